use std::io;

use arq_lab_abstract::ArqError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] ArqError),
    #[error("failed to write received data: {0}")]
    Sink(#[source] io::Error),
    #[error("could not resolve {0}")]
    Resolve(String),
    #[error("stopped before the transfer completed")]
    Stopped,
}
