use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::packet::PacketError;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown policy '{0}' (expected unreliable, stop-and-wait, go-back-n or selective-repeat)")]
    UnknownPolicy(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Failures a protocol session can report to its driver.
///
/// Channel misbehaviour (loss, duplication, reordering, stale acks) is never
/// an error; only local problems are.
#[derive(Debug, Error)]
pub enum ArqError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to read from the input source: {0}")]
    Source(#[source] io::Error),
    #[error("failed to encode packet: {0}")]
    Encode(#[from] PacketError),
}
