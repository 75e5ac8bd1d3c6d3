//! Policy-parametrized ARQ engine.
//!
//! Sessions are sans-IO: every datagram, timer and delivery goes through the
//! [`SystemContext`](arq_lab_abstract::SystemContext) lent by a driver.

use std::io::Read;

use arq_lab_abstract::{ArqConfig, ArqError, TransportProtocol};

pub mod receiver;
pub mod segmenter;
pub mod sender;
pub mod timer;

#[cfg(test)]
mod test_support;

pub use receiver::{ReceiverSession, ReceiverState};
pub use segmenter::{Chunk, Segmenter};
pub use sender::{SenderSession, SenderState};
pub use timer::RetransmitTimers;

pub type BoxedProtocol = Box<dyn TransportProtocol + Send>;

/// Sender for `config.policy` reading from `source`.
pub fn sender<R>(config: ArqConfig, source: R) -> Result<BoxedProtocol, ArqError>
where
    R: Read + Send + 'static,
{
    Ok(Box::new(SenderSession::new(config, source)?))
}

/// Receiver for `config.policy` accepting up to `streams` streams (0 = unlimited).
pub fn receiver(config: ArqConfig, streams: u32) -> Result<BoxedProtocol, ArqError> {
    Ok(Box::new(
        ReceiverSession::new(config)?.with_stream_limit(streams),
    ))
}
