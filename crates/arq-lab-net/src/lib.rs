//! UDP driver for the ARQ sessions.
//!
//! One task owns the socket and the session. Datagrams, timer deadlines and
//! the stop signal are multiplexed with `tokio::select!`; whatever the session
//! asks for during a callback is applied once the callback returns.

mod driver;
mod error;
mod stop;

pub use driver::{Endpoint, ReceiveSummary, resolve_peer, run_receiver, run_sender};
pub use error::NetError;
pub use stop::StopSignal;
