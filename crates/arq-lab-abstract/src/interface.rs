use bytes::Bytes;
use serde::Serialize;

use crate::config::Policy;
use crate::error::ArqError;

/// Timer id a session uses for its retransmission deadline.
pub const RETRANSMIT_TIMER: u32 = 1;
/// Timer id the unreliable policy uses to pace transmissions.
pub const PACE_TIMER: u32 = 2;

/// Capabilities a driver (simulator or UDP loop) lends to a protocol session
/// for the duration of one callback.
pub trait SystemContext {
    /// Hand a datagram to the unreliable channel, addressed to the peer.
    fn send_datagram(&mut self, datagram: Bytes);

    /// Arm timer `timer_id` to fire after `delay_ms`. Re-arming an id
    /// replaces the previous deadline.
    fn start_timer(&mut self, delay_ms: u64, timer_id: u32);

    fn cancel_timer(&mut self, timer_id: u32);

    /// Append in-order payload bytes to the application's output.
    fn deliver_data(&mut self, data: &[u8]);

    /// The stream currently being delivered is complete.
    fn end_of_stream(&mut self) {}

    fn log(&mut self, message: &str);

    /// Milliseconds on the driver's clock.
    fn now(&self) -> u64;

    /// Record a numeric sample (e.g. `send_base`, `in_flight`) for traces.
    fn record_metric(&mut self, _name: &str, _value: f64) {}
}

/// Outcome of a finished sender session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferReport {
    pub policy: Policy,
    pub bytes: u64,
    pub packets: u64,
    pub retransmissions: u64,
    pub duplicate_acks: u64,
    pub elapsed_ms: u64,
    /// `(bytes / 1000) / seconds`.
    pub throughput_kbps: f64,
}

impl TransferReport {
    pub fn new(
        policy: Policy,
        bytes: u64,
        packets: u64,
        retransmissions: u64,
        duplicate_acks: u64,
        elapsed_ms: u64,
    ) -> Self {
        let elapsed_ms = elapsed_ms.max(1);
        let secs = elapsed_ms as f64 / 1000.0;
        Self {
            policy,
            bytes,
            packets,
            retransmissions,
            duplicate_acks,
            elapsed_ms,
            throughput_kbps: (bytes as f64 / 1000.0) / secs,
        }
    }

    /// `"<retransmissions> <throughput>"`, the line printed by the sender.
    pub fn summary_line(&self) -> String {
        format!("{} {:.2}", self.retransmissions, self.throughput_kbps)
    }
}

/// A protocol session, either end of a transfer.
pub trait TransportProtocol {
    /// Called once before any datagram or timer is delivered.
    fn init(&mut self, _ctx: &mut dyn SystemContext) -> Result<(), ArqError> {
        Ok(())
    }

    /// A datagram arrived from the peer.
    fn on_datagram(&mut self, ctx: &mut dyn SystemContext, datagram: &[u8])
    -> Result<(), ArqError>;

    fn on_timer(&mut self, ctx: &mut dyn SystemContext, timer_id: u32) -> Result<(), ArqError>;

    /// `true` once the session has nothing more to do.
    fn is_complete(&self) -> bool;

    /// Transfer statistics, available from senders once complete.
    fn report(&self) -> Option<TransferReport> {
        None
    }
}
