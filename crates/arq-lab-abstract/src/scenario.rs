use serde::Deserialize;

use crate::config::{ArqConfig, SimConfig};

/// A scripted simulator run loaded from TOML.
#[derive(Deserialize, Debug, Clone)]
pub struct TestScenario {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Protocol parameters shared by both endpoints.
    #[serde(default)]
    pub arq: ArqConfig,
    #[serde(default)]
    pub config: SimConfigOverride,
    pub input: InputSpec,
    #[serde(default)]
    pub actions: Vec<TestAction>,
    #[serde(default)]
    pub assertions: Vec<TestAssertion>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct SimConfigOverride {
    pub loss_rate: Option<f64>,
    pub duplicate_rate: Option<f64>,
    pub corrupt_rate: Option<f64>,
    pub min_latency: Option<u64>,
    pub max_latency: Option<u64>,
    pub seed: Option<u64>,
}

impl SimConfigOverride {
    pub fn apply_to(&self, config: &mut SimConfig) {
        if let Some(v) = self.loss_rate {
            config.loss_rate = v;
        }
        if let Some(v) = self.duplicate_rate {
            config.duplicate_rate = v;
        }
        if let Some(v) = self.corrupt_rate {
            config.corrupt_rate = v;
        }
        if let Some(v) = self.min_latency {
            config.min_latency = v;
        }
        if let Some(v) = self.max_latency {
            config.max_latency = v;
        }
        if let Some(v) = self.seed {
            config.seed = v;
        }
    }
}

/// Byte stream the sender transfers.
#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputSpec {
    Text { data: String },
    /// `size` pseudo-random bytes drawn from `seed`.
    Random { size: usize, seed: u64 },
}

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TestAction {
    /// Drop the first data packet the sender emits with this wire sequence number.
    DropNextFromSenderSeq { seq: u16 },
    /// Drop the first ack the receiver emits for this wire sequence number.
    DropNextFromReceiverAck { ack: u16 },
    /// Deliver the next ack for `ack` to the sender `times` extra times.
    DuplicateNextAck { ack: u16, times: u32 },
}

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TestAssertion {
    /// Receiver output equals the scenario input byte for byte.
    OutputMatchesInput,
    /// Receiver output equals `data`.
    DataDelivered { data: String },
    /// Total datagrams emitted by the sender lie within range.
    SenderPacketCount { min: u32, max: Option<u32> },
    MaxRetransmissions { max: u64 },
    /// The sender reached its terminal state.
    SenderCompleted,
    /// Number of end-of-stream signals seen by the receiver's application.
    StreamsCompleted { count: u32 },
    /// The simulation finished within `ms` simulated milliseconds.
    MaxDuration { ms: u64 },
}
