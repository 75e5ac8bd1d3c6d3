use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::packet::{Codec, MAX_PAYLOAD};
use crate::seq::{MAX_MODULUS, SeqSpace};

/// Upper bound for `timeout_ms` and `pace_ms`.
pub const MAX_TIMER_MS: u64 = 60 * 60 * 1000;
/// Shortest time a finished receiver keeps treating traffic as retransmissions.
pub const MIN_LINGER_MS: u64 = 200;

/// Window and acknowledgement discipline of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Policy {
    /// Fire-and-forget baseline, no acknowledgements.
    Unreliable,
    /// One outstanding packet, single timer.
    StopAndWait,
    /// Window `W`, cumulative acks, whole-window retransmission.
    GoBackN,
    /// Window `W`, per-packet acks and timers, receiver-side buffering.
    SelectiveRepeat,
}

impl Policy {
    pub const ALL: [Policy; 4] = [
        Policy::Unreliable,
        Policy::StopAndWait,
        Policy::GoBackN,
        Policy::SelectiveRepeat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Policy::Unreliable => "unreliable",
            Policy::StopAndWait => "stop-and-wait",
            Policy::GoBackN => "go-back-n",
            Policy::SelectiveRepeat => "selective-repeat",
        }
    }

    pub fn is_pipelined(&self) -> bool {
        matches!(self, Policy::GoBackN | Policy::SelectiveRepeat)
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Policy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unreliable" | "a" => Ok(Policy::Unreliable),
            "stop-and-wait" | "saw" | "b" => Ok(Policy::StopAndWait),
            "go-back-n" | "gbn" | "c" => Ok(Policy::GoBackN),
            "selective-repeat" | "sr" | "d" => Ok(Policy::SelectiveRepeat),
            other => Err(ConfigError::UnknownPolicy(other.to_string())),
        }
    }
}

/// Per-session protocol parameters. Both endpoints of a transfer must agree
/// on `policy`, `seq_modulus`, `integrity` and (for selective repeat)
/// `window_size`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArqConfig {
    pub policy: Policy,
    pub window_size: u32,
    /// Retransmission timeout in milliseconds.
    pub timeout_ms: u64,
    pub chunk_size: usize,
    pub seq_modulus: u32,
    /// Redundant acks a receiver sends when it accepts the EOF packet.
    pub final_ack_burst: u32,
    /// Selective repeat: this many repeats of an EOF ack that was already
    /// taken end the transfer even if earlier acks were lost. Zero disables
    /// the shortcut.
    pub terminal_ack_threshold: u32,
    /// Unreliable policy: gap between consecutive packets.
    pub pace_ms: u64,
    pub integrity: bool,
}

impl Default for ArqConfig {
    fn default() -> Self {
        Self {
            policy: Policy::StopAndWait,
            window_size: 1,
            timeout_ms: 50,
            chunk_size: MAX_PAYLOAD,
            seq_modulus: MAX_MODULUS,
            final_ack_burst: 20,
            terminal_ack_threshold: 10,
            pace_ms: 1,
            integrity: false,
        }
    }
}

impl ArqConfig {
    pub fn new(policy: Policy, window_size: u32) -> Self {
        Self {
            policy,
            window_size,
            ..Default::default()
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_seq_modulus(mut self, modulus: u32) -> Self {
        self.seq_modulus = modulus;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_integrity(mut self, integrity: bool) -> Self {
        self.integrity = integrity;
        self
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ArqConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Window actually enforced by the engine; stop-and-wait is always 1.
    pub fn effective_window(&self) -> u32 {
        match self.policy {
            Policy::StopAndWait => 1,
            _ => self.window_size,
        }
    }

    /// How long a receiver keeps answering a finished stream:
    /// four timeouts, at least [`MIN_LINGER_MS`].
    pub fn linger_ms(&self) -> u64 {
        self.timeout_ms.saturating_mul(4).max(MIN_LINGER_MS)
    }

    pub fn seq_space(&self) -> SeqSpace {
        SeqSpace::new(self.seq_modulus)
    }

    pub fn codec(&self) -> Codec {
        Codec::new(self.integrity)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size == 0 {
            return Err(ConfigError::Invalid("window_size must be at least 1".into()));
        }
        if self.chunk_size == 0 || self.chunk_size > MAX_PAYLOAD {
            return Err(ConfigError::Invalid(format!(
                "chunk_size must be in 1..={MAX_PAYLOAD}, got {}",
                self.chunk_size
            )));
        }
        if !(2..=MAX_MODULUS).contains(&self.seq_modulus) {
            return Err(ConfigError::Invalid(format!(
                "seq_modulus must be in 2..={MAX_MODULUS}, got {}",
                self.seq_modulus
            )));
        }
        if self.policy != Policy::Unreliable && self.timeout_ms == 0 {
            return Err(ConfigError::Invalid(format!(
                "{} needs a non-zero timeout_ms",
                self.policy
            )));
        }
        if self.timeout_ms > MAX_TIMER_MS || self.pace_ms > MAX_TIMER_MS {
            return Err(ConfigError::Invalid(format!(
                "timeout_ms and pace_ms must not exceed {MAX_TIMER_MS}, got {} and {}",
                self.timeout_ms, self.pace_ms
            )));
        }
        match self.policy {
            Policy::GoBackN if self.window_size >= self.seq_modulus => {
                Err(ConfigError::Invalid(format!(
                    "go-back-n window {} must be smaller than the sequence modulus {}",
                    self.window_size, self.seq_modulus
                )))
            }
            Policy::SelectiveRepeat if self.window_size > self.seq_modulus / 2 => {
                Err(ConfigError::Invalid(format!(
                    "selective-repeat window {} must not exceed half the sequence modulus {}",
                    self.window_size, self.seq_modulus
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Fault model of the simulated channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub loss_rate: f64,
    pub duplicate_rate: f64,
    /// Only meaningful with integrity checking on; the reference channel
    /// never corrupts.
    pub corrupt_rate: f64,
    pub min_latency: u64,
    pub max_latency: u64,
    pub seed: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            loss_rate: 0.0,
            duplicate_rate: 0.0,
            corrupt_rate: 0.0,
            min_latency: 10,
            max_latency: 100,
            seed: 0,
        }
    }
}
