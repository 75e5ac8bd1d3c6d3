pub mod checksum;
pub mod config;
pub mod context;
pub mod error;
pub mod interface;
pub mod packet;
pub mod scenario;
pub mod seq;

pub use interface::{PACE_TIMER, RETRANSMIT_TIMER, SystemContext, TransferReport, TransportProtocol};
pub use packet::{Ack, Codec, Packet, PacketError};
pub use packet::flags;

pub use config::{ArqConfig, Policy, SimConfig};
pub use context::{ActionBuffer, ScopedContext, TimerOp};
pub use error::{ArqError, ConfigError};
pub use scenario::{InputSpec, SimConfigOverride, TestAction, TestAssertion, TestScenario};
pub use seq::SeqSpace;
