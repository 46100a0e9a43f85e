//! p2pjs protocol core.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod cookie;
pub mod core;
pub mod ledger;
pub mod protocol;
pub mod reassembly;
pub mod registry;
pub mod wire;

pub use cookie::Cookie;
pub use crate::core::{ConnectIntent, NodeConfig, NodeCore, OutboundAction};
pub use ledger::{ExecutionRequest, JobLedger, JobPayload, LedgerError};
pub use protocol::{JobKind, JobStatus, Message, MessageKind, PeerAddress, SeedPeerError};
pub use reassembly::{Progress, Reassembler};
pub use registry::{PeerId, PeerRecord, PeerRegistry};
pub use wire::{decode, encode, DecodeError, EncodeError};
