//! Kademlia-style UDP node discovery: masked-header wire codec, handshake
//! and session layer, routing table, iterative lookup, talk sub-protocol
//! dispatch and the single-event-loop protocol core that ties them together.
//!
//! See `protocol::ProtocolHandle` for the public entry point.

pub mod config;
pub mod crypto;
pub mod error;
pub mod handshake;
pub mod ip_vote;
pub mod lookup;
pub mod metrics;
pub mod node;
pub mod portal;
pub mod protocol;
pub mod requests;
pub mod routing_table;
pub mod session;
pub mod talk;
pub mod wire;

pub use config::{Config, IpLimits};
pub use error::{CryptoError, ProtocolError};
pub use node::{Address, Node, NodeId, Record};
pub use protocol::{PongInfo, ProtocolHandle};
pub use routing_table::AddOutcome;
pub use talk::TalkHandler;
