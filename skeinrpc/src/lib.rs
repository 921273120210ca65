//! SkeinRPC -- reliable-delivery RPC engine over UDP.
//!
//! Calls are multiplexed four to a connection, each with its own
//! sliding-window packet rings, a priority-coalescing ACK scheduler,
//! adaptive retransmission timers and an RTT estimator. Client
//! connections to the same peer and security context are pooled into
//! bundles with FIFO admission, and idle connections are culled on a
//! deadline unless a new call reclaims them first.

pub mod ack;
pub mod bundle;
pub mod call;
pub mod channel;
pub mod config;
pub mod conn;
pub mod demux;
pub mod endpoint;
pub mod error;
pub mod packet;
pub mod retransmit;
pub mod ring;
pub mod rtt;

// Re-export key public types at crate root.
pub use bundle::{BundleKey, ClientPool};
pub use call::{Call, CallState, Direction};
pub use config::Config;
pub use conn::{Admission, Connection};
pub use endpoint::{CallHandle, Endpoint, Received};
pub use error::{Result, SkeinError};
pub use packet::{AckReason, Header, Packet, PacketFlags, PacketType, Seq, SeqRange};
pub use rtt::RttEstimator;
