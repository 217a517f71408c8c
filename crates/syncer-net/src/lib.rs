//! Networking primitives for the service-registry synchronizer
//!
//! This crate provides:
//! - Length-prefixed message framing
//! - Pull RPC messages and the TCP transport client/server
//! - Gossip datagram messages for the membership overlay

pub mod framing;
pub mod gossip;
pub mod messages;
pub mod transport;

pub use framing::{Frame, FrameCodec, FrameType};
pub use gossip::{GossipMessage, MemberDigest, UserEvent};
pub use messages::{PullRequest, PullResponse};
pub use transport::{PullClient, SnapshotSource, TcpPullClient, TransportServer};
