//! Gossip datagrams for the membership overlay
//!
//! Every message is a single postcard-encoded UDP datagram. Liveness is
//! carried by per-member heartbeat counters; a member is only refreshed by
//! a digest whose `(incarnation, heartbeat)` is newer than what we hold.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use syncer_core::types::*;
use thiserror::Error;

/// Largest datagram we send or accept
pub const MAX_DATAGRAM: usize = 60 * 1024;

/// Gossip wire errors
#[derive(Debug, Error)]
pub enum GossipError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
    #[error("Datagram too large: {0} bytes (max {MAX_DATAGRAM})")]
    TooLarge(usize),
}

/// One member as advertised on the wire
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemberDigest {
    pub node: Node,
    /// Address the member's gossip socket listens on
    pub gossip_addr: SocketAddr,
    /// Process start marker; a restarted node comes back with a higher one
    pub incarnation: u64,
    /// Counter bumped by the member itself on every gossip round
    pub heartbeat: u64,
}

impl MemberDigest {
    /// Whether this digest carries newer liveness than `other`
    pub fn supersedes(&self, other: &MemberDigest) -> bool {
        (self.incarnation, self.heartbeat) > (other.incarnation, other.heartbeat)
    }
}

/// Custom event broadcast to the cluster
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserEvent {
    pub origin: NodeId,
    /// Per-origin sequence used by receivers to drop duplicates
    pub sequence: u64,
    pub name: String,
    pub payload: Vec<u8>,
}

/// Gossip protocol messages
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum GossipMessage {
    /// Sent to a seed to enter the overlay
    Join { member: MemberDigest },
    /// Seed's reply carrying its live view
    JoinAck { members: Vec<MemberDigest> },
    /// Periodic push of the sender's live view
    Heartbeat { from: NodeId, members: Vec<MemberDigest> },
    /// Graceful departure
    Leave { node: NodeId, incarnation: u64 },
    /// Best-effort custom event
    UserEvent(UserEvent),
}

impl GossipMessage {
    pub fn encode(&self) -> Result<Vec<u8>, GossipError> {
        let bytes = postcard::to_allocvec(self)?;
        if bytes.len() > MAX_DATAGRAM {
            return Err(GossipError::TooLarge(bytes.len()));
        }
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, GossipError> {
        if bytes.len() > MAX_DATAGRAM {
            return Err(GossipError::TooLarge(bytes.len()));
        }
        Ok(postcard::from_bytes(bytes)?)
    }
}
