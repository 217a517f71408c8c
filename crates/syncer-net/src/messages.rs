//! Pull RPC messages
//!
//! One request type: a peer asks for the owner's snapshot since a version it
//! already merged. `since_version == 0` means a full snapshot is requested.

use crate::framing::{Frame, FrameType};
use serde::{Deserialize, Serialize};
use syncer_core::types::*;

/// Snapshot pull request
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PullRequest {
    /// Cluster of the node asking
    pub requester: ClusterId,
    /// Last version the requester merged from us (0 = full)
    pub since_version: u64,
}

/// Snapshot pull response
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum PullResponse {
    /// Full or delta snapshot plus the owner's current export version
    Snapshot {
        snapshot: Snapshot,
        current_version: u64,
    },
    /// The owner has nothing to serve yet (no export completed)
    Unavailable { reason: String },
}

impl PullRequest {
    pub fn full(requester: ClusterId) -> Self {
        Self {
            requester,
            since_version: 0,
        }
    }

    pub fn to_frame(&self) -> Result<Frame, postcard::Error> {
        let payload = postcard::to_allocvec(self)?;
        Ok(Frame::new(FrameType::PullRequest, payload))
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, postcard::Error> {
        postcard::from_bytes(&frame.payload)
    }
}

impl PullResponse {
    pub fn to_frame(&self) -> Result<Frame, postcard::Error> {
        let payload = postcard::to_allocvec(self)?;
        Ok(Frame::new(FrameType::PullResponse, payload))
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, postcard::Error> {
        postcard::from_bytes(&frame.payload)
    }
}
