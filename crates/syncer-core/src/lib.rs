//! Synchronizer Core Library
//!
//! This crate provides the data model shared by every synchronizer node:
//! service records, snapshots, checkpoints and the gossip-visible node
//! description, plus the canonical encoding used to checksum snapshots.
//!
//! # Modules
//!
//! - [`types`]: Data model (ServiceRecord, Snapshot, Checkpoint, Node, ...)
//! - [`canonical`]: Deterministic serialization for checksumming
//! - [`checksum`]: Snapshot checksum derivation and verification
//! - [`error`]: Error types

pub mod canonical;
pub mod checksum;
pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::*;
