//! syncerd - cross-cluster service registry synchronizer
//!
//! This daemon provides:
//! - Gossip membership of peer synchronizer nodes
//! - Versioned, checksummed exports of the local registry
//! - Periodic and event-driven reconciliation with peer clusters
//! - Durable per-peer checkpoints
//! - Ordered startup and graceful shutdown of all of the above

pub mod config;
pub mod engine;
pub mod export;
pub mod membership;
pub mod registry;
pub mod server;
pub mod signal;
pub mod storage;

pub use config::Config;
pub use engine::{Engine, EngineConfig};
pub use export::{ExportCache, Exporter};
pub use membership::{EventHandler, MemberView, Membership};
pub use registry::{MemoryRegistry, RegistryBridge};
pub use server::Server;
pub use storage::Storage;
