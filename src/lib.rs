//! # oplog-sync
//!
//! Copies a live document database to another server and keeps it in step,
//! with no gap between the bulk copy and change-log replication.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              Synchronizer                               │
//! │                                                                         │
//! │  ┌────────────────────┐   checkpoint   ┌──────────────────────────────┐ │
//! │  │ CheckpointProvider │───────────────►│ OplogReplicator              │ │
//! │  │ (latest optime)    │                │ (tail, apply in order)       │ │
//! │  └────────────────────┘                └──────────────────────────────┘ │
//! │            │                                          │                 │
//! │            ▼                                          ▼                 │
//! │  ┌────────────────────┐                    ┌─────────────────────┐      │
//! │  │ InitialSync        │                    │ CheckpointStore     │      │
//! │  │ indexes, then      │                    │ (SQLite)            │      │
//! │  │ parallel copy      │                    └─────────────────────┘      │
//! │  └────────────────────┘                                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Two Phases
//!
//! 1. **Initial sync**: every non-internal collection is copied from a
//!    point-in-time snapshot by a pool of workers, indexes first.
//! 2. **Change-log replication**: the source change log is replayed from a
//!    checkpoint captured *before* the copy started. Every apply is
//!    idempotent, so entries that raced the copy are harmless.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use oplog_sync::{MemoryDatabase, SyncConfig, Synchronizer};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = SyncConfig::default();
//!     let source = Arc::new(MemoryDatabase::new("source"));
//!     let destination = MemoryDatabase::new("destination");
//!
//!     let mut sync = Synchronizer::new(config, source, destination)
//!         .await
//!         .expect("Failed to connect");
//!     sync.start().await.expect("Failed to start");
//!
//!     // Runs until shutdown
//!     sync.shutdown().await.expect("Failed to stop");
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod database;
pub mod error;
pub mod initial_sync;
pub mod metrics;
pub mod namespace;
pub mod oplog;
pub mod replicator;
pub mod resilience;
pub mod synchronizer;

// Re-exports for convenience
pub use checkpoint::{CheckpointProvider, CheckpointStore};
pub use config::{CheckpointConfig, ConnectConfig, CopyConfig, SyncConfig, SyncSettings, TailConfig};
pub use database::{DbError, DestinationDatabase, Document, IndexSpec, MemoryDatabase, SourceDatabase};
pub use error::{ReplicationError, Result};
pub use initial_sync::{CollectionCopier, CopyStats, IndexReplicator, InitialSync, InitialSyncReport};
pub use namespace::Namespace;
pub use oplog::{OplogEntry, Operation, Timestamp, UpdateDelta};
pub use replicator::{OplogReplicator, ReplicationSummary, ReplicatorState};
pub use synchronizer::{ShutdownHandle, SyncOutcome, SyncState, Synchronizer};
