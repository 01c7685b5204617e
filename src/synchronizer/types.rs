//! Synchronizer state and outcome types.
//!
//! # State Transitions
//!
//! ```text
//!              new()
//!   (connect + checkpoint) ──► Ready
//!                                │ start()
//!                 ┌──────────────┴──────────────┐
//!                 │ full sync                   │ oplog_only / resumed
//!                 ↓                             │
//!            InitialSync ───────────────────────┤
//!                 │                             ↓
//!                 │                          Tailing
//!                 │                             │
//!                 │           shutdown()        │
//!                 └──────────► ShuttingDown ◄───┘
//!                                   │
//!                                   ↓
//!                                Stopped
//!
//!   (fatal error in any running phase) ──► Failed
//! ```
//!
//! # State Descriptions
//!
//! - **Ready**: Both endpoints reachable and the checkpoint is known. No
//!   background work yet.
//! - **InitialSync**: Bulk copy of all collections in progress.
//! - **Tailing**: Applying the change log. Runs until shutdown.
//! - **ShuttingDown**: `shutdown()` called. In-flight writes are finishing.
//! - **Stopped**: Clean stop. The last checkpoint has been persisted.
//! - **Failed**: Unrecoverable error, e.g. the checkpoint fell off the log.

use crate::initial_sync::InitialSyncReport;
use crate::replicator::ReplicationSummary;

/// State of the synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Ready,
    InitialSync,
    Tailing,
    ShuttingDown,
    Stopped,
    Failed,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Ready => "Ready",
            SyncState::InitialSync => "InitialSync",
            SyncState::Tailing => "Tailing",
            SyncState::ShuttingDown => "ShuttingDown",
            SyncState::Stopped => "Stopped",
            SyncState::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a finished run did.
#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
    /// `None` when the bulk copy was skipped (resume or `oplog_only`).
    pub initial_sync: Option<InitialSyncReport>,
    /// `None` when shutdown arrived before tailing began.
    pub replication: Option<ReplicationSummary>,
}
