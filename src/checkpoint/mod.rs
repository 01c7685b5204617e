// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resume checkpoints.
//!
//! [`CheckpointProvider`] reads the newest change-log timestamp from the
//! source before any data is copied. Replaying the change log from that
//! point after the bulk copy converges the destination even though the copy
//! was not a consistent snapshot of the whole server.
//!
//! [`CheckpointStore`] persists the last applied timestamp so a restart
//! can resume tailing instead of copying everything again.

mod store;

pub use store::CheckpointStore;

use crate::database::{DbError, SourceDatabase};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::oplog::Timestamp;
use std::sync::Arc;
use tracing::{error, info};

/// Captures the replication starting point from the source.
pub struct CheckpointProvider<S: SourceDatabase> {
    source: Arc<S>,
}

impl<S: SourceDatabase> CheckpointProvider<S> {
    pub fn new(source: Arc<S>) -> Self {
        Self { source }
    }

    /// Timestamp of the most recent change-log entry on the source.
    ///
    /// Fails with [`ReplicationError::CheckpointUnavailable`] when the change
    /// log is not enabled or the source cannot be queried. There is no
    /// retry here: without a checkpoint nothing else can start.
    pub async fn capture(&self) -> Result<Timestamp> {
        match self.source.latest_optime().await {
            Ok(ts) => {
                let wall = ts
                    .to_datetime()
                    .map(|dt| dt.to_rfc3339())
                    .unwrap_or_else(|| "invalid".to_string());
                info!(checkpoint = %ts, wall_time = %wall, "Captured replication checkpoint");
                metrics::set_checkpoint(ts);
                Ok(ts)
            }
            Err(e) => {
                error!(error = %e, "Failed to capture replication checkpoint");
                metrics::record_error("checkpoint_unavailable");
                Err(match e {
                    DbError::OplogUnavailable(message) => ReplicationError::CheckpointUnavailable(
                        format!("change log not enabled on source: {}", message),
                    ),
                    other => ReplicationError::CheckpointUnavailable(format!(
                        "failed to query change log: {}",
                        other
                    )),
                })
            }
        }
    }
}
