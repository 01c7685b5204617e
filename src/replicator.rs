// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change-log replication.
//!
//! Tails the source change log from a checkpoint and applies each entry to
//! the destination, one at a time, in source order.
//!
//! ```text
//!   Idle ──► Tailing ◄──► Disconnected
//!               │              │
//!               └──► Stopped ◄─┘
//! ```
//!
//! # Apply Semantics
//!
//! Every apply is idempotent so that re-reading entries after a reconnect or
//! restart is harmless:
//!
//! | Entry | Destination call | Target missing |
//! |-------|------------------|----------------|
//! | insert | upsert by `_id` | created |
//! | replace | upsert by `_id` | created |
//! | update | apply delta by `_id` | no-op |
//! | delete | delete by `_id` | no-op |
//! | noop / command | none | - |
//!
//! # Checkpoint
//!
//! The checkpoint advances only after the destination acknowledges the
//! write. Skipped entries (internal namespaces, no-ops, malformed or rejected
//! entries) advance it too. Every reconnect reopens the tail *at* the
//! checkpoint, so the last applied entry is read again and re-applied.
//!
//! # Failure Handling
//!
//! - Transient apply errors (connection, timeout) retry the same entry with
//!   backoff. The stream does not move on until it succeeds.
//! - Other apply errors and malformed entries are logged and skipped.
//! - A dropped tail goes `Disconnected` and reconnects with backoff forever.
//! - A change log truncated past the checkpoint is fatal:
//!   [`ReplicationError::CheckpointTooOld`].

use crate::checkpoint::CheckpointStore;
use crate::config::TailConfig;
use crate::database::{
    document_id, DbError, DbResult, DestinationDatabase, Document, OplogTail, SourceDatabase,
};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::oplog::{entry_timestamp, parse_entry, OplogEntry, Operation, TailStart, Timestamp};
use crate::resilience::RetryConfig;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Change-log replicator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorState {
    /// Created, not yet tailing.
    Idle,
    /// Tail open, applying entries.
    Tailing,
    /// Tail lost, reconnecting with backoff.
    Disconnected,
    /// Finished, either on shutdown or after a fatal error.
    Stopped,
}

impl ReplicatorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicatorState::Idle => "Idle",
            ReplicatorState::Tailing => "Tailing",
            ReplicatorState::Disconnected => "Disconnected",
            ReplicatorState::Stopped => "Stopped",
        }
    }
}

impl std::fmt::Display for ReplicatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What applying one entry did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The destination was written.
    Applied,
    /// Update or delete whose target no longer exists.
    TargetAbsent,
    /// Nothing to write; the reason is used as a metric label.
    Skipped(&'static str),
}

/// Counters returned when replication stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicationSummary {
    pub applied: u64,
    pub skipped: u64,
    /// Entries that were malformed or rejected by the destination.
    pub failed: u64,
    pub reconnects: u64,
    /// Last recorded checkpoint.
    pub checkpoint: Timestamp,
}

/// Apply one parsed entry to the destination.
pub async fn apply_entry<D: DestinationDatabase>(
    destination: &D,
    entry: &OplogEntry,
) -> DbResult<ApplyOutcome> {
    if entry.is_internal() {
        return Ok(ApplyOutcome::Skipped("internal"));
    }
    let ns = match &entry.namespace {
        Some(ns) => ns,
        None => return Ok(ApplyOutcome::Skipped("noop")),
    };

    match &entry.operation {
        Operation::Noop => Ok(ApplyOutcome::Skipped("noop")),
        Operation::Command { .. } => Ok(ApplyOutcome::Skipped("command")),
        Operation::Insert { document } => {
            let id = document_id(document)
                .ok_or_else(|| DbError::Other(format!("insert into {} without _id", ns)))?;
            destination.upsert(ns, id, document.clone()).await?;
            Ok(ApplyOutcome::Applied)
        }
        Operation::Replace { id, document } => {
            destination.upsert(ns, id, document.clone()).await?;
            Ok(ApplyOutcome::Applied)
        }
        Operation::Update { id, delta } => {
            if destination.update(ns, id, delta).await? {
                Ok(ApplyOutcome::Applied)
            } else {
                Ok(ApplyOutcome::TargetAbsent)
            }
        }
        Operation::Delete { id } => {
            if destination.delete(ns, id).await? {
                Ok(ApplyOutcome::Applied)
            } else {
                Ok(ApplyOutcome::TargetAbsent)
            }
        }
    }
}

enum Step {
    Done(ApplyOutcome),
    Rejected(DbError),
    Interrupted,
}

enum TailEnd {
    Shutdown,
    Disconnected,
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Tails the source change log and applies it to the destination.
pub struct OplogReplicator<S: SourceDatabase, D: DestinationDatabase> {
    source: Arc<S>,
    destination: D,
    store: Arc<CheckpointStore>,
    /// Key under which the checkpoint is stored.
    checkpoint_key: String,
    config: TailConfig,
    state_tx: watch::Sender<ReplicatorState>,
}

impl<S: SourceDatabase, D: DestinationDatabase> OplogReplicator<S, D> {
    pub fn new(
        source: Arc<S>,
        destination: D,
        store: Arc<CheckpointStore>,
        checkpoint_key: impl Into<String>,
        config: TailConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(ReplicatorState::Idle);
        Self {
            source,
            destination,
            store,
            checkpoint_key: checkpoint_key.into(),
            config,
            state_tx,
        }
    }

    pub fn state(&self) -> ReplicatorState {
        *self.state_tx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ReplicatorState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: ReplicatorState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            info!(from = %previous, to = %state, "Replicator state changed");
            metrics::set_tail_state(state.as_str());
        }
    }

    /// Replicate from `checkpoint` until shutdown or a fatal error.
    ///
    /// The first entry applied is the one at `checkpoint` (if it still
    /// exists). Returns the summary on shutdown.
    pub async fn run(
        &self,
        checkpoint: Timestamp,
        shutdown: watch::Receiver<bool>,
    ) -> Result<ReplicationSummary> {
        let span = info_span!("replicator", checkpoint_key = %self.checkpoint_key);
        let result = self.run_inner(checkpoint, shutdown).instrument(span.clone()).await;
        self.set_state(ReplicatorState::Stopped);

        if let Err(e) = self.store.flush_dirty().await {
            span.in_scope(|| warn!(error = %e, "Failed to flush checkpoint on stop"));
        }
        result
    }

    async fn run_inner(
        &self,
        checkpoint: Timestamp,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<ReplicationSummary> {
        let mut summary = ReplicationSummary {
            checkpoint,
            ..Default::default()
        };

        // From here on a restart resumes tailing instead of resyncing
        self.store.set(&self.checkpoint_key, checkpoint).await;
        if let Err(e) = self.store.flush_dirty().await {
            warn!(error = %e, "Failed to persist starting checkpoint");
        }
        info!(checkpoint = %checkpoint, "Starting change-log replication");

        let reconnect = self.config.reconnect_retry();
        let mut attempt = 0usize;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let start = TailStart::AtOrAfter(summary.checkpoint);
            let opened = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                opened = self.source.tail_oplog(start) => opened,
            };

            let mut tail = match opened {
                Ok(tail) => {
                    if attempt > 0 {
                        info!(attempt, checkpoint = %summary.checkpoint, "Change-log tail reconnected");
                        metrics::record_tail_reconnect(true);
                        summary.reconnects += 1;
                    }
                    self.set_state(ReplicatorState::Tailing);
                    tail
                }
                Err(DbError::OplogTruncated { oldest, .. }) => {
                    error!(
                        checkpoint = %summary.checkpoint,
                        oldest = %oldest,
                        "Change log truncated past checkpoint, full resync required"
                    );
                    metrics::record_error("checkpoint_too_old");
                    return Err(ReplicationError::CheckpointTooOld {
                        checkpoint: summary.checkpoint,
                    });
                }
                Err(DbError::OplogUnavailable(message)) => {
                    error!(error = %message, "Source change log is not available");
                    metrics::record_error("checkpoint_unavailable");
                    return Err(ReplicationError::CheckpointUnavailable(message));
                }
                Err(e) => {
                    attempt += 1;
                    metrics::record_tail_reconnect(false);
                    self.set_state(ReplicatorState::Disconnected);
                    if !self.backoff(&reconnect, attempt, &e, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            match self.drain_tail(&mut tail, &mut summary, &mut attempt, &mut shutdown).await? {
                TailEnd::Shutdown => break,
                TailEnd::Disconnected => {
                    attempt += 1;
                    self.set_state(ReplicatorState::Disconnected);
                    let e = DbError::Connection("tail interrupted".into());
                    if !self.backoff(&reconnect, attempt, &e, &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        info!(
            applied = summary.applied,
            skipped = summary.skipped,
            failed = summary.failed,
            reconnects = summary.reconnects,
            checkpoint = %summary.checkpoint,
            "Change-log replication stopped"
        );
        Ok(summary)
    }

    /// Read and apply batches until the tail breaks or shutdown.
    async fn drain_tail(
        &self,
        tail: &mut Box<dyn OplogTail>,
        summary: &mut ReplicationSummary,
        attempt: &mut usize,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<TailEnd> {
        loop {
            let batch = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(TailEnd::Shutdown);
                    }
                    continue;
                }
                batch = tail.next_batch(self.config.batch_size) => batch,
            };

            let entries = match batch {
                Ok(entries) => entries,
                Err(DbError::OplogTruncated { oldest, .. }) => {
                    error!(
                        checkpoint = %summary.checkpoint,
                        oldest = %oldest,
                        "Change log truncated beneath the tail, full resync required"
                    );
                    metrics::record_error("checkpoint_too_old");
                    return Err(ReplicationError::CheckpointTooOld {
                        checkpoint: summary.checkpoint,
                    });
                }
                Err(e) => {
                    warn!(error = %e, checkpoint = %summary.checkpoint, "Change-log tail lost");
                    metrics::record_error("tail_disconnected");
                    return Ok(TailEnd::Disconnected);
                }
            };
            *attempt = 0;

            if entries.is_empty() {
                // Caught up: a good moment to make progress durable
                if self.store.has_dirty().await {
                    if let Err(e) = self.store.flush_dirty().await {
                        warn!(error = %e, "Checkpoint flush failed");
                    }
                }
                continue;
            }

            metrics::record_oplog_entries_read(entries.len());
            trace!(count = entries.len(), "Read change-log batch");

            for raw in entries {
                if *shutdown.borrow() {
                    return Ok(TailEnd::Shutdown);
                }
                match self.process(&raw, summary, shutdown).await {
                    Some(next) => {
                        summary.checkpoint = next;
                        self.store.set(&self.checkpoint_key, next).await;
                    }
                    None => return Ok(TailEnd::Shutdown),
                }
            }

            metrics::record_replication_lag(summary.checkpoint.lag_secs(now_secs()));
        }
    }

    /// Apply one raw entry and return the checkpoint to record, or `None` if
    /// shutdown interrupted a retry before the entry was applied.
    async fn process(
        &self,
        raw: &Document,
        summary: &mut ReplicationSummary,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Timestamp> {
        let checkpoint = summary.checkpoint;
        let entry = match parse_entry(raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "Skipping malformed change-log entry");
                metrics::record_oplog_entry_skipped("malformed");
                summary.failed += 1;
                // Move past it if we can tell where it sits
                return Some(entry_timestamp(raw).map_or(checkpoint, |ts| ts.max(checkpoint)));
            }
        };

        let started = Instant::now();
        match self.apply_with_retry(&entry, shutdown).await {
            Step::Done(ApplyOutcome::Skipped(reason)) => {
                trace!(ts = %entry.ts, reason, "Skipped change-log entry");
                metrics::record_oplog_entry_skipped(reason);
                summary.skipped += 1;
            }
            Step::Done(outcome) => {
                if outcome == ApplyOutcome::TargetAbsent {
                    debug!(
                        ts = %entry.ts,
                        op = entry.operation.kind(),
                        "Target document absent, nothing to do"
                    );
                }
                metrics::record_oplog_entry_applied(entry.operation.kind());
                metrics::record_apply_latency(started.elapsed());
                summary.applied += 1;
            }
            Step::Rejected(e) => {
                error!(
                    ts = %entry.ts,
                    op = entry.operation.kind(),
                    namespace = ?entry.namespace.as_ref().map(ToString::to_string),
                    error = %e,
                    "Destination rejected change-log entry, skipping"
                );
                metrics::record_oplog_entry_skipped("rejected");
                summary.failed += 1;
            }
            Step::Interrupted => return None,
        }

        Some(entry.ts.max(checkpoint))
    }

    async fn apply_with_retry(&self, entry: &OplogEntry, shutdown: &mut watch::Receiver<bool>) -> Step {
        let retry = self.config.reconnect_retry();
        let mut attempt = 0usize;
        loop {
            match apply_entry(&self.destination, entry).await {
                Ok(outcome) => return Step::Done(outcome),
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    metrics::record_apply_retry(entry.operation.kind());
                    if !self.backoff(&retry, attempt, &e, shutdown).await {
                        return Step::Interrupted;
                    }
                }
                Err(e) => return Step::Rejected(e),
            }
        }
    }

    /// Sleep before the next attempt. Returns `false` if shutdown arrived.
    async fn backoff(
        &self,
        retry: &RetryConfig,
        attempt: usize,
        error: &DbError,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let delay = retry.delay_for_attempt(attempt);
        warn!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Retrying after transient failure"
        );
        if *shutdown.borrow() {
            return false;
        }
        tokio::select! {
            changed = shutdown.changed() => {
                !(changed.is_err() || *shutdown.borrow())
            }
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
