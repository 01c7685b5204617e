// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Top-level synchronizer.
//!
//! Ties the phases together:
//! 1. Checks that both endpoints answer (bounded retry, fatal on failure)
//! 2. Captures the checkpoint, or loads a stored one when resuming
//! 3. Runs the initial sync unless resuming or in `oplog_only` mode
//! 4. Hands off to the change-log replicator, which runs until shutdown
//!
//! # Checkpoint Handoff
//!
//! The checkpoint is captured in [`Synchronizer::new`] before any document is
//! read, so every write that races the bulk copy is in the change log at or
//! after it. The copy never touches the checkpoint. The replicator starts
//! from it and owns it from then on.
//!
//! # Graceful Shutdown
//!
//! [`Synchronizer::shutdown`] (or a [`ShutdownHandle`]) signals all tasks.
//! The initial sync stops feeding its copy workers and the replicator between
//! entries; in-flight writes finish. The checkpoint store is flushed and
//! closed last.

mod types;

pub use types::{SyncOutcome, SyncState};

use crate::checkpoint::{CheckpointProvider, CheckpointStore};
use crate::config::SyncConfig;
use crate::database::{DestinationDatabase, SourceDatabase};
use crate::error::{ReplicationError, Result};
use crate::initial_sync::InitialSync;
use crate::metrics;
use crate::oplog::Timestamp;
use crate::replicator::{OplogReplicator, ReplicatorState};
use crate::resilience::retry_transient;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// How long `shutdown()` waits for in-flight work before giving up.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

fn set_state(tx: &watch::Sender<SyncState>, state: SyncState) {
    let previous = tx.send_replace(state);
    if previous != state {
        info!(from = %previous, to = %state, "Synchronizer state changed");
        metrics::set_sync_state(state.as_str());
    }
}

/// Requests shutdown of a running [`Synchronizer`] from another task.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

/// Keeps a destination in step with a source.
///
/// # Example
///
/// ```rust,no_run
/// # async fn example() -> oplog_sync::Result<()> {
/// use oplog_sync::{MemoryDatabase, SyncConfig, Synchronizer};
/// use std::sync::Arc;
///
/// let source = Arc::new(MemoryDatabase::new("source"));
/// let destination = MemoryDatabase::new("destination");
///
/// let mut sync = Synchronizer::new(SyncConfig::default(), source, destination).await?;
/// sync.start().await?;
/// // ... later
/// sync.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct Synchronizer<S: SourceDatabase, D: DestinationDatabase> {
    config: SyncConfig,
    source: Arc<S>,
    destination: D,
    store: Arc<CheckpointStore>,

    /// Where replication starts.
    checkpoint: Timestamp,

    /// The checkpoint came from the store rather than the source.
    resumed: bool,

    state_tx: Arc<watch::Sender<SyncState>>,
    state_rx: watch::Receiver<SyncState>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    replicator_state: Option<watch::Receiver<ReplicatorState>>,

    main_handle: Option<JoinHandle<Result<SyncOutcome>>>,
    flush_handle: Option<JoinHandle<()>>,
    finished: bool,
}

impl<S: SourceDatabase, D: DestinationDatabase> Synchronizer<S, D> {
    /// Connect to both endpoints and establish the replication checkpoint.
    ///
    /// Fails without starting anything if either endpoint is unreachable or
    /// the source cannot report a change-log position.
    pub async fn new(config: SyncConfig, source: Arc<S>, destination: D) -> Result<Self> {
        config.validate()?;
        info!(
            source = %config.source_uri,
            destination = %config.destination_uri,
            oplog_only = config.oplog_only,
            "Initializing synchronizer"
        );

        check_connectivity(&config, source.as_ref(), &destination).await?;

        let store = Arc::new(CheckpointStore::new(&config.checkpoint.sqlite_path).await?);
        info!(path = %store.path(), "Checkpoint store initialized");

        let stored = if config.checkpoint.resume {
            store.get(&config.checkpoint_key()).await
        } else {
            None
        };

        let (checkpoint, resumed) = match stored {
            Some(ts) => {
                info!(checkpoint = %ts, "Resuming from stored checkpoint, initial sync skipped");
                (ts, true)
            }
            None => match CheckpointProvider::new(Arc::clone(&source)).capture().await {
                Ok(ts) => (ts, false),
                Err(e) => {
                    store.close().await;
                    return Err(e);
                }
            },
        };

        let (state_tx, state_rx) = watch::channel(SyncState::Ready);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        metrics::set_sync_state(SyncState::Ready.as_str());

        Ok(Self {
            config,
            source,
            destination,
            store,
            checkpoint,
            resumed,
            state_tx: Arc::new(state_tx),
            state_rx,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            replicator_state: None,
            main_handle: None,
            flush_handle: None,
            finished: false,
        })
    }

    pub fn state(&self) -> SyncState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<SyncState> {
        self.state_rx.clone()
    }

    /// State of the change-log replicator, once started.
    pub fn replicator_state(&self) -> Option<ReplicatorState> {
        self.replicator_state.as_ref().map(|rx| *rx.borrow())
    }

    /// The checkpoint replication started from.
    pub fn start_checkpoint(&self) -> Timestamp {
        self.checkpoint
    }

    /// Latest recorded checkpoint.
    pub async fn checkpoint(&self) -> Timestamp {
        self.store
            .get(&self.config.checkpoint_key())
            .await
            .unwrap_or(self.checkpoint)
    }

    /// True if this run resumed from a stored checkpoint.
    pub fn resumed(&self) -> bool {
        self.resumed
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Spawn the sync phases in the background.
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != SyncState::Ready || self.main_handle.is_some() {
            return Err(ReplicationError::InvalidState {
                expected: "Ready".to_string(),
                actual: self.state().to_string(),
            });
        }

        let replicator = OplogReplicator::new(
            Arc::clone(&self.source),
            self.destination.session(),
            Arc::clone(&self.store),
            self.config.checkpoint_key(),
            self.config.settings.tail.clone(),
        );
        self.replicator_state = Some(replicator.state_receiver());

        let initial_sync = if self.config.oplog_only {
            info!("Change-log only mode, initial sync skipped");
            None
        } else if self.resumed {
            None
        } else {
            Some(InitialSync::new(
                Arc::clone(&self.source),
                self.destination.session(),
                self.config.settings.copy.clone(),
            ))
        };

        self.spawn_checkpoint_flush_task();

        let state_tx = Arc::clone(&self.state_tx);
        let shutdown_rx = self.shutdown_rx.clone();
        let checkpoint = self.checkpoint;
        let span = info_span!("synchronizer", source = %self.config.source_uri);

        let handle = tokio::spawn(
            async move {
                let result = drive(initial_sync, replicator, checkpoint, &state_tx, shutdown_rx).await;
                if let Err(e) = &result {
                    error!(error = %e, "Synchronizer failed");
                    metrics::record_error("fatal");
                    set_state(&state_tx, SyncState::Failed);
                }
                result
            }
            .instrument(span),
        );
        self.main_handle = Some(handle);

        info!(checkpoint = %self.checkpoint, resumed = self.resumed, "Synchronizer started");
        Ok(())
    }

    /// Periodically flush dirty checkpoints.
    fn spawn_checkpoint_flush_task(&mut self) {
        let store = Arc::clone(&self.store);
        let mut shutdown_rx = self.shutdown_rx.clone();
        let flush_interval = self.config.checkpoint.flush_interval_duration();

        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(flush_interval);

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if let Err(e) = store.flush_dirty().await {
                            warn!(error = %e, "Failed to flush checkpoints");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!("Checkpoint flush task stopping");
                            break;
                        }
                    }
                }
            }
        });

        debug!(interval_ms = flush_interval.as_millis() as u64, "Spawned checkpoint flush task");
        self.flush_handle = Some(handle);
    }

    /// Wait for the background work to end.
    ///
    /// Replication only ends on shutdown (see [`shutdown_handle`](Self::shutdown_handle))
    /// or a fatal error.
    pub async fn wait(&mut self) -> Result<SyncOutcome> {
        let handle = self.main_handle.take().ok_or_else(|| ReplicationError::InvalidState {
            expected: "started".to_string(),
            actual: self.state().to_string(),
        })?;

        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(ReplicationError::Internal(format!(
                "synchronizer task panicked: {}",
                e
            ))),
        };
        self.finish(result.is_ok()).await;
        result
    }

    /// Start and run until shutdown or a fatal error.
    pub async fn run(mut self) -> Result<SyncOutcome> {
        self.start().await?;
        self.wait().await
    }

    /// Stop gracefully.
    ///
    /// Shutdown sequence:
    /// 1. Signal the running phase to stop
    /// 2. Wait for in-flight work (with timeout)
    /// 3. Flush and close the checkpoint store
    pub async fn shutdown(&mut self) -> Result<SyncOutcome> {
        if self.finished {
            return Ok(SyncOutcome::default());
        }

        info!("Shutting down synchronizer");
        if self.state() != SyncState::Failed {
            set_state(&self.state_tx, SyncState::ShuttingDown);
        }
        self.shutdown_tx.send_replace(true);

        let result = match self.main_handle.take() {
            None => Ok(SyncOutcome::default()),
            Some(mut handle) => match tokio::time::timeout(DRAIN_TIMEOUT, &mut handle).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => Err(ReplicationError::Internal(format!(
                    "synchronizer task panicked: {}",
                    e
                ))),
                Err(_) => {
                    warn!(timeout_secs = DRAIN_TIMEOUT.as_secs(), "Synchronizer did not stop in time, aborting");
                    handle.abort();
                    Err(ReplicationError::Internal("timed out waiting for shutdown".to_string()))
                }
            },
        };

        self.finish(result.is_ok()).await;
        result
    }

    async fn finish(&mut self, success: bool) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.shutdown_tx.send_replace(true);

        if let Some(handle) = self.flush_handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Checkpoint flush task panicked");
            }
        }

        // Close checkpoint store (includes WAL checkpoint)
        self.store.close().await;

        if success {
            set_state(&self.state_tx, SyncState::Stopped);
            info!("Synchronizer stopped");
        } else {
            set_state(&self.state_tx, SyncState::Failed);
        }
    }
}

/// Ping both endpoints with the startup retry policy.
async fn check_connectivity<S: SourceDatabase, D: DestinationDatabase>(
    config: &SyncConfig,
    source: &S,
    destination: &D,
) -> Result<()> {
    let retry = config.settings.connect.retry_config();

    match retry_transient(&retry, "source_ping", || source.ping()).await {
        Ok(()) => {
            info!(endpoint = %config.source_uri, "Connected to source");
            metrics::record_connection("source", true);
        }
        Err(e) => {
            error!(endpoint = %config.source_uri, error = %e, "Failed to connect to source");
            metrics::record_connection("source", false);
            return Err(ReplicationError::connection(&config.source_uri, e.to_string()));
        }
    }

    match retry_transient(&retry, "destination_ping", || destination.ping()).await {
        Ok(()) => {
            info!(endpoint = %config.destination_uri, "Connected to destination");
            metrics::record_connection("destination", true);
        }
        Err(e) => {
            error!(endpoint = %config.destination_uri, error = %e, "Failed to connect to destination");
            metrics::record_connection("destination", false);
            return Err(ReplicationError::connection(&config.destination_uri, e.to_string()));
        }
    }

    Ok(())
}

/// Bulk copy (if any), then replicate until shutdown.
async fn drive<S: SourceDatabase, D: DestinationDatabase>(
    initial_sync: Option<InitialSync<S, D>>,
    replicator: OplogReplicator<S, D>,
    checkpoint: Timestamp,
    state_tx: &watch::Sender<SyncState>,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<SyncOutcome> {
    let mut outcome = SyncOutcome::default();

    if let Some(initial_sync) = initial_sync {
        set_state(state_tx, SyncState::InitialSync);
        let report = initial_sync.run(&shutdown_rx).await?;
        let cancelled = report.cancelled;
        outcome.initial_sync = Some(report);
        if cancelled {
            return Ok(outcome);
        }
    }

    if *shutdown_rx.borrow() {
        return Ok(outcome);
    }

    set_state(state_tx, SyncState::Tailing);
    outcome.replication = Some(replicator.run(checkpoint, shutdown_rx).await?);
    Ok(outcome)
}
