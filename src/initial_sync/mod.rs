// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Initial sync: bulk copy of every replicated collection.
//!
//! Collections are processed strictly one at a time. For each one the
//! indexes are replicated first, then the documents are copied through the
//! [`CollectionCopier`] worker pool. Only documents within a collection are
//! copied in parallel, which keeps destination write load bounded.
//!
//! A failure on one collection is logged and counted; the remaining
//! collections still sync. Failing to list databases at all ends the run.
//!
//! The replication checkpoint is captured before this runs and is not
//! touched here.

pub mod copier;
pub mod indexes;

pub use copier::{progress_percent, CollectionCopier, CopyStats};
pub use indexes::IndexReplicator;

use crate::config::CopyConfig;
use crate::database::{DestinationDatabase, SourceDatabase};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::namespace::{is_internal_database, is_system_collection, Namespace};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{error, info, info_span, warn, Instrument};

/// One collection that did not sync.
#[derive(Debug, Clone)]
pub struct CollectionFailure {
    /// The collection, or just the database (empty collection name) when
    /// listing its collections failed.
    pub namespace: Namespace,
    pub error: String,
}

/// Outcome of a full initial sync.
#[derive(Debug, Clone, Default)]
pub struct InitialSyncReport {
    pub collections_synced: usize,
    pub collections_failed: usize,
    pub indexes_created: usize,
    pub documents_copied: u64,
    pub documents_failed: u64,
    pub failures: Vec<CollectionFailure>,
    /// Shutdown was requested before every collection was processed.
    pub cancelled: bool,
    pub duration: Duration,
}

/// Drives index replication and bulk copy across all collections.
pub struct InitialSync<S: SourceDatabase, D: DestinationDatabase> {
    source: Arc<S>,
    indexes: IndexReplicator<S, D>,
    copier: CollectionCopier<S, D>,
    started: AtomicBool,
}

impl<S: SourceDatabase, D: DestinationDatabase> InitialSync<S, D> {
    pub fn new(source: Arc<S>, destination: D, config: CopyConfig) -> Self {
        Self {
            indexes: IndexReplicator::new(Arc::clone(&source), destination.session()),
            copier: CollectionCopier::new(Arc::clone(&source), destination, config),
            source,
            started: AtomicBool::new(false),
        }
    }

    /// Run the bulk copy. May only be called once.
    ///
    /// Returns early with `cancelled` set if `shutdown` flips to `true`.
    /// No new collection is started after that, and a copy in progress stops
    /// feeding its workers and waits for their in-flight inserts.
    pub async fn run(&self, shutdown: &watch::Receiver<bool>) -> Result<InitialSyncReport> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ReplicationError::InvalidState {
                expected: "initial sync not started".to_string(),
                actual: "initial sync already ran".to_string(),
            });
        }

        let started = Instant::now();
        let mut report = InitialSyncReport::default();

        let databases = self.source.database_names().await.map_err(ReplicationError::from)?;
        let databases: Vec<String> = databases
            .into_iter()
            .filter(|db| !is_internal_database(db))
            .collect();
        info!(databases = databases.len(), "Starting initial sync");

        'databases: for database in databases {
            let collections = match self.source.collection_names(&database).await {
                Ok(names) => names,
                Err(e) => {
                    error!(database = %database, error = %e, "Failed to list collections, skipping database");
                    metrics::record_error("list_collections");
                    report.collections_failed += 1;
                    report.failures.push(CollectionFailure {
                        namespace: Namespace::new(database.clone(), ""),
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            for collection in collections.into_iter().filter(|c| !is_system_collection(c)) {
                if *shutdown.borrow() {
                    info!("Shutdown requested, stopping initial sync between collections");
                    report.cancelled = true;
                    break 'databases;
                }

                let ns = Namespace::new(database.clone(), collection);
                let collection_started = Instant::now();
                let span = info_span!("initial_sync", namespace = %ns);

                match self.sync_collection(&ns, shutdown).instrument(span).await {
                    Ok((indexes, stats)) if stats.cancelled => {
                        info!(namespace = %ns, copied = stats.copied, "Shutdown requested, collection left partially copied");
                        report.indexes_created += indexes;
                        report.documents_copied += stats.copied;
                        report.documents_failed += stats.failed;
                        report.cancelled = true;
                        break 'databases;
                    }
                    Ok((indexes, stats)) => {
                        report.collections_synced += 1;
                        report.indexes_created += indexes;
                        report.documents_copied += stats.copied;
                        report.documents_failed += stats.failed;
                        metrics::record_collection_sync(&ns.to_string(), true, collection_started.elapsed());
                    }
                    Err(e) => {
                        error!(namespace = %ns, error = %e, "Collection sync failed, continuing with next");
                        metrics::record_collection_sync(&ns.to_string(), false, collection_started.elapsed());
                        report.collections_failed += 1;
                        report.failures.push(CollectionFailure {
                            namespace: ns,
                            error: e.to_string(),
                        });
                    }
                }
            }
        }

        report.duration = started.elapsed();
        metrics::record_initial_sync_complete(
            report.collections_synced,
            report.collections_failed,
            report.duration,
        );

        if report.collections_failed > 0 {
            warn!(
                synced = report.collections_synced,
                failed = report.collections_failed,
                "Initial sync finished with failures"
            );
        }
        info!(
            synced = report.collections_synced,
            failed = report.collections_failed,
            documents = report.documents_copied,
            indexes = report.indexes_created,
            cancelled = report.cancelled,
            elapsed_ms = report.duration.as_millis() as u64,
            "Initial sync complete"
        );
        Ok(report)
    }

    async fn sync_collection(
        &self,
        ns: &Namespace,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<(usize, CopyStats)> {
        info!("Syncing collection");
        let indexes = self.indexes.replicate(ns).await?;
        let stats = self.copier.copy(ns, shutdown).await?;
        Ok((indexes, stats))
    }
}
