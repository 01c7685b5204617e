//! Parallel bulk copy of one collection.
//!
//! ```text
//!   snapshot cursor ──► producer ──► bounded queue ──┬──► worker 1 ──► destination
//!                                                    ├──► worker 2 ──► destination
//!                                                    └──► worker N ──► destination
//! ```
//!
//! One producer reads the point-in-time cursor and feeds a bounded channel.
//! A fixed pool of workers drains it, each with its own destination session,
//! doing plain inserts. The copy finishes only after every worker has exited.
//!
//! Document write failures (typically a duplicate key because the document
//! was already written) are counted and logged; they never abort the copy.
//!
//! On shutdown the producer stops reading and workers stop taking documents
//! off the queue. Inserts already in progress run to completion; whatever is
//! still queued is dropped and the copy reports itself as cancelled.

use crate::config::CopyConfig;
use crate::database::{document_id, DestinationDatabase, Document, SourceDatabase};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::namespace::Namespace;
use crate::resilience::RateLimiter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Outcome of copying one collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    /// Documents inserted on the destination.
    pub copied: u64,
    /// Count taken with the snapshot. Approximate.
    pub total: u64,
    /// Documents whose insert failed.
    pub failed: u64,
    /// Documents read from the cursor.
    pub read: u64,
    /// Shutdown stopped the copy before the cursor was exhausted.
    pub cancelled: bool,
}

impl CopyStats {
    pub fn percent(&self) -> f64 {
        progress_percent(self.copied + self.failed, self.total)
    }
}

/// Progress as a percentage of `total`.
///
/// Can exceed 100 when the collection grew after the count was taken. An
/// empty collection is reported as complete.
pub fn progress_percent(processed: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    processed as f64 * 100.0 / total as f64
}

/// Resolves once shutdown is requested. Never resolves if the sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[derive(Default)]
struct CopyCounters {
    copied: AtomicU64,
    failed: AtomicU64,
    processed: AtomicU64,
}

/// Copies collections through a bounded worker pool.
pub struct CollectionCopier<S: SourceDatabase, D: DestinationDatabase> {
    source: Arc<S>,
    destination: D,
    config: CopyConfig,
    rate_limiter: Option<Arc<RateLimiter>>,
}

impl<S: SourceDatabase, D: DestinationDatabase> CollectionCopier<S, D> {
    pub fn new(source: Arc<S>, destination: D, config: CopyConfig) -> Self {
        let rate_limiter = config
            .rate_limit_config()
            .map(|c| Arc::new(RateLimiter::new(c)));
        Self {
            source,
            destination,
            config,
            rate_limiter,
        }
    }

    /// Copy every document of `ns` visible in a snapshot opened now.
    ///
    /// Fails with [`ReplicationError::Copy`] if the snapshot cannot be opened
    /// or the cursor breaks mid-way. In the latter case the documents already
    /// queued are still written before the error is returned.
    ///
    /// If `shutdown` flips to `true` the copy winds down early and returns
    /// stats with `cancelled` set.
    pub async fn copy(&self, ns: &Namespace, shutdown: &watch::Receiver<bool>) -> Result<CopyStats> {
        let started = Instant::now();
        let ns_label = ns.to_string();

        let snapshot = self
            .source
            .open_snapshot(ns)
            .await
            .map_err(|e| ReplicationError::Copy {
                namespace: ns.clone(),
                message: format!("failed to open snapshot cursor: {}", e),
            })?;
        let total = snapshot.total;
        let mut cursor = snapshot.cursor;

        let worker_count = self.config.worker_count();
        let progress_interval = self.config.progress_interval.max(1);
        info!(namespace = %ns, total, workers = worker_count, "Starting collection copy");

        let (tx, rx) = mpsc::channel::<Document>(self.config.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let counters = Arc::new(CopyCounters::default());

        let mut workers = JoinSet::new();
        for worker_id in 0..worker_count {
            let session = self.destination.session();
            let rx = Arc::clone(&rx);
            let counters = Arc::clone(&counters);
            let limiter = self.rate_limiter.clone();
            let ns = ns.clone();
            let ns_label = ns_label.clone();
            let mut shutdown = shutdown.clone();

            workers.spawn(async move {
                loop {
                    // Hold the lock only while waiting for the next document
                    let next = tokio::select! {
                        biased;
                        _ = shutdown_requested(&mut shutdown) => None,
                        next = async { rx.lock().await.recv().await } => next,
                    };
                    let Some(doc) = next else { break };

                    if let Some(limiter) = &limiter {
                        limiter.acquire().await;
                    }

                    let id = document_id(&doc).cloned();
                    match session.insert(&ns, doc).await {
                        Ok(()) => {
                            counters.copied.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            counters.failed.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                namespace = %ns,
                                worker = worker_id,
                                id = ?id,
                                error = %e,
                                "Document insert failed, continuing"
                            );
                        }
                    }

                    let processed = counters.processed.fetch_add(1, Ordering::Relaxed) + 1;
                    if processed % progress_interval == 0 {
                        let percent = progress_percent(processed, total);
                        info!(namespace = %ns, processed, total, percent = %format!("{:.1}", percent), "Copy progress");
                        metrics::set_copy_progress(&ns_label, percent);
                    }
                }
                debug!(namespace = %ns, worker = worker_id, "Copy worker finished");
            });
        }

        let mut shutdown = shutdown.clone();
        let mut read = 0u64;
        let mut cancelled = false;
        let mut cursor_error = None;
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => {
                    cancelled = true;
                    break;
                }
                next = cursor.next() => next,
            };
            match next {
                Ok(Some(doc)) => {
                    read += 1;
                    let sent = tokio::select! {
                        biased;
                        _ = shutdown_requested(&mut shutdown) => {
                            cancelled = true;
                            break;
                        }
                        sent = tx.send(doc) => sent,
                    };
                    if sent.is_err() {
                        if *shutdown.borrow() {
                            cancelled = true;
                        } else {
                            cursor_error = Some("all copy workers exited early".to_string());
                        }
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!(namespace = %ns, read, error = %e, "Snapshot cursor failed");
                    cursor_error = Some(format!("cursor failed after {} documents: {}", read, e));
                    break;
                }
            }
        }
        if cancelled {
            info!(namespace = %ns, read, "Shutdown requested, stopping collection copy");
        }
        // Closing the queue lets the workers drain and exit
        drop(tx);

        let mut panicked = 0;
        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                panicked += 1;
                error!(namespace = %ns, error = %e, "Copy worker panicked");
            }
        }

        let stats = CopyStats {
            copied: counters.copied.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            total,
            read,
            cancelled,
        };

        metrics::record_documents_copied(&ns_label, stats.copied);
        metrics::record_document_copy_failures(&ns_label, stats.failed);
        metrics::set_copy_progress(&ns_label, stats.percent());

        if panicked > 0 && cursor_error.is_none() {
            cursor_error = Some(format!("{} copy workers panicked", panicked));
        }
        if let Some(message) = cursor_error {
            return Err(ReplicationError::Copy {
                namespace: ns.clone(),
                message,
            });
        }

        if cancelled {
            warn!(
                namespace = %ns,
                copied = stats.copied,
                failed = stats.failed,
                total,
                "Collection copy cancelled"
            );
            return Ok(stats);
        }

        info!(
            namespace = %ns,
            copied = stats.copied,
            failed = stats.failed,
            total,
            percent = %format!("{:.1}", stats.percent()),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Collection copy complete"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{
        BoxFuture, DbError, DocumentCursor, IndexSpec, MemoryDatabase, OplogTail, Snapshot,
    };
    use crate::oplog::{TailStart, Timestamp};
    use serde_json::json;

    fn doc(id: u64) -> Document {
        json!({"_id": id, "name": format!("user-{}", id)})
            .as_object()
            .cloned()
            .unwrap()
    }

    fn config(workers: usize) -> CopyConfig {
        CopyConfig {
            workers: Some(workers),
            queue_capacity: 16,
            progress_interval: 100,
            ..Default::default()
        }
    }

    async fn seeded(count: u64) -> (Arc<MemoryDatabase>, Namespace) {
        let source = Arc::new(MemoryDatabase::new("src"));
        let ns = Namespace::new("app", "users");
        source.create_collection(&ns).await;
        for i in 0..count {
            source.insert(&ns, doc(i)).await.unwrap();
        }
        (source, ns)
    }

    fn running() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    #[test]
    fn test_progress_percent() {
        assert_eq!(progress_percent(0, 0), 100.0);
        assert_eq!(progress_percent(5, 10), 50.0);
        assert_eq!(progress_percent(15, 10), 150.0);
    }

    #[tokio::test]
    async fn test_copies_all_documents() {
        let (source, ns) = seeded(1_000).await;
        let dest = MemoryDatabase::new("dst");

        let copier = CollectionCopier::new(source, dest.clone(), config(4));
        let stats = copier.copy(&ns, &running()).await.unwrap();

        assert_eq!(stats.copied, 1_000);
        assert_eq!(stats.total, 1_000);
        assert_eq!(stats.read, 1_000);
        assert_eq!(stats.failed, 0);
        assert!(!stats.cancelled);
        assert_eq!(dest.count(&ns).await, 1_000);
        assert_eq!(dest.find(&ns, &json!(999)).await, Some(doc(999)));
    }

    #[tokio::test]
    async fn test_empty_collection() {
        let (source, ns) = seeded(0).await;
        let dest = MemoryDatabase::new("dst");

        let stats = CollectionCopier::new(source, dest, config(2)).copy(&ns, &running()).await.unwrap();
        assert_eq!((stats.copied, stats.total), (0, 0));
        assert_eq!(stats.percent(), 100.0);
    }

    #[tokio::test]
    async fn test_duplicate_keys_are_not_fatal() {
        let (source, ns) = seeded(50).await;
        let dest = MemoryDatabase::new("dst");
        for i in 0..10 {
            dest.insert(&ns, doc(i)).await.unwrap();
        }

        let stats = CollectionCopier::new(source, dest.clone(), config(3)).copy(&ns, &running()).await.unwrap();
        assert_eq!(stats.copied, 40);
        assert_eq!(stats.failed, 10);
        assert_eq!(dest.count(&ns).await, 50);
    }

    #[tokio::test]
    async fn test_single_worker() {
        let (source, ns) = seeded(250).await;
        let dest = MemoryDatabase::new("dst");

        let stats = CollectionCopier::new(source, dest.clone(), config(1)).copy(&ns, &running()).await.unwrap();
        assert_eq!(stats.copied, 250);
        assert_eq!(dest.count(&ns).await, 250);
    }

    #[tokio::test]
    async fn test_rate_limited_copy_completes() {
        let (source, ns) = seeded(20).await;
        let dest = MemoryDatabase::new("dst");
        let mut cfg = config(2);
        cfg.rate_limit_enabled = true;
        cfg.rate_limit_burst = 100;
        cfg.rate_limit_per_sec = 1000;

        let stats = CollectionCopier::new(source, dest, cfg).copy(&ns, &running()).await.unwrap();
        assert_eq!(stats.copied, 20);
    }

    #[tokio::test]
    async fn test_shutdown_before_copy_reads_nothing() {
        let (source, ns) = seeded(100).await;
        let dest = MemoryDatabase::new("dst");
        let (_tx, stopped) = watch::channel(true);

        let stats = CollectionCopier::new(source, dest.clone(), config(2))
            .copy(&ns, &stopped)
            .await
            .unwrap();
        assert!(stats.cancelled);
        assert_eq!(stats.read, 0);
        assert_eq!(stats.copied, 0);
        assert_eq!(dest.count(&ns).await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_mid_copy_stops_promptly() {
        let (source, ns) = seeded(1_000).await;
        let dest = MemoryDatabase::new("dst");
        let mut cfg = config(2);
        cfg.rate_limit_enabled = true;
        cfg.rate_limit_per_sec = 100;
        cfg.rate_limit_burst = 10;

        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(150)).await;
            tx.send_replace(true);
        });

        let started = Instant::now();
        let stats = CollectionCopier::new(source, dest.clone(), cfg)
            .copy(&ns, &rx)
            .await
            .unwrap();
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
        assert!(stats.cancelled);
        assert!(stats.copied > 0);
        assert!(stats.copied < 1_000);
        // Every insert that started also finished
        assert_eq!(dest.count(&ns).await as u64, stats.copied);
    }

    /// Source whose cursor breaks after a few documents.
    struct BrokenCursorSource {
        good: u64,
    }

    struct BrokenCursor {
        remaining: u64,
        next_id: u64,
    }

    impl DocumentCursor for BrokenCursor {
        fn next(&mut self) -> BoxFuture<'_, Option<Document>> {
            Box::pin(async move {
                if self.remaining == 0 {
                    return Err(DbError::Connection("cursor killed".into()));
                }
                self.remaining -= 1;
                self.next_id += 1;
                Ok(Some(doc(self.next_id)))
            })
        }
    }

    impl SourceDatabase for BrokenCursorSource {
        fn ping(&self) -> BoxFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }
        fn database_names(&self) -> BoxFuture<'_, Vec<String>> {
            Box::pin(async { Ok(vec![]) })
        }
        fn collection_names<'a>(&'a self, _database: &'a str) -> BoxFuture<'a, Vec<String>> {
            Box::pin(async { Ok(vec![]) })
        }
        fn indexes<'a>(&'a self, _ns: &'a Namespace) -> BoxFuture<'a, Vec<IndexSpec>> {
            Box::pin(async { Ok(vec![]) })
        }
        fn open_snapshot<'a>(&'a self, _ns: &'a Namespace) -> BoxFuture<'a, Snapshot> {
            let good = self.good;
            Box::pin(async move {
                Ok(Snapshot {
                    total: good * 2,
                    cursor: Box::new(BrokenCursor {
                        remaining: good,
                        next_id: 0,
                    }),
                })
            })
        }
        fn latest_optime(&self) -> BoxFuture<'_, Timestamp> {
            Box::pin(async { Ok(Timestamp::default()) })
        }
        fn tail_oplog(&self, _start: TailStart) -> BoxFuture<'_, Box<dyn OplogTail>> {
            Box::pin(async { Err(DbError::OplogUnavailable("not supported".into())) })
        }
    }

    #[tokio::test]
    async fn test_cursor_failure_drains_then_errors() {
        let source = Arc::new(BrokenCursorSource { good: 7 });
        let dest = MemoryDatabase::new("dst");
        let ns = Namespace::new("app", "users");

        let err = CollectionCopier::new(source, dest.clone(), config(2))
            .copy(&ns, &running())
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Copy { .. }));
        assert!(err.to_string().contains("after 7 documents"));
        // Everything read before the failure was still written
        assert_eq!(dest.count(&ns).await, 7);
    }
}
