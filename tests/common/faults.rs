//! Fault-injecting wrappers around [`MemoryDatabase`].
//!
//! Each counter in [`Faults`] is a budget: the next N matching calls fail
//! with a transient `DbError::Connection`, then calls pass through again.
//! Tests arm faults at the moment they want the outage to begin.
//!
//! [`SlowDestination`] instead delays every insert and counts how many
//! started and finished, so tests can tell whether a write was cut short.

use oplog_sync::database::{
    BoxFuture, DbError, DestinationDatabase, Document, IndexSpec, OplogTail, Snapshot,
    SourceDatabase,
};
use oplog_sync::oplog::{TailStart, Timestamp, UpdateDelta};
use oplog_sync::{MemoryDatabase, Namespace};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Remaining failures per call kind.
#[derive(Default, Debug)]
pub struct Faults {
    pings: AtomicUsize,
    tail_opens: AtomicUsize,
    tail_reads: AtomicUsize,
    writes: AtomicUsize,
    /// Total failures actually injected.
    injected: AtomicUsize,
}

impl Faults {
    pub fn fail_pings(&self, n: usize) {
        self.pings.store(n, Ordering::SeqCst);
    }

    pub fn fail_tail_opens(&self, n: usize) {
        self.tail_opens.store(n, Ordering::SeqCst);
    }

    pub fn fail_tail_reads(&self, n: usize) {
        self.tail_reads.store(n, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, n: usize) {
        self.writes.store(n, Ordering::SeqCst);
    }

    pub fn injected(&self) -> usize {
        self.injected.load(Ordering::SeqCst)
    }

    fn take(&self, counter: &AtomicUsize) -> bool {
        let hit = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if hit {
            self.injected.fetch_add(1, Ordering::SeqCst);
        }
        hit
    }

    fn check(&self, counter: &AtomicUsize, what: &str) -> Result<(), DbError> {
        if self.take(counter) {
            Err(DbError::Connection(format!("injected fault: {}", what)))
        } else {
            Ok(())
        }
    }
}

/// Source whose pings, tail opens and tail reads can be made to fail.
pub struct FlakySource {
    pub inner: MemoryDatabase,
    pub faults: Arc<Faults>,
}

impl FlakySource {
    pub fn new(inner: MemoryDatabase) -> Self {
        Self {
            inner,
            faults: Arc::new(Faults::default()),
        }
    }
}

struct FlakyTail {
    inner: Box<dyn OplogTail>,
    faults: Arc<Faults>,
}

impl OplogTail for FlakyTail {
    fn next_batch(&mut self, max: usize) -> BoxFuture<'_, Vec<Document>> {
        Box::pin(async move {
            self.faults.check(&self.faults.tail_reads, "tail read")?;
            self.inner.next_batch(max).await
        })
    }
}

impl SourceDatabase for FlakySource {
    fn ping(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.faults.check(&self.faults.pings, "ping")?;
            SourceDatabase::ping(&self.inner).await
        })
    }

    fn database_names(&self) -> BoxFuture<'_, Vec<String>> {
        self.inner.database_names()
    }

    fn collection_names<'a>(&'a self, database: &'a str) -> BoxFuture<'a, Vec<String>> {
        self.inner.collection_names(database)
    }

    fn indexes<'a>(&'a self, ns: &'a Namespace) -> BoxFuture<'a, Vec<IndexSpec>> {
        self.inner.indexes(ns)
    }

    fn open_snapshot<'a>(&'a self, ns: &'a Namespace) -> BoxFuture<'a, Snapshot> {
        self.inner.open_snapshot(ns)
    }

    fn latest_optime(&self) -> BoxFuture<'_, Timestamp> {
        self.inner.latest_optime()
    }

    fn tail_oplog(&self, start: TailStart) -> BoxFuture<'_, Box<dyn OplogTail>> {
        Box::pin(async move {
            self.faults.check(&self.faults.tail_opens, "tail open")?;
            let inner = self.inner.tail_oplog(start).await?;
            let tail: Box<dyn OplogTail> = Box::new(FlakyTail {
                inner,
                faults: Arc::clone(&self.faults),
            });
            Ok(tail)
        })
    }
}

/// Destination whose pings and writes can be made to fail.
#[derive(Clone)]
pub struct FlakyDestination {
    pub inner: MemoryDatabase,
    pub faults: Arc<Faults>,
}

impl FlakyDestination {
    pub fn new(inner: MemoryDatabase) -> Self {
        Self {
            inner,
            faults: Arc::new(Faults::default()),
        }
    }
}

impl DestinationDatabase for FlakyDestination {
    fn ping(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.faults.check(&self.faults.pings, "ping")?;
            DestinationDatabase::ping(&self.inner).await
        })
    }

    fn session(&self) -> Self {
        self.clone()
    }

    fn create_index<'a>(&'a self, ns: &'a Namespace, index: &'a IndexSpec) -> BoxFuture<'a, ()> {
        self.inner.create_index(ns, index)
    }

    fn insert<'a>(&'a self, ns: &'a Namespace, document: Document) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.faults.check(&self.faults.writes, "insert")?;
            self.inner.insert(ns, document).await
        })
    }

    fn upsert<'a>(&'a self, ns: &'a Namespace, id: &'a Value, document: Document) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.faults.check(&self.faults.writes, "upsert")?;
            self.inner.upsert(ns, id, document).await
        })
    }

    fn update<'a>(&'a self, ns: &'a Namespace, id: &'a Value, delta: &'a UpdateDelta) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            self.faults.check(&self.faults.writes, "update")?;
            self.inner.update(ns, id, delta).await
        })
    }

    fn delete<'a>(&'a self, ns: &'a Namespace, id: &'a Value) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            self.faults.check(&self.faults.writes, "delete")?;
            self.inner.delete(ns, id).await
        })
    }
}

/// Destination whose inserts each take `delay`.
#[derive(Clone)]
pub struct SlowDestination {
    pub inner: MemoryDatabase,
    delay: Duration,
    started: Arc<AtomicUsize>,
    finished: Arc<AtomicUsize>,
}

impl SlowDestination {
    pub fn new(inner: MemoryDatabase, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            started: Arc::new(AtomicUsize::new(0)),
            finished: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn inserts_started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn inserts_finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

impl DestinationDatabase for SlowDestination {
    fn ping(&self) -> BoxFuture<'_, ()> {
        DestinationDatabase::ping(&self.inner)
    }

    fn session(&self) -> Self {
        self.clone()
    }

    fn create_index<'a>(&'a self, ns: &'a Namespace, index: &'a IndexSpec) -> BoxFuture<'a, ()> {
        self.inner.create_index(ns, index)
    }

    fn insert<'a>(&'a self, ns: &'a Namespace, document: Document) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            let result = self.inner.insert(ns, document).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            result
        })
    }

    fn upsert<'a>(&'a self, ns: &'a Namespace, id: &'a Value, document: Document) -> BoxFuture<'a, ()> {
        self.inner.upsert(ns, id, document)
    }

    fn update<'a>(&'a self, ns: &'a Namespace, id: &'a Value, delta: &'a UpdateDelta) -> BoxFuture<'a, bool> {
        self.inner.update(ns, id, delta)
    }

    fn delete<'a>(&'a self, ns: &'a Namespace, id: &'a Value) -> BoxFuture<'a, bool> {
        self.inner.delete(ns, id)
    }
}
