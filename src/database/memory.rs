// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory database.
//!
//! Implements both [`SourceDatabase`] and [`DestinationDatabase`]. Every
//! write appends a change-log entry in the same raw shape a replica-set
//! member produces, so one instance can act as a source and another as the
//! destination without any driver.
//!
//! - Snapshots copy the collection at open time; later writes are invisible
//!   to the cursor.
//! - The change log can be disabled (standalone server) or truncated from
//!   the front (capped collection rolling over).
//! - Only `_id` uniqueness is enforced.

use super::{
    document_id, BoxFuture, DbError, DbResult, DestinationDatabase, Document, DocumentCursor,
    IndexSpec, OplogTail, Snapshot, SourceDatabase, ID_FIELD, ID_INDEX_NAME,
};
use crate::namespace::Namespace;
use crate::oplog::{
    entry_timestamp, raw_command, raw_delete, raw_insert, raw_noop, raw_update, TailStart,
    Timestamp, UpdateDelta,
};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tracing::debug;

/// How long an idle tail waits for new entries before returning empty.
const DEFAULT_AWAIT_DATA: Duration = Duration::from_millis(100);

/// Canonical map key for an `_id` value.
fn id_key(id: &Value) -> String {
    id.to_string()
}

fn now_secs() -> u32 {
    u32::try_from(chrono::Utc::now().timestamp()).unwrap_or(u32::MAX)
}

#[derive(Default)]
struct Collection {
    documents: BTreeMap<String, Document>,
    indexes: Vec<IndexSpec>,
}

impl Collection {
    fn is_empty(&self) -> bool {
        self.documents.is_empty() && self.indexes.is_empty()
    }
}

struct State {
    collections: BTreeMap<Namespace, Collection>,
    oplog: Vec<Document>,
    /// Entries discarded from the front so far.
    removed: usize,
    /// Newest discarded entry.
    truncated_through: Option<Timestamp>,
    last_ts: Timestamp,
}

impl State {
    fn record(&mut self, build: impl FnOnce(Timestamp) -> Document) -> Timestamp {
        let ts = self.last_ts.successor(now_secs());
        self.last_ts = ts;
        self.oplog.push(build(ts));
        ts
    }

    fn oldest(&self) -> Timestamp {
        self.oplog
            .first()
            .and_then(entry_timestamp)
            .unwrap_or(self.last_ts)
    }
}

struct Inner {
    name: String,
    state: RwLock<State>,
    appended: Notify,
    oplog_enabled: AtomicBool,
    await_data: Duration,
}

/// Shared handle to an in-memory database. Clones see the same data.
#[derive(Clone)]
pub struct MemoryDatabase {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDatabase")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

impl MemoryDatabase {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_await_data(name, DEFAULT_AWAIT_DATA)
    }

    /// Create with a custom idle wait for tails.
    pub fn with_await_data(name: impl Into<String>, await_data: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: RwLock::new(State {
                    collections: BTreeMap::new(),
                    oplog: Vec::new(),
                    removed: 0,
                    truncated_through: None,
                    last_ts: Timestamp::new(now_secs(), 0),
                }),
                appended: Notify::new(),
                oplog_enabled: AtomicBool::new(true),
                await_data,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Turn change-log recording on or off.
    pub fn set_oplog_enabled(&self, enabled: bool) {
        self.inner.oplog_enabled.store(enabled, Ordering::SeqCst);
    }

    fn oplog_enabled(&self) -> bool {
        self.inner.oplog_enabled.load(Ordering::SeqCst)
    }

    /// Append an entry (if the change log is on) and wake idle tails.
    ///
    /// A collection only comes into existence if the mutation leaves
    /// something in it; updates and deletes that match nothing, or writes
    /// that fail, do not create one.
    async fn write<T>(
        &self,
        ns: &Namespace,
        mutate: impl FnOnce(&mut Collection) -> DbResult<(T, Option<EntryBuilder>)>,
    ) -> DbResult<T> {
        let (result, recorded) = {
            let mut state = self.inner.state.write().await;
            let created = !state.collections.contains_key(ns);
            let outcome = mutate(state.collections.entry(ns.clone()).or_default());
            if created && state.collections.get(ns).is_some_and(Collection::is_empty) {
                state.collections.remove(ns);
            }
            let (result, entry) = outcome?;
            match entry {
                Some(build) if self.oplog_enabled() && ns.database != "local" => {
                    state.record(build);
                    (result, true)
                }
                _ => (result, false),
            }
        };
        if recorded {
            self.inner.appended.notify_waiters();
        }
        Ok(result)
    }

    /// Append a raw entry built around the next timestamp.
    ///
    /// The builder may produce anything, including entries that do not
    /// parse.
    pub async fn push_raw_entry(&self, build: impl FnOnce(Timestamp) -> Document) -> Timestamp {
        let ts = self.inner.state.write().await.record(build);
        self.inner.appended.notify_waiters();
        ts
    }

    /// Heartbeat entry, as the server writes periodically when idle.
    pub async fn noop(&self, message: &str) -> Timestamp {
        self.push_raw_entry(|ts| raw_noop(ts, message)).await
    }

    /// Discard change-log entries older than `ts`.
    pub async fn truncate_oplog_before(&self, ts: Timestamp) -> usize {
        let mut state = self.inner.state.write().await;
        let cut = state
            .oplog
            .partition_point(|e| entry_timestamp(e).unwrap_or_default() < ts);
        if cut == 0 {
            return 0;
        }
        let newest_removed = state.oplog[..cut]
            .iter()
            .filter_map(entry_timestamp)
            .max();
        state.oplog.drain(..cut);
        state.removed += cut;
        state.truncated_through = state.truncated_through.max(newest_removed);
        debug!(db = %self.inner.name, removed = cut, "Truncated change log");
        cut
    }

    /// Copy of the raw change log.
    pub async fn oplog_entries(&self) -> Vec<Document> {
        self.inner.state.read().await.oplog.clone()
    }

    pub async fn oplog_len(&self) -> usize {
        self.inner.state.read().await.oplog.len()
    }

    /// Create an empty collection.
    pub async fn create_collection(&self, ns: &Namespace) {
        self.inner
            .state
            .write()
            .await
            .collections
            .entry(ns.clone())
            .or_default();
    }

    pub async fn find(&self, ns: &Namespace, id: &Value) -> Option<Document> {
        let state = self.inner.state.read().await;
        state
            .collections
            .get(ns)
            .and_then(|c| c.documents.get(&id_key(id)).cloned())
    }

    /// All documents in a collection.
    pub async fn documents(&self, ns: &Namespace) -> Vec<Document> {
        let state = self.inner.state.read().await;
        state
            .collections
            .get(ns)
            .map(|c| c.documents.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn count(&self, ns: &Namespace) -> usize {
        let state = self.inner.state.read().await;
        state.collections.get(ns).map_or(0, |c| c.documents.len())
    }

    /// Explicit (non-`_id`) indexes on a collection.
    pub async fn index_specs(&self, ns: &Namespace) -> Vec<IndexSpec> {
        let state = self.inner.state.read().await;
        state
            .collections
            .get(ns)
            .map(|c| c.indexes.clone())
            .unwrap_or_default()
    }

    pub async fn namespaces(&self) -> Vec<Namespace> {
        self.inner.state.read().await.collections.keys().cloned().collect()
    }
}

fn id_index() -> IndexSpec {
    let mut key = Map::new();
    key.insert(ID_FIELD.to_string(), Value::from(1));
    IndexSpec::new(ID_INDEX_NAME, key)
}

struct MemoryCursor {
    documents: std::vec::IntoIter<Document>,
}

impl DocumentCursor for MemoryCursor {
    fn next(&mut self) -> BoxFuture<'_, Option<Document>> {
        let doc = self.documents.next();
        Box::pin(async move { Ok(doc) })
    }
}

struct MemoryTail {
    db: MemoryDatabase,
    /// Absolute index of the next entry to hand out.
    next: usize,
    last_seen: Timestamp,
}

impl MemoryTail {
    async fn read_batch(&mut self, max: usize) -> DbResult<Vec<Document>> {
        if !self.db.oplog_enabled() {
            return Err(DbError::OplogUnavailable("change log disabled".into()));
        }
        let state = self.db.inner.state.read().await;
        if self.next < state.removed {
            return Err(DbError::OplogTruncated {
                requested: self.last_seen,
                oldest: state.oldest(),
            });
        }
        let start = self.next - state.removed;
        let batch: Vec<Document> = state.oplog.iter().skip(start).take(max).cloned().collect();
        self.next += batch.len();
        if let Some(ts) = batch.last().and_then(entry_timestamp) {
            self.last_seen = ts;
        }
        Ok(batch)
    }
}

impl OplogTail for MemoryTail {
    fn next_batch(&mut self, max: usize) -> BoxFuture<'_, Vec<Document>> {
        Box::pin(async move {
            let appended = Arc::clone(&self.db.inner);
            let notified = appended.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.read_batch(max).await?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            let _ = tokio::time::timeout(self.db.inner.await_data, notified).await;
            self.read_batch(max).await
        })
    }
}

impl SourceDatabase for MemoryDatabase {
    fn ping(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn database_names(&self) -> BoxFuture<'_, Vec<String>> {
        Box::pin(async move {
            let state = self.inner.state.read().await;
            let names: BTreeSet<String> = state
                .collections
                .keys()
                .map(|ns| ns.database.clone())
                .collect();
            Ok(names.into_iter().collect())
        })
    }

    fn collection_names<'a>(&'a self, database: &'a str) -> BoxFuture<'a, Vec<String>> {
        Box::pin(async move {
            let state = self.inner.state.read().await;
            Ok(state
                .collections
                .keys()
                .filter(|ns| ns.database == database)
                .map(|ns| ns.collection.clone())
                .collect())
        })
    }

    fn indexes<'a>(&'a self, ns: &'a Namespace) -> BoxFuture<'a, Vec<IndexSpec>> {
        Box::pin(async move {
            let state = self.inner.state.read().await;
            let mut specs = vec![id_index()];
            if let Some(collection) = state.collections.get(ns) {
                specs.extend(collection.indexes.iter().cloned());
            }
            Ok(specs)
        })
    }

    fn open_snapshot<'a>(&'a self, ns: &'a Namespace) -> BoxFuture<'a, Snapshot> {
        Box::pin(async move {
            let state = self.inner.state.read().await;
            let documents: Vec<Document> = state
                .collections
                .get(ns)
                .map(|c| c.documents.values().cloned().collect())
                .unwrap_or_default();
            Ok(Snapshot {
                total: documents.len() as u64,
                cursor: Box::new(MemoryCursor {
                    documents: documents.into_iter(),
                }),
            })
        })
    }

    fn latest_optime(&self) -> BoxFuture<'_, Timestamp> {
        Box::pin(async move {
            if !self.oplog_enabled() {
                return Err(DbError::OplogUnavailable(format!(
                    "{} is not recording a change log",
                    self.inner.name
                )));
            }
            Ok(self.inner.state.read().await.last_ts)
        })
    }

    fn tail_oplog(&self, start: TailStart) -> BoxFuture<'_, Box<dyn OplogTail>> {
        Box::pin(async move {
            if !self.oplog_enabled() {
                return Err(DbError::OplogUnavailable(format!(
                    "{} is not recording a change log",
                    self.inner.name
                )));
            }
            let state = self.inner.state.read().await;
            if let Some(through) = state.truncated_through {
                if start.includes(through) {
                    return Err(DbError::OplogTruncated {
                        requested: start.timestamp(),
                        oldest: state.oldest(),
                    });
                }
            }
            let offset = state
                .oplog
                .partition_point(|e| !start.includes(entry_timestamp(e).unwrap_or_default()));
            let tail: Box<dyn OplogTail> = Box::new(MemoryTail {
                db: self.clone(),
                next: state.removed + offset,
                last_seen: start.timestamp(),
            });
            Ok(tail)
        })
    }
}

type EntryBuilder = Box<dyn FnOnce(Timestamp) -> Document + Send>;

fn require_id(doc: &Document) -> DbResult<Value> {
    document_id(doc)
        .cloned()
        .ok_or_else(|| DbError::Other("document has no _id".into()))
}

impl DestinationDatabase for MemoryDatabase {
    fn ping(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn session(&self) -> Self {
        self.clone()
    }

    fn create_index<'a>(&'a self, ns: &'a Namespace, index: &'a IndexSpec) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if index.is_id_index() {
                self.create_collection(ns).await;
                return Ok(());
            }
            let ns_owned = ns.clone();
            let spec = index.clone();
            self.write(ns, move |collection| {
                if let Some(existing) = collection
                    .indexes
                    .iter()
                    .find(|i| i.name == spec.name || i.key.iter().eq(spec.key.iter()))
                {
                    if existing.name == spec.name && existing.is_equivalent(&spec) {
                        return Ok(((), None));
                    }
                    return Err(DbError::IndexConflict(format!(
                        "{} conflicts with existing index {} on {}",
                        spec.name, existing.name, ns_owned
                    )));
                }
                let mut body = Map::new();
                body.insert("createIndexes".into(), Value::from(ns_owned.collection.clone()));
                body.insert("name".into(), Value::from(spec.name.clone()));
                body.insert("key".into(), Value::Object(spec.key.clone()));
                collection.indexes.push(spec);
                let database = ns_owned.database.clone();
                let build: EntryBuilder = Box::new(move |ts| raw_command(ts, &database, body));
                Ok(((), Some(build)))
            })
            .await
        })
    }

    fn insert<'a>(&'a self, ns: &'a Namespace, document: Document) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let id = require_id(&document)?;
            let ns_owned = ns.clone();
            self.write(ns, move |collection| {
                let key = id_key(&id);
                if collection.documents.contains_key(&key) {
                    return Err(DbError::DuplicateKey(format!("{} in {}", key, ns_owned)));
                }
                collection.documents.insert(key, document.clone());
                let build: EntryBuilder = Box::new(move |ts| raw_insert(ts, &ns_owned, document));
                Ok(((), Some(build)))
            })
            .await
        })
    }

    fn upsert<'a>(
        &'a self,
        ns: &'a Namespace,
        id: &'a Value,
        mut document: Document,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if !document.contains_key(ID_FIELD) {
                document.insert(ID_FIELD.to_string(), id.clone());
            }
            let ns_owned = ns.clone();
            let id = id.clone();
            self.write(ns, move |collection| {
                let existed = collection
                    .documents
                    .insert(id_key(&id), document.clone())
                    .is_some();
                let build: EntryBuilder = if existed {
                    Box::new(move |ts| raw_update(ts, &ns_owned, &id, document))
                } else {
                    Box::new(move |ts| raw_insert(ts, &ns_owned, document))
                };
                Ok(((), Some(build)))
            })
            .await
        })
    }

    fn update<'a>(
        &'a self,
        ns: &'a Namespace,
        id: &'a Value,
        delta: &'a UpdateDelta,
    ) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let ns_owned = ns.clone();
            let id = id.clone();
            let delta = delta.clone();
            self.write(ns, move |collection| {
                let Some(stored) = collection.documents.get_mut(&id_key(&id)) else {
                    return Ok((false, None));
                };
                let mut updated = stored.clone();
                delta
                    .apply_to(&mut updated)
                    .map_err(|e| DbError::InvalidUpdate(e.to_string()))?;
                *stored = updated.clone();
                let o = delta.to_operator_document().unwrap_or(updated);
                let build: EntryBuilder = Box::new(move |ts| raw_update(ts, &ns_owned, &id, o));
                Ok((true, Some(build)))
            })
            .await
        })
    }

    fn delete<'a>(&'a self, ns: &'a Namespace, id: &'a Value) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let ns_owned = ns.clone();
            let id = id.clone();
            self.write(ns, move |collection| {
                if collection.documents.remove(&id_key(&id)).is_none() {
                    return Ok((false, None));
                }
                let build: EntryBuilder = Box::new(move |ts| raw_delete(ts, &ns_owned, &id));
                Ok((true, Some(build)))
            })
            .await
        })
    }
}
