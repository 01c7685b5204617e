// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Database integration traits.
//!
//! The synchronizer never talks to a wire protocol directly. It drives a
//! source and a destination through these traits, so a driver-backed
//! implementation and the in-memory [`MemoryDatabase`](memory::MemoryDatabase)
//! are interchangeable.
//!
//! # Example
//!
//! ```rust,no_run
//! use oplog_sync::database::{BoxFuture, DestinationDatabase, Document, IndexSpec};
//! use oplog_sync::namespace::Namespace;
//! use oplog_sync::oplog::UpdateDelta;
//! use serde_json::Value;
//!
//! #[derive(Clone)]
//! struct Discard;
//!
//! impl DestinationDatabase for Discard {
//!     fn ping(&self) -> BoxFuture<'_, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//!     fn session(&self) -> Self {
//!         self.clone()
//!     }
//!     fn create_index<'a>(&'a self, _ns: &'a Namespace, _index: &'a IndexSpec) -> BoxFuture<'a, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//!     fn insert<'a>(&'a self, _ns: &'a Namespace, _doc: Document) -> BoxFuture<'a, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//!     fn upsert<'a>(&'a self, _ns: &'a Namespace, _id: &'a Value, _doc: Document) -> BoxFuture<'a, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//!     fn update<'a>(&'a self, _ns: &'a Namespace, _id: &'a Value, _delta: &'a UpdateDelta) -> BoxFuture<'a, bool> {
//!         Box::pin(async { Ok(false) })
//!     }
//!     fn delete<'a>(&'a self, _ns: &'a Namespace, _id: &'a Value) -> BoxFuture<'a, bool> {
//!         Box::pin(async { Ok(false) })
//!     }
//! }
//! ```

pub mod memory;

use crate::namespace::Namespace;
use crate::oplog::{TailStart, Timestamp, UpdateDelta};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::future::Future;
use std::pin::Pin;

pub use memory::MemoryDatabase;

/// A document: an ordered JSON object.
pub type Document = Map<String, Value>;

/// Field that identifies a document within its collection.
pub const ID_FIELD: &str = "_id";

/// Name of the index every collection has on `_id`.
pub const ID_INDEX_NAME: &str = "_id_";

/// The `_id` of a document, if present.
pub fn document_id(doc: &Document) -> Option<&Value> {
    doc.get(ID_FIELD)
}

/// Result type for backend operations.
pub type DbResult<T> = std::result::Result<T, DbError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = DbResult<T>> + Send + 'a>>;

/// Backend error, classified by what the caller can do about it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DbError {
    /// Connection refused, reset or lost.
    #[error("connection error: {0}")]
    Connection(String),

    /// The server did not answer in time.
    #[error("timeout: {0}")]
    Timeout(String),

    /// A write collided with an existing `_id` or unique key.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// An index with the same name or key but different options exists.
    #[error("index conflict: {0}")]
    IndexConflict(String),

    /// An update could not be applied to the stored document.
    #[error("invalid update: {0}")]
    InvalidUpdate(String),

    /// The change log is not enabled on this server.
    #[error("change log unavailable: {0}")]
    OplogUnavailable(String),

    /// Entries at or after the requested position have been discarded.
    #[error("change log truncated: requested {requested}, oldest available {oldest}")]
    OplogTruncated {
        requested: Timestamp,
        oldest: Timestamp,
    },

    #[error("{0}")]
    Other(String),
}

impl DbError {
    /// True for errors that may succeed if the same call is repeated.
    pub fn is_transient(&self) -> bool {
        matches!(self, DbError::Connection(_) | DbError::Timeout(_))
    }
}

/// Index definition as reported by the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    /// Ordered field → direction (or index type) map.
    pub key: Document,
    #[serde(default)]
    pub unique: bool,
    /// Remaining options (`sparse`, `expireAfterSeconds`, ...).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub options: Document,
}

impl IndexSpec {
    pub fn new(name: impl Into<String>, key: Document) -> Self {
        Self {
            name: name.into(),
            key,
            unique: false,
            options: Map::new(),
        }
    }

    /// Single ascending field index named the way the server names it.
    pub fn ascending(field: &str) -> Self {
        let mut key = Map::new();
        key.insert(field.to_string(), Value::from(1));
        Self::new(format!("{}_1", field), key)
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn with_option(mut self, name: impl Into<String>, value: Value) -> Self {
        self.options.insert(name.into(), value);
        self
    }

    /// The implicit `_id` index, which every collection already has.
    pub fn is_id_index(&self) -> bool {
        self.name == ID_INDEX_NAME
    }

    /// Same key (in order), uniqueness and options. Names are not compared.
    pub fn is_equivalent(&self, other: &IndexSpec) -> bool {
        self.key.iter().eq(other.key.iter())
            && self.unique == other.unique
            && self.options == other.options
    }
}

/// Point-in-time read cursor over one collection.
pub trait DocumentCursor: Send {
    /// Next document, or `None` when exhausted.
    fn next(&mut self) -> BoxFuture<'_, Option<Document>>;
}

/// A consistent snapshot of a collection plus the count taken with it.
///
/// The count is approximate: a server may report a value that disagrees
/// with the number of documents the cursor yields.
pub struct Snapshot {
    pub total: u64,
    pub cursor: Box<dyn DocumentCursor>,
}

/// Open tail on the source change log.
pub trait OplogTail: Send {
    /// Up to `max` raw entries in log order.
    ///
    /// May wait briefly for new entries and return an empty batch when
    /// there are none. Fails with [`DbError::OplogTruncated`] if entries
    /// were discarded beneath the tail's position.
    fn next_batch(&mut self, max: usize) -> BoxFuture<'_, Vec<Document>>;
}

/// What the synchronizer reads from the source.
pub trait SourceDatabase: Send + Sync + 'static {
    /// Round-trip to verify the connection.
    fn ping(&self) -> BoxFuture<'_, ()>;

    fn database_names(&self) -> BoxFuture<'_, Vec<String>>;

    fn collection_names<'a>(&'a self, database: &'a str) -> BoxFuture<'a, Vec<String>>;

    fn indexes<'a>(&'a self, ns: &'a Namespace) -> BoxFuture<'a, Vec<IndexSpec>>;

    /// Open a snapshot cursor and take the collection count alongside it.
    fn open_snapshot<'a>(&'a self, ns: &'a Namespace) -> BoxFuture<'a, Snapshot>;

    /// Timestamp of the newest change-log entry.
    ///
    /// Fails with [`DbError::OplogUnavailable`] when the change log is not
    /// enabled.
    fn latest_optime(&self) -> BoxFuture<'_, Timestamp>;

    /// Open a tail positioned at `start`.
    ///
    /// Fails with [`DbError::OplogTruncated`] when entries at `start` have
    /// already been discarded.
    fn tail_oplog(&self, start: TailStart) -> BoxFuture<'_, Box<dyn OplogTail>>;
}

/// What the synchronizer writes to the destination.
pub trait DestinationDatabase: Send + Sync + 'static {
    /// Round-trip to verify the connection.
    fn ping(&self) -> BoxFuture<'_, ()>;

    /// An independent handle for one copy worker.
    fn session(&self) -> Self
    where
        Self: Sized;

    /// Create the index unless an equivalent one already exists.
    fn create_index<'a>(&'a self, ns: &'a Namespace, index: &'a IndexSpec) -> BoxFuture<'a, ()>;

    /// Plain insert. Fails with [`DbError::DuplicateKey`] if `_id` exists.
    fn insert<'a>(&'a self, ns: &'a Namespace, document: Document) -> BoxFuture<'a, ()>;

    /// Insert or fully replace the document with this `_id`.
    fn upsert<'a>(&'a self, ns: &'a Namespace, id: &'a Value, document: Document)
        -> BoxFuture<'a, ()>;

    /// Apply `delta` to the document with this `_id`. Returns whether a
    /// document matched.
    fn update<'a>(&'a self, ns: &'a Namespace, id: &'a Value, delta: &'a UpdateDelta)
        -> BoxFuture<'a, bool>;

    /// Remove the document with this `_id`. Returns whether one existed.
    fn delete<'a>(&'a self, ns: &'a Namespace, id: &'a Value) -> BoxFuture<'a, bool>;
}
