//! Database/collection namespaces and the internal-namespace filter.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Databases that hold server bookkeeping and are never replicated.
pub const INTERNAL_DATABASES: [&str; 2] = ["admin", "local"];

/// Collection name prefix reserved for server-managed collections.
pub const SYSTEM_COLLECTION_PREFIX: &str = "system.";

/// A `(database, collection)` pair, written `db.coll`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Namespace {
    pub database: String,
    pub collection: String,
}

impl Namespace {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// Parse `db.coll`, splitting at the first dot.
    ///
    /// Collection names may themselves contain dots (`system.indexes`,
    /// `a.b.c`), database names may not.
    pub fn parse(ns: &str) -> Option<Self> {
        let (database, collection) = ns.split_once('.')?;
        if database.is_empty() || collection.is_empty() {
            return None;
        }
        Some(Self::new(database, collection))
    }

    /// Command pseudo-collection (`db.$cmd`).
    pub fn is_command(&self) -> bool {
        self.collection == "$cmd"
    }

    /// True if this namespace must never be replicated.
    pub fn is_internal(&self) -> bool {
        is_internal_database(&self.database) || is_system_collection(&self.collection)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

/// `admin` and `local` hold server state, not user data.
pub fn is_internal_database(name: &str) -> bool {
    INTERNAL_DATABASES.contains(&name)
}

pub fn is_system_collection(name: &str) -> bool {
    name.starts_with(SYSTEM_COLLECTION_PREFIX)
}
