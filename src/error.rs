// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the synchronizer.
//!
//! Errors are classified by what the caller should do about them, not by the
//! text of the underlying driver message.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Scope |
//! |------------|-----------|-------|
//! | `Connection` | Yes | Fatal at startup, retried while tailing |
//! | `CheckpointUnavailable` | No | Fatal at startup (change log disabled or unreachable) |
//! | `Index` | No | Aborts one collection's sync |
//! | `Copy` | No | Aborts one collection's sync |
//! | `Database` | Depends | Backend error, see [`DbError::is_transient`] |
//! | `OplogParse` | No | Malformed change-log entry, skipped |
//! | `CheckpointTooOld` | No | Fatal, a full resync is required |
//! | `CheckpointStore` | No | Local SQLite errors (needs operator attention) |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Lifecycle violation |
//! | `Internal` | No | Unexpected internal error |

use crate::database::DbError;
use crate::namespace::Namespace;
use crate::oplog::Timestamp;
use thiserror::Error;

/// Result type alias for synchronizer operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur while synchronizing.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// An endpoint could not be reached or the connection dropped.
    #[error("Connection error ({endpoint}): {message}")]
    Connection { endpoint: String, message: String },

    /// The resume checkpoint could not be read from the source.
    ///
    /// Either the change log is not enabled on the source or the connection
    /// was lost while querying it.
    #[error("Checkpoint unavailable: {0}")]
    CheckpointUnavailable(String),

    /// Creating an index on the destination failed.
    #[error("Index error on {namespace}: {message}")]
    Index { namespace: Namespace, message: String },

    /// Bulk copy of a collection could not proceed (cursor or listing failure).
    #[error("Copy error on {namespace}: {message}")]
    Copy { namespace: Namespace, message: String },

    /// Backend error not covered by a more specific variant.
    #[error("Database error: {0}")]
    Database(#[source] DbError),

    /// A change-log entry did not have the expected shape.
    #[error("Oplog parse error: {0}")]
    OplogParse(String),

    /// The source change log no longer holds entries at the checkpoint.
    #[error("Checkpoint {checkpoint} is older than the oldest change-log entry; full resync required")]
    CheckpointTooOld { checkpoint: Timestamp },

    /// SQLite error during checkpoint persistence.
    #[error("Checkpoint store error: {0}")]
    CheckpointStore(#[from] sqlx::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lifecycle violation (e.g. `start()` on a running synchronizer).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a connection error for an endpoint.
    pub fn connection(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }
}

impl From<DbError> for ReplicationError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::Connection(message) => Self::connection("unknown", message),
            DbError::OplogUnavailable(message) => Self::CheckpointUnavailable(message),
            DbError::OplogTruncated { requested, .. } => {
                Self::CheckpointTooOld { checkpoint: requested }
            }
            other => Self::Database(other),
        }
    }
}
