//! Index replication.
//!
//! Indexes are created on the destination before any document of the
//! collection is written, so documents inserted during the copy are indexed
//! the same way on both sides.

use crate::database::{DestinationDatabase, SourceDatabase};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::namespace::Namespace;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Copies index definitions for one collection at a time.
pub struct IndexReplicator<S: SourceDatabase, D: DestinationDatabase> {
    source: Arc<S>,
    destination: D,
}

impl<S: SourceDatabase, D: DestinationDatabase> IndexReplicator<S, D> {
    pub fn new(source: Arc<S>, destination: D) -> Self {
        Self {
            source,
            destination,
        }
    }

    /// Ensure every source index on `ns` exists on the destination.
    ///
    /// Returns the number of indexes ensured, not counting `_id`. An
    /// equivalent index already present on the destination is not an error;
    /// any other failure aborts with [`ReplicationError::Index`].
    pub async fn replicate(&self, ns: &Namespace) -> Result<usize> {
        let ns_label = ns.to_string();
        let indexes = self
            .source
            .indexes(ns)
            .await
            .map_err(|e| ReplicationError::Index {
                namespace: ns.clone(),
                message: format!("failed to list source indexes: {}", e),
            })?;

        let mut ensured = 0;
        for index in indexes.iter().filter(|i| !i.is_id_index()) {
            match self.destination.create_index(ns, index).await {
                Ok(()) => {
                    debug!(namespace = %ns, index = %index.name, unique = index.unique, "Index ensured");
                    metrics::record_index_created(&ns_label, true);
                    ensured += 1;
                }
                Err(e) => {
                    warn!(namespace = %ns, index = %index.name, error = %e, "Index creation failed");
                    metrics::record_index_created(&ns_label, false);
                    return Err(ReplicationError::Index {
                        namespace: ns.clone(),
                        message: format!("failed to create index {}: {}", index.name, e),
                    });
                }
            }
        }

        info!(namespace = %ns, count = ensured, "Replicated indexes");
        Ok(ensured)
    }
}
