//! The table backend contract: the pluggable seam between this crate's
//! core (memtable, table set, manifest protocol) and wherever tables
//! actually live (on-disk files, S3, …). Only the contract is defined
//! here — see SPEC_FULL.md §1 — plus an in-memory reference
//! implementation used by tests and single-process callers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::addr::Addr;
use crate::table::{MemoryTable, Table, TableError};
use crate::table_set::TableSet;

/// Errors raised by a [`TableBackend`].
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("table not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Table(#[from] TableError),
}

/// Factory for table readers and empty table sets, scoped by namespace.
///
/// `open_table` materializes a reader given only a name — this is what
/// lets [`crate::table_set::TableSet::union`] discover tables it learns
/// about from a manifest snapshot written by another process.
/// `write_table` persists a set of chunks (typically a just-frozen
/// memtable) as a new, durably-nameable table; this is what the engine
/// calls before computing a CAS payload, since a manifest can only
/// reference tables the backend can later re-open by name.
pub trait TableBackend: Send + Sync {
    /// Returns a fresh, empty table set scoped to `namespace`.
    fn create_table_set(&self, namespace: &str) -> Result<TableSet, BackendError>;

    /// Materializes a reader for a table the backend already knows about.
    fn open_table(&self, namespace: &str, name: &str) -> Result<Arc<dyn Table>, BackendError>;

    /// Persists `chunks` as a new table and returns a reader for it.
    fn write_table(
        &self,
        namespace: &str,
        chunks: Vec<(Addr, Arc<[u8]>)>,
    ) -> Result<Arc<dyn Table>, BackendError>;
}

/// An in-memory [`TableBackend`]: tables live in a process-wide registry
/// keyed by namespace and name. Good enough to exercise every engine path
/// (including cross-"process" union reconciliation within one test binary
/// by sharing one `Arc<MemoryTableBackend>` across multiple
/// `BlockStore`s) but not a production blob store — see SPEC_FULL.md §1.
#[derive(Default)]
pub struct MemoryTableBackend {
    namespaces: Mutex<HashMap<String, HashMap<String, Arc<dyn Table>>>>,
}

impl MemoryTableBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn table_name(chunks: &[(Addr, Arc<[u8]>)]) -> String {
        let mut addrs: Vec<&Addr> = chunks.iter().map(|(a, _)| a).collect();
        addrs.sort();
        let mut hasher = Sha256::new();
        for a in addrs {
            hasher.update(a.as_bytes());
        }
        let digest = hasher.finalize();
        format!("table-{:x}", digest.iter().take(8).fold(0u64, |acc, b| (acc << 8) | *b as u64))
    }
}

impl TableBackend for MemoryTableBackend {
    fn create_table_set(&self, namespace: &str) -> Result<TableSet, BackendError> {
        let mut guard = self.namespaces.lock().expect("backend lock poisoned");
        guard.entry(namespace.to_string()).or_default();
        Ok(TableSet::empty())
    }

    fn open_table(&self, namespace: &str, name: &str) -> Result<Arc<dyn Table>, BackendError> {
        let guard = self.namespaces.lock().expect("backend lock poisoned");
        guard
            .get(namespace)
            .and_then(|tables| tables.get(name))
            .cloned()
            .ok_or_else(|| BackendError::NotFound(name.to_string()))
    }

    fn write_table(
        &self,
        namespace: &str,
        chunks: Vec<(Addr, Arc<[u8]>)>,
    ) -> Result<Arc<dyn Table>, BackendError> {
        let name = Self::table_name(&chunks);
        debug!(namespace, name = %name, count = chunks.len(), "backend: writing table");
        let table: Arc<dyn Table> = Arc::new(MemoryTable::new(name.clone(), chunks));
        let mut guard = self.namespaces.lock().expect("backend lock poisoned");
        guard
            .entry(namespace.to_string())
            .or_default()
            .insert(name, Arc::clone(&table));
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::{HashAddr, Sha256Addr};

    fn addr(s: &str) -> Addr {
        Sha256Addr.hash(s.as_bytes())
    }

    #[test]
    fn write_then_open_round_trips() {
        let backend = MemoryTableBackend::new();
        let chunks = vec![(addr("a"), Arc::from(b"1".as_slice()))];
        let written = backend.write_table("ns", chunks).unwrap();
        let reopened = backend.open_table("ns", written.name()).unwrap();
        assert_eq!(reopened.get(&addr("a")).unwrap().data(), b"1");
    }

    #[test]
    fn open_unknown_table_errors() {
        let backend = MemoryTableBackend::new();
        assert!(matches!(backend.open_table("ns", "nope"), Err(BackendError::NotFound(_))));
    }

    #[test]
    fn namespaces_are_isolated() {
        let backend = MemoryTableBackend::new();
        let chunks = vec![(addr("a"), Arc::from(b"1".as_slice()))];
        let written = backend.write_table("ns1", chunks).unwrap();
        assert!(backend.open_table("ns2", written.name()).is_err());
    }

    #[test]
    fn same_chunk_set_produces_same_table_name() {
        let backend = MemoryTableBackend::new();
        let chunks_a = vec![(addr("a"), Arc::from(b"1".as_slice()))];
        let chunks_b = vec![(addr("a"), Arc::from(b"1".as_slice()))];
        let t1 = backend.write_table("ns", chunks_a).unwrap();
        let t2 = backend.write_table("ns", chunks_b).unwrap();
        assert_eq!(t1.name(), t2.name());
    }
}
