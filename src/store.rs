//! # BlockStore
//!
//! The engine itself: a bounded memtable fronting a versioned table set,
//! with all durability and cross-process coordination funneled through a
//! single CAS-driven [`crate::manifest::ManifestStore`] update.
//!
//! Shape is the teacher's `Engine`/`EngineInner` split: one
//! `Arc<RwLock<StoreState>>` guarding the small, swappable parts (the
//! current memtable, the current table set, the current root), with
//! every read snapshotting the guarded state under the lock and then
//! doing its actual work — hashing, I/O, fan-out — after releasing it.
//! Writers hold the lock for the duration of their mutation, same as the
//! teacher's write path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::addr::Addr;
use crate::backend::{BackendError, TableBackend};
use crate::chunk::Chunk;
use crate::get_record::GetRecord;
use crate::manifest::{ManifestError, ManifestStore, ENGINE_VERSION};
use crate::memtable::{MemTable, MemTableError};
use crate::table::ExtractOrder;
use crate::table_set::{TableSetError, TableSet};

/// Configuration for opening a [`BlockStore`].
#[derive(Debug, Clone)]
pub struct BlockStoreConfig {
    /// Namespace passed to the [`TableBackend`] for every table this store
    /// creates or opens. Lets one backend host multiple independent
    /// stores.
    pub namespace: String,
    /// Byte capacity of each memtable generation before it rolls over.
    /// Defaults to [`crate::memtable::DEFAULT_CAPACITY_BYTES`].
    pub memtable_capacity_bytes: usize,
}

impl Default for BlockStoreConfig {
    fn default() -> Self {
        BlockStoreConfig {
            namespace: "default".to_string(),
            memtable_capacity_bytes: crate::memtable::DEFAULT_CAPACITY_BYTES,
        }
    }
}

/// Errors raised by [`BlockStore`] operations.
#[derive(Debug, Error)]
pub enum BlockStoreError {
    #[error(transparent)]
    MemTable(#[from] MemTableError),

    #[error(transparent)]
    TableSet(#[from] TableSetError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    /// An assertion about engine state that should be unreachable in
    /// correct usage failed. Not retryable.
    #[error("invariant violation: {0}")]
    Invariant(String),
}

struct StoreState {
    memtable: Option<Arc<MemTable>>,
    tables: TableSet,
    root: Addr,
    engine_version: String,
}

/// A content-addressed chunk store engine bound to one manifest, one
/// table backend, and one namespace.
///
/// Cloning a `BlockStore` is cheap and shares all state — every clone
/// observes the same memtable, table set, and root.
#[derive(Clone)]
pub struct BlockStore {
    inner: Arc<RwLock<StoreState>>,
    manifest: Arc<dyn ManifestStore>,
    backend: Arc<dyn TableBackend>,
    namespace: String,
    memtable_capacity_bytes: usize,
    put_count: Arc<AtomicU64>,
}

impl BlockStore {
    /// Opens a store against `manifest`/`backend`, adopting whatever root
    /// and table set the manifest already records, or starting fresh at
    /// [`Addr::ZERO`] if this is the first open.
    #[instrument(skip(manifest, backend))]
    pub fn open(
        manifest: Arc<dyn ManifestStore>,
        backend: Arc<dyn TableBackend>,
        config: BlockStoreConfig,
    ) -> Result<Self, BlockStoreError> {
        let namespace = config.namespace;
        let existing = manifest.parse_if_exists()?;

        let (root, engine_version, tables) = match existing {
            Some(contents) => {
                let empty = backend.create_table_set(&namespace)?;
                let namespace_for_discover = namespace.clone();
                let backend_for_discover = Arc::clone(&backend);
                let tables = empty.union(&contents.specs, move |name| {
                    backend_for_discover
                        .open_table(&namespace_for_discover, name)
                        .map_err(BackendError::into_table_error)
                })?;
                info!(root = %contents.root, tables = tables.len(), "store: opened existing manifest");
                (contents.root, contents.engine_version, tables)
            }
            None => {
                let tables = backend.create_table_set(&namespace)?;
                info!("store: no manifest record yet, starting fresh");
                (Addr::ZERO, ENGINE_VERSION.to_string(), tables)
            }
        };

        Ok(BlockStore {
            inner: Arc::new(RwLock::new(StoreState {
                memtable: None,
                tables,
                root,
                engine_version,
            })),
            manifest,
            backend,
            namespace,
            memtable_capacity_bytes: config.memtable_capacity_bytes,
            put_count: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Inserts one chunk. The caller-supplied address is trusted; this
    /// call never hashes the payload itself.
    ///
    /// Not durable on its own — the chunk is only reachable to another
    /// process once a subsequent [`BlockStore::update_root`] (or
    /// [`BlockStore::flush`]) publishes a root that covers it.
    #[instrument(skip(self, chunk), fields(addr = %chunk.addr()))]
    pub fn put(&self, chunk: Chunk) -> Result<(), BlockStoreError> {
        if chunk.is_empty() {
            return Err(BlockStoreError::Invariant("cannot store a zero-length chunk".into()));
        }
        let addr = chunk.addr();
        let payload: Arc<[u8]> = Arc::from(chunk.data());

        let mut state = self.inner.write().expect("store lock poisoned");
        self.put_locked(&mut state, addr, payload)?;
        self.put_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Inserts as many of `chunks` as fit, in order. Returns the
    /// unprocessed suffix (including the chunk that couldn't fit, even
    /// after a rollover) as a backpressure signal — an empty vec means
    /// every chunk was accepted.
    #[instrument(skip(self, chunks), fields(n = chunks.len()))]
    pub fn put_many(&self, chunks: Vec<Chunk>) -> Result<Vec<Chunk>, BlockStoreError> {
        let mut state = self.inner.write().expect("store lock poisoned");
        let mut iter = chunks.into_iter();

        while let Some(chunk) = iter.next() {
            if chunk.is_empty() {
                return Err(BlockStoreError::Invariant("cannot store a zero-length chunk".into()));
            }
            let addr = chunk.addr();
            let payload: Arc<[u8]> = Arc::from(chunk.data());

            match self.put_locked(&mut state, addr, payload) {
                Ok(()) => {
                    self.put_count.fetch_add(1, Ordering::SeqCst);
                }
                Err(BlockStoreError::Invariant(_)) => {
                    warn!(?addr, "put_many: chunk does not fit even in a fresh memtable, backpressuring");
                    let mut remaining = vec![chunk];
                    remaining.extend(iter);
                    return Ok(remaining);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Vec::new())
    }

    /// Adds `addr -> payload` to the current memtable, rolling it over to
    /// the table set exactly once if it doesn't fit. `state` must already
    /// be write-locked by the caller.
    fn put_locked(
        &self,
        state: &mut StoreState,
        addr: Addr,
        payload: Arc<[u8]>,
    ) -> Result<(), BlockStoreError> {
        if state.memtable.is_none() {
            state.memtable = Some(Arc::new(MemTable::new(self.memtable_capacity_bytes)));
        }

        let fits = {
            let mt = state.memtable.as_ref().expect("memtable just installed");
            mt.add_chunk(addr, Arc::clone(&payload))?
        };
        if fits {
            return Ok(());
        }

        self.roll_memtable(state)?;
        state.memtable = Some(Arc::new(MemTable::new(self.memtable_capacity_bytes)));
        let fits_fresh = {
            let mt = state.memtable.as_ref().expect("memtable just installed");
            mt.add_chunk(addr, payload)?
        };
        if !fits_fresh {
            return Err(BlockStoreError::Invariant(format!(
                "chunk at {addr:?} exceeds memtable capacity ({} bytes)",
                self.memtable_capacity_bytes
            )));
        }
        Ok(())
    }

    /// Persists the current memtable (if non-empty) through the backend
    /// and prepends it to the table set, clearing `state.memtable`.
    /// No-op if there is no memtable or it is empty.
    fn roll_memtable(&self, state: &mut StoreState) -> Result<(), BlockStoreError> {
        let Some(mt) = state.memtable.take() else {
            return Ok(());
        };
        if mt.is_empty() {
            return Ok(());
        }

        let (tx, rx) = crossbeam::channel::bounded(1);
        let mt_for_extract = Arc::clone(&mt);
        let chunks: Vec<(Addr, Arc<[u8]>)> = std::thread::scope(|scope| {
            scope.spawn(move || mt_for_extract.extract(ExtractOrder::InsertOrder, &tx));
            rx.iter().map(|c| (c.addr(), Arc::from(c.data()))).collect()
        });

        debug!(count = chunks.len(), "store: rolling memtable into table set");
        let table = self.backend.write_table(&self.namespace, chunks)?;
        let name = table.name().to_string();
        state.tables = state.tables.prepend(name, table);
        Ok(())
    }

    /// Direct lookup. Returns [`Chunk::empty`] on a miss.
    #[instrument(skip(self))]
    pub fn get(&self, addr: Addr) -> Result<Chunk, BlockStoreError> {
        let (mt, tables) = {
            let state = self.inner.read().expect("store lock poisoned");
            (state.memtable.clone(), state.tables.clone())
        };

        if let Some(mt) = &mt {
            if let Some(chunk) = mt.get(&addr)? {
                return Ok(chunk);
            }
        }
        Ok(tables.get(&addr).unwrap_or_else(Chunk::empty))
    }

    /// Batch lookup. Results are returned in the same order as `addrs`;
    /// missing entries are [`Chunk::empty`].
    #[instrument(skip(self, addrs), fields(n = addrs.len()))]
    pub fn get_many(&self, addrs: &[Addr]) -> Result<Vec<Chunk>, BlockStoreError> {
        let reqs: Vec<Arc<GetRecord>> = addrs
            .iter()
            .enumerate()
            .map(|(i, a)| Arc::new(GetRecord::new(*a, i)))
            .collect();

        let (mt, tables) = {
            let state = self.inner.read().expect("store lock poisoned");
            (state.memtable.clone(), state.tables.clone())
        };

        if let Some(mt) = &mt {
            mt.get_many(&reqs)?;
        }

        // Sort by prefix to let the table set coalesce adjacent reads, then
        // restore caller order before handing results back.
        let mut sorted = reqs.clone();
        sorted.sort_by_key(|r| r.prefix);
        tables.get_many(&sorted);

        let mut out: Vec<Option<Chunk>> = vec![None; reqs.len()];
        for req in &reqs {
            out[req.order] = Some(req.take_result());
        }
        Ok(out.into_iter().map(|c| c.unwrap_or_else(Chunk::empty)).collect())
    }

    /// `true` if `addr` is present in the memtable or any table.
    pub fn has(&self, addr: Addr) -> Result<bool, BlockStoreError> {
        let (mt, tables) = {
            let state = self.inner.read().expect("store lock poisoned");
            (state.memtable.clone(), state.tables.clone())
        };
        if let Some(mt) = &mt {
            if mt.has(&addr)? {
                return Ok(true);
            }
        }
        Ok(tables.has(&addr))
    }

    /// Sum of distinct addresses across the memtable and every table.
    /// Not deduplicated across layers — a chunk rewritten after a
    /// rollover is counted once per layer it appears in.
    pub fn count(&self) -> u32 {
        let state = self.inner.read().expect("store lock poisoned");
        let mt_count = state.memtable.as_ref().map(|m| m.count()).unwrap_or(0);
        mt_count + state.tables.count()
    }

    /// Estimates `(reads, split)` for `addrs` against the table set only.
    ///
    /// Callers are expected to use this for addresses they know live in
    /// already-flushed tables, not the hot memtable; it is an invariant
    /// violation for the table set to report every requested address as
    /// unresolved while the memtable is absent, since that would mean the
    /// caller asked about data this store has never seen.
    #[instrument(skip(self, addrs), fields(n = addrs.len()))]
    pub fn calc_reads(
        &self,
        addrs: &[Addr],
        block_size: u64,
        max_read_size: u64,
        amp_thresh: f64,
    ) -> Result<(u32, bool), BlockStoreError> {
        let reqs: Vec<Arc<GetRecord>> = addrs
            .iter()
            .enumerate()
            .map(|(i, a)| Arc::new(GetRecord::new(*a, i)))
            .collect();

        let (has_memtable, tables) = {
            let state = self.inner.read().expect("store lock poisoned");
            (state.memtable.is_some(), state.tables.clone())
        };

        let (reads, split, remaining) = tables.calc_reads(&reqs, block_size, max_read_size, amp_thresh);
        if remaining && !has_memtable {
            return Err(BlockStoreError::Invariant(
                "calc_reads: table set reports unresolved addresses with no memtable present".into(),
            ));
        }
        Ok((reads, split))
    }

    /// Atomically publishes `new_root` if the store's current root equals
    /// `expected_root`, folding in any non-empty memtable first.
    ///
    /// `expected_root` must equal the value last observed via
    /// [`BlockStore::root`] or a prior `update_root`/`flush` call on this
    /// same store instance — a mismatch is a programming error, not a
    /// retryable race, and returns `Err`. A *lost* CAS against another
    /// writer (this store's `root` was current, but a different process
    /// won first) returns `Ok(false)`, and this store adopts the winner's
    /// root and tables.
    #[instrument(skip(self))]
    pub fn update_root(&self, expected_root: Addr, new_root: Addr) -> Result<bool, BlockStoreError> {
        let mut state = self.inner.write().expect("store lock poisoned");
        if state.root != expected_root {
            return Err(BlockStoreError::Invariant(format!(
                "update_root: expected_root {expected_root:?} does not match current root {:?}",
                state.root
            )));
        }
        self.update_root_locked(&mut state, expected_root, new_root)
    }

    /// Re-publishes the current root with whatever the memtable has
    /// accumulated since the last successful root update. Always wins its
    /// own CAS unless another process raced it, since this store
    /// exclusively owns `state.root` between calls.
    #[instrument(skip(self))]
    pub fn flush(&self) -> Result<bool, BlockStoreError> {
        let mut state = self.inner.write().expect("store lock poisoned");
        let current_root = state.root;
        self.update_root_locked(&mut state, current_root, current_root)
    }

    fn update_root_locked(
        &self,
        state: &mut StoreState,
        expected_root: Addr,
        new_root: Addr,
    ) -> Result<bool, BlockStoreError> {
        self.roll_memtable(state)?;
        let specs = state.tables.to_specs();

        let (actual_root, actual_specs) = self.manifest.update(specs, expected_root, new_root)?;

        if actual_root != new_root {
            warn!(expected = %new_root, actual = %actual_root, "store: lost update_root race, merging in winner's tables");
            // Merge `actual_specs` into the existing table set rather than
            // rebuilding from scratch: this store's own just-rolled table
            // (not part of `actual_specs` yet, since this CAS lost) must
            // stay reachable so the caller's writes survive to retry the
            // update, per spec §4.7 step 5.
            let namespace = self.namespace.clone();
            let backend = Arc::clone(&self.backend);
            state.tables = state.tables.union(&actual_specs, move |name| {
                backend.open_table(&namespace, name).map_err(BackendError::into_table_error)
            })?;
            state.root = actual_root;
            return Ok(false);
        }

        state.root = new_root;
        state.engine_version = ENGINE_VERSION.to_string();
        info!(root = %new_root, "store: update_root committed");
        Ok(true)
    }

    /// Emits every chunk currently held (memtable, then tables, or the
    /// reverse) to `sink`. Holds the shared read lock for the duration of
    /// production, so a concurrent writer blocks until enumeration
    /// finishes.
    #[instrument(skip(self, sink))]
    pub fn extract_chunks(
        &self,
        order: ExtractOrder,
        sink: &crossbeam::channel::Sender<Chunk>,
    ) -> Result<(), BlockStoreError> {
        let state = self.inner.read().expect("store lock poisoned");
        match order {
            ExtractOrder::InsertOrder => {
                state.tables.extract(order, sink)?;
                if let Some(mt) = &state.memtable {
                    mt.extract(order, sink)?;
                }
            }
            ExtractOrder::ReverseOrder => {
                if let Some(mt) = &state.memtable {
                    mt.extract(order, sink)?;
                }
                state.tables.extract(order, sink)?;
            }
        }
        Ok(())
    }

    /// Releases every table reader's backend resources. Does not clear
    /// the in-memory memtable or root; a closed store should not be used
    /// again.
    pub fn close(&self) -> Result<(), BlockStoreError> {
        let state = self.inner.read().expect("store lock poisoned");
        state.tables.close()?;
        Ok(())
    }

    /// The currently published root.
    pub fn root(&self) -> Addr {
        self.inner.read().expect("store lock poisoned").root
    }

    /// The engine version tag recorded by the last successful root update.
    pub fn version(&self) -> String {
        self.inner.read().expect("store lock poisoned").engine_version.clone()
    }

    /// Total successful `put`/`put_many`-accepted chunk insertions across
    /// this store's lifetime. Informational only; not persisted.
    pub fn put_count(&self) -> u64 {
        self.put_count.load(Ordering::SeqCst)
    }

    /// Accepts prefetch/locality hints for future reads. Not implemented
    /// by any current backend; present so callers can be written against
    /// the full interface ahead of a backend that uses them.
    pub fn add_hints(&self, _addrs: &[Addr]) {}
}

impl BackendError {
    fn into_table_error(self) -> crate::table::TableError {
        match self {
            BackendError::Table(e) => e,
            other => crate::table::TableError::Backend(other.to_string()),
        }
    }
}
