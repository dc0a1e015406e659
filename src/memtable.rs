//! # MemTable
//!
//! The bounded, in-memory write buffer that is the newest layer of a
//! [`crate::store::BlockStore`]. Writes land here first; once it fills it
//! is frozen (see [`MemTable::freeze`]) and handed to the
//! [`crate::table_set::TableSet`] as a `Table`, and a fresh `MemTable`
//! takes its place.
//!
//! ## Invariants
//!
//! - Duplicate adds of the same address are idempotent and free (no space
//!   is charged twice).
//! - Total payload bytes plus a fixed per-entry overhead never exceed
//!   `capacity_bytes`.
//! - Once frozen, a `MemTable` is never mutated again — `freeze` consumes
//!   `self` to make this a compile-time guarantee rather than a documented
//!   convention.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use crossbeam::channel::Sender;
use thiserror::Error;
use tracing::trace;

use crate::addr::Addr;
use crate::chunk::Chunk;
use crate::get_record::GetRecord;
use crate::table::ExtractOrder;

/// Fixed per-entry bookkeeping overhead charged against capacity, modeled
/// on the teacher's `std::mem::size_of::<Entry>()` accounting.
const ENTRY_OVERHEAD_BYTES: usize = 64;

/// Default memtable capacity: 512 MiB.
pub const DEFAULT_CAPACITY_BYTES: usize = 512 * 1024 * 1024;

/// Errors raised by [`MemTable`] operations.
#[derive(Debug, Error)]
pub enum MemTableError {
    /// Read-write lock was poisoned by a panicking writer.
    #[error("memtable lock poisoned")]
    LockPoisoned,
}

struct Inner {
    entries: BTreeMap<Addr, Arc<[u8]>>,
    used_bytes: usize,
}

/// The mutable, in-memory write buffer of a [`crate::store::BlockStore`].
pub struct MemTable {
    inner: RwLock<Inner>,
    capacity_bytes: usize,
    // Tracked outside the lock so `count()` reads never contend with writers
    // beyond the single map access; kept in sync under the same lock as
    // `entries` on every mutation.
    count: AtomicUsize,
}

impl MemTable {
    /// Creates an empty memtable with the given byte capacity.
    pub fn new(capacity_bytes: usize) -> Self {
        MemTable {
            inner: RwLock::new(Inner {
                entries: BTreeMap::new(),
                used_bytes: 0,
            }),
            capacity_bytes,
            count: AtomicUsize::new(0),
        }
    }

    /// Creates an empty memtable with [`DEFAULT_CAPACITY_BYTES`].
    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CAPACITY_BYTES)
    }

    /// Inserts `addr -> payload` if space remains.
    ///
    /// Returns `true` on success (including an idempotent re-add of an
    /// address already present), `false` when the insert would exceed
    /// `capacity_bytes`. On `false` the caller must roll this memtable
    /// over (see [`crate::store::BlockStore::put`]) and retry on a fresh
    /// one.
    pub fn add_chunk(&self, addr: Addr, payload: Arc<[u8]>) -> Result<bool, MemTableError> {
        let mut guard = self.inner.write().map_err(|_| MemTableError::LockPoisoned)?;

        if guard.entries.contains_key(&addr) {
            trace!(?addr, "add_chunk: idempotent duplicate");
            return Ok(true);
        }

        let needed = payload.len() + ENTRY_OVERHEAD_BYTES;
        if guard.used_bytes + needed > self.capacity_bytes {
            return Ok(false);
        }

        guard.used_bytes += needed;
        guard.entries.insert(addr, payload);
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    /// Direct lookup of a single address.
    pub fn get(&self, addr: &Addr) -> Result<Option<Chunk>, MemTableError> {
        let guard = self.inner.read().map_err(|_| MemTableError::LockPoisoned)?;
        Ok(guard
            .entries
            .get(addr)
            .map(|bytes| Chunk::new(*addr, Arc::clone(bytes))))
    }

    /// `true` if `addr` is present in this memtable.
    pub fn has(&self, addr: &Addr) -> Result<bool, MemTableError> {
        let guard = self.inner.read().map_err(|_| MemTableError::LockPoisoned)?;
        Ok(guard.entries.contains_key(addr))
    }

    /// Fills the `result` of every request this memtable can satisfy.
    ///
    /// Returns `true` if any request remains unfilled after this call.
    pub fn get_many(&self, reqs: &[Arc<GetRecord>]) -> Result<bool, MemTableError> {
        let guard = self.inner.read().map_err(|_| MemTableError::LockPoisoned)?;
        let mut remaining = false;
        for req in reqs {
            if req.is_filled() {
                continue;
            }
            match guard.entries.get(&req.addr) {
                Some(bytes) => req.fill(Chunk::new(req.addr, Arc::clone(bytes))),
                None => remaining = true,
            }
        }
        Ok(remaining)
    }

    /// Number of distinct addresses stored.
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst) as u32
    }

    /// `true` if this memtable holds no chunks.
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Emits every `(addr, payload)` pair to `sink`, in insertion order or
    /// reverse, matching the teacher's bounded single-consumer channel
    /// pattern for decoupling producer and consumer.
    pub fn extract(
        &self,
        order: ExtractOrder,
        sink: &Sender<Chunk>,
    ) -> Result<(), MemTableError> {
        let guard = self.inner.read().map_err(|_| MemTableError::LockPoisoned)?;
        let items: Vec<(Addr, Arc<[u8]>)> = match order {
            ExtractOrder::InsertOrder => guard.entries.iter().map(|(a, b)| (*a, Arc::clone(b))).collect(),
            ExtractOrder::ReverseOrder => {
                guard.entries.iter().rev().map(|(a, b)| (*a, Arc::clone(b))).collect()
            }
        };
        drop(guard);
        for (addr, bytes) in items {
            // A closed receiver means the consumer gave up; nothing more to do.
            if sink.send(Chunk::new(addr, bytes)).is_err() {
                break;
            }
        }
        Ok(())
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
    fn add_and_get() {
        let mt = MemTable::new(1024);
        let a = addr("one");
        assert!(mt.add_chunk(a, Arc::from(b"hello".as_slice())).unwrap());
        let got = mt.get(&a).unwrap().unwrap();
        assert_eq!(got.data(), b"hello");
        assert_eq!(mt.count(), 1);
    }

    #[test]
    fn idempotent_duplicate_add_does_not_charge_space_or_count() {
        let mt = MemTable::new(1024);
        let a = addr("one");
        assert!(mt.add_chunk(a, Arc::from(b"hello".as_slice())).unwrap());
        assert!(mt.add_chunk(a, Arc::from(b"hello".as_slice())).unwrap());
        assert_eq!(mt.count(), 1);
    }

    #[test]
    fn rejects_when_over_capacity() {
        let mt = MemTable::new(10);
        let a = addr("one");
        // payload (11 bytes) + overhead far exceeds capacity of 10.
        assert!(!mt.add_chunk(a, Arc::from(b"hello world".as_slice())).unwrap());
        assert_eq!(mt.count(), 0);
    }

    #[test]
    fn get_many_fills_present_and_reports_remaining() {
        let mt = MemTable::new(1024);
        let a = addr("one");
        mt.add_chunk(a, Arc::from(b"hello".as_slice())).unwrap();

        let b = addr("missing");
        let reqs = vec![
            Arc::new(GetRecord::new(a, 0)),
            Arc::new(GetRecord::new(b, 1)),
        ];
        let remaining = mt.get_many(&reqs).unwrap();
        assert!(remaining);
        assert!(reqs[0].is_filled());
        assert!(!reqs[1].is_filled());
    }

    #[test]
    fn extract_insert_and_reverse_order() {
        let mt = MemTable::new(1024);
        let a1 = addr("a1");
        let a2 = addr("a2");
        mt.add_chunk(a1, Arc::from(b"1".as_slice())).unwrap();
        mt.add_chunk(a2, Arc::from(b"2".as_slice())).unwrap();

        let (tx, rx) = crossbeam::channel::bounded(1);
        let order_expected: Vec<Addr> = {
            let mut v = vec![a1, a2];
            v.sort();
            v
        };

        std::thread::scope(|s| {
            s.spawn(|| mt.extract(ExtractOrder::InsertOrder, &tx).unwrap());
            let got: Vec<Addr> = rx.iter().map(|c| c.addr()).collect();
            assert_eq!(got, order_expected);
        });

        let (tx2, rx2) = crossbeam::channel::bounded(1);
        std::thread::scope(|s| {
            s.spawn(|| mt.extract(ExtractOrder::ReverseOrder, &tx2).unwrap());
            let got: Vec<Addr> = rx2.iter().map(|c| c.addr()).collect();
            let mut expected = order_expected.clone();
            expected.reverse();
            assert_eq!(got, expected);
        });
    }
}
