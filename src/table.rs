//! The `Table` contract: an immutable, named, readable chunk bundle.
//!
//! Table internals (on-disk format, index structures, the blob backend
//! behind them) are out of scope for this crate — see §6 of the
//! specification. This module only defines the trait the engine depends
//! on, plus the in-memory reference implementation used by tests and by
//! callers who don't need real persistence.

use std::sync::Arc;

use crossbeam::channel::Sender;
use thiserror::Error;

use crate::addr::Addr;
use crate::chunk::Chunk;
use crate::get_record::GetRecord;

/// Traversal order for [`Table::extract`] and
/// [`crate::table_set::TableSet::extract`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractOrder {
    /// Oldest-inserted chunk first.
    InsertOrder,
    /// Newest-inserted chunk first.
    ReverseOrder,
}

/// Errors a `Table` implementation may raise. Backend I/O errors are
/// wrapped in `Backend` and propagated without modification — the engine
/// does not retry at this layer.
#[derive(Debug, Error)]
pub enum TableError {
    #[error("table backend error: {0}")]
    Backend(String),
}

/// An immutable, named, readable bundle of chunks.
///
/// Implementations must be safe to share across threads: the same `Table`
/// instance may be queried concurrently by many readers, and may outlive
/// the `TableSet` that discovered it if another snapshot still references
/// it (readers are reference-counted at the backend layer so a `close`
/// during active reads does not invalidate in-flight lookups).
pub trait Table: Send + Sync {
    /// The content-derived name backends use to identify this table.
    fn name(&self) -> &str;

    /// Number of distinct chunks in this table.
    fn count(&self) -> u32;

    /// `true` if `addr` is present.
    fn has(&self, addr: &Addr) -> bool;

    /// Direct lookup of a single address.
    fn get(&self, addr: &Addr) -> Option<Chunk>;

    /// Fills the `result` of every request this table can satisfy.
    /// Requests already filled by an earlier (newer) layer must be left
    /// untouched.
    fn get_many(&self, reqs: &[Arc<GetRecord>]);

    /// Estimates the number of backend reads required to satisfy `reqs`,
    /// given the atomic backend block size, the maximum size a single
    /// coalesced read may reach, and an amplification threshold past
    /// which a coalesced read is split. Returns `(reads, split)`.
    fn calc_reads(&self, reqs: &[Arc<GetRecord>], block_size: u64, max_read_size: u64, amp_thresh: f64) -> (u32, bool);

    /// Emits every chunk in this table to `sink`, in the given order.
    fn extract(&self, order: ExtractOrder, sink: &Sender<Chunk>) -> Result<(), TableError>;

    /// Releases backend resources held by this reader.
    fn close(&self) -> Result<(), TableError>;
}

/// A plain in-memory [`Table`], backed by a sorted map.
///
/// This is the reference `Table` implementation: good enough to exercise
/// every engine code path (including read-amplification estimation) in a
/// single process, but it is not a production on-disk table format — that
/// format is explicitly out of scope (see SPEC_FULL.md §1).
pub struct MemoryTable {
    name: String,
    entries: std::collections::BTreeMap<Addr, Arc<[u8]>>,
    // Preserves the order chunks were added, for `extract`.
    insertion_order: Vec<Addr>,
}

impl MemoryTable {
    /// Builds a new named, immutable in-memory table from `chunks`.
    /// `chunks` order is taken as insertion order.
    pub fn new(name: impl Into<String>, chunks: impl IntoIterator<Item = (Addr, Arc<[u8]>)>) -> Self {
        let mut entries = std::collections::BTreeMap::new();
        let mut insertion_order = Vec::new();
        for (addr, bytes) in chunks {
            if entries.insert(addr, bytes).is_none() {
                insertion_order.push(addr);
            }
        }
        MemoryTable {
            name: name.into(),
            entries,
            insertion_order,
        }
    }
}

impl Table for MemoryTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn count(&self) -> u32 {
        self.entries.len() as u32
    }

    fn has(&self, addr: &Addr) -> bool {
        self.entries.contains_key(addr)
    }

    fn get(&self, addr: &Addr) -> Option<Chunk> {
        self.entries.get(addr).map(|b| Chunk::new(*addr, Arc::clone(b)))
    }

    fn get_many(&self, reqs: &[Arc<GetRecord>]) {
        for req in reqs {
            if req.is_filled() {
                continue;
            }
            if let Some(bytes) = self.entries.get(&req.addr) {
                req.fill(Chunk::new(req.addr, Arc::clone(bytes)));
            }
        }
    }

    fn calc_reads(&self, reqs: &[Arc<GetRecord>], block_size: u64, max_read_size: u64, amp_thresh: f64) -> (u32, bool) {
        calc_reads_for_hits(
            reqs.iter().filter(|r| self.entries.contains_key(&r.addr)).count(),
            block_size,
            max_read_size,
            amp_thresh,
        )
    }

    fn extract(&self, order: ExtractOrder, sink: &Sender<Chunk>) -> Result<(), TableError> {
        let addrs: Vec<Addr> = match order {
            ExtractOrder::InsertOrder => self.insertion_order.clone(),
            ExtractOrder::ReverseOrder => self.insertion_order.iter().rev().copied().collect(),
        };
        for addr in addrs {
            let bytes = self.entries.get(&addr).expect("insertion_order entry must exist");
            if sink.send(Chunk::new(addr, Arc::clone(bytes))).is_err() {
                break;
            }
        }
        Ok(())
    }

    fn close(&self) -> Result<(), TableError> {
        Ok(())
    }
}

/// Shared read-amplification cost model used by every `Table`
/// implementation's `calc_reads`: coalesce `hits` logical lookups into
/// physical backend reads of at most `max_read_size` bytes, splitting a
/// coalesced read that would amplify past `amp_thresh`.
pub(crate) fn calc_reads_for_hits(hits: usize, block_size: u64, max_read_size: u64, amp_thresh: f64) -> (u32, bool) {
    if hits == 0 || block_size == 0 {
        return (0, false);
    }
    let blocks_per_read = (max_read_size / block_size).max(1);
    let mut reads = (hits as u64).div_ceil(blocks_per_read);

    // A read spanning many blocks to serve few hits amplifies I/O; split
    // it once the amplification ratio passes `amp_thresh`.
    let amplification = blocks_per_read as f64 / hits.min(blocks_per_read as usize).max(1) as f64;
    let split = amplification > amp_thresh;
    if split {
        reads = reads.saturating_mul(2);
    }
    (reads as u32, split)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::{HashAddr, Sha256Addr};

    fn addr(s: &str) -> Addr {
        Sha256Addr.hash(s.as_bytes())
    }

    #[test]
    fn memory_table_basic_lookup() {
        let a = addr("one");
        let t = MemoryTable::new("t1", vec![(a, Arc::from(b"v".as_slice()))]);
        assert!(t.has(&a));
        assert_eq!(t.get(&a).unwrap().data(), b"v");
        assert_eq!(t.count(), 1);
    }

    #[test]
    fn memory_table_get_many_does_not_overwrite_filled() {
        let a = addr("one");
        let t = MemoryTable::new("t1", vec![(a, Arc::from(b"v1".as_slice()))]);
        let rec = Arc::new(GetRecord::new(a, 0));
        rec.fill(Chunk::new(a, b"already-found".to_vec()));
        t.get_many(&[Arc::clone(&rec)]);
        assert_eq!(rec.take_result().data(), b"already-found");
    }

    #[test]
    fn extract_orders() {
        let a1 = addr("a1");
        let a2 = addr("a2");
        let t = MemoryTable::new(
            "t1",
            vec![(a1, Arc::from(b"1".as_slice())), (a2, Arc::from(b"2".as_slice()))],
        );

        let (tx, rx) = crossbeam::channel::bounded(2);
        t.extract(ExtractOrder::InsertOrder, &tx).unwrap();
        drop(tx);
        let got: Vec<Addr> = rx.iter().map(|c| c.addr()).collect();
        assert_eq!(got, vec![a1, a2]);

        let (tx, rx) = crossbeam::channel::bounded(2);
        t.extract(ExtractOrder::ReverseOrder, &tx).unwrap();
        drop(tx);
        let got: Vec<Addr> = rx.iter().map(|c| c.addr()).collect();
        assert_eq!(got, vec![a2, a1]);
    }

    #[test]
    fn cost_model_zero_hits_is_zero_reads() {
        assert_eq!(calc_reads_for_hits(0, 4096, 65536, 2.0), (0, false));
    }

    #[test]
    fn cost_model_coalesces_within_max_read_size() {
        let (reads, _split) = calc_reads_for_hits(4, 4096, 16384, 100.0);
        assert_eq!(reads, 1);
    }
}
