//! Per-request carrier used by batch reads.

use crate::addr::Addr;
use crate::chunk::Chunk;
use std::sync::Mutex;

/// A single slot in a batch `get_many` request.
///
/// `order` preserves the caller's original index so results can be
/// returned positionally after the engine internally re-sorts requests by
/// address prefix to enable coalescing (see
/// [`crate::table_set::TableSet::calc_reads`]). `result` starts empty and
/// is filled by whichever layer (memtable or a table) finds the chunk
/// first; when the same address lives in more than one layer (e.g. after
/// a re-put following a root update), multiple layers may race to fill
/// the same slot concurrently — `fill` is first-writer-wins and later
/// callers are a no-op, not an error, since table-set fan-out dispatches
/// every layer concurrently with no ordering guarantee between them.
pub struct GetRecord {
    pub addr: Addr,
    pub prefix: [u8; crate::addr::PREFIX_LEN],
    pub order: usize,
    result: Mutex<Option<Chunk>>,
}

impl GetRecord {
    /// Builds a new, unfilled request slot for `addr` at caller position
    /// `order`.
    pub fn new(addr: Addr, order: usize) -> Self {
        GetRecord {
            addr,
            prefix: addr.prefix(),
            order,
            result: Mutex::new(None),
        }
    }

    /// `true` once some layer has filled this slot.
    pub fn is_filled(&self) -> bool {
        self.result.lock().expect("GetRecord result lock poisoned").is_some()
    }

    /// Fills this slot with `chunk`, unless it is already filled.
    ///
    /// First-writer-wins: returns `true` if this call performed the fill,
    /// `false` if another layer had already filled the slot. Callers that
    /// dispatch to multiple layers concurrently (see
    /// [`crate::table_set::TableSet::get_many`]) must not assume they are
    /// the only filler.
    pub fn fill(&self, chunk: Chunk) -> bool {
        let mut guard = self.result.lock().expect("GetRecord result lock poisoned");
        if guard.is_some() {
            return false;
        }
        *guard = Some(chunk);
        true
    }

    /// Takes the result out, leaving the empty chunk sentinel for misses.
    pub fn take_result(&self) -> Chunk {
        self.result
            .lock()
            .expect("GetRecord result lock poisoned")
            .take()
            .unwrap_or_else(Chunk::empty)
    }
}
