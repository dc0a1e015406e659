//! Chunks: the unit of storage.

use crate::addr::Addr;
use std::sync::Arc;

/// An immutable payload paired with its content address.
///
/// The address is required to equal the hash of the payload; the engine
/// trusts the caller for this equality and does not rehash on write (see
/// [`crate::store::BlockStore::put`]).
///
/// Cloning a `Chunk` is cheap: the payload is reference-counted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    addr: Addr,
    data: Arc<[u8]>,
}

impl Chunk {
    /// Builds a chunk from an address and its payload.
    pub fn new(addr: Addr, data: impl Into<Arc<[u8]>>) -> Self {
        Chunk {
            addr,
            data: data.into(),
        }
    }

    /// The sentinel returned for a miss. `is_empty()` is the only supported
    /// way for a caller to distinguish "not found" from a zero-length chunk
    /// that was genuinely stored — this engine does not accept zero-length
    /// payloads (see [`crate::memtable::MemTable::add_chunk`]), so the
    /// sentinel is unambiguous.
    pub fn empty() -> Self {
        Chunk {
            addr: Addr::ZERO,
            data: Arc::from([]),
        }
    }

    /// `true` for the not-found sentinel returned by `get`/`get_many`.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// This chunk's content address.
    pub fn addr(&self) -> Addr {
        self.addr
    }

    /// This chunk's payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Size of the payload in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Sha256Addr;
    use crate::addr::HashAddr;

    #[test]
    fn empty_chunk_is_empty() {
        assert!(Chunk::empty().is_empty());
    }

    #[test]
    fn non_empty_chunk_round_trips_fields() {
        let addr = Sha256Addr.hash(b"payload");
        let c = Chunk::new(addr, b"payload".to_vec());
        assert_eq!(c.addr(), addr);
        assert_eq!(c.data(), b"payload");
        assert!(!c.is_empty());
    }
}
