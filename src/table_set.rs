//! # TableSet
//!
//! An ordered, newest-first stack of immutable [`Table`] readers. When a
//! memtable fills (or a non-empty memtable is flushed on root update),
//! [`crate::store::BlockStore`] persists its chunks through the
//! [`crate::backend::TableBackend`] and prepends the resulting named
//! table at the head; older tables trail toward the tail.
//!
//! A `TableSet` value is immutable for the lifetime of any reference a
//! reader holds: `prepend` and `union` both return a *new* `TableSet`
//! rather than mutating the receiver in place. This is what makes
//! "snapshot under the engine lock, then work outside it" sound — see the
//! design notes in SPEC_FULL.md §9.

use std::sync::Arc;

use rayon::prelude::*;
use thiserror::Error;
use tracing::debug;

use crate::addr::Addr;
use crate::get_record::GetRecord;
use crate::table::{ExtractOrder, Table, TableError};

/// The durable identity of one table in a `TableSet`: its name and chunk
/// count. This is exactly the payload a [`crate::manifest::ManifestStore`]
/// CAS carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub name: String,
    pub count: u32,
}

/// Errors raised by [`TableSet`] operations.
#[derive(Debug, Error)]
pub enum TableSetError {
    #[error(transparent)]
    Table(#[from] TableError),
}

type Layer = (String, Arc<dyn Table>);

/// An ordered, newest-first collection of table readers.
///
/// Cheap to clone: the outer `Vec` is rebuilt on `prepend`/`union`, but
/// the `Arc<dyn Table>` handles inside are shared, so existing readers
/// never pay for a table being re-discovered by another layer.
#[derive(Clone)]
pub struct TableSet {
    layers: Arc<Vec<Layer>>,
}

impl Default for TableSet {
    fn default() -> Self {
        TableSet::empty()
    }
}

impl TableSet {
    /// An empty table set (no tables).
    pub fn empty() -> Self {
        TableSet {
            layers: Arc::new(Vec::new()),
        }
    }

    /// Builds a table set from already-resolved `(name, reader)` pairs,
    /// newest-first. Used by [`crate::backend::TableBackend`]
    /// implementations to materialize a set from manifest specs.
    pub fn from_layers(layers: Vec<Layer>) -> Self {
        TableSet {
            layers: Arc::new(layers),
        }
    }

    /// Number of layers (tables) in this set.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// `true` if this set has no tables.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Returns a new logical set with `reader` at the head. This is the
    /// operation that freezes a memtable: the caller wraps the frozen
    /// memtable as a `Table` and prepends it here.
    pub fn prepend(&self, name: impl Into<String>, reader: Arc<dyn Table>) -> TableSet {
        let mut layers = Vec::with_capacity(self.layers.len() + 1);
        layers.push((name.into(), reader));
        layers.extend(self.layers.iter().cloned());
        TableSet {
            layers: Arc::new(layers),
        }
    }

    /// Merges in tables discovered from a manifest snapshot that this set
    /// doesn't yet know about. `discover` materializes a reader for a name
    /// this set has never seen (typically `TableBackend::open_table`).
    ///
    /// The union is an idempotent set-union preserving order-by-first
    /// appearance: names already present keep their existing position and
    /// reader; unseen names are appended at the positions implied by
    /// `specs`' own ordering, after all currently-known names, so that
    /// "newest first" is preserved for the winner's own fresh tables while
    /// this engine's own already-known layers are never reordered.
    pub fn union<F>(&self, specs: &[TableSpec], mut discover: F) -> Result<TableSet, TableSetError>
    where
        F: FnMut(&str) -> Result<Arc<dyn Table>, TableError>,
    {
        let mut layers = self.layers.as_ref().clone();
        let known: std::collections::HashSet<&str> =
            layers.iter().map(|(name, _)| name.as_str()).collect();

        for spec in specs {
            if known.contains(spec.name.as_str()) {
                continue;
            }
            debug!(name = %spec.name, "table_set: discovering table for union");
            let reader = discover(&spec.name)?;
            layers.push((spec.name.clone(), reader));
        }

        Ok(TableSet {
            layers: Arc::new(layers),
        })
    }

    /// Queries layers newest-to-oldest, returning the address on first
    /// hit.
    pub fn has(&self, addr: &Addr) -> bool {
        self.layers.iter().any(|(_, t)| t.has(addr))
    }

    /// Queries layers newest-to-oldest, returning on first hit.
    pub fn get(&self, addr: &Addr) -> Option<crate::chunk::Chunk> {
        self.layers.iter().find_map(|(_, t)| t.get(addr))
    }

    /// Distributes `reqs` across layers in parallel. The same address can
    /// legitimately live in more than one layer (e.g. re-put after a root
    /// update), so more than one layer may race to fill the same slot
    /// concurrently; [`GetRecord::fill`] is first-writer-wins and a later
    /// fill is a harmless no-op rather than an error, so fanning the
    /// *same* shared `reqs` slice out to every layer concurrently is safe
    /// regardless of which layer's result happens to land first.
    ///
    /// Returns `true` if any request remains unfilled after querying every
    /// layer.
    pub fn get_many(&self, reqs: &[Arc<GetRecord>]) -> bool {
        self.layers.par_iter().for_each(|(_, t)| t.get_many(reqs));
        reqs.iter().any(|r| !r.is_filled())
    }

    /// Estimates `(reads, split)` for `reqs` across every layer in this
    /// set, and whether any request falls outside the set entirely
    /// (`remaining`). The engine asserts `remaining` is `false` whenever
    /// the memtable is absent (see SPEC_FULL.md §4.5).
    pub fn calc_reads(
        &self,
        reqs: &[Arc<GetRecord>],
        block_size: u64,
        max_read_size: u64,
        amp_thresh: f64,
    ) -> (u32, bool, bool) {
        let mut total_reads = 0u32;
        let mut any_split = false;
        let mut satisfied = vec![false; reqs.len()];

        for (_, table) in self.layers.iter() {
            let unresolved: Vec<Arc<GetRecord>> = reqs
                .iter()
                .enumerate()
                .filter(|(i, _)| !satisfied[*i])
                .map(|(_, r)| Arc::clone(r))
                .collect();
            if unresolved.is_empty() {
                break;
            }
            let (reads, split) = table.calc_reads(&unresolved, block_size, max_read_size, amp_thresh);
            total_reads += reads;
            any_split |= split;
            for (i, req) in reqs.iter().enumerate() {
                if !satisfied[i] && table.has(&req.addr) {
                    satisfied[i] = true;
                }
            }
        }

        let remaining = satisfied.iter().any(|s| !s);
        (total_reads, any_split, remaining)
    }

    /// Emits every chunk in every table to `sink`. Visits tables
    /// newest-first for `ReverseOrder`, oldest-first for `InsertOrder`.
    pub fn extract(&self, order: ExtractOrder, sink: &crossbeam::channel::Sender<crate::chunk::Chunk>) -> Result<(), TableSetError> {
        let iter_layers: Box<dyn Iterator<Item = &Layer>> = match order {
            ExtractOrder::ReverseOrder => Box::new(self.layers.iter()),
            ExtractOrder::InsertOrder => Box::new(self.layers.iter().rev()),
        };
        for (_, table) in iter_layers {
            table.extract(order, sink)?;
        }
        Ok(())
    }

    /// The durable identity of this set: `(name, count)` for every layer,
    /// newest-first. Used as the CAS payload in
    /// [`crate::manifest::ManifestStore::update`].
    pub fn to_specs(&self) -> Vec<TableSpec> {
        self.layers
            .iter()
            .map(|(name, t)| TableSpec {
                name: name.clone(),
                count: t.count(),
            })
            .collect()
    }

    /// Sum of `count()` across every layer. Per SPEC_FULL.md §4.5 this is
    /// not deduplicated across layers.
    pub fn count(&self) -> u32 {
        self.layers.iter().map(|(_, t)| t.count()).sum()
    }

    /// Releases every reader's backend resources.
    pub fn close(&self) -> Result<(), TableSetError> {
        for (_, t) in self.layers.iter() {
            t.close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::{HashAddr, Sha256Addr};
    use crate::table::MemoryTable;

    fn addr(s: &str) -> Addr {
        Sha256Addr.hash(s.as_bytes())
    }

    fn table(name: &str, entries: &[(&str, &[u8])]) -> Arc<dyn Table> {
        Arc::new(MemoryTable::new(
            name,
            entries
                .iter()
                .map(|(k, v)| (addr(k), Arc::from(*v))),
        ))
    }

    #[test]
    fn prepend_adds_at_head_and_preserves_tail() {
        let base = TableSet::empty().prepend("t1", table("t1", &[("a", b"1")]));
        let next = base.prepend("t2", table("t2", &[("b", b"2")]));
        let specs = next.to_specs();
        assert_eq!(specs[0].name, "t2");
        assert_eq!(specs[1].name, "t1");
    }

    #[test]
    fn get_returns_newest_layer_first() {
        let a = addr("dup");
        let older = TableSet::empty().prepend("old", table("old", &[("dup", b"old-value")]));
        let newer = older.prepend("new", table("new", &[("dup", b"new-value")]));
        assert_eq!(newer.get(&a).unwrap().data(), b"new-value");
    }

    #[test]
    fn union_is_idempotent_and_preserves_known_layers() {
        let t1 = table("t1", &[("a", b"1")]);
        let set = TableSet::empty().prepend("t1", t1);
        let specs = vec![
            TableSpec { name: "t1".into(), count: 1 },
            TableSpec { name: "t2".into(), count: 1 },
        ];
        let unioned = set
            .union(&specs, |name| Ok(table(name, &[("b", b"2")])))
            .unwrap();
        assert_eq!(unioned.len(), 2);
        // t1 is still the original reader (no rediscovery for known names).
        assert_eq!(unioned.get(&addr("a")).unwrap().data(), b"1");

        // Re-unioning with the same specs changes nothing.
        let unioned_again = unioned.union(&specs, |_| panic!("should not rediscover")).unwrap();
        assert_eq!(unioned_again.len(), 2);
    }

    #[test]
    fn get_many_distributes_across_layers_without_overwrite() {
        let set = TableSet::empty()
            .prepend("old", table("old", &[("a", b"old")]))
            .prepend("new", table("new", &[("a", b"new")]));
        let rec = Arc::new(GetRecord::new(addr("a"), 0));
        let remaining = set.get_many(&[Arc::clone(&rec)]);
        assert!(!remaining);
        assert_eq!(rec.take_result().data(), b"new");
    }

    #[test]
    fn extract_order_visits_layers_newest_or_oldest_first() {
        let set = TableSet::empty()
            .prepend("old", table("old", &[("a", b"1")]))
            .prepend("new", table("new", &[("b", b"2")]));

        let (tx, rx) = crossbeam::channel::bounded(4);
        set.extract(ExtractOrder::ReverseOrder, &tx).unwrap();
        drop(tx);
        let got: Vec<Addr> = rx.iter().map(|c| c.addr()).collect();
        assert_eq!(got, vec![addr("b"), addr("a")]);
    }

    #[test]
    fn count_does_not_dedup_across_layers() {
        let set = TableSet::empty()
            .prepend("old", table("old", &[("a", b"1")]))
            .prepend("new", table("new", &[("a", b"2")]));
        assert_eq!(set.count(), 2);
    }
}
