//! # chunkvault
//!
//! An embeddable, content-addressed chunk store engine. Chunks are keyed
//! by the hash of their own payload; the engine never computes that hash
//! itself (see [`addr::HashAddr`]) and trusts the address a caller hands
//! it. Coordination across independent writers — possibly on different
//! hosts — happens through a single compare-and-swap update to an
//! external [`manifest::ManifestStore`] record; there is no lock service
//! and no leader election.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                       BlockStore                          │
//! │  ┌────────────┐       ┌──────────────────────────────┐   │
//! │  │  MemTable  │──────►│           TableSet            │   │
//! │  │ (bounded,  │ roll  │  newest-first stack of        │   │
//! │  │  RwLock)   │       │  immutable Table readers       │   │
//! │  └────────────┘       └──────────────┬─────────────────┘   │
//! │                                      │ to_specs()           │
//! │                                      ▼                     │
//! │                      ┌───────────────────────────────┐    │
//! │                      │   ManifestStore (CAS cell)    │    │
//! │                      │ {root, engine-version, specs} │    │
//! │                      └───────────────────────────────┘    │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`store`] | The engine — open, put, get, extract, update_root, flush |
//! | [`memtable`] | Bounded in-memory write buffer, the newest layer |
//! | [`table`] | The `Table` contract and an in-memory reference reader |
//! | [`table_set`] | Ordered stack of `Table` layers with fan-out reads |
//! | [`manifest`] | The external CAS cell binding root, version, and table list |
//! | [`backend`] | The pluggable seam for where tables actually live |
//! | [`addr`] | Content addresses and the pluggable hash adapter |
//! | [`chunk`] | The chunk type: an address paired with its payload |
//! | [`get_record`] | Per-request carrier used by batch reads |
//!
//! ## Key properties
//!
//! - **Content-addressed, not key-addressed** — there is no separate key
//!   space; a chunk's address is derived from (and trusted to equal) its
//!   payload, so writes are naturally idempotent.
//! - **CAS-driven durability** — a `put` is visible to the calling
//!   process immediately, but only reachable to any other process once a
//!   subsequent `update_root` (or `flush`) wins its manifest CAS.
//! - **Out-of-scope table format** — on-disk table layout and the blob
//!   backend behind [`backend::TableBackend`] are intentionally left to
//!   the implementer; this crate only defines the contract and an
//!   in-memory reference implementation.
//! - **No background compaction** — merging or garbage-collecting old
//!   tables is left to callers who want it; the core engine only grows
//!   the table set.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chunkvault::addr::{HashAddr, Sha256Addr};
//! use chunkvault::backend::MemoryTableBackend;
//! use chunkvault::chunk::Chunk;
//! use chunkvault::manifest::InMemoryManifest;
//! use chunkvault::store::{BlockStore, BlockStoreConfig};
//!
//! let store = BlockStore::open(
//!     Arc::new(InMemoryManifest::new()),
//!     Arc::new(MemoryTableBackend::new()),
//!     BlockStoreConfig::default(),
//! )
//! .unwrap();
//!
//! let addr = Sha256Addr.hash(b"hello world");
//! store.put(Chunk::new(addr, b"hello world".to_vec())).unwrap();
//! assert_eq!(store.get(addr).unwrap().data(), b"hello world");
//!
//! // Publish: chunks written since the last successful update_root become
//! // visible to any other process sharing this manifest and backend.
//! let root = store.root();
//! store.update_root(root, addr).unwrap();
//! ```

#![allow(dead_code)]

pub mod addr;
pub mod backend;
pub mod chunk;
pub mod get_record;
pub mod manifest;
pub mod memtable;
pub mod store;
pub mod table;
pub mod table_set;
