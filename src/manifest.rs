//! # Manifest
//!
//! The external, atomic CAS cell binding `{storage-version, engine-version,
//! root, table list}`. Multiple independent processes coordinate through
//! this record alone — there is no separate lock service.
//!
//! Two implementations ship:
//! - [`InMemoryManifest`]: a mutex-guarded in-process cell, for tests and
//!   single-process demos.
//! - [`FileManifest`]: a file-per-directory implementation using the
//!   bit-exact text record format from SPEC_FULL.md §4.3, atomic rename,
//!   and an advisory file lock to serialize the CAS sequence across
//!   processes — grounded in the teacher's `Manifest::checkpoint`
//!   snapshot-write-then-rename-then-fsync pattern.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crc32fast::Hasher as Crc32;
use fs2::FileExt;
use thiserror::Error;
use tracing::{info, warn};

use crate::addr::Addr;
use crate::table_set::TableSpec;

/// Current storage format version. A manifest carrying any other value is
/// fatal to open — see [`ManifestError::StorageVersionMismatch`].
pub const STORAGE_VERSION: &str = "0";

/// Compiled-in engine version tag, written on every successful root
/// update. A manifest carrying a different engine-version is still
/// loadable; the next successful `update_root` overwrites it.
pub const ENGINE_VERSION: &str = "chunkstore-engine/1";

const FIELD_SEP: char = '\u{1f}'; // ASCII unit separator
const MANIFEST_FILENAME: &str = "MANIFEST";
const LOCK_FILENAME: &str = "MANIFEST.lock";

/// Errors raised by a [`ManifestStore`].
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("manifest record is malformed: {0}")]
    Malformed(String),

    #[error("manifest checksum mismatch")]
    ChecksumMismatch,

    /// Fatal: the on-disk storage format does not match this build.
    #[error("storage-version mismatch: found {found}, expected {expected}")]
    StorageVersionMismatch { found: String, expected: String },

    #[error("manifest lock poisoned")]
    LockPoisoned,
}

/// Snapshot of a manifest record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestContents {
    pub engine_version: String,
    pub root: Addr,
    pub specs: Vec<TableSpec>,
}

/// The external CAS cell contract.
///
/// Implementations must guarantee that a successful `update` is visible
/// to every subsequent `parse_if_exists`/`update` call from any process
/// sharing the same underlying storage, and that `update` is atomic: two
/// racing callers with the same `expected_root` never both observe
/// success.
pub trait ManifestStore: Send + Sync {
    /// Reads the current record, if one has ever been written.
    fn parse_if_exists(&self) -> Result<Option<ManifestContents>, ManifestError>;

    /// Atomically replaces the record if its current root equals
    /// `expected_root`. Returns the record's root and specs *after* the
    /// call: `(new_root, specs)` on success, or the unchanged
    /// `(actual_root, actual_specs)` if another writer won the race.
    /// Callers MUST treat `actual_root != new_root` as "lost the race".
    fn update(
        &self,
        specs: Vec<TableSpec>,
        expected_root: Addr,
        new_root: Addr,
    ) -> Result<(Addr, Vec<TableSpec>), ManifestError>;
}

// --------------------------------------------------------------------
// In-memory manifest
// --------------------------------------------------------------------

struct InMemoryData {
    engine_version: String,
    root: Addr,
    specs: Vec<TableSpec>,
    ever_written: bool,
}

/// A process-local, mutex-guarded manifest. Useful for tests and for
/// engines that don't need to coordinate across processes.
pub struct InMemoryManifest {
    data: Mutex<InMemoryData>,
}

impl Default for InMemoryManifest {
    fn default() -> Self {
        InMemoryManifest {
            data: Mutex::new(InMemoryData {
                engine_version: ENGINE_VERSION.to_string(),
                root: Addr::ZERO,
                specs: Vec::new(),
                ever_written: false,
            }),
        }
    }
}

impl InMemoryManifest {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ManifestStore for InMemoryManifest {
    fn parse_if_exists(&self) -> Result<Option<ManifestContents>, ManifestError> {
        let guard = self.data.lock().map_err(|_| ManifestError::LockPoisoned)?;
        if !guard.ever_written {
            return Ok(None);
        }
        Ok(Some(ManifestContents {
            engine_version: guard.engine_version.clone(),
            root: guard.root,
            specs: guard.specs.clone(),
        }))
    }

    fn update(
        &self,
        specs: Vec<TableSpec>,
        expected_root: Addr,
        new_root: Addr,
    ) -> Result<(Addr, Vec<TableSpec>), ManifestError> {
        let mut guard = self.data.lock().map_err(|_| ManifestError::LockPoisoned)?;
        if !guard.ever_written || guard.root == expected_root {
            guard.engine_version = ENGINE_VERSION.to_string();
            guard.root = new_root;
            guard.specs = specs;
            guard.ever_written = true;
            Ok((guard.root, guard.specs.clone()))
        } else {
            Ok((guard.root, guard.specs.clone()))
        }
    }
}

// --------------------------------------------------------------------
// File-backed manifest
// --------------------------------------------------------------------

/// A file-per-directory manifest implementation.
///
/// Record layout (one line, `FIELD_SEP`-delimited, in this exact order,
/// per SPEC_FULL.md §4.3):
///
/// ```text
/// storage-version <SEP> engine-version <SEP> root-hex (<SEP> name <SEP> count)*
/// ```
///
/// followed by a newline and a trailing `crc32=<hex>` line covering the
/// first line's bytes. Bit-exact field order matters: multiple writers on
/// different hosts may read each other's manifests.
pub struct FileManifest {
    dir: PathBuf,
}

impl FileManifest {
    /// Opens (creating the directory if needed) a file manifest rooted at
    /// `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(FileManifest { dir })
    }

    fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILENAME)
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILENAME)
    }

    fn acquire_lock(&self) -> Result<File, ManifestError> {
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_path())?;
        lock_file.lock_exclusive()?;
        Ok(lock_file)
    }

    fn encode(engine_version: &str, root: Addr, specs: &[TableSpec]) -> String {
        let mut line = format!("{STORAGE_VERSION}{FIELD_SEP}{engine_version}{FIELD_SEP}{}", root.to_hex());
        for spec in specs {
            line.push(FIELD_SEP);
            line.push_str(&spec.name);
            line.push(FIELD_SEP);
            line.push_str(&spec.count.to_string());
        }
        let mut hasher = Crc32::new();
        hasher.update(line.as_bytes());
        let checksum = hasher.finalize();
        format!("{line}\ncrc32={checksum:08x}\n")
    }

    fn decode(text: &str) -> Result<ManifestContents, ManifestError> {
        let mut lines = text.lines();
        let record_line = lines
            .next()
            .ok_or_else(|| ManifestError::Malformed("empty manifest file".into()))?;
        let checksum_line = lines
            .next()
            .ok_or_else(|| ManifestError::Malformed("missing checksum line".into()))?;

        let found_checksum = checksum_line
            .strip_prefix("crc32=")
            .and_then(|h| u32::from_str_radix(h, 16).ok())
            .ok_or_else(|| ManifestError::Malformed("malformed checksum line".into()))?;

        let mut hasher = Crc32::new();
        hasher.update(record_line.as_bytes());
        if hasher.finalize() != found_checksum {
            return Err(ManifestError::ChecksumMismatch);
        }

        let mut fields = record_line.split(FIELD_SEP);
        let storage_version = fields
            .next()
            .ok_or_else(|| ManifestError::Malformed("missing storage-version".into()))?;
        if storage_version != STORAGE_VERSION {
            return Err(ManifestError::StorageVersionMismatch {
                found: storage_version.to_string(),
                expected: STORAGE_VERSION.to_string(),
            });
        }
        let engine_version = fields
            .next()
            .ok_or_else(|| ManifestError::Malformed("missing engine-version".into()))?
            .to_string();
        let root_hex = fields
            .next()
            .ok_or_else(|| ManifestError::Malformed("missing root".into()))?;
        let root = Addr::from_hex(root_hex)
            .ok_or_else(|| ManifestError::Malformed(format!("bad root hex: {root_hex}")))?;

        let mut specs = Vec::new();
        loop {
            let Some(name) = fields.next() else { break };
            let count_str = fields
                .next()
                .ok_or_else(|| ManifestError::Malformed("table spec missing count".into()))?;
            let count: u32 = count_str
                .parse()
                .map_err(|_| ManifestError::Malformed(format!("bad count: {count_str}")))?;
            specs.push(TableSpec { name: name.to_string(), count });
        }

        Ok(ManifestContents { engine_version, root, specs })
    }

    fn read_unlocked(&self) -> Result<Option<ManifestContents>, ManifestError> {
        let path = self.manifest_path();
        if !path.exists() {
            return Ok(None);
        }
        let mut text = String::new();
        File::open(&path)?.read_to_string(&mut text)?;
        Ok(Some(Self::decode(&text)?))
    }

    fn write_unlocked(&self, engine_version: &str, root: Addr, specs: &[TableSpec]) -> Result<(), ManifestError> {
        let body = Self::encode(engine_version, root, specs);
        let tmp_path = self.dir.join(format!("{MANIFEST_FILENAME}.tmp"));
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            f.write_all(body.as_bytes())?;
            f.sync_all()?;
        }
        fs::rename(&tmp_path, self.manifest_path())?;
        if let Ok(dir_file) = File::open(&self.dir) {
            let _ = dir_file.sync_all();
        }
        Ok(())
    }
}

impl ManifestStore for FileManifest {
    fn parse_if_exists(&self) -> Result<Option<ManifestContents>, ManifestError> {
        let lock_file = self.acquire_lock()?;
        let result = self.read_unlocked();
        let _ = FileExt::unlock(&lock_file);
        result
    }

    fn update(
        &self,
        specs: Vec<TableSpec>,
        expected_root: Addr,
        new_root: Addr,
    ) -> Result<(Addr, Vec<TableSpec>), ManifestError> {
        let lock_file = self.acquire_lock()?;

        let current = self.read_unlocked()?;
        let (current_root, current_specs) = match &current {
            Some(c) => (c.root, c.specs.clone()),
            None => (Addr::ZERO, Vec::new()),
        };

        let result = if current.is_none() || current_root == expected_root {
            self.write_unlocked(ENGINE_VERSION, new_root, &specs)?;
            info!(root = %new_root, "manifest: CAS won");
            Ok((new_root, specs))
        } else {
            warn!(expected = %expected_root, actual = %current_root, "manifest: CAS lost");
            Ok((current_root, current_specs))
        };

        let _ = FileExt::unlock(&lock_file);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn spec(name: &str, count: u32) -> TableSpec {
        TableSpec { name: name.to_string(), count }
    }

    #[test]
    fn in_memory_parse_if_exists_is_none_before_first_write() {
        let m = InMemoryManifest::new();
        assert!(m.parse_if_exists().unwrap().is_none());
    }

    #[test]
    fn in_memory_update_wins_on_matching_root() {
        let m = InMemoryManifest::new();
        let (root, specs) = m.update(vec![spec("t1", 1)], Addr::ZERO, Addr::from_hex(&"11".repeat(20)).unwrap()).unwrap();
        assert_eq!(root, Addr::from_hex(&"11".repeat(20)).unwrap());
        assert_eq!(specs, vec![spec("t1", 1)]);
    }

    #[test]
    fn in_memory_update_loses_on_stale_root() {
        let m = InMemoryManifest::new();
        let winner_root = Addr::from_hex(&"22".repeat(20)).unwrap();
        m.update(vec![spec("t1", 1)], Addr::ZERO, winner_root).unwrap();

        let loser_root = Addr::from_hex(&"33".repeat(20)).unwrap();
        let (actual_root, actual_specs) = m.update(vec![spec("t2", 1)], Addr::ZERO, loser_root).unwrap();
        assert_eq!(actual_root, winner_root);
        assert_eq!(actual_specs, vec![spec("t1", 1)]);
    }

    #[test]
    fn file_manifest_round_trips_through_disk() {
        let tmp = TempDir::new().unwrap();
        let m = FileManifest::open(tmp.path()).unwrap();
        assert!(m.parse_if_exists().unwrap().is_none());

        let root = Addr::from_hex(&"aa".repeat(20)).unwrap();
        let (actual_root, _) = m.update(vec![spec("t1", 3), spec("t2", 5)], Addr::ZERO, root).unwrap();
        assert_eq!(actual_root, root);

        let reopened = FileManifest::open(tmp.path()).unwrap();
        let contents = reopened.parse_if_exists().unwrap().unwrap();
        assert_eq!(contents.root, root);
        assert_eq!(contents.specs, vec![spec("t1", 3), spec("t2", 5)]);
        assert_eq!(contents.engine_version, ENGINE_VERSION);
    }

    #[test]
    fn file_manifest_detects_checksum_corruption() {
        let tmp = TempDir::new().unwrap();
        let m = FileManifest::open(tmp.path()).unwrap();
        m.update(vec![spec("t1", 1)], Addr::ZERO, Addr::from_hex(&"bb".repeat(20)).unwrap())
            .unwrap();

        let path = tmp.path().join(MANIFEST_FILENAME);
        let mut text = std::fs::read_to_string(&path).unwrap();
        text = text.replace("t1", "t9");
        std::fs::write(&path, text).unwrap();

        let reopened = FileManifest::open(tmp.path()).unwrap();
        let err = reopened.parse_if_exists().unwrap_err();
        assert!(matches!(err, ManifestError::ChecksumMismatch));
    }

    #[test]
    fn file_manifest_rejects_wrong_storage_version() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(MANIFEST_FILENAME);
        let bad_line = format!("9{FIELD_SEP}{ENGINE_VERSION}{FIELD_SEP}{}", Addr::ZERO.to_hex());
        let mut hasher = Crc32::new();
        hasher.update(bad_line.as_bytes());
        let checksum = hasher.finalize();
        std::fs::write(&path, format!("{bad_line}\ncrc32={checksum:08x}\n")).unwrap();

        let m = FileManifest::open(tmp.path()).unwrap();
        let err = m.parse_if_exists().unwrap_err();
        assert!(matches!(err, ManifestError::StorageVersionMismatch { .. }));
    }
}
