//! Entry table collaborator interface
//!
//! The entry table is the external logical→physical index and
//! durability-state tracker. The file-system core only calls this narrow
//! interface and never owns the table. `SimpleEntryTable` is an in-memory
//! implementation used for wiring and tests.

use crate::error::{FsError, FsResult};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// One logical path's physical resolution and durability state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMeta {
    /// Logical path seen by readers/writers
    pub logical_path: String,
    /// Physical location realized by a storage variant
    pub physical_path: String,
    /// Byte offset inside the physical file (non-zero only inside packages)
    pub offset: u64,
    /// Byte length
    pub length: u64,
    /// Whether the entry is a directory
    pub is_dir: bool,
    /// Content lives only in memory (no durable copy yet)
    pub is_mem_file: bool,
    /// Whether the entry may still be mutated
    pub mutable: bool,
    /// Marked durable/immutable by the flush freeze callback
    pub frozen: bool,
}

impl EntryMeta {
    /// A freshly created, still-mutable file entry.
    pub fn new_file(logical_path: &str, physical_path: &str, length: u64) -> Self {
        EntryMeta {
            logical_path: logical_path.to_string(),
            physical_path: physical_path.to_string(),
            offset: 0,
            length,
            is_dir: false,
            is_mem_file: false,
            mutable: true,
            frozen: false,
        }
    }

    /// A directory entry.
    pub fn new_dir(logical_path: &str, physical_path: &str) -> Self {
        EntryMeta {
            logical_path: logical_path.to_string(),
            physical_path: physical_path.to_string(),
            offset: 0,
            length: 0,
            is_dir: true,
            is_mem_file: false,
            mutable: true,
            frozen: false,
        }
    }
}

/// Narrow interface the core consumes; ownership stays external.
pub trait EntryTable: Send + Sync {
    /// Register a new mutable file entry.
    fn create_file(&self, logical_path: &str, physical_path: &str) -> FsResult<()>;

    /// Insert or replace a full entry.
    fn add_entry_meta(&self, meta: EntryMeta) -> FsResult<()>;

    /// Mark the given logical paths durable and immutable.
    fn freeze(&self, paths: &[String]) -> FsResult<()>;

    /// Remove an entry. `NotFound` if absent.
    fn delete(&self, path: &str) -> FsResult<()>;

    /// Repoint an entry into a shared package data file at `offset`.
    fn update_package_data_file(
        &self,
        path: &str,
        physical_data_path: &str,
        offset: u64,
    ) -> FsResult<()>;

    /// Record the length of a flushed package meta file.
    fn update_package_meta_file(&self, path: &str, length: u64) -> FsResult<()>;

    /// Flag whether an entry's content is memory-resident only.
    fn set_entry_meta_is_mem_file(&self, path: &str, is_mem: bool) -> FsResult<()>;

    /// Flag whether an entry may still be mutated.
    fn set_entry_meta_mutable(&self, path: &str, mutable: bool) -> FsResult<()>;

    /// Look up an entry (test/debug surface).
    fn find(&self, path: &str) -> Option<EntryMeta>;
}

/// In-memory entry table for wiring and tests
#[derive(Debug, Default)]
pub struct SimpleEntryTable {
    entries: Mutex<FxHashMap<String, EntryMeta>>,
}

impl SimpleEntryTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn with_entry<R>(
        &self,
        path: &str,
        f: impl FnOnce(&mut EntryMeta) -> R,
    ) -> FsResult<R> {
        let mut entries = self.entries.lock();
        match entries.get_mut(path) {
            Some(meta) => Ok(f(meta)),
            None => Err(FsError::NotFound(path.to_string())),
        }
    }
}

impl EntryTable for SimpleEntryTable {
    fn create_file(&self, logical_path: &str, physical_path: &str) -> FsResult<()> {
        let meta = EntryMeta::new_file(logical_path, physical_path, 0);
        self.entries.lock().insert(logical_path.to_string(), meta);
        Ok(())
    }

    fn add_entry_meta(&self, meta: EntryMeta) -> FsResult<()> {
        self.entries.lock().insert(meta.logical_path.clone(), meta);
        Ok(())
    }

    fn freeze(&self, paths: &[String]) -> FsResult<()> {
        let mut entries = self.entries.lock();
        for path in paths {
            if let Some(meta) = entries.get_mut(path) {
                meta.frozen = true;
                meta.mutable = false;
                meta.is_mem_file = false;
            }
        }
        Ok(())
    }

    fn delete(&self, path: &str) -> FsResult<()> {
        match self.entries.lock().remove(path) {
            Some(_) => Ok(()),
            None => Err(FsError::NotFound(path.to_string())),
        }
    }

    fn update_package_data_file(
        &self,
        path: &str,
        physical_data_path: &str,
        offset: u64,
    ) -> FsResult<()> {
        self.with_entry(path, |meta| {
            meta.physical_path = physical_data_path.to_string();
            meta.offset = offset;
        })
    }

    fn update_package_meta_file(&self, path: &str, length: u64) -> FsResult<()> {
        self.with_entry(path, |meta| {
            meta.length = length;
        })
    }

    fn set_entry_meta_is_mem_file(&self, path: &str, is_mem: bool) -> FsResult<()> {
        self.with_entry(path, |meta| {
            meta.is_mem_file = is_mem;
        })
    }

    fn set_entry_meta_mutable(&self, path: &str, mutable: bool) -> FsResult<()> {
        self.with_entry(path, |meta| {
            meta.mutable = mutable;
        })
    }

    fn find(&self, path: &str) -> Option<EntryMeta> {
        self.entries.lock().get(path).cloned()
    }
}
