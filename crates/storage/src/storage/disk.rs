//! Read-oriented storage over an existing physical tree

use crate::cache::FileNodeCache;
use crate::metrics::MetricGroup;
use crate::node::{FileNode, MmapRegistry, DEFAULT_BLOCK_SIZE};
use crate::reader::FileReader;
use indexfs_core::{
    path, EntryTable, FsError, FsPrimitives, FsResult, LoadConfigList, OpenType,
};
use indexfs_package::PACKAGE_DATA_FILE_PREFIX;
use std::sync::Arc;
use tracing::debug;

/// Disk storage: every read resolves its open type from an ordered
/// pattern list and is deduplicated through the shared node cache.
pub struct DiskStorage {
    fs: Arc<dyn FsPrimitives>,
    physical_root: String,
    entry_table: Arc<dyn EntryTable>,
    cache: Arc<FileNodeCache>,
    load_config: LoadConfigList,
    registry: MmapRegistry,
}

impl DiskStorage {
    /// Create a disk storage rooted at `physical_root`.
    pub fn new(
        fs: Arc<dyn FsPrimitives>,
        physical_root: &str,
        entry_table: Arc<dyn EntryTable>,
        cache: Arc<FileNodeCache>,
        load_config: LoadConfigList,
    ) -> Self {
        DiskStorage {
            fs,
            physical_root: physical_root.trim_end_matches('/').to_string(),
            entry_table,
            cache,
            load_config,
            registry: MmapRegistry::new(),
        }
    }

    fn physical(&self, logical_path: &str) -> String {
        format!("{}{logical_path}", self.physical_root)
    }

    /// Open with the configured open type for the path.
    pub fn create_file_reader(&self, logical_path: &str) -> FsResult<FileReader> {
        self.open(logical_path, OpenType::LoadConfig)
    }

    /// Open with an explicit open type. A cache hit whose representation
    /// differs from an explicit request is an error, never silently
    /// reinterpreted; `LoadConfig` requests accept whatever is cached.
    pub fn open(&self, logical_path: &str, open_type: OpenType) -> FsResult<FileReader> {
        let resolved = match open_type {
            OpenType::LoadConfig => self.load_config.resolve(logical_path),
            explicit => explicit,
        };

        if let Some(node) = self.cache.find(logical_path) {
            self.cache.metrics().increase_cache_hit();
            if node.is_directory() {
                return Err(FsError::IsDirectory(logical_path.to_string()));
            }
            if open_type != OpenType::LoadConfig && node.open_type() != resolved {
                return Err(FsError::Inconsistent(format!(
                    "{logical_path} cached as {:?}, requested {resolved:?}",
                    node.open_type()
                )));
            }
            return Ok(FileReader::new(node));
        }
        self.cache.metrics().increase_cache_miss();

        let node = Arc::new(self.load_node(logical_path, resolved)?);
        self.cache.insert(Arc::clone(&node));
        Ok(FileReader::new(node))
    }

    fn load_node(&self, logical_path: &str, open_type: OpenType) -> FsResult<FileNode> {
        // entries living inside a package data file get a slice view
        if let Some(meta) = self.entry_table.find(logical_path) {
            if meta.is_dir {
                return Err(FsError::IsDirectory(logical_path.to_string()));
            }
            let physical_name = path::file_name(&meta.physical_path);
            if physical_name.starts_with(PACKAGE_DATA_FILE_PREFIX) {
                return self.load_packaged(logical_path, open_type, &meta.physical_path,
                    meta.offset, meta.length);
            }
        }

        let physical = self.physical(logical_path);
        if !self.fs.is_exist(&physical)? {
            return Err(FsError::NotFound(logical_path.to_string()));
        }
        debug!(
            target: "indexfs::storage",
            path = %logical_path,
            open_type = ?open_type,
            "loading node from disk"
        );
        match open_type {
            OpenType::Mem => {
                let data = self.fs.read_file(&physical)?;
                Ok(FileNode::new_mem(
                    logical_path,
                    &physical,
                    data,
                    false,
                    MetricGroup::Local,
                ))
            }
            OpenType::Mmap | OpenType::MmapLocked => {
                let locked = open_type == OpenType::MmapLocked;
                let mapped = self.registry.open_shared(&physical, locked)?;
                Ok(FileNode::new_mmap(logical_path, &physical, mapped, locked))
            }
            OpenType::Block => {
                let length = self.fs.file_length(&physical)?;
                Ok(FileNode::new_buffered(
                    logical_path,
                    &physical,
                    Arc::clone(&self.fs),
                    length,
                    DEFAULT_BLOCK_SIZE,
                ))
            }
            OpenType::Buffered => {
                let length = self.fs.file_length(&physical)?;
                Ok(FileNode::new_buffered(
                    logical_path,
                    &physical,
                    Arc::clone(&self.fs),
                    length,
                    0,
                ))
            }
            OpenType::LoadConfig => Err(FsError::BadArgs(
                "unresolved load-config open type".to_string(),
            )),
        }
    }

    fn load_packaged(
        &self,
        logical_path: &str,
        open_type: OpenType,
        data_path: &str,
        offset: u64,
        length: u64,
    ) -> FsResult<FileNode> {
        match open_type {
            OpenType::Mem => {
                let data = self.fs.read_range(data_path, offset, length as usize)?;
                let node =
                    FileNode::new_mem(logical_path, data_path, data, false, MetricGroup::Local);
                node.mark_in_package();
                Ok(node)
            }
            OpenType::Mmap | OpenType::MmapLocked => {
                let locked = open_type == OpenType::MmapLocked;
                let mapped = self.registry.open_shared(data_path, locked)?;
                let base = Arc::new(FileNode::new_mmap(data_path, data_path, mapped, locked));
                let node = FileNode::new_slice(logical_path, base, offset, length)?;
                node.mark_in_package();
                Ok(node)
            }
            OpenType::Block | OpenType::Buffered => {
                let block = if open_type == OpenType::Block {
                    DEFAULT_BLOCK_SIZE
                } else {
                    0
                };
                let data_length = self.fs.file_length(data_path)?;
                let base = Arc::new(FileNode::new_buffered(
                    data_path,
                    data_path,
                    Arc::clone(&self.fs),
                    data_length,
                    block,
                ));
                let node = FileNode::new_slice(logical_path, base, offset, length)?;
                node.mark_in_package();
                Ok(node)
            }
            OpenType::LoadConfig => Err(FsError::BadArgs(
                "unresolved load-config open type".to_string(),
            )),
        }
    }

    /// Create a logical directory on disk and in the cache.
    pub fn make_directory(&self, logical_path: &str, recursive: bool) -> FsResult<()> {
        let physical = self.physical(logical_path);
        self.fs.mkdir(&physical, recursive)?;
        self.cache.insert(Arc::new(FileNode::new_directory(
            logical_path,
            &physical,
            MetricGroup::Local,
        )));
        self.entry_table
            .add_entry_meta(indexfs_core::EntryMeta::new_dir(logical_path, &physical))
    }

    /// Remove a file from the cache, the entry table, and disk.
    pub fn remove_file(&self, logical_path: &str) -> FsResult<()> {
        let mut found = false;
        match self.cache.remove_file(logical_path) {
            Ok(()) => found = true,
            Err(FsError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
        match self.entry_table.delete(logical_path) {
            Ok(()) => found = true,
            Err(FsError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
        let physical = self.physical(logical_path);
        if self.fs.is_exist(&physical)? {
            self.fs.delete_file(&physical)?;
            found = true;
        }
        if found {
            Ok(())
        } else {
            Err(FsError::NotFound(logical_path.to_string()))
        }
    }

    /// Remove a directory subtree from the cache, the entry table, and
    /// disk. The cache check runs first so an in-use subtree aborts the
    /// whole removal before anything is deleted.
    pub fn remove_directory(&self, logical_path: &str) -> FsResult<()> {
        let mut found = false;
        let cached = self.cache.subtree(logical_path);
        match self.cache.remove_directory(logical_path) {
            Ok(()) => found = true,
            Err(FsError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
        for node in &cached {
            match self.entry_table.delete(node.logical_path()) {
                Ok(()) | Err(FsError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        match self.entry_table.delete(logical_path) {
            Ok(()) => found = true,
            Err(FsError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
        let physical = self.physical(logical_path);
        if self.fs.is_exist(&physical)? {
            self.fs.delete_dir(&physical)?;
            found = true;
        }
        if found {
            Ok(())
        } else {
            Err(FsError::NotFound(logical_path.to_string()))
        }
    }

    /// Bytes pinned in memory if the subtree were opened: whole lengths
    /// for `Mem` and `MmapLocked` paths, nothing for the rest.
    pub fn estimate_file_lock_memory_use(&self, logical_path: &str) -> FsResult<u64> {
        let physical = self.physical(logical_path);
        if !self.fs.is_exist(&physical)? {
            return Err(FsError::NotFound(logical_path.to_string()));
        }
        if self.fs.is_dir(&physical)? {
            let mut total = 0;
            for name in self.fs.list_dir(&physical)? {
                total += self.estimate_file_lock_memory_use(&path::join(logical_path, &name))?;
            }
            return Ok(total);
        }
        match self.load_config.resolve(logical_path) {
            OpenType::Mem | OpenType::MmapLocked => self.fs.file_length(&physical),
            _ => Ok(0),
        }
    }

    /// Reclaim clean, unreferenced cache entries and dead mappings.
    pub fn clean_cache(&self) -> usize {
        let evicted = self.cache.clean();
        self.registry.evict_dead();
        evicted
    }

    /// Shared node cache.
    pub fn cache(&self) -> &Arc<FileNodeCache> {
        &self.cache
    }
}
