//! In-memory build storage with write-behind flushing

use super::WriterOptions;
use crate::cache::FileNodeCache;
use crate::flush::{
    FlushFuture, FlushOperation, FlushOperationQueue, FlushScheduler, FreezeContext,
};
use crate::metrics::MetricGroup;
use crate::node::{FileNode, SharedMmap};
use crate::reader::FileReader;
use crate::writer::{FileWriter, SwapMmapWriter};
use indexfs_core::{path, EntryMeta, EntryTable, FsError, FsPrimitives, FsResult};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

pub(crate) struct MemStorageInner {
    pub(crate) fs: Arc<dyn FsPrimitives>,
    pub(crate) physical_root: String,
    pub(crate) entry_table: Arc<dyn EntryTable>,
    pub(crate) cache: Arc<FileNodeCache>,
    pub(crate) scheduler: Arc<FlushScheduler>,
    queue: Mutex<Arc<FlushOperationQueue>>,
    flush_enabled: bool,
    external_lock: Option<Arc<Mutex<()>>>,
}

impl MemStorageInner {
    pub(crate) fn physical(&self, logical_path: &str) -> String {
        format!("{}{logical_path}", self.physical_root)
    }

    pub(crate) fn push_op(&self, op: FlushOperation) {
        self.queue.lock().push(op);
    }

    /// Accept a built node: index it, cache it, and queue its flush.
    pub(crate) fn store_node(&self, node: Arc<FileNode>, options: WriterOptions) -> FsResult<()> {
        let logical = node.logical_path().to_string();
        let mut meta = EntryMeta::new_file(&logical, node.physical_path(), node.length());
        meta.is_mem_file = true;
        self.entry_table.add_entry_meta(meta)?;
        self.cache.insert(Arc::clone(&node));

        if self.flush_enabled {
            let snapshot = if options.copy_on_dump {
                Some(node.read_all()?)
            } else {
                None
            };
            let physical_path = node.physical_path().to_string();
            self.push_op(FlushOperation::Single {
                fs: Arc::clone(&self.fs),
                node,
                physical_path,
                atomic: options.atomic_dump,
                snapshot,
            });
        }
        debug!(target: "indexfs::storage", path = %logical, "stored node");
        Ok(())
    }

    pub(crate) fn insert_directory(&self, logical_path: &str) -> FsResult<()> {
        let physical = self.physical(logical_path);
        self.cache.insert(Arc::new(FileNode::new_directory(
            logical_path,
            &physical,
            MetricGroup::Mem,
        )));
        self.entry_table
            .add_entry_meta(EntryMeta::new_dir(logical_path, &physical))
    }

    /// Create the directory (and, recursively, its uncached ancestors) in
    /// the cache and entry table; one mkdir flush op covers the chain.
    pub(crate) fn make_directory(
        &self,
        logical_path: &str,
        recursive: bool,
        flush: bool,
    ) -> FsResult<()> {
        if recursive {
            let mut chain = Vec::new();
            let mut current = logical_path;
            loop {
                if self.cache.find(current).is_some() {
                    break;
                }
                chain.push(current.to_string());
                match path::parent(current) {
                    Some(parent) if !parent.is_empty() => current = parent,
                    _ => break,
                }
            }
            for dir in chain.iter().rev() {
                self.insert_directory(dir)?;
            }
        } else {
            if let Some(parent) = path::parent(logical_path) {
                if !parent.is_empty() && self.cache.find(parent).is_none() {
                    return Err(FsError::NotFound(parent.to_string()));
                }
            }
            if self.cache.find(logical_path).is_some() {
                return Err(FsError::AlreadyExists(logical_path.to_string()));
            }
            self.insert_directory(logical_path)?;
        }

        if flush && self.flush_enabled {
            self.push_op(FlushOperation::Mkdir {
                fs: Arc::clone(&self.fs),
                physical_path: self.physical(logical_path),
                logical_path: logical_path.to_string(),
            });
        }
        Ok(())
    }

    pub(crate) fn freeze_context(&self) -> FreezeContext {
        FreezeContext {
            entry_table: Arc::clone(&self.entry_table),
            cache: Arc::clone(&self.cache),
            external_lock: self.external_lock.clone(),
        }
    }

    pub(crate) fn sync(&self) -> FsResult<FlushFuture> {
        // a terminal failure from an earlier dump surfaces before any new
        // work is accepted
        if let Some(err) = self.scheduler.take_error() {
            return Err(err);
        }
        let queue = {
            let mut slot = self.queue.lock();
            std::mem::replace(&mut *slot, Arc::new(FlushOperationQueue::new()))
        };
        Ok(self.scheduler.submit(queue, self.freeze_context()))
    }

    pub(crate) fn wait_sync_finish(&self) -> FsResult<()> {
        let future = self.sync()?;
        future.wait();
        self.scheduler.wait_idle();
        match self.scheduler.take_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub(crate) fn create_file_reader(&self, logical_path: &str) -> FsResult<FileReader> {
        if let Some(node) = self.cache.find(logical_path) {
            self.cache.metrics().increase_cache_hit();
            if node.is_directory() {
                return Err(FsError::IsDirectory(logical_path.to_string()));
            }
            return Ok(FileReader::new(node));
        }
        self.cache.metrics().increase_cache_miss();

        // flushed-and-evicted content falls back to the physical copy
        let physical = self.physical(logical_path);
        if !self.fs.is_exist(&physical)? {
            return Err(FsError::NotFound(logical_path.to_string()));
        }
        let data = self.fs.read_file(&physical)?;
        let node = Arc::new(FileNode::new_mem(
            logical_path,
            &physical,
            data,
            false,
            MetricGroup::Mem,
        ));
        self.cache.insert(Arc::clone(&node));
        Ok(FileReader::new(node))
    }

    pub(crate) fn remove_file(&self, logical_path: &str) -> FsResult<()> {
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

    pub(crate) fn remove_directory(&self, logical_path: &str) -> FsResult<()> {
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
}

/// Write path for freshly built content; accepted writes become durable
/// through the flush pipeline on `sync()`.
pub struct MemStorage {
    inner: Arc<MemStorageInner>,
}

impl MemStorage {
    /// Create a mem storage flushing into `physical_root`.
    pub fn new(
        fs: Arc<dyn FsPrimitives>,
        physical_root: &str,
        entry_table: Arc<dyn EntryTable>,
        cache: Arc<FileNodeCache>,
        scheduler: Arc<FlushScheduler>,
        flush_enabled: bool,
    ) -> Self {
        MemStorage {
            inner: Arc::new(MemStorageInner {
                fs,
                physical_root: physical_root.trim_end_matches('/').to_string(),
                entry_table,
                cache,
                scheduler,
                queue: Mutex::new(Arc::new(FlushOperationQueue::new())),
                flush_enabled,
                external_lock: None,
            }),
        }
    }

    /// Serialize freeze callbacks with an externally owned lock.
    pub fn with_external_lock(mut self, lock: Arc<Mutex<()>>) -> Self {
        let inner = Arc::get_mut(&mut self.inner)
            .unwrap_or_else(|| unreachable!("inner is unshared during construction"));
        inner.external_lock = Some(lock);
        self
    }

    pub(crate) fn inner(&self) -> &Arc<MemStorageInner> {
        &self.inner
    }

    /// Shared node cache.
    pub fn cache(&self) -> &Arc<FileNodeCache> {
        &self.inner.cache
    }

    /// Open a reader; cached content first, the physical copy as
    /// fallback.
    pub fn create_file_reader(&self, logical_path: &str) -> FsResult<FileReader> {
        self.inner.create_file_reader(logical_path)
    }

    /// Open a buffering writer whose close stores the content.
    pub fn create_file_writer(
        &self,
        logical_path: &str,
        options: WriterOptions,
    ) -> FsResult<FileWriter> {
        let inner = Arc::clone(&self.inner);
        let logical = logical_path.to_string();
        self.inner
            .entry_table
            .create_file(logical_path, &self.inner.physical(logical_path))?;
        Ok(FileWriter::new(
            logical_path,
            Box::new(move |data| {
                let physical = inner.physical(&logical);
                let node = Arc::new(FileNode::new_mem(
                    &logical,
                    &physical,
                    data,
                    true,
                    MetricGroup::Mem,
                ));
                inner.store_node(node, options)
            }),
        ))
    }

    /// Open a growable writer over a shared mapping so previously
    /// returned reader pointers stay valid while the file grows.
    pub fn create_swap_mmap_writer(
        &self,
        logical_path: &str,
        capacity: usize,
    ) -> FsResult<SwapMmapWriter> {
        let physical = self.inner.physical(logical_path);
        if let Some(parent) = path::parent(&physical) {
            self.inner.fs.mkdir(parent, true)?;
        }
        let shared = SharedMmap::create(&physical, capacity)?;
        let node = Arc::new(FileNode::new_swap_mmap(logical_path, &physical, shared));

        let mut meta = EntryMeta::new_file(logical_path, &physical, 0);
        meta.is_mem_file = true;
        self.inner.entry_table.add_entry_meta(meta)?;
        self.inner.cache.insert(Arc::clone(&node));
        SwapMmapWriter::new(node)
    }

    /// Accept a node built elsewhere.
    pub fn store_file(&self, node: Arc<FileNode>, options: WriterOptions) -> FsResult<()> {
        self.inner.store_node(node, options)
    }

    /// Create a logical directory.
    pub fn make_directory(&self, logical_path: &str, recursive: bool) -> FsResult<()> {
        self.inner.make_directory(logical_path, recursive, true)
    }

    /// Remove one logical file.
    pub fn remove_file(&self, logical_path: &str) -> FsResult<()> {
        self.inner.remove_file(logical_path)
    }

    /// Remove a logical directory subtree.
    pub fn remove_directory(&self, logical_path: &str) -> FsResult<()> {
        self.inner.remove_directory(logical_path)
    }

    /// Swap in a fresh queue and hand the current one to the dumper.
    pub fn sync(&self) -> FsResult<FlushFuture> {
        self.inner.sync()
    }

    /// Block until every dump has drained; re-raises deferred failures.
    pub fn wait_sync_finish(&self) -> FsResult<()> {
        self.inner.wait_sync_finish()
    }

    /// Reclaim clean, unreferenced cache entries.
    pub fn clean_cache(&self) -> usize {
        self.inner.cache.clean()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flush::{FlushMode, RetryPolicy};
    use crate::metrics::StorageMetrics;
    use indexfs_core::{LocalFs, SimpleEntryTable};
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: String,
        storage: MemStorage,
        table: Arc<SimpleEntryTable>,
    }

    fn fixture(mode: FlushMode, flush_enabled: bool) -> Fixture {
        let dir = tempdir().unwrap();
        let root = dir.path().to_string_lossy().to_string();
        let table = Arc::new(SimpleEntryTable::new());
        let storage = MemStorage::new(
            Arc::new(LocalFs::new()),
            &root,
            Arc::clone(&table) as Arc<dyn EntryTable>,
            Arc::new(FileNodeCache::new(Arc::new(StorageMetrics::new()))),
            Arc::new(FlushScheduler::new(mode, RetryPolicy::none())),
            flush_enabled,
        );
        Fixture {
            _dir: dir,
            root,
            storage,
            table,
        }
    }

    #[test]
    fn test_write_read_before_sync() {
        let f = fixture(FlushMode::Inline, true);
        f.storage.make_directory("/seg", true).unwrap();
        let mut writer = f
            .storage
            .create_file_writer("/seg/f", WriterOptions::default())
            .unwrap();
        writer.write(b"built content").unwrap();
        writer.close().unwrap();

        // readable from memory before any sync
        let reader = f.storage.create_file_reader("/seg/f").unwrap();
        assert_eq!(reader.read_at(0, 13).unwrap(), b"built content");
        assert!(f.table.find("/seg/f").unwrap().is_mem_file);
        assert!(!std::path::Path::new(&format!("{}/seg/f", f.root)).exists());
    }

    #[test]
    fn test_sync_flushes_and_freezes() {
        let f = fixture(FlushMode::Inline, true);
        f.storage.make_directory("/seg", true).unwrap();
        let mut writer = f
            .storage
            .create_file_writer("/seg/f", WriterOptions::default())
            .unwrap();
        writer.write(b"durable").unwrap();
        writer.close().unwrap();

        assert!(f.storage.sync().unwrap().wait());
        assert_eq!(
            std::fs::read(format!("{}/seg/f", f.root)).unwrap(),
            b"durable"
        );
        let meta = f.table.find("/seg/f").unwrap();
        assert!(meta.frozen);
        assert!(!meta.is_mem_file);
        // frozen and superseded by the durable copy, so evicted
        assert!(f.storage.cache().find("/seg/f").is_none());
        // content still reachable through the physical fallback
        let reader = f.storage.create_file_reader("/seg/f").unwrap();
        assert_eq!(reader.read_at(0, 7).unwrap(), b"durable");
    }

    #[test]
    fn test_flush_disabled_stays_resident() {
        let f = fixture(FlushMode::Inline, false);
        f.storage.make_directory("/seg", true).unwrap();
        let mut writer = f
            .storage
            .create_file_writer("/seg/f", WriterOptions::default())
            .unwrap();
        writer.write(b"mem only").unwrap();
        writer.close().unwrap();

        assert!(f.storage.sync().unwrap().wait());
        assert!(!std::path::Path::new(&format!("{}/seg/f", f.root)).exists());
        assert!(f.table.find("/seg/f").unwrap().is_mem_file);
        assert!(f.storage.cache().find("/seg/f").is_some());
    }

    #[test]
    fn test_direct_mode_dump_overwrites_existing_file() {
        let f = fixture(FlushMode::Inline, true);
        f.storage.make_directory("/seg", true).unwrap();
        // a stale physical copy is already in place
        std::fs::create_dir_all(format!("{}/seg", f.root)).unwrap();
        std::fs::write(format!("{}/seg/f", f.root), b"old").unwrap();

        let mut writer = f
            .storage
            .create_file_writer(
                "/seg/f",
                WriterOptions {
                    atomic_dump: false,
                    copy_on_dump: false,
                },
            )
            .unwrap();
        writer.write(b"new").unwrap();
        writer.close().unwrap();

        f.storage.wait_sync_finish().unwrap();
        assert_eq!(std::fs::read(format!("{}/seg/f", f.root)).unwrap(), b"new");
        assert!(f.table.find("/seg/f").unwrap().frozen);
    }

    #[test]
    fn test_deferred_error_resurfaces_on_next_sync() {
        let f = fixture(FlushMode::Background, true);
        f.storage.make_directory("/seg", true).unwrap();
        // occupy the destination so the flush loses the race
        std::fs::create_dir_all(format!("{}/seg", f.root)).unwrap();
        std::fs::write(format!("{}/seg/f", f.root), b"occupied").unwrap();

        let mut writer = f
            .storage
            .create_file_writer("/seg/f", WriterOptions::default())
            .unwrap();
        writer.write(b"loser").unwrap();
        writer.close().unwrap();

        let future = f.storage.sync().unwrap();
        assert!(!future.wait());
        // the terminal failure is re-raised exactly once
        assert!(f.storage.sync().is_err());
        assert!(f.storage.sync().is_ok());
    }

    #[test]
    fn test_mkdir_nonrecursive_requires_parent() {
        let f = fixture(FlushMode::Inline, true);
        assert!(matches!(
            f.storage.make_directory("/a/b", false).unwrap_err(),
            FsError::NotFound(_)
        ));
        f.storage.make_directory("/a/b", true).unwrap();
        assert!(f.storage.cache().find("/a").is_some());
        assert!(matches!(
            f.storage.make_directory("/a/b", false).unwrap_err(),
            FsError::AlreadyExists(_)
        ));
    }

    #[test]
    fn test_swap_mmap_shared_visibility() {
        let f = fixture(FlushMode::Inline, true);
        f.storage.make_directory("/seg", true).unwrap();
        let mut writer = f.storage.create_swap_mmap_writer("/seg/grow", 4096).unwrap();

        let reader_a = f.storage.create_file_reader("/seg/grow").unwrap();
        let reader_b = f.storage.create_file_reader("/seg/grow").unwrap();
        // both readers observe the same shared mapping
        let base_a = reader_a.node().swap_mmap().unwrap().as_ptr();
        let base_b = reader_b.node().swap_mmap().unwrap().as_ptr();
        assert_eq!(base_a, base_b);

        writer.write(b"visible").unwrap();
        assert_eq!(reader_a.read_at(0, 7).unwrap(), b"visible");
        assert_eq!(reader_b.read_at(0, 7).unwrap(), b"visible");
        writer.close().unwrap();
    }
}
