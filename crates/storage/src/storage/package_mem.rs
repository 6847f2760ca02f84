//! Packaging build storage
//!
//! Wraps the mem-storage write path with packaging units: a directory
//! created with a package hint collects the files stored beneath it, and
//! `flush_package` seals each unit into one shared data file plus a meta
//! document instead of flushing the files individually.

use super::{MemStorage, WriterOptions};
use crate::cache::FileNodeCache;
use crate::flush::{FlushFuture, FlushOperation, FlushScheduler, PackagedNode};
use crate::metrics::MetricGroup;
use crate::node::FileNode;
use crate::reader::FileReader;
use crate::storage::mem::MemStorageInner;
use crate::writer::{FileWriter, SwapMmapWriter};
use indexfs_core::{path, EntryMeta, EntryTable, FsError, FsPrimitives, FsResult};
use indexfs_package::{InnerFileMeta, PackageFileMeta, PACKAGE_META_FILE_NAME};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Default)]
struct PackageUnit {
    files: Vec<Arc<FileNode>>,
    plain_dirs: Vec<String>,
}

type UnitMap = Arc<Mutex<BTreeMap<String, PackageUnit>>>;

/// Mem storage that batches whole directories into package files
pub struct PackageMemStorage {
    mem: MemStorage,
    units: UnitMap,
    file_align_size: u64,
}

impl PackageMemStorage {
    /// Create a packaging storage flushing into `physical_root`.
    pub fn new(
        fs: Arc<dyn FsPrimitives>,
        physical_root: &str,
        entry_table: Arc<dyn EntryTable>,
        cache: Arc<FileNodeCache>,
        scheduler: Arc<FlushScheduler>,
        file_align_size: u64,
    ) -> Self {
        PackageMemStorage {
            mem: MemStorage::new(fs, physical_root, entry_table, cache, scheduler, true),
            units: Arc::new(Mutex::new(BTreeMap::new())),
            file_align_size,
        }
    }

    /// Shared node cache.
    pub fn cache(&self) -> &Arc<FileNodeCache> {
        self.mem.cache()
    }

    fn find_unit_root(units: &UnitMap, logical_path: &str) -> Option<String> {
        let map = units.lock();
        let mut current = path::parent(logical_path);
        while let Some(dir) = current {
            if dir.is_empty() {
                break;
            }
            if map.contains_key(dir) {
                return Some(dir.to_string());
            }
            current = path::parent(dir);
        }
        None
    }

    fn store_routed(
        inner: &Arc<MemStorageInner>,
        units: &UnitMap,
        node: Arc<FileNode>,
        options: WriterOptions,
    ) -> FsResult<()> {
        let logical = node.logical_path().to_string();
        match Self::find_unit_root(units, &logical) {
            Some(unit_root) => {
                let mut meta =
                    EntryMeta::new_file(&logical, node.physical_path(), node.length());
                meta.is_mem_file = true;
                inner.entry_table.add_entry_meta(meta)?;
                inner.cache.insert(Arc::clone(&node));
                let mut map = units.lock();
                let unit = map
                    .get_mut(&unit_root)
                    .unwrap_or_else(|| unreachable!("unit root vanished"));
                unit.files.push(node);
                debug!(
                    target: "indexfs::package",
                    path = %logical,
                    unit = %unit_root,
                    "buffered into packaging unit"
                );
                Ok(())
            }
            None => inner.store_node(node, options),
        }
    }

    /// Open a reader over cached content.
    pub fn create_file_reader(&self, logical_path: &str) -> FsResult<FileReader> {
        self.mem.create_file_reader(logical_path)
    }

    /// Open a buffering writer; content below a packaging unit is
    /// buffered into the unit rather than flushed on its own.
    pub fn create_file_writer(
        &self,
        logical_path: &str,
        options: WriterOptions,
    ) -> FsResult<FileWriter> {
        let inner = Arc::clone(self.mem.inner());
        let units = Arc::clone(&self.units);
        let logical = logical_path.to_string();
        inner
            .entry_table
            .create_file(logical_path, &inner.physical(logical_path))?;
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
                Self::store_routed(&inner, &units, node, options)
            }),
        ))
    }

    /// Open a growable shared-mapping writer (never packaged).
    pub fn create_swap_mmap_writer(
        &self,
        logical_path: &str,
        capacity: usize,
    ) -> FsResult<SwapMmapWriter> {
        self.mem.create_swap_mmap_writer(logical_path, capacity)
    }

    /// Accept a node built elsewhere, routing it through packaging units.
    pub fn store_file(&self, node: Arc<FileNode>, options: WriterOptions) -> FsResult<()> {
        Self::store_routed(self.mem.inner(), &self.units, node, options)
    }

    /// Create a directory. A package hint starts a new packaging unit;
    /// a plain directory under an existing unit is recorded for the
    /// package meta instead of getting its own mkdir flush.
    pub fn make_directory(
        &self,
        logical_path: &str,
        recursive: bool,
        package_hint: bool,
    ) -> FsResult<()> {
        if package_hint {
            self.mem.inner().make_directory(logical_path, recursive, true)?;
            self.units
                .lock()
                .insert(logical_path.to_string(), PackageUnit::default());
            info!(target: "indexfs::package", unit = %logical_path, "packaging unit opened");
            return Ok(());
        }
        match Self::find_unit_root(&self.units, logical_path) {
            Some(unit_root) => {
                // everything between the unit root and the new directory
                // becomes part of the package meta
                let mut chain = Vec::new();
                let mut current = logical_path;
                while current != unit_root {
                    if self.mem.cache().find(current).is_none() {
                        chain.push(current.to_string());
                    }
                    match path::parent(current) {
                        Some(parent) if !parent.is_empty() => current = parent,
                        _ => break,
                    }
                }
                self.mem
                    .inner()
                    .make_directory(logical_path, recursive, false)?;
                let mut map = self.units.lock();
                let unit = map
                    .get_mut(&unit_root)
                    .unwrap_or_else(|| unreachable!("unit root vanished"));
                unit.plain_dirs.extend(chain);
                Ok(())
            }
            None => self.mem.make_directory(logical_path, recursive),
        }
    }

    /// Remove one logical file, dropping it from its unit's buffer.
    pub fn remove_file(&self, logical_path: &str) -> FsResult<()> {
        if let Some(unit_root) = Self::find_unit_root(&self.units, logical_path) {
            let mut map = self.units.lock();
            if let Some(unit) = map.get_mut(&unit_root) {
                unit.files.retain(|n| n.logical_path() != logical_path);
            }
        }
        self.mem.remove_file(logical_path)
    }

    /// Remove a logical directory subtree, discarding affected units.
    pub fn remove_directory(&self, logical_path: &str) -> FsResult<()> {
        self.mem.remove_directory(logical_path)?;
        let prefix = format!("{logical_path}/");
        let mut map = self.units.lock();
        map.retain(|root, _| root != logical_path && !root.starts_with(&prefix));
        for unit in map.values_mut() {
            unit.files
                .retain(|n| !path::is_strict_prefix(logical_path, n.logical_path()));
            unit.plain_dirs
                .retain(|d| !path::is_strict_prefix(logical_path, d));
        }
        Ok(())
    }

    /// Seal every packaging unit at or under `root`, deepest first so a
    /// nested unit is fully described before its parent's package closes.
    pub fn flush_package(&self, root: &str) -> FsResult<()> {
        let mut sealed: Vec<(String, PackageUnit)> = {
            let mut map = self.units.lock();
            let roots: Vec<String> = map
                .keys()
                .filter(|k| k.as_str() == root || path::is_strict_prefix(root, k))
                .cloned()
                .collect();
            roots
                .into_iter()
                .map(|r| {
                    let unit = map.remove(&r).unwrap_or_else(|| unreachable!());
                    (r, unit)
                })
                .collect()
        };
        sealed.sort_by_key(|(r, _)| std::cmp::Reverse(r.matches('/').count()));

        for (unit_root, unit) in sealed {
            self.seal_unit(&unit_root, unit)?;
        }
        Ok(())
    }

    fn seal_unit(&self, unit_root: &str, mut unit: PackageUnit) -> FsResult<()> {
        let inner = self.mem.inner();
        let physical_dir = inner.physical(unit_root);

        let mut meta = PackageFileMeta::new(self.file_align_size);
        let data_idx = meta.add_physical_file(&PackageFileMeta::data_file_name(0), "");
        let data_physical = path::join(&physical_dir, &PackageFileMeta::data_file_name(0));

        unit.files.sort_by(|a, b| a.logical_path().cmp(b.logical_path()));
        let mut packed = Vec::with_capacity(unit.files.len());
        let mut logical_paths = Vec::new();
        let mut cursor = 0u64;
        for node in &unit.files {
            let offset = meta.align(cursor);
            let relative = path::relative_to(unit_root, node.logical_path())
                .ok_or_else(|| {
                    FsError::Inconsistent(format!(
                        "{} buffered outside its unit {unit_root}",
                        node.logical_path()
                    ))
                })?;
            meta.add_inner_file(InnerFileMeta::new_file(
                relative,
                offset,
                node.length(),
                data_idx,
            ));
            cursor = offset + node.length();
            packed.push(PackagedNode {
                node: Arc::clone(node),
                data_file_idx: data_idx,
                offset,
            });
            logical_paths.push(node.logical_path().to_string());
        }
        for dir in &unit.plain_dirs {
            let relative = path::relative_to(unit_root, dir).ok_or_else(|| {
                FsError::Inconsistent(format!("{dir} recorded outside its unit {unit_root}"))
            })?;
            meta.add_inner_file(InnerFileMeta::new_dir(relative));
            logical_paths.push(dir.clone());
        }
        meta.sort();
        meta.update_physical_lengths();
        meta.validate()?;

        // repoint every inner path at the shared data file before the
        // flush so readers resolving through the entry table already see
        // the packaged layout
        for item in &packed {
            inner.entry_table.update_package_data_file(
                item.node.logical_path(),
                &data_physical,
                item.offset,
            )?;
            item.node.mark_in_package();
        }
        let meta_logical = path::join(unit_root, PACKAGE_META_FILE_NAME);
        let meta_physical = path::join(&physical_dir, PACKAGE_META_FILE_NAME);
        let meta_length = meta.to_json()?.len() as u64;
        inner
            .entry_table
            .add_entry_meta(EntryMeta::new_file(&meta_logical, &meta_physical, 0))?;
        inner
            .entry_table
            .update_package_meta_file(&meta_logical, meta_length)?;
        logical_paths.push(meta_logical);

        info!(
            target: "indexfs::package",
            unit = %unit_root,
            files = packed.len(),
            dirs = unit.plain_dirs.len(),
            "packaging unit sealed"
        );
        inner.push_op(FlushOperation::Package {
            fs: Arc::clone(&inner.fs),
            physical_dir,
            meta,
            files: packed,
            logical_paths,
        });
        Ok(())
    }

    /// Swap in a fresh queue and hand the current one to the dumper.
    pub fn sync(&self) -> FsResult<FlushFuture> {
        self.mem.sync()
    }

    /// Block until every dump has drained; re-raises deferred failures.
    pub fn wait_sync_finish(&self) -> FsResult<()> {
        self.mem.wait_sync_finish()
    }

    /// Reclaim clean, unreferenced cache entries.
    pub fn clean_cache(&self) -> usize {
        self.mem.clean_cache()
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
        storage: PackageMemStorage,
        table: Arc<SimpleEntryTable>,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let root = dir.path().to_string_lossy().to_string();
        let table = Arc::new(SimpleEntryTable::new());
        let storage = PackageMemStorage::new(
            Arc::new(LocalFs::new()),
            &root,
            Arc::clone(&table) as Arc<dyn EntryTable>,
            Arc::new(FileNodeCache::new(Arc::new(StorageMetrics::new()))),
            Arc::new(FlushScheduler::new(FlushMode::Inline, RetryPolicy::none())),
            16,
        );
        Fixture {
            _dir: dir,
            root,
            storage,
            table,
        }
    }

    fn write(f: &Fixture, logical: &str, data: &[u8]) {
        let mut w = f
            .storage
            .create_file_writer(logical, WriterOptions::default())
            .unwrap();
        w.write(data).unwrap();
        w.close().unwrap();
    }

    #[test]
    fn test_flush_package_end_to_end() {
        let f = fixture();
        f.storage.make_directory("/unit", true, true).unwrap();
        f.storage.make_directory("/unit/sub", false, false).unwrap();
        write(&f, "/unit/a", b"aaaaa");
        write(&f, "/unit/sub/b", b"bb");

        f.storage.flush_package("/unit").unwrap();
        assert!(f.storage.sync().unwrap().wait());

        let data_path = format!("{}/unit/package_file.__data__0", f.root);
        let bytes = std::fs::read(&data_path).unwrap();
        assert_eq!(&bytes[..5], b"aaaaa");
        // second file starts at the next 16-byte boundary
        assert_eq!(&bytes[16..18], b"bb");
        assert_eq!(bytes.len(), 18);

        let meta = PackageFileMeta::load(
            &LocalFs::new(),
            &format!("{}/unit/package_file.__meta__", f.root),
        )
        .unwrap();
        assert_eq!(meta.inner_file_count(), 3);
        assert!(meta.inner_files.iter().any(|i| i.relative_path == "sub" && i.is_dir));
        assert_eq!(meta.physical_file_lengths, vec![18]);

        // entry table repointed into the shared data file
        let entry = f.table.find("/unit/sub/b").unwrap();
        assert_eq!(entry.physical_path, data_path);
        assert_eq!(entry.offset, 16);
        assert!(entry.frozen);
        // individual physical files were never written
        assert!(!std::path::Path::new(&format!("{}/unit/a", f.root)).exists());
    }

    #[test]
    fn test_files_outside_units_flush_individually() {
        let f = fixture();
        f.storage.make_directory("/plain", true, false).unwrap();
        write(&f, "/plain/f", b"solo");

        assert!(f.storage.sync().unwrap().wait());
        assert_eq!(
            std::fs::read(format!("{}/plain/f", f.root)).unwrap(),
            b"solo"
        );
    }

    #[test]
    fn test_nested_units_seal_deepest_first() {
        let f = fixture();
        f.storage.make_directory("/outer", true, true).unwrap();
        f.storage.make_directory("/outer/inner", false, true).unwrap();
        write(&f, "/outer/top", b"top");
        write(&f, "/outer/inner/deep", b"deep");

        f.storage.flush_package("/outer").unwrap();
        assert!(f.storage.sync().unwrap().wait());

        // each unit produced its own package
        let outer_meta = PackageFileMeta::load(
            &LocalFs::new(),
            &format!("{}/outer/package_file.__meta__", f.root),
        )
        .unwrap();
        let inner_meta = PackageFileMeta::load(
            &LocalFs::new(),
            &format!("{}/outer/inner/package_file.__meta__", f.root),
        )
        .unwrap();
        assert!(outer_meta.inner_files.iter().any(|i| i.relative_path == "top"));
        assert!(inner_meta.inner_files.iter().any(|i| i.relative_path == "deep"));
        assert!(!outer_meta.inner_files.iter().any(|i| i.relative_path == "inner/deep"));
    }

    #[test]
    fn test_remove_file_unbuffers() {
        let f = fixture();
        f.storage.make_directory("/unit", true, true).unwrap();
        write(&f, "/unit/keep", b"keep");
        write(&f, "/unit/drop", b"drop");
        f.storage.remove_file("/unit/drop").unwrap();

        f.storage.flush_package("/unit").unwrap();
        assert!(f.storage.sync().unwrap().wait());

        let meta = PackageFileMeta::load(
            &LocalFs::new(),
            &format!("{}/unit/package_file.__meta__", f.root),
        )
        .unwrap();
        assert!(meta.inner_files.iter().any(|i| i.relative_path == "keep"));
        assert!(!meta.inner_files.iter().any(|i| i.relative_path == "drop"));
    }
}
