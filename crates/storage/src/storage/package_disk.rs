//! Read/merge-oriented storage over packaged trees
//!
//! The physical tree is partitioned into units, one per previously
//! packaged directory. New small files append to an open physical stream
//! per unit; `commit_package` seals every open stream under a fresh
//! versioned meta, and `recover_package` rebuilds unit bookkeeping from
//! the versioned metas a crash left behind.

use crate::cache::FileNodeCache;
use crate::metrics::MetricGroup;
use crate::node::{FileNode, MmapRegistry};
use crate::reader::FileReader;
use crate::storage::WriterOptions;
use crate::writer::FileWriter;
use indexfs_core::{path, EntryMeta, EntryTable, FsError, FsPrimitives, FsResult};
use indexfs_package::{
    InnerFileMeta, PackageFileMeta, VersionedPackageFileMeta, PACKAGE_DATA_FILE_PREFIX,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, info};

struct BuildingStream {
    data_idx: u32,
    data_physical: String,
    writer: Box<dyn Write + Send>,
    written: u64,
    // (logical path, offset) of entries not yet committed
    new_entries: Vec<(String, u64)>,
}

struct DiskUnit {
    meta: PackageFileMeta,
    next_version: u32,
    building: Option<BuildingStream>,
}

struct PackageDiskInner {
    fs: Arc<dyn FsPrimitives>,
    physical_root: String,
    entry_table: Arc<dyn EntryTable>,
    cache: Arc<FileNodeCache>,
    registry: MmapRegistry,
    description: String,
    file_align_size: u64,
    units: Mutex<BTreeMap<String, DiskUnit>>,
}

/// Packaged disk storage with crash-safe incremental append
pub struct PackageDiskStorage {
    inner: Arc<PackageDiskInner>,
}

impl PackageDiskInner {
    fn physical(&self, logical_path: &str) -> String {
        format!("{}{logical_path}", self.physical_root)
    }

    fn find_unit_root(&self, logical_path: &str) -> Option<String> {
        let units = self.units.lock();
        let mut current = path::parent(logical_path);
        while let Some(dir) = current {
            if dir.is_empty() {
                break;
            }
            if units.contains_key(dir) {
                return Some(dir.to_string());
            }
            current = path::parent(dir);
        }
        None
    }

    /// Append a built node to its unit's open physical stream. Content
    /// is on disk immediately but only becomes part of the package once
    /// `commit_package` seals the stream under a versioned meta.
    fn store_file(&self, node: Arc<FileNode>) -> FsResult<()> {
        let logical = node.logical_path().to_string();
        let unit_root = self.find_unit_root(&logical).ok_or(FsError::NotSupported(
            "store_file outside a packaging unit on packaged disk storage",
        ))?;
        let physical_dir = self.physical(&unit_root);
        let relative = path::relative_to(&unit_root, &logical)
            .ok_or_else(|| {
                FsError::Inconsistent(format!("{logical} routed outside its unit {unit_root}"))
            })?
            .to_string();
        let bytes = node.read_all()?;

        let mut units = self.units.lock();
        let unit = units
            .get_mut(&unit_root)
            .ok_or_else(|| FsError::NotFound(unit_root.clone()))?;

        if unit.building.is_none() {
            let name = VersionedPackageFileMeta::data_file_name(
                &self.description,
                unit.meta.physical_file_names.len() as u32,
            );
            let data_idx = unit.meta.add_physical_file(&name, "");
            let data_physical = path::join(&physical_dir, &name);
            let writer = self.fs.create_write(&data_physical)?;
            unit.building = Some(BuildingStream {
                data_idx,
                data_physical,
                writer,
                written: 0,
                new_entries: Vec::new(),
            });
        }
        let offset = unit
            .meta
            .align(unit.building.as_ref().map(|b| b.written).unwrap_or(0));
        let data_idx = {
            let stream = match unit.building.as_mut() {
                Some(stream) => stream,
                None => unreachable!("stream opened above"),
            };
            if offset > stream.written {
                let zeros = vec![0u8; (offset - stream.written) as usize];
                stream.writer.write_all(&zeros).map_err(FsError::Io)?;
            }
            stream.writer.write_all(&bytes).map_err(FsError::Io)?;
            stream.written = offset + bytes.len() as u64;
            stream.new_entries.push((logical.clone(), offset));
            stream.data_idx
        };
        unit.meta.add_inner_file(InnerFileMeta::new_file(
            &relative,
            offset,
            bytes.len() as u64,
            data_idx,
        ));
        drop(units);

        let mut meta = EntryMeta::new_file(&logical, node.physical_path(), node.length());
        meta.is_mem_file = true;
        self.entry_table.add_entry_meta(meta)?;
        self.cache.insert(node);
        debug!(
            target: "indexfs::package",
            path = %logical,
            unit = %unit_root,
            offset,
            "appended to open package stream"
        );
        Ok(())
    }
}

impl PackageDiskStorage {
    /// Create a packaged disk storage rooted at `physical_root`, whose
    /// versioned files carry `description` in their names.
    pub fn new(
        fs: Arc<dyn FsPrimitives>,
        physical_root: &str,
        entry_table: Arc<dyn EntryTable>,
        cache: Arc<FileNodeCache>,
        description: &str,
        file_align_size: u64,
    ) -> Self {
        PackageDiskStorage {
            inner: Arc::new(PackageDiskInner {
                fs,
                physical_root: physical_root.trim_end_matches('/').to_string(),
                entry_table,
                cache,
                registry: MmapRegistry::new(),
                description: description.to_string(),
                file_align_size,
                units: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Shared node cache.
    pub fn cache(&self) -> &Arc<FileNodeCache> {
        &self.inner.cache
    }

    /// Create a directory; with a package hint the directory becomes a
    /// unit accepting appended files.
    pub fn make_directory(
        &self,
        logical_path: &str,
        recursive: bool,
        package_hint: bool,
    ) -> FsResult<()> {
        let inner = &self.inner;
        let physical = inner.physical(logical_path);
        inner.fs.mkdir(&physical, recursive)?;
        inner.cache.insert(Arc::new(FileNode::new_directory(
            logical_path,
            &physical,
            MetricGroup::Local,
        )));
        inner
            .entry_table
            .add_entry_meta(EntryMeta::new_dir(logical_path, &physical))?;
        if package_hint {
            inner.units.lock().insert(
                logical_path.to_string(),
                DiskUnit {
                    meta: PackageFileMeta::new(inner.file_align_size),
                    next_version: 0,
                    building: None,
                },
            );
            info!(target: "indexfs::package", unit = %logical_path, "disk unit opened");
        }
        Ok(())
    }

    /// Append a built node into its unit's open stream.
    pub fn store_file(&self, node: Arc<FileNode>) -> FsResult<()> {
        self.inner.store_file(node)
    }

    /// Open a buffering writer whose `close` appends the content into
    /// the target's packaging unit.
    pub fn create_file_writer(
        &self,
        logical_path: &str,
        _options: WriterOptions,
    ) -> FsResult<FileWriter> {
        if self.inner.find_unit_root(logical_path).is_none() {
            return Err(FsError::NotSupported(
                "write outside a packaging unit on packaged disk storage",
            ));
        }
        self.inner
            .entry_table
            .create_file(logical_path, &self.inner.physical(logical_path))?;
        let inner = Arc::clone(&self.inner);
        let logical = logical_path.to_string();
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
                inner.store_file(node)
            }),
        ))
    }

    /// Seal every open stream: flush it, write the next versioned meta,
    /// and repoint the appended entries at the shared data file.
    pub fn commit_package(&self) -> FsResult<()> {
        let inner = &self.inner;
        let mut units = inner.units.lock();
        for (unit_root, unit) in units.iter_mut() {
            let Some(mut stream) = unit.building.take() else {
                continue;
            };
            stream.writer.flush().map_err(FsError::Io)?;
            drop(stream.writer);

            unit.meta.sort();
            unit.meta.update_physical_lengths();
            unit.meta.validate()?;

            let physical_dir = inner.physical(unit_root);
            let versioned = VersionedPackageFileMeta::new(unit.meta.clone(), unit.next_version);
            versioned.store(inner.fs.as_ref(), &physical_dir, &inner.description)?;
            unit.next_version += 1;

            let mut frozen_paths = Vec::with_capacity(stream.new_entries.len());
            for (logical, offset) in &stream.new_entries {
                inner
                    .entry_table
                    .update_package_data_file(logical, &stream.data_physical, *offset)?;
                if let Some(node) = inner.cache.find(logical) {
                    node.mark_in_package();
                    node.freeze();
                }
                frozen_paths.push(logical.clone());
            }
            inner.entry_table.freeze(&frozen_paths)?;
            inner.cache.clean_files(&frozen_paths);
            info!(
                target: "indexfs::package",
                unit = %unit_root,
                version = versioned.version_id,
                appended = frozen_paths.len(),
                "package committed"
            );
        }
        Ok(())
    }

    /// Rebuild one unit from the versioned metas on disk: the highest
    /// version wins unless `requested` names one, files from an
    /// incomplete later attempt are deleted, and the entry table is
    /// repopulated from the recovered meta. Returns the recovered
    /// version, or `None` when the unit has no meta yet.
    pub fn recover_package(&self, root: &str, requested: Option<u32>) -> FsResult<Option<u32>> {
        let inner = &self.inner;
        let physical_dir = inner.physical(root);
        if !inner.units.lock().contains_key(root) {
            return Err(FsError::NotFound(root.to_string()));
        }
        let Some(versioned) = VersionedPackageFileMeta::recover(
            inner.fs.as_ref(),
            &physical_dir,
            &inner.description,
            requested,
        )?
        else {
            return Ok(None);
        };
        versioned.clean_stale_data_files(inner.fs.as_ref(), &physical_dir, &inner.description)?;
        self.clean_newer_metas(&physical_dir, versioned.version_id)?;

        let mut frozen_paths = Vec::new();
        for inner_file in &versioned.meta.inner_files {
            let logical = path::join(root, &inner_file.relative_path);
            if inner_file.is_dir {
                inner
                    .entry_table
                    .add_entry_meta(EntryMeta::new_dir(&logical, &inner.physical(&logical)))?;
            } else {
                let data_physical = path::join(
                    &physical_dir,
                    &versioned.meta.physical_file_names[inner_file.data_file_idx as usize],
                );
                let mut meta = EntryMeta::new_file(&logical, &data_physical, inner_file.length);
                meta.offset = inner_file.offset;
                inner.entry_table.add_entry_meta(meta)?;
            }
            frozen_paths.push(logical);
        }
        inner.entry_table.freeze(&frozen_paths)?;

        let mut units = inner.units.lock();
        let unit = units
            .get_mut(root)
            .ok_or_else(|| FsError::NotFound(root.to_string()))?;
        unit.meta = versioned.meta.clone();
        unit.next_version = versioned.version_id + 1;
        unit.building = None;
        info!(
            target: "indexfs::package",
            unit = %root,
            version = versioned.version_id,
            entries = versioned.meta.inner_file_count(),
            "package recovered"
        );
        Ok(Some(versioned.version_id))
    }

    fn clean_newer_metas(&self, physical_dir: &str, version_id: u32) -> FsResult<()> {
        for name in self.inner.fs.list_dir(physical_dir)? {
            if let Some((description, version)) = VersionedPackageFileMeta::recognize(&name) {
                if description == self.inner.description && version > version_id {
                    self.inner.fs.delete_file(&path::join(physical_dir, &name))?;
                }
            }
        }
        Ok(())
    }

    /// Open a reader; packaged entries resolve through the entry table
    /// to a slice of the shared data-file mapping.
    pub fn create_file_reader(&self, logical_path: &str) -> FsResult<FileReader> {
        let inner = &self.inner;
        if let Some(node) = inner.cache.find(logical_path) {
            inner.cache.metrics().increase_cache_hit();
            if node.is_directory() {
                return Err(FsError::IsDirectory(logical_path.to_string()));
            }
            return Ok(FileReader::new(node));
        }
        inner.cache.metrics().increase_cache_miss();

        let meta = inner
            .entry_table
            .find(logical_path)
            .ok_or_else(|| FsError::NotFound(logical_path.to_string()))?;
        if meta.is_dir {
            return Err(FsError::IsDirectory(logical_path.to_string()));
        }
        let physical_name = path::file_name(&meta.physical_path);
        let node = if physical_name.starts_with(PACKAGE_DATA_FILE_PREFIX) {
            let mapped = inner.registry.open_shared(&meta.physical_path, false)?;
            let base = Arc::new(FileNode::new_mmap(
                &meta.physical_path,
                &meta.physical_path,
                mapped,
                false,
            ));
            let slice = FileNode::new_slice(logical_path, base, meta.offset, meta.length)?;
            slice.mark_in_package();
            Arc::new(slice)
        } else {
            let data = inner.fs.read_file(&meta.physical_path)?;
            Arc::new(FileNode::new_mem(
                logical_path,
                &meta.physical_path,
                data,
                false,
                MetricGroup::Local,
            ))
        };
        inner.cache.insert(Arc::clone(&node));
        Ok(FileReader::new(node))
    }

    /// Nothing is page-locked by this variant.
    pub fn estimate_file_lock_memory_use(&self, _logical_path: &str) -> FsResult<u64> {
        Ok(0)
    }

    /// Remove one logical file from the cache and the entry table. The
    /// packed bytes stay in the shared data file until a merge rewrites
    /// it.
    pub fn remove_file(&self, logical_path: &str) -> FsResult<()> {
        let inner = &self.inner;
        let mut found = false;
        match inner.cache.remove_file(logical_path) {
            Ok(()) => found = true,
            Err(FsError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
        match inner.entry_table.delete(logical_path) {
            Ok(()) => found = true,
            Err(FsError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
        if found {
            Ok(())
        } else {
            Err(FsError::NotFound(logical_path.to_string()))
        }
    }

    /// Remove a logical directory subtree, dropping any unit rooted in
    /// it.
    pub fn remove_directory(&self, logical_path: &str) -> FsResult<()> {
        let inner = &self.inner;
        let cached = inner.cache.subtree(logical_path);
        inner.cache.remove_directory(logical_path)?;
        for node in &cached {
            match inner.entry_table.delete(node.logical_path()) {
                Ok(()) | Err(FsError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        let physical = inner.physical(logical_path);
        if inner.fs.is_exist(&physical)? {
            inner.fs.delete_dir(&physical)?;
        }
        let prefix = format!("{logical_path}/");
        inner
            .units
            .lock()
            .retain(|root, _| root != logical_path && !root.starts_with(&prefix));
        Ok(())
    }

    /// Reclaim clean, unreferenced cache entries and dead mappings.
    pub fn clean_cache(&self) -> usize {
        let evicted = self.inner.cache.clean();
        self.inner.registry.evict_dead();
        evicted
    }
}
