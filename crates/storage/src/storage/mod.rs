//! Storage variants
//!
//! A `Storage` decides where a logical file's bytes live and how reads
//! and writes are realized. The set of variants is closed and chosen once
//! at construction; operations that make no sense for a variant answer
//! `NotSupported` instead of guessing.

pub mod disk;
pub mod mem;
pub mod package_disk;
pub mod package_mem;

pub use disk::DiskStorage;
pub use mem::MemStorage;
pub use package_disk::PackageDiskStorage;
pub use package_mem::PackageMemStorage;

use crate::flush::FlushFuture;
use crate::node::FileNode;
use crate::reader::FileReader;
use crate::writer::{FileWriter, SwapMmapWriter};
use indexfs_core::{FsError, FsResult};
use std::sync::Arc;

/// Which variant a `Storage` was constructed as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    /// Read-oriented view over an existing physical tree
    Disk,
    /// Write path for freshly built content
    Mem,
    /// Mem storage that batches directories into package files
    PackageMem,
    /// Read/merge-oriented storage over packaged trees
    PackageDisk,
}

/// Per-write knobs for `store_file` and writer handles
#[derive(Debug, Clone, Copy)]
pub struct WriterOptions {
    /// Flush through a temp name and rename (refuses to overwrite)
    pub atomic_dump: bool,
    /// Snapshot content at enqueue time so the node may keep growing
    pub copy_on_dump: bool,
}

impl Default for WriterOptions {
    fn default() -> Self {
        WriterOptions {
            atomic_dump: true,
            copy_on_dump: false,
        }
    }
}

/// Closed sum of the storage variants
pub enum Storage {
    /// Read-oriented disk storage
    Disk(DiskStorage),
    /// In-memory build storage
    Mem(MemStorage),
    /// Packaging build storage
    PackageMem(PackageMemStorage),
    /// Packaged disk storage
    PackageDisk(PackageDiskStorage),
}

impl Storage {
    /// Variant discriminant.
    pub fn storage_type(&self) -> StorageType {
        match self {
            Storage::Disk(_) => StorageType::Disk,
            Storage::Mem(_) => StorageType::Mem,
            Storage::PackageMem(_) => StorageType::PackageMem,
            Storage::PackageDisk(_) => StorageType::PackageDisk,
        }
    }

    /// Open a reader for a logical path.
    pub fn create_file_reader(&self, path: &str) -> FsResult<FileReader> {
        match self {
            Storage::Disk(s) => s.create_file_reader(path),
            Storage::Mem(s) => s.create_file_reader(path),
            Storage::PackageMem(s) => s.create_file_reader(path),
            Storage::PackageDisk(s) => s.create_file_reader(path),
        }
    }

    /// Open a buffering writer for a logical path.
    pub fn create_file_writer(&self, path: &str, options: WriterOptions) -> FsResult<FileWriter> {
        match self {
            Storage::Disk(_) => Err(FsError::NotSupported("write on disk storage")),
            Storage::Mem(s) => s.create_file_writer(path, options),
            Storage::PackageMem(s) => s.create_file_writer(path, options),
            Storage::PackageDisk(s) => s.create_file_writer(path, options),
        }
    }

    /// Open a growable shared-mapping writer.
    pub fn create_swap_mmap_writer(&self, path: &str, capacity: usize) -> FsResult<SwapMmapWriter> {
        match self {
            Storage::Mem(s) => s.create_swap_mmap_writer(path, capacity),
            Storage::PackageMem(s) => s.create_swap_mmap_writer(path, capacity),
            _ => Err(FsError::NotSupported("swap-mmap writer on this storage")),
        }
    }

    /// Create a logical directory. A `package_hint` starts tracking the
    /// directory as a packaging unit on the package variants.
    pub fn make_directory(
        &self,
        logical_path: &str,
        recursive: bool,
        package_hint: bool,
    ) -> FsResult<()> {
        match self {
            Storage::Disk(s) => {
                if package_hint {
                    return Err(FsError::NotSupported("package hint on disk storage"));
                }
                s.make_directory(logical_path, recursive)
            }
            Storage::Mem(s) => {
                if package_hint {
                    return Err(FsError::NotSupported("package hint on mem storage"));
                }
                s.make_directory(logical_path, recursive)
            }
            Storage::PackageMem(s) => s.make_directory(logical_path, recursive, package_hint),
            Storage::PackageDisk(s) => s.make_directory(logical_path, recursive, package_hint),
        }
    }

    /// Remove one logical file.
    pub fn remove_file(&self, path: &str) -> FsResult<()> {
        match self {
            Storage::Disk(s) => s.remove_file(path),
            Storage::Mem(s) => s.remove_file(path),
            Storage::PackageMem(s) => s.remove_file(path),
            Storage::PackageDisk(s) => s.remove_file(path),
        }
    }

    /// Remove a logical directory and everything beneath it.
    pub fn remove_directory(&self, path: &str) -> FsResult<()> {
        match self {
            Storage::Disk(s) => s.remove_directory(path),
            Storage::Mem(s) => s.remove_directory(path),
            Storage::PackageMem(s) => s.remove_directory(path),
            Storage::PackageDisk(s) => s.remove_directory(path),
        }
    }

    /// Accept a built node into the storage.
    pub fn store_file(&self, node: Arc<FileNode>, options: WriterOptions) -> FsResult<()> {
        match self {
            Storage::Disk(_) => Err(FsError::NotSupported("store_file on disk storage")),
            Storage::Mem(s) => s.store_file(node, options),
            Storage::PackageMem(s) => s.store_file(node, options),
            Storage::PackageDisk(s) => s.store_file(node),
        }
    }

    /// Bytes that would become memory-resident if the subtree were opened
    /// with its configured open types.
    pub fn estimate_file_lock_memory_use(&self, path: &str) -> FsResult<u64> {
        match self {
            Storage::Disk(s) => s.estimate_file_lock_memory_use(path),
            Storage::PackageDisk(s) => s.estimate_file_lock_memory_use(path),
            _ => Ok(0),
        }
    }

    /// Hand the pending flush queue to the dumper; resolves when that
    /// queue and its freeze callbacks complete.
    pub fn sync(&self) -> FsResult<FlushFuture> {
        match self {
            Storage::Disk(_) | Storage::PackageDisk(_) => {
                let (future, promise) = FlushFuture::channel();
                promise.set(true);
                Ok(future)
            }
            Storage::Mem(s) => s.sync(),
            Storage::PackageMem(s) => s.sync(),
        }
    }

    /// Block until every submitted flush has drained; re-raises a
    /// deferred flush failure.
    pub fn wait_sync_finish(&self) -> FsResult<()> {
        match self {
            Storage::Disk(_) | Storage::PackageDisk(_) => Ok(()),
            Storage::Mem(s) => s.wait_sync_finish(),
            Storage::PackageMem(s) => s.wait_sync_finish(),
        }
    }

    /// Reclaim clean, unreferenced cache entries.
    pub fn clean_cache(&self) -> usize {
        match self {
            Storage::Disk(s) => s.clean_cache(),
            Storage::Mem(s) => s.clean_cache(),
            Storage::PackageMem(s) => s.clean_cache(),
            Storage::PackageDisk(s) => s.clean_cache(),
        }
    }

    /// Seal every packaging unit at or under `root` into package files.
    pub fn flush_package(&self, root: &str) -> FsResult<()> {
        match self {
            Storage::PackageMem(s) => s.flush_package(root),
            _ => Err(FsError::NotSupported("flush_package on this storage")),
        }
    }

    /// Seal all open package streams into versioned package files.
    pub fn commit_package(&self) -> FsResult<()> {
        match self {
            Storage::PackageDisk(s) => s.commit_package(),
            _ => Err(FsError::NotSupported("commit_package on this storage")),
        }
    }

    /// Rebuild unit bookkeeping from the versioned metas on disk.
    pub fn recover_package(&self, root: &str, requested: Option<u32>) -> FsResult<Option<u32>> {
        match self {
            Storage::PackageDisk(s) => s.recover_package(root, requested),
            _ => Err(FsError::NotSupported("recover_package on this storage")),
        }
    }
}
