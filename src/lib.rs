//! indexfs — virtual file-system core for a search-index storage engine
//!
//! A logical namespace of index files decoupled from physical placement:
//! bytes may live on local disk, in memory awaiting an async flush, or
//! packed with other small files inside a package archive, while readers
//! see one stable logical path either way.
//!
//! The workspace splits along ownership lines:
//! - [`core`] — error taxonomy, logical paths, the `FsPrimitives` byte
//!   trait, the `EntryTable` collaborator interface, quota accounting.
//! - [`package`] — the package archive document model, versioned package
//!   files, and the directory merger.
//! - [`storage`] — file nodes, the refcounted node cache, the flush
//!   pipeline, and the four storage variants.
//!
//! The most common entry points are re-exported at the root.

pub use indexfs_core as core;
pub use indexfs_package as package;
pub use indexfs_storage as storage;

pub use indexfs_core::{
    BlockMemoryQuotaController, EntryMeta, EntryTable, FsError, FsPrimitives, FsResult,
    LoadConfigList, LoadRule, LocalFs, OpenType, SimpleEntryTable,
};
pub use indexfs_package::{
    DirectoryMerger, InnerFileMeta, PackageFileMeta, VersionedPackageFileMeta,
};
pub use indexfs_storage::{
    DiskStorage, FileNode, FileNodeCache, FileReader, FileWriter, FlushMode, FlushScheduler,
    MemStorage, MetricGroup, PackageDiskStorage, PackageMemStorage, Storage, StorageMetrics,
    StorageType, WriterOptions,
};
