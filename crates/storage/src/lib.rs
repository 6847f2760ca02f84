//! Refcounted node cache, storage variants, and the async flush pipeline
//!
//! This crate is the stateful middle of indexfs. Logical files live as
//! [`node::FileNode`]s inside a [`cache::FileNodeCache`]; a
//! [`storage::Storage`] variant decides where their bytes come from and
//! where dirty content goes; the [`flush`] module moves built content to
//! disk off the build thread and freezes it once it has landed.
//!
//! Nothing here owns the logical namespace: path→entry resolution stays
//! behind the `EntryTable` trait from `indexfs-core`, and package file
//! layout comes from `indexfs-package`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod flush;
pub mod metrics;
pub mod node;
pub mod reader;
pub mod storage;
pub mod writer;

pub use cache::FileNodeCache;
pub use flush::{
    FlushFuture, FlushMode, FlushOperation, FlushOperationQueue, FlushPromise, FlushScheduler,
    FreezeContext, PackagedNode, RetryPolicy,
};
pub use metrics::{FileType, MetricGroup, StorageMetrics};
pub use node::{FileNode, MappedFile, MmapRegistry, SharedMmap, DEFAULT_BLOCK_SIZE};
pub use reader::FileReader;
pub use storage::{
    DiskStorage, MemStorage, PackageDiskStorage, PackageMemStorage, Storage, StorageType,
    WriterOptions,
};
pub use writer::{FileWriter, StoreFn, SwapMmapWriter};
