//! Package archive format for indexfs
//!
//! A package file stores many small logical files contiguously inside a few
//! physical files to bound physical file count:
//!
//! - `package_file.__data__<N>` — concatenated data file N (final)
//! - `package_file.__data__.<description>.<N>` — versioned data file
//! - `package_file.__meta__` — final self-describing meta document
//! - `package_file.__meta__.<description>.<versionId>` — versioned meta
//!   written during incremental build or merge
//!
//! The meta document lists every inner logical file's (offset, length,
//! data-file index, directory flag) plus the physical file names, tags,
//! lengths, and the alignment unit.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod merger;
pub mod meta;
pub mod versioned;

pub use merger::DirectoryMerger;
pub use meta::{
    InnerFileMeta, PackageFileMeta, DEFAULT_FILE_ALIGN_SIZE, PACKAGE_DATA_FILE_PREFIX,
    PACKAGE_META_FILE_NAME,
};
pub use versioned::VersionedPackageFileMeta;
