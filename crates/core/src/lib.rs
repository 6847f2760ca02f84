//! Core types and collaborator interfaces for indexfs
//!
//! This crate holds everything the file-system core consumes but does not
//! own:
//! - Error taxonomy (`FsError` / `FsResult`) shared by every layer
//! - Logical path utilities (normalization, prefix scans)
//! - `FsPrimitives`: the narrow byte-level filesystem trait, plus `LocalFs`
//! - `EntryTable`: the external logical→physical index interface
//! - `BlockMemoryQuotaController`: resident-byte accounting
//! - `LoadConfigList`: ordered path-pattern → open-type rules

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod entry_table;
pub mod error;
pub mod fs;
pub mod load_config;
pub mod path;
pub mod quota;

pub use entry_table::{EntryMeta, EntryTable, SimpleEntryTable};
pub use error::{FsError, FsResult};
pub use fs::{FsPrimitives, LocalFs, TMP_SUFFIX};
pub use load_config::{LoadConfigList, LoadRule, OpenType};
pub use quota::BlockMemoryQuotaController;
