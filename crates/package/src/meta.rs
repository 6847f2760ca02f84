//! Package meta document
//!
//! Document form (JSON, self-describing):
//!
//! ```text
//! {
//!   "inner_files": [
//!     { "path": "...", "offset": 0, "length": 0, "fileIdx": 0, "isDir": true },
//!     { "path": "...", "offset": 0, "length": 13, "fileIdx": 0, "isDir": false }
//!   ],
//!   "file_align_size": 4096,
//!   "physical_file_names":   ["package_file.__data__0"],
//!   "physical_file_lengths": [4109],
//!   "physical_file_tags":    [""]
//! }
//! ```
//!
//! Invariants after `sort()`:
//! - entries ordered by (fileIdx, offset, directory-first, length, path)
//! - `physical_file_lengths[i]` equals `max(offset + length)` over all
//!   non-directory entries with `fileIdx == i`
//! - directory entries always carry offset = length = 0

use indexfs_core::{FsError, FsPrimitives, FsResult};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Final meta document file name
pub const PACKAGE_META_FILE_NAME: &str = "package_file.__meta__";

/// Physical data file name prefix
pub const PACKAGE_DATA_FILE_PREFIX: &str = "package_file.__data__";

/// Default alignment unit for inner-file offsets (one page)
pub const DEFAULT_FILE_ALIGN_SIZE: u64 = 4096;

/// One logical file stored inside a package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InnerFileMeta {
    /// Path relative to the packaging directory
    #[serde(rename = "path")]
    pub relative_path: String,
    /// Byte offset inside the physical data file
    pub offset: u64,
    /// Byte length
    pub length: u64,
    /// Index into the physical file lists
    #[serde(rename = "fileIdx")]
    pub data_file_idx: u32,
    /// Directory marker; directories always carry offset = length = 0
    #[serde(rename = "isDir")]
    pub is_dir: bool,
}

impl InnerFileMeta {
    /// A file entry.
    pub fn new_file(relative_path: &str, offset: u64, length: u64, data_file_idx: u32) -> Self {
        InnerFileMeta {
            relative_path: relative_path.to_string(),
            offset,
            length,
            data_file_idx,
            is_dir: false,
        }
    }

    /// A directory entry (offset and length fixed at zero).
    pub fn new_dir(relative_path: &str) -> Self {
        InnerFileMeta {
            relative_path: relative_path.to_string(),
            offset: 0,
            length: 0,
            data_file_idx: 0,
            is_dir: true,
        }
    }

    fn sort_key_cmp(&self, other: &Self) -> Ordering {
        self.data_file_idx
            .cmp(&other.data_file_idx)
            .then(self.offset.cmp(&other.offset))
            // directories before files at the same position
            .then(other.is_dir.cmp(&self.is_dir))
            .then(self.length.cmp(&other.length))
            .then(self.relative_path.cmp(&other.relative_path))
    }
}

/// Self-describing description of one package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageFileMeta {
    /// Inner logical files, ordered after `sort()`
    pub inner_files: Vec<InnerFileMeta>,
    /// Alignment unit for inner-file offsets
    pub file_align_size: u64,
    /// Physical data file names, indexed by `data_file_idx`
    pub physical_file_names: Vec<String>,
    /// Physical data file lengths, parallel to names
    pub physical_file_lengths: Vec<u64>,
    /// Physical data file tags, parallel to names
    pub physical_file_tags: Vec<String>,
}

impl PackageFileMeta {
    /// Empty meta with the given alignment unit.
    pub fn new(file_align_size: u64) -> Self {
        PackageFileMeta {
            inner_files: Vec::new(),
            file_align_size,
            physical_file_names: Vec::new(),
            physical_file_lengths: Vec::new(),
            physical_file_tags: Vec::new(),
        }
    }

    /// Round `offset` up to the next alignment boundary.
    pub fn align(&self, offset: u64) -> u64 {
        let align = self.file_align_size.max(1);
        (offset + align - 1) / align * align
    }

    /// Register a physical data file; returns its index.
    pub fn add_physical_file(&mut self, name: &str, tag: &str) -> u32 {
        self.physical_file_names.push(name.to_string());
        self.physical_file_lengths.push(0);
        self.physical_file_tags.push(tag.to_string());
        (self.physical_file_names.len() - 1) as u32
    }

    /// Append an inner file entry.
    pub fn add_inner_file(&mut self, inner: InnerFileMeta) {
        self.inner_files.push(inner);
    }

    /// Final data file name for index `idx`: `package_file.__data__<idx>`.
    pub fn data_file_name(idx: u32) -> String {
        format!("{}{}", PACKAGE_DATA_FILE_PREFIX, idx)
    }

    /// Sort entries by (fileIdx, offset, directory-first, length, path).
    pub fn sort(&mut self) {
        self.inner_files.sort_by(InnerFileMeta::sort_key_cmp);
    }

    /// Recompute `physical_file_lengths[i]` as `max(offset + length)` over
    /// non-directory entries with `fileIdx == i`.
    pub fn update_physical_lengths(&mut self) {
        for len in self.physical_file_lengths.iter_mut() {
            *len = 0;
        }
        for inner in &self.inner_files {
            if inner.is_dir {
                continue;
            }
            let idx = inner.data_file_idx as usize;
            if idx < self.physical_file_lengths.len() {
                let end = inner.offset + inner.length;
                if end > self.physical_file_lengths[idx] {
                    self.physical_file_lengths[idx] = end;
                }
            }
        }
    }

    /// Check internal consistency: parallel lists agree, every entry's
    /// index is in range, directory entries carry offset = length = 0, and
    /// the physical length invariant holds.
    pub fn validate(&self) -> FsResult<()> {
        if self.physical_file_names.len() != self.physical_file_lengths.len()
            || self.physical_file_names.len() != self.physical_file_tags.len()
        {
            return Err(FsError::Inconsistent(
                "package meta physical file lists disagree in length".to_string(),
            ));
        }
        let mut max_ends = vec![0u64; self.physical_file_names.len()];
        for inner in &self.inner_files {
            if inner.is_dir {
                if inner.offset != 0 || inner.length != 0 {
                    return Err(FsError::Inconsistent(format!(
                        "directory entry {} carries nonzero extent",
                        inner.relative_path
                    )));
                }
                continue;
            }
            let idx = inner.data_file_idx as usize;
            if idx >= max_ends.len() {
                return Err(FsError::Inconsistent(format!(
                    "inner file {} references data file {} of {}",
                    inner.relative_path,
                    idx,
                    max_ends.len()
                )));
            }
            max_ends[idx] = max_ends[idx].max(inner.offset + inner.length);
        }
        for (idx, (&expect, &got)) in max_ends
            .iter()
            .zip(self.physical_file_lengths.iter())
            .enumerate()
        {
            if expect != got {
                return Err(FsError::Inconsistent(format!(
                    "physical file {} length {} != max inner extent {}",
                    idx, got, expect
                )));
            }
        }
        Ok(())
    }

    /// Serialize to the JSON document form.
    pub fn to_json(&self) -> FsResult<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| FsError::Serialization(e.to_string()))
    }

    /// Parse the JSON document form.
    pub fn from_json(data: &[u8]) -> FsResult<Self> {
        serde_json::from_slice(data).map_err(|e| FsError::Serialization(e.to_string()))
    }

    /// Load a meta document from `path`.
    pub fn load(fs: &dyn FsPrimitives, path: &str) -> FsResult<Self> {
        let data = fs.atomic_load(path)?;
        Self::from_json(&data)
    }

    /// Atomically store the meta document at `path`.
    pub fn store(&self, fs: &dyn FsPrimitives, path: &str) -> FsResult<()> {
        fs.atomic_store(path, &self.to_json()?)
    }

    /// Number of inner entries.
    pub fn inner_file_count(&self) -> usize {
        self.inner_files.len()
    }
}

impl Default for PackageFileMeta {
    fn default() -> Self {
        Self::new(DEFAULT_FILE_ALIGN_SIZE)
    }
}
