//! Versioned package meta
//!
//! During incremental build or merge, meta documents are written under
//! `package_file.__meta__.<description>.<versionId>` with monotonically
//! increasing version ids, and data files under
//! `package_file.__data__.<description>.<N>`. Recovery scans the directory
//! and keeps the highest version present (or an explicitly requested one),
//! discarding files left over from an incomplete prior attempt.

use crate::meta::{PackageFileMeta, PACKAGE_DATA_FILE_PREFIX, PACKAGE_META_FILE_NAME};
use indexfs_core::{FsPrimitives, FsResult};
use tracing::info;

/// A package meta plus its version id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedPackageFileMeta {
    /// The meta document
    pub meta: PackageFileMeta,
    /// Monotonically increasing version id
    pub version_id: u32,
}

impl VersionedPackageFileMeta {
    /// Wrap a meta with a version id.
    pub fn new(meta: PackageFileMeta, version_id: u32) -> Self {
        VersionedPackageFileMeta { meta, version_id }
    }

    /// Versioned meta file name: `package_file.__meta__.<description>.<versionId>`.
    pub fn meta_file_name(description: &str, version_id: u32) -> String {
        format!("{}.{}.{}", PACKAGE_META_FILE_NAME, description, version_id)
    }

    /// Versioned data file name: `package_file.__data__.<description>.<N>`.
    pub fn data_file_name(description: &str, idx: u32) -> String {
        format!("{}.{}.{}", PACKAGE_DATA_FILE_PREFIX, description, idx)
    }

    /// Parse a versioned meta file name into (description, version id).
    pub fn recognize(file_name: &str) -> Option<(String, u32)> {
        let rest = file_name.strip_prefix(PACKAGE_META_FILE_NAME)?;
        let rest = rest.strip_prefix('.')?;
        let (description, version) = rest.rsplit_once('.')?;
        if description.is_empty() {
            return None;
        }
        let version_id = version.parse::<u32>().ok()?;
        Some((description.to_string(), version_id))
    }

    /// Parse a versioned data file name into (description, data file index).
    pub fn recognize_data(file_name: &str) -> Option<(String, u32)> {
        let rest = file_name.strip_prefix(PACKAGE_DATA_FILE_PREFIX)?;
        let rest = rest.strip_prefix('.')?;
        let (description, idx) = rest.rsplit_once('.')?;
        if description.is_empty() {
            return None;
        }
        let idx = idx.parse::<u32>().ok()?;
        Some((description.to_string(), idx))
    }

    /// Atomically store under the versioned name inside `dir`.
    pub fn store(&self, fs: &dyn FsPrimitives, dir: &str, description: &str) -> FsResult<()> {
        let path = indexfs_core::path::join(
            dir,
            &Self::meta_file_name(description, self.version_id),
        );
        self.meta.store(fs, &path)
    }

    /// Recover the meta for `description` from `dir`.
    ///
    /// With `requested` set, only that exact version is accepted; otherwise
    /// the highest version id present wins. Returns `Ok(None)` when no
    /// versioned meta for the description exists.
    pub fn recover(
        fs: &dyn FsPrimitives,
        dir: &str,
        description: &str,
        requested: Option<u32>,
    ) -> FsResult<Option<VersionedPackageFileMeta>> {
        let mut best: Option<u32> = None;
        for name in fs.list_dir(dir)? {
            if let Some((desc, version)) = Self::recognize(&name) {
                if desc != description {
                    continue;
                }
                match requested {
                    Some(want) if version == want => {
                        best = Some(version);
                        break;
                    }
                    Some(_) => {}
                    None => {
                        if best.map_or(true, |b| version > b) {
                            best = Some(version);
                        }
                    }
                }
            }
        }
        let Some(version_id) = best else {
            return Ok(None);
        };
        let path =
            indexfs_core::path::join(dir, &Self::meta_file_name(description, version_id));
        let meta = PackageFileMeta::load(fs, &path)?;
        info!(
            target: "indexfs::package",
            dir, description, version_id, "recovered versioned package meta"
        );
        Ok(Some(VersionedPackageFileMeta { meta, version_id }))
    }

    /// Delete versioned data files for `description` whose meta never
    /// became visible (index not referenced by `self.meta`). Used after
    /// recovery to drop leftovers of an incomplete attempt.
    pub fn clean_stale_data_files(
        &self,
        fs: &dyn FsPrimitives,
        dir: &str,
        description: &str,
    ) -> FsResult<()> {
        let referenced: Vec<String> = self.meta.physical_file_names.clone();
        for name in fs.list_dir(dir)? {
            if let Some((desc, _idx)) = Self::recognize_data(&name) {
                if desc == description && !referenced.iter().any(|r| r == &name) {
                    info!(target: "indexfs::package", file = %name, "removing stale package data file");
                    fs.delete_file(&indexfs_core::path::join(dir, &name))?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::InnerFileMeta;
    use indexfs_core::LocalFs;
    use tempfile::tempdir;

    fn meta_with(description: &str, n: u32) -> PackageFileMeta {
        let mut meta = PackageFileMeta::new(4096);
        let idx = meta.add_physical_file(
            &VersionedPackageFileMeta::data_file_name(description, 0),
            "",
        );
        meta.add_inner_file(InnerFileMeta::new_file(&format!("f{}", n), 0, 8, idx));
        meta.update_physical_lengths();
        meta
    }

    #[test]
    fn test_file_names() {
        assert_eq!(
            VersionedPackageFileMeta::meta_file_name("merge", 3),
            "package_file.__meta__.merge.3"
        );
        assert_eq!(
            VersionedPackageFileMeta::data_file_name("merge", 0),
            "package_file.__data__.merge.0"
        );
    }

    #[test]
    fn test_recognize() {
        assert_eq!(
            VersionedPackageFileMeta::recognize("package_file.__meta__.merge.7"),
            Some(("merge".to_string(), 7))
        );
        assert_eq!(
            VersionedPackageFileMeta::recognize("package_file.__meta__"),
            None
        );
        assert_eq!(
            VersionedPackageFileMeta::recognize("package_file.__meta__.merge.x"),
            None
        );
        assert_eq!(
            VersionedPackageFileMeta::recognize_data("package_file.__data__.merge.2"),
            Some(("merge".to_string(), 2))
        );
        // final data files carry no description
        assert_eq!(
            VersionedPackageFileMeta::recognize_data("package_file.__data__0"),
            None
        );
    }

    #[test]
    fn test_recover_highest_version() {
        let dir = tempdir().unwrap();
        let fs = LocalFs::new();
        let dir_str = dir.path().to_string_lossy().to_string();

        for v in [1u32, 3, 2] {
            VersionedPackageFileMeta::new(meta_with("build", v), v)
                .store(&fs, &dir_str, "build")
                .unwrap();
        }

        let recovered = VersionedPackageFileMeta::recover(&fs, &dir_str, "build", None)
            .unwrap()
            .unwrap();
        assert_eq!(recovered.version_id, 3);
    }

    #[test]
    fn test_recover_requested_version() {
        let dir = tempdir().unwrap();
        let fs = LocalFs::new();
        let dir_str = dir.path().to_string_lossy().to_string();

        for v in [1u32, 2] {
            VersionedPackageFileMeta::new(meta_with("build", v), v)
                .store(&fs, &dir_str, "build")
                .unwrap();
        }

        let recovered = VersionedPackageFileMeta::recover(&fs, &dir_str, "build", Some(1))
            .unwrap()
            .unwrap();
        assert_eq!(recovered.version_id, 1);

        // requesting an absent version finds nothing
        let missing =
            VersionedPackageFileMeta::recover(&fs, &dir_str, "build", Some(9)).unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_recover_ignores_other_descriptions() {
        let dir = tempdir().unwrap();
        let fs = LocalFs::new();
        let dir_str = dir.path().to_string_lossy().to_string();

        VersionedPackageFileMeta::new(meta_with("merge", 5), 5)
            .store(&fs, &dir_str, "merge")
            .unwrap();

        let none = VersionedPackageFileMeta::recover(&fs, &dir_str, "build", None).unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn test_clean_stale_data_files() {
        let dir = tempdir().unwrap();
        let fs = LocalFs::new();
        let dir_str = dir.path().to_string_lossy().to_string();

        // referenced data file 0, stale data file 1
        let data0 = dir.path().join("package_file.__data__.build.0");
        let data1 = dir.path().join("package_file.__data__.build.1");
        std::fs::write(&data0, b"dddddddd").unwrap();
        std::fs::write(&data1, b"leftover").unwrap();

        let versioned = VersionedPackageFileMeta::new(meta_with("build", 1), 1);
        versioned
            .clean_stale_data_files(&fs, &dir_str, "build")
            .unwrap();

        assert!(data0.exists());
        assert!(!data1.exists());
    }
}
