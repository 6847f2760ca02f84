//! Offline package consolidation
//!
//! `DirectoryMerger` folds every versioned package meta in a directory into
//! one final `package_file.__meta__`, renumbering the physical data files
//! contiguously from 0 and renaming them to their final names. Source
//! versioned metas are deleted once the final document is durably in place,
//! so a crash mid-merge leaves either the versioned inputs or the finished
//! package, never neither.

use crate::meta::{InnerFileMeta, PackageFileMeta, PACKAGE_META_FILE_NAME};
use crate::versioned::VersionedPackageFileMeta;
use indexfs_core::{path as fspath, FsError, FsPrimitives, FsResult};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Consolidates versioned package metas inside one directory
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectoryMerger;

impl DirectoryMerger {
    /// Create a merger.
    pub fn new() -> Self {
        DirectoryMerger
    }

    /// Merge every versioned meta in `dir` into the final package meta.
    ///
    /// Returns `Ok(None)` when the directory holds no versioned metas.
    /// Fails with `AlreadyExists` if the final meta is already present, and
    /// with `Inconsistent` on align-size mismatch or a path that appears
    /// both as a file and as a directory.
    pub fn merge_package_files(
        &self,
        fs: &dyn FsPrimitives,
        dir: &str,
    ) -> FsResult<Option<PackageFileMeta>> {
        let final_meta_path = fspath::join(dir, PACKAGE_META_FILE_NAME);
        if fs.is_exist(&final_meta_path)? {
            return Err(FsError::AlreadyExists(final_meta_path));
        }

        // Deterministic input order: (description, version id)
        let mut sources: Vec<(String, String, u32)> = Vec::new();
        for name in fs.list_dir(dir)? {
            if let Some((description, version_id)) = VersionedPackageFileMeta::recognize(&name) {
                sources.push((name, description, version_id));
            }
        }
        if sources.is_empty() {
            return Ok(None);
        }
        sources.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)));

        let mut loaded = Vec::with_capacity(sources.len());
        for (name, _, _) in &sources {
            loaded.push(PackageFileMeta::load(fs, &fspath::join(dir, name))?);
        }

        let align = loaded[0].file_align_size;
        if loaded.iter().any(|m| m.file_align_size != align) {
            return Err(FsError::Inconsistent(format!(
                "file_align_size differs across versioned metas in {}",
                dir
            )));
        }

        let mut merged = PackageFileMeta::new(align);
        // path → position in merged.inner_files, for the duplicate rule
        let mut seen: BTreeMap<String, bool> = BTreeMap::new();

        for source in &loaded {
            // Renumber this source's data files contiguously into the output
            let mut idx_map = Vec::with_capacity(source.physical_file_names.len());
            for (old_idx, old_name) in source.physical_file_names.iter().enumerate() {
                let tag = &source.physical_file_tags[old_idx];
                let new_idx = merged.add_physical_file("", tag);
                let new_name = PackageFileMeta::data_file_name(new_idx);
                fs.rename(&fspath::join(dir, old_name), &fspath::join(dir, &new_name))?;
                merged.physical_file_names[new_idx as usize] = new_name.clone();
                debug!(
                    target: "indexfs::package",
                    from = %old_name, to = %new_name, "renumbered package data file"
                );
                idx_map.push(new_idx);
            }

            for inner in &source.inner_files {
                match seen.get(&inner.relative_path) {
                    Some(&was_dir) => {
                        // Exact duplicates that agree on directory-ness are
                        // benign; disagreement is a corrupt layout.
                        if was_dir != inner.is_dir {
                            return Err(FsError::Inconsistent(format!(
                                "{} is both a file and a directory across versioned metas",
                                inner.relative_path
                            )));
                        }
                    }
                    None => {
                        seen.insert(inner.relative_path.clone(), inner.is_dir);
                        let entry = if inner.is_dir {
                            InnerFileMeta::new_dir(&inner.relative_path)
                        } else {
                            InnerFileMeta::new_file(
                                &inner.relative_path,
                                inner.offset,
                                inner.length,
                                idx_map[inner.data_file_idx as usize],
                            )
                        };
                        merged.add_inner_file(entry);
                    }
                }
            }
        }

        merged.sort();
        merged.update_physical_lengths();
        merged.validate()?;
        merged.store(fs, &final_meta_path)?;

        for (name, _, _) in &sources {
            fs.delete_file(&fspath::join(dir, name))?;
        }
        info!(
            target: "indexfs::package",
            dir,
            sources = sources.len(),
            inner_files = merged.inner_file_count(),
            "merged versioned package metas"
        );
        Ok(Some(merged))
    }
}
