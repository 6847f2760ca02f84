//! Individual flush operations
//!
//! An operation captures everything needed to realize one durable effect
//! on the physical filesystem: a directory creation, one whole file, or a
//! packaged directory. Operations are retried on transient errors; races
//! and caller mistakes (`AlreadyExists`, `BadArgs`) fail immediately.

use crate::node::FileNode;
use indexfs_core::{path, FsError, FsPrimitives, FsResult, TMP_SUFFIX};
use indexfs_package::{PackageFileMeta, PACKAGE_META_FILE_NAME};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry behavior for transient flush failures
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Additional attempts after the first failure
    pub max_retries: u32,
    /// Sleep between attempts
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            interval: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries (inline flushes, tests).
    pub fn none() -> Self {
        RetryPolicy {
            max_retries: 0,
            interval: Duration::ZERO,
        }
    }
}

/// One inner file scheduled into a package data file
pub struct PackagedNode {
    /// Source of the bytes
    pub node: Arc<FileNode>,
    /// Which physical data file receives them
    pub data_file_idx: u32,
    /// Aligned offset inside that data file
    pub offset: u64,
}

/// A single durable effect awaiting execution
pub enum FlushOperation {
    /// Create a physical directory (with parents)
    Mkdir {
        /// Target filesystem
        fs: Arc<dyn FsPrimitives>,
        /// Physical directory path
        physical_path: String,
        /// Logical path to freeze on success
        logical_path: String,
    },
    /// Persist one whole file
    Single {
        /// Target filesystem
        fs: Arc<dyn FsPrimitives>,
        /// Source node; read at execution time unless a snapshot is set
        node: Arc<FileNode>,
        /// Physical destination path
        physical_path: String,
        /// Write-fsync-rename, refusing existing destinations; direct
        /// mode overwrites in place
        atomic: bool,
        /// Content captured at enqueue time (copy-on-dump)
        snapshot: Option<Vec<u8>>,
    },
    /// Persist a packaged directory: data files first, meta last
    Package {
        /// Target filesystem
        fs: Arc<dyn FsPrimitives>,
        /// Physical directory receiving the package
        physical_dir: String,
        /// Finished package description
        meta: PackageFileMeta,
        /// Inner files ordered by (data_file_idx, offset)
        files: Vec<PackagedNode>,
        /// Logical paths to freeze on success (inner files + directories)
        logical_paths: Vec<String>,
    },
}

impl FlushOperation {
    /// Whether this is a directory creation. Directory operations run
    /// before file operations in a queue dump.
    pub fn is_mkdir(&self) -> bool {
        matches!(self, FlushOperation::Mkdir { .. })
    }

    /// Logical paths made durable when this operation succeeds. A
    /// copy-on-dump single flushes a snapshot while the source keeps
    /// growing, so it freezes nothing.
    pub fn logical_paths(&self) -> Vec<String> {
        match self {
            FlushOperation::Mkdir { logical_path, .. } => vec![logical_path.clone()],
            FlushOperation::Single {
                snapshot: Some(_), ..
            } => Vec::new(),
            FlushOperation::Single { node, .. } => vec![node.logical_path().to_string()],
            FlushOperation::Package { logical_paths, .. } => logical_paths.clone(),
        }
    }

    /// Nodes whose dirty flags clear when this operation succeeds.
    pub fn nodes(&self) -> Vec<Arc<FileNode>> {
        match self {
            FlushOperation::Mkdir { .. } => Vec::new(),
            FlushOperation::Single {
                snapshot: Some(_), ..
            } => Vec::new(),
            FlushOperation::Single { node, .. } => vec![Arc::clone(node)],
            FlushOperation::Package { files, .. } => {
                files.iter().map(|f| Arc::clone(&f.node)).collect()
            }
        }
    }

    /// Run the operation once.
    pub fn execute(&self) -> FsResult<()> {
        match self {
            FlushOperation::Mkdir {
                fs, physical_path, ..
            } => fs.mkdir(physical_path, true),
            FlushOperation::Single {
                fs,
                node,
                physical_path,
                atomic,
                snapshot,
            } => {
                let bytes = match snapshot {
                    Some(bytes) => bytes.clone(),
                    None => node.read_all()?,
                };
                if *atomic {
                    // atomic mode never claims a destination someone else
                    // already owns; direct mode writes through
                    if fs.is_exist(physical_path)? {
                        return Err(FsError::AlreadyExists(physical_path.clone()));
                    }
                    fs.atomic_store(physical_path, &bytes)
                } else {
                    fs.write_file(physical_path, &bytes)
                }
            }
            FlushOperation::Package {
                fs,
                physical_dir,
                meta,
                files,
                ..
            } => Self::execute_package(fs.as_ref(), physical_dir, meta, files),
        }
    }

    /// Run with retries. Races and bad arguments are never retried; on
    /// final failure any partially written physical file is removed.
    pub fn execute_with_retry(&self, policy: RetryPolicy) -> FsResult<()> {
        let mut attempt = 0;
        loop {
            match self.execute() {
                Ok(()) => return Ok(()),
                // the destination belongs to someone else on a race, so
                // nothing of ours is cleaned up
                Err(err) if err.is_race() || matches!(err, FsError::BadArgs(_)) => {
                    return Err(err);
                }
                Err(err) if attempt < policy.max_retries => {
                    attempt += 1;
                    warn!(
                        target: "indexfs::flush",
                        attempt,
                        error = %err,
                        "flush operation failed, retrying"
                    );
                    std::thread::sleep(policy.interval);
                }
                Err(err) => {
                    self.clean_partial_output();
                    return Err(err);
                }
            }
        }
    }

    // Data files are streamed through a `.__tmp__` name and renamed into
    // place; the meta file goes last so a crash leaves either no package
    // or a complete one.
    fn execute_package(
        fs: &dyn FsPrimitives,
        physical_dir: &str,
        meta: &PackageFileMeta,
        files: &[PackagedNode],
    ) -> FsResult<()> {
        let meta_path = path::join(physical_dir, PACKAGE_META_FILE_NAME);
        if fs.is_exist(&meta_path)? {
            return Err(FsError::AlreadyExists(meta_path));
        }
        fs.mkdir(physical_dir, true)?;

        for (idx, name) in meta.physical_file_names.iter().enumerate() {
            let final_path = path::join(physical_dir, name);
            let tmp_path = format!("{final_path}{TMP_SUFFIX}");
            let mut writer = fs.create_write(&tmp_path)?;
            let mut written = 0u64;
            for packed in files.iter().filter(|f| f.data_file_idx == idx as u32) {
                if packed.offset > written {
                    write_zeros(writer.as_mut(), packed.offset - written)?;
                    written = packed.offset;
                }
                let bytes = packed.node.read_all()?;
                writer.write_all(&bytes).map_err(FsError::Io)?;
                written += bytes.len() as u64;
            }
            let expected = meta.physical_file_lengths[idx];
            if expected > written {
                write_zeros(writer.as_mut(), expected - written)?;
            }
            writer.flush().map_err(FsError::Io)?;
            drop(writer);
            fs.rename(&tmp_path, &final_path)?;
            debug!(
                target: "indexfs::flush",
                path = %final_path,
                length = expected,
                "package data file written"
            );
        }

        meta.store(fs, &meta_path)
    }

    fn clean_partial_output(&self) {
        match self {
            FlushOperation::Mkdir { .. } => {}
            FlushOperation::Single {
                fs, physical_path, ..
            } => {
                // atomic_store cleans its own temp; a plain write may leave
                // a truncated file behind
                if let Ok(true) = fs.is_exist(physical_path) {
                    let _ = fs.delete_file(physical_path);
                }
            }
            FlushOperation::Package {
                fs,
                physical_dir,
                meta,
                ..
            } => {
                for name in &meta.physical_file_names {
                    let tmp = format!("{}{TMP_SUFFIX}", path::join(physical_dir, name));
                    if let Ok(true) = fs.is_exist(&tmp) {
                        let _ = fs.delete_file(&tmp);
                    }
                }
            }
        }
    }
}

fn write_zeros(writer: &mut dyn Write, mut count: u64) -> FsResult<()> {
    let zeros = [0u8; 4096];
    while count > 0 {
        let take = count.min(zeros.len() as u64) as usize;
        writer.write_all(&zeros[..take]).map_err(FsError::Io)?;
        count -= take as u64;
    }
    Ok(())
}

impl std::fmt::Debug for FlushOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlushOperation::Mkdir { physical_path, .. } => {
                f.debug_struct("Mkdir").field("path", physical_path).finish()
            }
            FlushOperation::Single {
                physical_path,
                atomic,
                ..
            } => f
                .debug_struct("Single")
                .field("path", physical_path)
                .field("atomic", atomic)
                .finish(),
            FlushOperation::Package {
                physical_dir,
                files,
                ..
            } => f
                .debug_struct("Package")
                .field("dir", physical_dir)
                .field("files", &files.len())
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricGroup;
    use indexfs_core::LocalFs;
    use indexfs_package::InnerFileMeta;
    use tempfile::tempdir;

    fn mem_node(path: &str, data: &[u8]) -> Arc<FileNode> {
        Arc::new(FileNode::new_mem(
            path,
            path,
            data.to_vec(),
            true,
            MetricGroup::Mem,
        ))
    }

    #[test]
    fn test_single_writes_and_refuses_overwrite() {
        let dir = tempdir().unwrap();
        let fs: Arc<dyn FsPrimitives> = Arc::new(LocalFs::new());
        let target = dir.path().join("f").to_string_lossy().to_string();

        let op = FlushOperation::Single {
            fs: Arc::clone(&fs),
            node: mem_node("/f", b"payload"),
            physical_path: target.clone(),
            atomic: true,
            snapshot: None,
        };
        op.execute().unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"payload");

        assert!(matches!(
            op.execute().unwrap_err(),
            FsError::AlreadyExists(_)
        ));
    }

    #[test]
    fn test_single_direct_mode_overwrites() {
        let dir = tempdir().unwrap();
        let fs: Arc<dyn FsPrimitives> = Arc::new(LocalFs::new());
        let target = dir.path().join("f").to_string_lossy().to_string();
        std::fs::write(&target, b"old").unwrap();

        let op = FlushOperation::Single {
            fs,
            node: mem_node("/f", b"new"),
            physical_path: target.clone(),
            atomic: false,
            snapshot: None,
        };
        op.execute().unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"new");
    }

    #[test]
    fn test_single_snapshot_ignores_later_appends() {
        let dir = tempdir().unwrap();
        let fs: Arc<dyn FsPrimitives> = Arc::new(LocalFs::new());
        let target = dir.path().join("f").to_string_lossy().to_string();

        let node = mem_node("/f", b"at enqueue");
        let op = FlushOperation::Single {
            fs,
            node: Arc::clone(&node),
            physical_path: target.clone(),
            atomic: false,
            snapshot: Some(node.read_all().unwrap()),
        };
        node.append(b" + later").unwrap();
        op.execute().unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"at enqueue");
    }

    #[test]
    fn test_package_pads_to_aligned_offsets() {
        let dir = tempdir().unwrap();
        let fs: Arc<dyn FsPrimitives> = Arc::new(LocalFs::new());
        let physical_dir = dir.path().join("unit").to_string_lossy().to_string();

        let mut meta = PackageFileMeta::new(16);
        let idx = meta.add_physical_file(&PackageFileMeta::data_file_name(0), "");
        meta.add_inner_file(InnerFileMeta::new_file("a", 0, 5, idx));
        meta.add_inner_file(InnerFileMeta::new_file("b", 16, 3, idx));
        meta.sort();
        meta.update_physical_lengths();

        let op = FlushOperation::Package {
            fs: Arc::clone(&fs),
            physical_dir: physical_dir.clone(),
            meta: meta.clone(),
            files: vec![
                PackagedNode {
                    node: mem_node("/unit/a", b"aaaaa"),
                    data_file_idx: idx,
                    offset: 0,
                },
                PackagedNode {
                    node: mem_node("/unit/b", b"bbb"),
                    data_file_idx: idx,
                    offset: 16,
                },
            ],
            logical_paths: vec!["/unit/a".into(), "/unit/b".into()],
        };
        op.execute().unwrap();

        let data_path = path::join(&physical_dir, &PackageFileMeta::data_file_name(0));
        let bytes = std::fs::read(&data_path).unwrap();
        assert_eq!(bytes.len(), 19);
        assert_eq!(&bytes[..5], b"aaaaa");
        assert!(bytes[5..16].iter().all(|&b| b == 0));
        assert_eq!(&bytes[16..], b"bbb");

        let loaded =
            PackageFileMeta::load(fs.as_ref(), &path::join(&physical_dir, PACKAGE_META_FILE_NAME))
                .unwrap();
        assert_eq!(loaded, meta);

        // second flush of the same package fast-fails
        assert!(matches!(
            op.execute().unwrap_err(),
            FsError::AlreadyExists(_)
        ));
    }

    #[test]
    fn test_retry_does_not_mask_races() {
        let dir = tempdir().unwrap();
        let fs: Arc<dyn FsPrimitives> = Arc::new(LocalFs::new());
        let target = dir.path().join("f").to_string_lossy().to_string();
        std::fs::write(&target, b"existing").unwrap();

        let op = FlushOperation::Single {
            fs,
            node: mem_node("/f", b"new"),
            physical_path: target.clone(),
            atomic: true,
            snapshot: None,
        };
        let started = std::time::Instant::now();
        assert!(op.execute_with_retry(RetryPolicy::default()).is_err());
        // no retry sleeps for a race error
        assert!(started.elapsed() < Duration::from_millis(90));
    }
}
