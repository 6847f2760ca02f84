//! Primitive byte-level filesystem interface
//!
//! The storage core never touches `std::fs` directly; it goes through
//! `FsPrimitives` so the distributed-file-system plumbing stays an external
//! collaborator. `LocalFs` is the local-disk implementation used by tests
//! and single-node deployments.
//!
//! `atomic_store` follows the write-fsync-rename pattern: bytes land in
//! `<path>.__tmp__` first and are renamed into place only after a successful
//! sync, so a crash never leaves a destination that looks complete.

use crate::error::{FsError, FsResult};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Staging suffix used by atomic dumps
pub const TMP_SUFFIX: &str = ".__tmp__";

/// Narrow byte-level filesystem trait
///
/// Every method returns an explicit `FsResult`, never panics. Operations
/// marked atomic are assumed atomic on the backing medium (POSIX rename).
pub trait FsPrimitives: Send + Sync {
    /// Read a whole file.
    fn read_file(&self, path: &str) -> FsResult<Vec<u8>>;

    /// Read `len` bytes starting at `offset`. Reading past end-of-file is
    /// `BadArgs`.
    fn read_range(&self, path: &str, offset: u64, len: usize) -> FsResult<Vec<u8>>;

    /// Create or truncate a file with the given contents.
    fn write_file(&self, path: &str, data: &[u8]) -> FsResult<()>;

    /// Open a streaming writer (create or truncate).
    fn create_write(&self, path: &str) -> FsResult<Box<dyn Write + Send>>;

    /// Write-fsync-rename: bytes become visible at `path` all at once.
    fn atomic_store(&self, path: &str, data: &[u8]) -> FsResult<()>;

    /// Counterpart of `atomic_store`.
    fn atomic_load(&self, path: &str) -> FsResult<Vec<u8>>;

    /// Rename a file or directory. Atomic on the backing medium.
    fn rename(&self, from: &str, to: &str) -> FsResult<()>;

    /// Delete a file. `NotFound` if absent.
    fn delete_file(&self, path: &str) -> FsResult<()>;

    /// Delete a directory and everything below it. `NotFound` if absent.
    fn delete_dir(&self, path: &str) -> FsResult<()>;

    /// List the names (not paths) of a directory's entries.
    fn list_dir(&self, path: &str) -> FsResult<Vec<String>>;

    /// Create a directory. With `recursive`, create missing parents and
    /// tolerate a pre-existing directory.
    fn mkdir(&self, path: &str, recursive: bool) -> FsResult<()>;

    /// Whether a file or directory exists.
    fn is_exist(&self, path: &str) -> FsResult<bool>;

    /// Whether the path exists and is a directory.
    fn is_dir(&self, path: &str) -> FsResult<bool>;

    /// Length of a file in bytes.
    fn file_length(&self, path: &str) -> FsResult<u64>;
}

/// Local-disk implementation of `FsPrimitives` over `std::fs`
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFs;

impl LocalFs {
    /// Create a new local filesystem handle.
    pub fn new() -> Self {
        LocalFs
    }
}

impl FsPrimitives for LocalFs {
    fn read_file(&self, path: &str) -> FsResult<Vec<u8>> {
        std::fs::read(path).map_err(|e| FsError::from_io(e, path))
    }

    fn read_range(&self, path: &str, offset: u64, len: usize) -> FsResult<Vec<u8>> {
        let mut file = File::open(path).map_err(|e| FsError::from_io(e, path))?;
        let total = file.metadata().map_err(FsError::Io)?.len();
        let end = offset.checked_add(len as u64).ok_or_else(|| {
            FsError::BadArgs(format!("read offset {offset} + {len} overflows"))
        })?;
        if end > total {
            return Err(FsError::BadArgs(format!(
                "read [{}, {}) past end of {} (len {})",
                offset, end, path, total
            )));
        }
        file.seek(SeekFrom::Start(offset)).map_err(FsError::Io)?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).map_err(FsError::Io)?;
        Ok(buf)
    }

    fn write_file(&self, path: &str, data: &[u8]) -> FsResult<()> {
        std::fs::write(path, data).map_err(|e| FsError::from_io(e, path))
    }

    fn create_write(&self, path: &str) -> FsResult<Box<dyn Write + Send>> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|e| FsError::from_io(e, path))?;
        Ok(Box::new(std::io::BufWriter::new(file)))
    }

    fn atomic_store(&self, path: &str, data: &[u8]) -> FsResult<()> {
        let temp_path = format!("{}{}", path, TMP_SUFFIX);

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| FsError::from_io(e, &temp_path))?;
        file.write_all(data).map_err(FsError::Io)?;
        file.sync_all().map_err(FsError::Io)?;
        drop(file);

        std::fs::rename(&temp_path, path).map_err(|e| FsError::from_io(e, path))?;

        // Sync parent directory so the rename itself is durable
        if let Some(parent) = Path::new(path).parent() {
            if parent.exists() {
                let dir = File::open(parent).map_err(FsError::Io)?;
                dir.sync_all().map_err(FsError::Io)?;
            }
        }
        Ok(())
    }

    fn atomic_load(&self, path: &str) -> FsResult<Vec<u8>> {
        self.read_file(path)
    }

    fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        std::fs::rename(from, to).map_err(|e| FsError::from_io(e, from))
    }

    fn delete_file(&self, path: &str) -> FsResult<()> {
        std::fs::remove_file(path).map_err(|e| FsError::from_io(e, path))
    }

    fn delete_dir(&self, path: &str) -> FsResult<()> {
        std::fs::remove_dir_all(path).map_err(|e| FsError::from_io(e, path))
    }

    fn list_dir(&self, path: &str) -> FsResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(path).map_err(|e| FsError::from_io(e, path))? {
            let entry = entry.map_err(FsError::Io)?;
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(names)
    }

    fn mkdir(&self, path: &str, recursive: bool) -> FsResult<()> {
        let result = if recursive {
            std::fs::create_dir_all(path)
        } else {
            std::fs::create_dir(path)
        };
        result.map_err(|e| FsError::from_io(e, path))
    }

    fn is_exist(&self, path: &str) -> FsResult<bool> {
        Ok(Path::new(path).exists())
    }

    fn is_dir(&self, path: &str) -> FsResult<bool> {
        Ok(Path::new(path).is_dir())
    }

    fn file_length(&self, path: &str) -> FsResult<u64> {
        let meta = std::fs::metadata(path).map_err(|e| FsError::from_io(e, path))?;
        Ok(meta.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn p(dir: &tempfile::TempDir, name: &str) -> String {
        dir.path().join(name).to_string_lossy().to_string()
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let fs = LocalFs::new();
        let path = p(&dir, "data.bin");

        fs.write_file(&path, b"hello indexfs").unwrap();
        assert_eq!(fs.read_file(&path).unwrap(), b"hello indexfs");
        assert_eq!(fs.file_length(&path).unwrap(), 13);
    }

    #[test]
    fn test_read_range() {
        let dir = tempdir().unwrap();
        let fs = LocalFs::new();
        let path = p(&dir, "data.bin");
        fs.write_file(&path, b"0123456789").unwrap();

        assert_eq!(fs.read_range(&path, 2, 4).unwrap(), b"2345");
        assert_eq!(fs.read_range(&path, 0, 10).unwrap(), b"0123456789");
    }

    #[test]
    fn test_read_range_past_eof() {
        let dir = tempdir().unwrap();
        let fs = LocalFs::new();
        let path = p(&dir, "data.bin");
        fs.write_file(&path, b"0123").unwrap();

        let err = fs.read_range(&path, 2, 4).unwrap_err();
        assert!(matches!(err, FsError::BadArgs(_)));
    }

    #[test]
    fn test_read_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let fs = LocalFs::new();
        let err = fs.read_file(&p(&dir, "gone")).unwrap_err();
        assert!(matches!(err, FsError::NotFound(_)));
    }

    #[test]
    fn test_atomic_store_leaves_no_tmp() {
        let dir = tempdir().unwrap();
        let fs = LocalFs::new();
        let path = p(&dir, "meta.json");

        fs.atomic_store(&path, b"{}").unwrap();
        assert_eq!(fs.atomic_load(&path).unwrap(), b"{}");
        assert!(!fs
            .is_exist(&format!("{}{}", path, TMP_SUFFIX))
            .unwrap());
    }

    #[test]
    fn test_mkdir_recursive_tolerates_existing() {
        let dir = tempdir().unwrap();
        let fs = LocalFs::new();
        let path = p(&dir, "a/b/c");

        fs.mkdir(&path, true).unwrap();
        fs.mkdir(&path, true).unwrap();
        assert!(fs.is_dir(&path).unwrap());
    }

    #[test]
    fn test_mkdir_non_recursive_fails_on_existing() {
        let dir = tempdir().unwrap();
        let fs = LocalFs::new();
        let path = p(&dir, "solo");

        fs.mkdir(&path, false).unwrap();
        let err = fs.mkdir(&path, false).unwrap_err();
        assert!(matches!(err, FsError::AlreadyExists(_)));
    }

    #[test]
    fn test_list_dir_sorted() {
        let dir = tempdir().unwrap();
        let fs = LocalFs::new();
        fs.write_file(&p(&dir, "b.txt"), b"").unwrap();
        fs.write_file(&p(&dir, "a.txt"), b"").unwrap();

        let names = fs.list_dir(&dir.path().to_string_lossy()).unwrap();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn test_rename_and_delete() {
        let dir = tempdir().unwrap();
        let fs = LocalFs::new();
        let from = p(&dir, "from");
        let to = p(&dir, "to");

        fs.write_file(&from, b"x").unwrap();
        fs.rename(&from, &to).unwrap();
        assert!(!fs.is_exist(&from).unwrap());
        assert!(fs.is_exist(&to).unwrap());

        fs.delete_file(&to).unwrap();
        assert!(!fs.is_exist(&to).unwrap());
        assert!(matches!(
            fs.delete_file(&to).unwrap_err(),
            FsError::NotFound(_)
        ));
    }
}
