// storage/mod.rs
// Pluggable storage backend and the crash-safe file operations built on it

use std::ffi::OsString;
use std::io::{BufRead, Read};
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::Result;

mod fs;

pub use self::fs::FileStorage;

/// `<path>~`, the temporary file used while rewriting `path`
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_os_string();
    name.push("~");
    PathBuf::from(name)
}

/// Directory holding `path` ("." for a bare file name)
pub fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// File-system-like capability the datastore persists through.
///
/// Only atomic `rename` and `flush` are assumed for crash safety.
pub trait Storage: Send + Sync {
    fn exists(&self, path: &Path) -> Result<bool>;

    /// Stream the file for line-by-line reading
    fn read_lines(&self, path: &Path) -> Result<Box<dyn BufRead + Send>>;

    /// Create or truncate `path` with exactly `data`
    fn write_all(&self, path: &Path, data: &[u8]) -> Result<()>;

    /// Append `data`, creating the file if needed
    fn append(&self, path: &Path, data: &[u8]) -> Result<()>;

    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    fn unlink(&self, path: &Path) -> Result<()>;

    fn mkdir_recursive(&self, path: &Path) -> Result<()>;

    /// Push the file (or directory entry) to durable storage
    fn flush(&self, path: &Path, is_dir: bool) -> Result<()>;

    fn read_to_string(&self, path: &Path) -> Result<String> {
        let mut contents = String::new();
        self.read_lines(path)?.read_to_string(&mut contents)?;
        Ok(contents)
    }

    /// Replace `path` with `lines` so that a crash at any point leaves either
    /// the old file or the new one readable:
    /// flush dir, flush old file, write `path~`, flush it, rename, flush dir.
    fn crash_safe_write_lines(&self, path: &Path, lines: &[String]) -> Result<()> {
        let dir = parent_dir(path);
        let temp = temp_path(path);

        self.flush(&dir, true)?;
        if self.exists(path)? {
            self.flush(path, false)?;
        }

        let mut data = String::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
        for line in lines {
            data.push_str(line);
            data.push('\n');
        }
        self.write_all(&temp, data.as_bytes())?;
        self.flush(&temp, false)?;

        self.rename(&temp, path)?;
        self.flush(&dir, true)?;

        debug!("rewrote {} with {} line(s)", path.display(), lines.len());
        Ok(())
    }

    /// Make sure a datafile exists: an interrupted rewrite may have left only
    /// `path~`, which is then promoted; otherwise an empty file is created.
    fn ensure_datafile_integrity(&self, path: &Path) -> Result<()> {
        if self.exists(path)? {
            return Ok(());
        }

        let temp = temp_path(path);
        if self.exists(&temp)? {
            debug!("promoting {} left by an interrupted rewrite", temp.display());
            self.rename(&temp, path)
        } else {
            self.write_all(path, b"")
        }
    }

    fn ensure_parent_dir(&self, path: &Path) -> Result<()> {
        self.mkdir_recursive(&parent_dir(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_temp_and_parent_paths() {
        assert_eq!(temp_path(Path::new("dir/data.db")), PathBuf::from("dir/data.db~"));
        assert_eq!(parent_dir(Path::new("dir/data.db")), PathBuf::from("dir"));
        assert_eq!(parent_dir(Path::new("data.db")), PathBuf::from("."));
    }

    #[test]
    fn test_crash_safe_write_replaces_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.db");
        let storage = FileStorage::default();

        storage.write_all(&path, b"old\n").unwrap();
        storage
            .crash_safe_write_lines(&path, &["a".to_string(), "b".to_string()])
            .unwrap();

        assert_eq!(storage.read_to_string(&path).unwrap(), "a\nb\n");
        assert!(!storage.exists(&temp_path(&path)).unwrap());
    }

    #[test]
    fn test_ensure_datafile_integrity() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.db");
        let storage = FileStorage::default();

        // nothing there: empty file created
        storage.ensure_datafile_integrity(&path).unwrap();
        assert_eq!(storage.read_to_string(&path).unwrap(), "");

        // only the temp file: promoted
        storage.unlink(&path).unwrap();
        storage.write_all(&temp_path(&path), b"{\"_id\":\"1\"}\n").unwrap();
        storage.ensure_datafile_integrity(&path).unwrap();
        assert_eq!(storage.read_to_string(&path).unwrap(), "{\"_id\":\"1\"}\n");
        assert!(!storage.exists(&temp_path(&path)).unwrap());

        // both present: canonical file wins
        storage.write_all(&temp_path(&path), b"stale\n").unwrap();
        storage.ensure_datafile_integrity(&path).unwrap();
        assert_eq!(storage.read_to_string(&path).unwrap(), "{\"_id\":\"1\"}\n");
    }

    #[test]
    fn test_ensure_parent_dir() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a/b/c/data.db");
        let storage = FileStorage::default();

        storage.ensure_parent_dir(&path).unwrap();
        assert!(dir.path().join("a/b/c").is_dir());
    }
}
