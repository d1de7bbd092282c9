// storage/fs.rs
// std::fs backed storage

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use crate::error::Result;

use super::Storage;

/// Storage on the local file system
#[derive(Debug, Clone, Copy)]
pub struct FileStorage {
    file_mode: u32,
    dir_mode: u32,
}

impl Default for FileStorage {
    fn default() -> Self {
        FileStorage {
            file_mode: 0o644,
            dir_mode: 0o755,
        }
    }
}

impl FileStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Permissions for created files (unix only)
    pub fn with_file_mode(mut self, mode: u32) -> Self {
        self.file_mode = mode;
        self
    }

    /// Permissions for created directories (unix only)
    pub fn with_dir_mode(mut self, mode: u32) -> Self {
        self.dir_mode = mode;
        self
    }

    fn open_options(&self) -> OpenOptions {
        let mut options = OpenOptions::new();
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(self.file_mode);
        }
        options
    }
}

impl Storage for FileStorage {
    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(path.try_exists()?)
    }

    fn read_lines(&self, path: &Path) -> Result<Box<dyn BufRead + Send>> {
        Ok(Box::new(BufReader::new(File::open(path)?)))
    }

    fn write_all(&self, path: &Path, data: &[u8]) -> Result<()> {
        let mut file = self
            .open_options()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(data)?;
        Ok(())
    }

    fn append(&self, path: &Path, data: &[u8]) -> Result<()> {
        let mut file = self.open_options().append(true).create(true).open(path)?;
        file.write_all(data)?;
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to)?;
        Ok(())
    }

    fn unlink(&self, path: &Path) -> Result<()> {
        fs::remove_file(path)?;
        Ok(())
    }

    fn mkdir_recursive(&self, path: &Path) -> Result<()> {
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(self.dir_mode);
        }
        builder.create(path)?;
        Ok(())
    }

    fn flush(&self, path: &Path, is_dir: bool) -> Result<()> {
        // directories can only be synced on unix
        if is_dir && cfg!(not(unix)) {
            return Ok(());
        }
        File::open(path)?.sync_all()?;
        Ok(())
    }
}
