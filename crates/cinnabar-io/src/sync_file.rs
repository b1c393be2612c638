//! Synchronous file backend using `std::fs`.
//!
//! This is the default backend. All operations are blocking and go through
//! the OS page cache; durability is only guaranteed after `fsync`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::{IoError, StorageFile};

/// A [`StorageFile`] backed by `std::fs::File`.
#[derive(Debug)]
pub struct SyncFile {
    file: File,
    path: PathBuf,
}

impl SyncFile {
    /// Creates a new empty file. Fails if the file already exists.
    pub fn create(path: &Path) -> Result<Self, IoError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => IoError::AlreadyExists {
                    path: path.to_path_buf(),
                },
                _ => IoError::Io { source: e },
            })?;
        tracing::debug!(path = %path.display(), "created backing file");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Opens an existing file for reading and writing.
    pub fn open(path: &Path) -> Result<Self, IoError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => IoError::NotFound {
                    path: path.to_path_buf(),
                },
                _ => IoError::Io { source: e },
            })?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Returns the path this file was opened with.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageFile for SyncFile {
    fn seek(&mut self, pos: u64) -> Result<(), IoError> {
        self.file.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), IoError> {
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<(), IoError> {
        self.file.write_all(buf)?;
        Ok(())
    }

    fn len(&self) -> Result<u64, IoError> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&mut self, new_len: u64) -> Result<(), IoError> {
        self.file.set_len(new_len)?;
        Ok(())
    }

    fn fsync(&mut self) -> Result<(), IoError> {
        self.file.sync_all()?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), IoError> {
        self.file.flush()?;
        tracing::debug!(path = %self.path.display(), "closed backing file");
        Ok(())
    }
}
