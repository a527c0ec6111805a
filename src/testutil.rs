//! Shared test doubles: an in-memory filesystem and a recording listener.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::app::AppListener;
use crate::error::Error;
use crate::fingerprint::FileFingerprint;
use crate::fs::{sparse_crc, FileAccess, FileSystem, FsError, FsResult};
use crate::transfer::file::File;
use crate::transfer::Transfer;
use crate::types::Ds;

#[derive(Debug, Clone)]
struct MockFile {
    content: Vec<u8>,
    mtime: i64,
}

/// In-memory filesystem with injectable failure modes.
#[derive(Debug, Default)]
pub struct MockFileSystem {
    files: HashMap<PathBuf, MockFile>,
    /// Paths whose operations fail transiently.
    pub transient_paths: Vec<PathBuf>,
    /// `set_mtime` reports success without changing anything.
    pub silent_mtime_failure: bool,
}

struct MockAccess {
    size: u64,
    mtime: i64,
}

impl FileAccess for MockAccess {
    fn size(&self) -> u64 {
        self.size
    }

    fn mtime(&self) -> i64 {
        self.mtime
    }
}

impl MockFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_file(&mut self, path: &str, content: &[u8], mtime: i64) {
        self.files.insert(
            PathBuf::from(path),
            MockFile {
                content: content.to_vec(),
                mtime,
            },
        );
    }

    pub fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.get(Path::new(path)).map(|f| f.content.clone())
    }

    /// A detached access handle reporting fixed metadata.
    pub fn make_access(&mut self, size: u64, mtime: i64) -> Box<dyn FileAccess> {
        Box::new(MockAccess { size, mtime })
    }

    fn check_transient(&self, path: &Path) -> FsResult<()> {
        if self.transient_paths.iter().any(|p| p == path) {
            Err(FsError::Transient)
        } else {
            Ok(())
        }
    }
}

impl FileSystem for MockFileSystem {
    fn open(&mut self, path: &Path) -> FsResult<Box<dyn FileAccess>> {
        self.check_transient(path)?;
        let f = self.files.get(path).ok_or(FsError::Persistent)?;
        Ok(Box::new(MockAccess {
            size: f.content.len() as u64,
            mtime: f.mtime,
        }))
    }

    fn set_mtime(&mut self, path: &Path, mtime: i64) -> FsResult<()> {
        self.check_transient(path)?;
        if self.silent_mtime_failure {
            return Ok(());
        }
        let f = self.files.get_mut(path).ok_or(FsError::Persistent)?;
        f.mtime = mtime;
        Ok(())
    }

    fn unlink(&mut self, path: &Path) -> FsResult<()> {
        self.check_transient(path)?;
        self.files.remove(path).map(|_| ()).ok_or(FsError::Persistent)
    }

    fn rename(&mut self, from: &Path, to: &Path) -> FsResult<()> {
        self.check_transient(from)?;
        self.check_transient(to)?;
        let f = self.files.remove(from).ok_or(FsError::Persistent)?;
        self.files.insert(to.to_path_buf(), f);
        Ok(())
    }

    fn copy(&mut self, from: &Path, to: &Path) -> FsResult<()> {
        self.check_transient(from)?;
        self.check_transient(to)?;
        let f = self.files.get(from).cloned().ok_or(FsError::Persistent)?;
        self.files.insert(to.to_path_buf(), f);
        Ok(())
    }

    fn exists(&mut self, path: &Path) -> bool {
        self.files.contains_key(path)
    }

    fn fingerprint(&mut self, path: &Path) -> Option<FileFingerprint> {
        let f = self.files.get(path)?;
        Some(FileFingerprint {
            size: f.content.len() as u64,
            mtime: f.mtime,
            crc: sparse_crc(&f.content),
            isvalid: true,
        })
    }
}

/// Listener that records every notification.
#[derive(Debug, Default)]
pub struct RecordingListener {
    pub updates: u32,
    pub failed: Vec<(Error, Ds)>,
    pub transfer_complete: u32,
    pub transfer_removed: u32,
    pub file_complete: Vec<String>,
    pub file_removed: Vec<(String, Error)>,
}

impl AppListener for RecordingListener {
    fn transfer_update(&mut self, _t: &Transfer) {
        self.updates += 1;
    }

    fn transfer_failed(&mut self, _t: &Transfer, e: Error, timeleft: Ds) {
        self.failed.push((e, timeleft));
    }

    fn transfer_complete(&mut self, _t: &Transfer) {
        self.transfer_complete += 1;
    }

    fn transfer_removed(&mut self, _t: &Transfer) {
        self.transfer_removed += 1;
    }

    fn file_complete(&mut self, f: &File) {
        self.file_complete.push(f.name.clone());
    }

    fn file_removed(&mut self, f: &File, e: Error) {
        self.file_removed.push((f.name.clone(), e));
    }
}
