//! Filesystem contracts and a thin standard-library implementation.
//!
//! The engine never touches the disk directly: every open, rename, copy,
//! unlink and mtime update goes through [`FileSystem`], and open files are
//! observed through [`FileAccess`]. Errors carry only what the engine's
//! policies need: whether the condition is worth retrying, and whether a
//! target name exceeded the filesystem's limits.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use filetime::FileTime;
use tracing::debug;

use crate::fingerprint::{FileFingerprint, CRC_WORDS};

/// Outcome classification for filesystem operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// Worth retrying shortly (locks, interruptions, exhaustion of handles).
    Transient,
    /// Will not succeed without outside intervention.
    Persistent,
    /// The target name is too long for the filesystem.
    NameTooLong,
}

pub type FsResult<T> = Result<T, FsError>;

/// Metadata of a file captured when it was opened.
pub trait FileAccess {
    fn size(&self) -> u64;
    fn mtime(&self) -> i64;
}

/// The engine's window onto local storage.
pub trait FileSystem {
    fn open(&mut self, path: &Path) -> FsResult<Box<dyn FileAccess>>;
    fn set_mtime(&mut self, path: &Path, mtime: i64) -> FsResult<()>;
    fn unlink(&mut self, path: &Path) -> FsResult<()>;
    fn rename(&mut self, from: &Path, to: &Path) -> FsResult<()>;
    fn copy(&mut self, from: &Path, to: &Path) -> FsResult<()>;
    fn exists(&mut self, path: &Path) -> bool;
    /// Content fingerprint of the file at `path`, if readable.
    fn fingerprint(&mut self, path: &Path) -> Option<FileFingerprint>;
}

// ── Standard-library implementation ──────────────────────────────────────────

fn classify(e: &io::Error) -> FsError {
    match e.kind() {
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
            FsError::Transient
        }
        _ => {
            // ENAMETOOLONG has no stable ErrorKind mapping
            if e.raw_os_error() == Some(36) {
                FsError::NameTooLong
            } else {
                FsError::Persistent
            }
        }
    }
}

struct StdFileAccess {
    size: u64,
    mtime: i64,
}

impl FileAccess for StdFileAccess {
    fn size(&self) -> u64 {
        self.size
    }

    fn mtime(&self) -> i64 {
        self.mtime
    }
}

/// Local-disk implementation of the [`FileSystem`] contract.
#[derive(Debug, Default)]
pub struct StdFileSystem;

impl FileSystem for StdFileSystem {
    fn open(&mut self, path: &Path) -> FsResult<Box<dyn FileAccess>> {
        let meta = fs::metadata(path).map_err(|e| classify(&e))?;
        Ok(Box::new(StdFileAccess {
            size: meta.len(),
            mtime: FileTime::from_last_modification_time(&meta).unix_seconds(),
        }))
    }

    fn set_mtime(&mut self, path: &Path, mtime: i64) -> FsResult<()> {
        filetime::set_file_mtime(path, FileTime::from_unix_time(mtime, 0))
            .map_err(|e| classify(&e))
    }

    fn unlink(&mut self, path: &Path) -> FsResult<()> {
        fs::remove_file(path).map_err(|e| classify(&e))
    }

    fn rename(&mut self, from: &Path, to: &Path) -> FsResult<()> {
        fs::rename(from, to).map_err(|e| classify(&e))
    }

    fn copy(&mut self, from: &Path, to: &Path) -> FsResult<()> {
        fs::copy(from, to).map(|_| ()).map_err(|e| classify(&e))
    }

    fn exists(&mut self, path: &Path) -> bool {
        path.exists()
    }

    fn fingerprint(&mut self, path: &Path) -> Option<FileFingerprint> {
        let meta = fs::metadata(path).ok()?;
        let size = meta.len();
        let mtime = FileTime::from_last_modification_time(&meta).unix_seconds();
        let content = fs::read(path).ok()?;
        let crc = sparse_crc(&content);
        debug!(
            event = "fingerprint_generated",
            path = %path.display(),
            size,
            "Local fingerprint generated"
        );
        Some(FileFingerprint {
            size,
            mtime,
            crc,
            isvalid: true,
        })
    }
}

/// Sparse content checksum: the file is split into four segments, each
/// folded with FNV-1a. Identity only — never a cryptographic digest.
pub fn sparse_crc(content: &[u8]) -> [u32; CRC_WORDS] {
    let mut crc = [0u32; CRC_WORDS];
    let seg = content.len().div_ceil(CRC_WORDS).max(1);
    for (i, word) in crc.iter_mut().enumerate() {
        let lo = (i * seg).min(content.len());
        let hi = ((i + 1) * seg).min(content.len());
        let mut h: u32 = 0x811c_9dc5;
        for &b in &content[lo..hi] {
            h ^= u32::from(b);
            h = h.wrapping_mul(0x0100_0193);
        }
        *word = h;
    }
    crc
}

/// Convenience wrapper joining name resolution helpers used by the
/// distributor: "name (2).ext" style variants.
pub fn numbered_variant(path: &Path, n: u32, suffix: &str) -> PathBuf {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
    let ext = path.extension().and_then(|s| s.to_str());
    let name = match ext {
        Some(ext) => format!("{stem} {suffix}{n}).{ext}", suffix = suffix),
        None => format!("{stem} {suffix}{n})", suffix = suffix),
    };
    path.with_file_name(name)
}
