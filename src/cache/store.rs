//! Crash-recovery store for queued transfers.
//!
//! Mutations never hit the disk directly: every public engine mutator opens
//! a [`DbCommitter`], records puts and deletes against it, and commits once
//! on the way out. The commit rewrites the cache file atomically, so the
//! on-disk state always reflects a consistent batch.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Result};
use tracing::{debug, warn};

use crate::cache::codec::{CacheableReader, CacheableWriter};
use crate::utils::atomic_write::atomic_write;

const CACHE_MAGIC: &[u8; 4] = b"STC1";

/// Scoped batch of cache mutations. Dropping an uncommitted committer
/// discards its batch — callers commit on every exit path.
#[derive(Debug, Default)]
pub struct DbCommitter {
    puts: Vec<(u64, Vec<u8>)>,
    dels: Vec<u64>,
}

impl DbCommitter {
    pub fn put(&mut self, dbid: u64, record: Vec<u8>) {
        self.puts.push((dbid, record));
    }

    pub fn del(&mut self, dbid: u64) {
        self.dels.push(dbid);
    }

    pub fn is_empty(&self) -> bool {
        self.puts.is_empty() && self.dels.is_empty()
    }
}

/// Persistent record store, keyed by a monotonically assigned id.
#[derive(Debug)]
pub struct TransferCache {
    /// `None` disables persistence (in-memory engine, tests).
    path: Option<PathBuf>,
    records: BTreeMap<u64, Vec<u8>>,
    next_dbid: u64,
}

impl TransferCache {
    /// In-memory cache; nothing touches the disk.
    pub fn ephemeral() -> Self {
        Self {
            path: None,
            records: BTreeMap::new(),
            next_dbid: 1,
        }
    }

    /// Open (or create) the cache at `path` and load surviving records.
    pub fn open(path: PathBuf) -> Result<Self> {
        let mut cache = Self {
            path: Some(path.clone()),
            records: BTreeMap::new(),
            next_dbid: 1,
        };

        if path.exists() {
            let raw = std::fs::read(&path)?;
            cache.parse(&raw)?;
            debug!(
                event = "transfer_cache_loaded",
                path = %path.display(),
                records = cache.records.len(),
                "Transfer cache loaded"
            );
        }
        Ok(cache)
    }

    fn parse(&mut self, raw: &[u8]) -> Result<()> {
        let mut r = CacheableReader::new(raw);
        let mut magic = [0u8; 4];
        if r.read_exact(&mut magic).is_none() || &magic != CACHE_MAGIC {
            bail!("transfer cache: bad magic");
        }
        let count = match r.read_u32() {
            Some(c) => c,
            None => bail!("transfer cache: truncated header"),
        };
        for _ in 0..count {
            let (dbid, len) = match (r.read_u64(), r.read_u32()) {
                (Some(d), Some(l)) => (d, l as usize),
                _ => bail!("transfer cache: truncated record header"),
            };
            let mut record = vec![0u8; len];
            if r.read_exact(&mut record).is_none() {
                bail!("transfer cache: truncated record body");
            }
            self.next_dbid = self.next_dbid.max(dbid + 1);
            self.records.insert(dbid, record);
        }
        Ok(())
    }

    /// Assign an id for a record that has never been cached.
    pub fn assign_dbid(&mut self) -> u64 {
        let id = self.next_dbid;
        self.next_dbid += 1;
        id
    }

    /// Records surviving from the previous run, in id order.
    pub fn records(&self) -> impl Iterator<Item = (&u64, &Vec<u8>)> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Apply a batch and rewrite the backing file.
    pub fn commit(&mut self, committer: DbCommitter) {
        if committer.is_empty() {
            return;
        }
        for (dbid, record) in committer.puts {
            self.records.insert(dbid, record);
        }
        for dbid in committer.dels {
            self.records.remove(&dbid);
        }
        if let Err(e) = self.flush() {
            warn!(
                event = "transfer_cache_flush_failure",
                error = %e,
                "Failed to persist transfer cache"
            );
        }
    }

    fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut w = CacheableWriter::new();
        w.write_bytes(CACHE_MAGIC);
        w.write_u32(self.records.len() as u32);
        for (dbid, record) in &self.records {
            w.write_u64(*dbid);
            w.write_u32(record.len() as u32);
            w.write_bytes(record);
        }
        atomic_write(path, &w.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transfers.db");

        let mut cache = TransferCache::open(path.clone()).unwrap();
        let a = cache.assign_dbid();
        let b = cache.assign_dbid();

        let mut committer = DbCommitter::default();
        committer.put(a, vec![1, 2, 3]);
        committer.put(b, vec![4, 5]);
        cache.commit(committer);

        let reloaded = TransferCache::open(path).unwrap();
        assert_eq!(reloaded.len(), 2);
        let records: Vec<_> = reloaded.records().map(|(_, r)| r.clone()).collect();
        assert_eq!(records, vec![vec![1, 2, 3], vec![4, 5]]);
    }

    #[test]
    fn test_delete_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transfers.db");

        let mut cache = TransferCache::open(path.clone()).unwrap();
        let a = cache.assign_dbid();
        let mut committer = DbCommitter::default();
        committer.put(a, vec![9]);
        cache.commit(committer);

        let mut committer = DbCommitter::default();
        committer.del(a);
        cache.commit(committer);

        let reloaded = TransferCache::open(path).unwrap();
        assert!(reloaded.is_empty());
    }

    #[test]
    fn test_dbid_monotonic_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transfers.db");

        let mut cache = TransferCache::open(path.clone()).unwrap();
        let a = cache.assign_dbid();
        let mut committer = DbCommitter::default();
        committer.put(a, vec![0]);
        cache.commit(committer);

        let mut reloaded = TransferCache::open(path).unwrap();
        assert!(reloaded.assign_dbid() > a);
    }

    #[test]
    fn test_empty_committer_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transfers.db");
        let mut cache = TransferCache::open(path.clone()).unwrap();
        cache.commit(DbCommitter::default());
        assert!(!path.exists(), "empty batch must not create the file");
    }

    #[test]
    fn test_corrupt_magic_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transfers.db");
        std::fs::write(&path, b"NOPE").unwrap();
        assert!(TransferCache::open(path).is_err());
    }
}
