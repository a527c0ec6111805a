//! Per-chunk integrity bookkeeping.
//!
//! Every transfer records, for each chunk it has moved, the chunk's MAC and
//! how much of it is on disk. The map answers three questions: how far the
//! contiguous prefix reaches (`pos`), how many bytes of finished chunks
//! exist (`completed`), and how many bytes sit in unfinished chunks
//! (`partial`). Resume after a crash replays exactly this state.
//!
//! Chunk boundaries grow from 128 KiB to 1 MiB over the first eight chunks,
//! then stay at 1 MiB.

use std::collections::BTreeMap;

use crate::cache::codec::{CacheableReader, CacheableWriter};
use crate::raid::RAIDLINE;

/// MAC width recorded per chunk.
pub const CHUNKMAC_BYTES: usize = 16;

const KIB: u64 = 1024;

/// Smallest boundary strictly greater than `pos`, capped at `limit`.
/// Boundaries fall at 128K, 384K, 768K, 1280K, 1920K, 2688K, 3584K, 4608K
/// and every 1 MiB thereafter.
pub fn chunk_ceil(pos: u64, limit: u64) -> u64 {
    let mut boundary = 0u64;
    for i in 1..=8u64 {
        boundary += i * 128 * KIB;
        if boundary > pos {
            return boundary.min(limit);
        }
    }
    // past the ramp: 1 MiB strides from 4608K
    let stride = 1024 * KIB;
    let past = pos - boundary;
    let boundary = boundary + (past / stride + 1) * stride;
    boundary.min(limit)
}

/// Largest boundary less than or equal to `pos`.
pub fn chunk_floor(pos: u64) -> u64 {
    let mut boundary = 0u64;
    for i in 1..=8u64 {
        let next = boundary + i * 128 * KIB;
        if next > pos {
            return boundary;
        }
        boundary = next;
    }
    let stride = 1024 * KIB;
    boundary + (pos - boundary) / stride * stride
}

// ── Chunk state ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkMac {
    pub mac: [u8; CHUNKMAC_BYTES],
    /// The whole chunk is transferred and verified.
    pub finished: bool,
    /// Bytes written so far when not finished.
    pub partial_bytes: u32,
}

/// Progress derived from the map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    /// Largest contiguous finished offset from 0.
    pub pos: u64,
    /// Sum of finished chunk sizes.
    pub completed: u64,
    /// Sum of partial bytes in unfinished chunks.
    pub partial: u64,
}

// ── Map ──────────────────────────────────────────────────────────────────────

/// Ordered map from chunk start offset to per-chunk state.
#[derive(Debug, Clone, Default)]
pub struct ChunkMacMap {
    entries: BTreeMap<u64, ChunkMac>,
}

impl ChunkMacMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record chunk state; replaces any previous (partial) state.
    pub fn insert(&mut self, offset: u64, mac: [u8; CHUNKMAC_BYTES], finished: bool, partial_bytes: u32) {
        self.entries.insert(
            offset,
            ChunkMac {
                mac,
                finished,
                partial_bytes,
            },
        );
    }

    pub fn get(&self, offset: u64) -> Option<&ChunkMac> {
        self.entries.get(&offset)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u64, &ChunkMac)> {
        self.entries.iter()
    }

    /// Compute progress against a file of `size` bytes. Idempotent: the map
    /// is not mutated.
    pub fn calc_progress(&self, size: u64) -> Progress {
        let mut p = Progress::default();
        for (&start, cm) in &self.entries {
            if cm.finished {
                let end = chunk_ceil(start, size);
                p.completed += end.saturating_sub(start);
                if start == p.pos {
                    p.pos = end;
                }
            } else {
                p.partial += u64::from(cm.partial_bytes);
            }
        }
        p
    }

    /// Copy entries whose chunk ends at or before the last RAID line
    /// boundary below `pos` into `dst`; returns the truncated position.
    /// Used when a transfer that ran single-source resumes as RAID:
    /// progress that is not stripe-aligned must be discarded.
    pub fn copy_entries_until_raidline_before_pos(&self, pos: u64, dst: &mut ChunkMacMap) -> u64 {
        let truncated = pos - pos % RAIDLINE;
        for (&start, cm) in &self.entries {
            let end = chunk_ceil(start, u64::MAX);
            if cm.finished && end <= truncated {
                dst.entries.insert(start, *cm);
            }
        }
        truncated
    }

    // ── Codec ────────────────────────────────────────────────────────────

    pub fn serialize(&self, w: &mut CacheableWriter) {
        w.write_u32(self.entries.len() as u32);
        for (&start, cm) in &self.entries {
            w.write_u64(start);
            w.write_bytes(&cm.mac);
            w.write_u8(cm.finished as u8);
            w.write_u32(cm.partial_bytes);
        }
    }

    pub fn unserialize(r: &mut CacheableReader<'_>) -> Option<ChunkMacMap> {
        let count = r.read_u32()?;
        let mut map = ChunkMacMap::new();
        for _ in 0..count {
            let start = r.read_u64()?;
            let mut mac = [0u8; CHUNKMAC_BYTES];
            r.read_exact(&mut mac)?;
            let finished = r.read_u8()? != 0;
            let partial_bytes = r.read_u32()?;
            map.entries.insert(
                start,
                ChunkMac {
                    mac,
                    finished,
                    partial_bytes,
                },
            );
        }
        Some(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: [u8; CHUNKMAC_BYTES] = [7u8; CHUNKMAC_BYTES];

    #[test]
    fn test_chunk_boundaries_ramp() {
        assert_eq!(chunk_ceil(0, u64::MAX), 128 * KIB);
        assert_eq!(chunk_ceil(128 * KIB, u64::MAX), 384 * KIB);
        assert_eq!(chunk_ceil(384 * KIB, u64::MAX), 768 * KIB);
        assert_eq!(chunk_ceil(4608 * KIB - 1, u64::MAX), 4608 * KIB);
        assert_eq!(chunk_ceil(4608 * KIB, u64::MAX), 5632 * KIB);
        assert_eq!(chunk_ceil(6000 * KIB, u64::MAX), 6656 * KIB);
    }

    #[test]
    fn test_chunk_floor_matches_ceil() {
        for pos in [0, 1, 128 * KIB, 500 * KIB, 4608 * KIB, 9000 * KIB] {
            let floor = chunk_floor(pos);
            assert!(floor <= pos);
            assert!(chunk_ceil(floor, u64::MAX) > pos || floor == pos);
        }
    }

    #[test]
    fn test_calc_progress_contiguous() {
        let size = 1024 * KIB;
        let mut m = ChunkMacMap::new();
        m.insert(0, MAC, true, 0);
        m.insert(128 * KIB, MAC, true, 0);

        let p = m.calc_progress(size);
        assert_eq!(p.pos, 384 * KIB);
        assert_eq!(p.completed, 384 * KIB);
        assert_eq!(p.partial, 0);
    }

    #[test]
    fn test_calc_progress_gap_and_partial() {
        let size = 2048 * KIB;
        let mut m = ChunkMacMap::new();
        m.insert(0, MAC, true, 0);
        // gap at 128K..384K, finished chunk beyond it
        m.insert(384 * KIB, MAC, true, 0);
        m.insert(128 * KIB, MAC, false, 4096);

        let p = m.calc_progress(size);
        assert_eq!(p.pos, 128 * KIB, "gap stops the contiguous prefix");
        assert_eq!(p.completed, 128 * KIB + 384 * KIB);
        assert_eq!(p.partial, 4096);
    }

    #[test]
    fn test_calc_progress_idempotent() {
        let mut m = ChunkMacMap::new();
        m.insert(0, MAC, true, 0);
        m.insert(128 * KIB, MAC, false, 17);
        let a = m.calc_progress(512 * KIB);
        let b = m.calc_progress(512 * KIB);
        assert_eq!(a, b);
    }

    #[test]
    fn test_final_chunk_capped_by_size() {
        let size = 100 * KIB; // single short chunk
        let mut m = ChunkMacMap::new();
        m.insert(0, MAC, true, 0);
        let p = m.calc_progress(size);
        assert_eq!(p.pos, size);
        assert_eq!(p.completed, size);
    }

    #[test]
    fn test_copy_until_raidline() {
        let mut m = ChunkMacMap::new();
        m.insert(0, MAC, true, 0);
        m.insert(128 * KIB, MAC, true, 0);

        let pos = 384 * KIB + 37; // not line-aligned
        let mut dst = ChunkMacMap::new();
        let truncated = m.copy_entries_until_raidline_before_pos(pos, &mut dst);

        assert_eq!(truncated % RAIDLINE, 0);
        assert_eq!(truncated, pos - pos % RAIDLINE);
        // both chunks end at 384K <= truncated, so both survive
        assert_eq!(dst.len(), 2);
    }

    #[test]
    fn test_copy_until_raidline_drops_straddler() {
        let mut m = ChunkMacMap::new();
        m.insert(0, MAC, true, 0);

        // truncation point inside the first chunk
        let mut dst = ChunkMacMap::new();
        let truncated = m.copy_entries_until_raidline_before_pos(64 * KIB, &mut dst);
        assert_eq!(truncated, 64 * KIB);
        assert!(dst.is_empty(), "straddling chunk must be discarded");
    }

    #[test]
    fn test_serialize_roundtrip() {
        let mut m = ChunkMacMap::new();
        m.insert(0, [1u8; 16], true, 0);
        m.insert(128 * KIB, [2u8; 16], false, 12_345);

        let mut w = CacheableWriter::new();
        m.serialize(&mut w);
        let data = w.into_bytes();

        let mut r = CacheableReader::new(&data);
        let back = ChunkMacMap::unserialize(&mut r).unwrap();
        assert!(!r.has_data_left());
        assert_eq!(back.len(), 2);
        assert_eq!(back.get(0), m.get(0));
        assert_eq!(back.get(128 * KIB), m.get(128 * KIB));
    }
}
