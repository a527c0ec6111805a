//! Reassembly buffer for streamed reads.
//!
//! The manager accepts byte pieces fetched by each connection, reassembles
//! stripes (XOR-reconstructing the spare part where needed), and emits
//! contiguous decoded output trimmed to the requested window. In the
//! non-redundant case it degenerates to a single pass-through buffer.
//!
//! Positions handed to connections are part-space offsets for raided
//! objects and absolute file offsets otherwise. Output positions are always
//! absolute file offsets, strictly increasing.

use std::collections::VecDeque;

use bytes::BytesMut;
use tracing::{debug, warn};

use super::{raid_part_size, EFFECTIVE_RAIDPARTS, RAIDLINE, RAIDPARTS, RAIDSECTOR};
use crate::config::MAX_DELIVERY_CHUNK;

/// A contiguous run of bytes at a position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePiece {
    pub pos: u64,
    pub buf: BytesMut,
}

impl FilePiece {
    pub fn new(pos: u64, data: &[u8]) -> Self {
        Self {
            pos,
            buf: BytesMut::from(data),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Answer to "what should connection `i` fetch next".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextPos {
    /// A reconstructed output piece became available; drain output instead
    /// of fetching.
    NewBufferSupplied,
    /// The connection is ahead of its siblings; fetch nothing this pass.
    PauseForRaid,
    /// Fetch `[lo, hi)`. `lo >= hi` means this part is done.
    Range { lo: u64, hi: u64 },
}

#[derive(Debug, Default)]
struct PartTracker {
    /// Fetch cursor: next offset a connection will be asked for.
    pos: u64,
    /// Total size of the part stream.
    size: u64,
    /// Last offset this window needs from the part.
    fetch_end: u64,
    /// Contiguous received bytes starting at the assembly boundary.
    buf: BytesMut,
}

/// Buffer manager for one streaming read.
#[derive(Debug, Default)]
pub struct RaidBufferManager {
    raid: bool,
    tempurls: Vec<String>,
    start: u64,
    /// Requested end, capped to the file size.
    end: u64,
    file_size: u64,
    max_request_size: u64,
    parts: Vec<PartTracker>,
    /// Spare part index; `RAIDPARTS` when none designated.
    unused: usize,
    /// Part-space offset assembled so far (sector-aligned).
    line_pos: u64,
    /// Next absolute file offset to emit.
    output_file_pos: u64,
    outputs: VecDeque<FilePiece>,
}

impl RaidBufferManager {
    pub fn new() -> Self {
        Self {
            unused: RAIDPARTS,
            ..Self::default()
        }
    }

    /// Configure parts and the requested window `[start, end_exclusive)`.
    /// Six URLs select the raided layout; anything else is a single
    /// pass-through stream.
    pub fn set_is_raid(
        &mut self,
        tempurls: &[String],
        start: u64,
        end_exclusive: u64,
        file_size: u64,
        max_request_size: u64,
        is_resume: bool,
    ) {
        self.tempurls = tempurls.to_vec();
        self.raid = tempurls.len() == RAIDPARTS;
        self.file_size = file_size;
        self.start = start.min(file_size);
        self.end = end_exclusive.min(file_size);
        self.max_request_size = max_request_size.max(RAIDSECTOR);
        self.outputs.clear();
        self.output_file_pos = self.start;

        if self.raid {
            let start_line = self.start / RAIDLINE;
            let end_line = self.end.div_ceil(RAIDLINE);
            let part_start = start_line * RAIDSECTOR;
            self.line_pos = part_start;
            self.parts = (0..RAIDPARTS)
                .map(|p| {
                    let size = raid_part_size(p, file_size);
                    let fetch_end = size.min(end_line * RAIDSECTOR);
                    PartTracker {
                        pos: part_start.min(fetch_end),
                        size,
                        fetch_end,
                        buf: BytesMut::new(),
                    }
                })
                .collect();
            if self.unused >= RAIDPARTS {
                // parity is the natural spare until a data part misbehaves
                self.unused = 0;
            }
        } else {
            self.unused = RAIDPARTS;
            self.line_pos = 0;
            self.parts = vec![PartTracker {
                pos: self.start,
                size: self.end,
                fetch_end: self.end,
                buf: BytesMut::new(),
            }];
        }

        debug!(
            event = "read_buffer_configured",
            raid = self.raid,
            start = self.start,
            end = self.end,
            file_size,
            is_resume,
            "Read buffer configured"
        );
    }

    pub fn is_raid(&self) -> bool {
        self.raid
    }

    pub fn temp_url_vector(&self) -> &[String] {
        &self.tempurls
    }

    pub fn temp_url(&self, conn: usize) -> &str {
        &self.tempurls[conn.min(self.tempurls.len().saturating_sub(1))]
    }

    /// Replace the URL set after a refresh, keeping everything downloaded
    /// so far. Fetch cursors fall back to the first byte not yet buffered,
    /// discarding knowledge of requests that were in flight.
    pub fn update_urls_and_reset_pos(&mut self, tempurls: &[String]) {
        debug_assert_eq!(tempurls.len(), self.tempurls.len());
        self.tempurls = tempurls.to_vec();
        if self.raid {
            for (i, part) in self.parts.iter_mut().enumerate() {
                if i != self.unused {
                    part.pos = (self.line_pos + part.buf.len() as u64).min(part.fetch_end);
                }
            }
        }
    }

    /// Designate the spare part; its bytes will be reconstructed from the
    /// parity of the other five.
    pub fn set_unused_raid_connection(&mut self, conn: usize) {
        if self.raid && conn < RAIDPARTS {
            self.unused = conn;
        }
    }

    pub fn unused_raid_connection(&self) -> usize {
        self.unused
    }

    /// Drop a part's buffered bytes and rewind its cursor to the assembly
    /// boundary, leaving the slot fully reusable.
    pub fn reset_part(&mut self, conn: usize) {
        if !self.raid || conn >= self.parts.len() {
            return;
        }
        let part = &mut self.parts[conn];
        part.buf.clear();
        part.pos = self.line_pos.min(part.fetch_end);
    }

    /// Fetch cursor of a part (set by the slot once a request is posted).
    pub fn transfer_pos(&self, conn: usize) -> u64 {
        self.parts[self.part_index(conn)].pos
    }

    pub fn set_transfer_pos(&mut self, conn: usize, pos: u64) {
        let idx = self.part_index(conn);
        self.parts[idx].pos = pos;
    }

    /// Total bytes this window fetches from a part.
    pub fn transfer_size(&self, conn: usize) -> u64 {
        self.parts[self.part_index(conn)].fetch_end
    }

    fn part_index(&self, conn: usize) -> usize {
        if self.raid {
            conn
        } else {
            0
        }
    }

    /// The next range connection `conn` should fetch.
    pub fn next_n_pos_for_connection(&mut self, conn: usize) -> NextPos {
        if !self.raid {
            let part = &self.parts[0];
            return NextPos::Range {
                lo: part.pos,
                hi: part.fetch_end,
            };
        }

        if conn == self.unused {
            self.assemble();
            if !self.outputs.is_empty() {
                return NextPos::NewBufferSupplied;
            }
            let part = &self.parts[conn];
            return NextPos::Range {
                lo: part.fetch_end,
                hi: part.fetch_end,
            };
        }

        let part = &self.parts[conn];
        if part.pos >= part.fetch_end {
            return NextPos::Range {
                lo: part.pos,
                hi: part.pos,
            };
        }

        if part.pos.saturating_sub(self.line_pos) > self.max_request_size {
            return NextPos::PauseForRaid;
        }

        let step = self.max_request_size.next_multiple_of(RAIDSECTOR);
        NextPos::Range {
            lo: part.pos,
            hi: part.fetch_end.min(part.pos + step),
        }
    }

    /// Deliver bytes fetched by connection `conn`. Raid submissions must be
    /// sector-aligned unless `is_final` marks the closing tail of the
    /// request; misaligned interim pieces are rejected.
    pub fn submit_buffer(&mut self, conn: usize, piece: FilePiece, is_final: bool) -> bool {
        if self.raid && !is_final && piece.len() as u64 % RAIDSECTOR != 0 {
            warn!(
                event = "raid_submit_misaligned",
                conn,
                len = piece.len(),
                "Rejecting non-sector-aligned interim piece"
            );
            return false;
        }

        if !self.raid {
            if !piece.is_empty() {
                self.outputs.push_back(piece);
            }
            return true;
        }

        let expected = self.line_pos + self.parts[conn].buf.len() as u64;
        if piece.pos != expected {
            warn!(
                event = "raid_submit_out_of_order",
                conn,
                pos = piece.pos,
                expected,
                "Dropping out-of-order piece"
            );
            return false;
        }
        self.parts[conn].buf.extend_from_slice(&piece.buf);
        self.assemble();
        true
    }

    /// Next contiguous decoded output piece, if any.
    pub fn output_piece(&mut self) -> Option<&FilePiece> {
        if self.raid {
            self.assemble();
        }
        self.outputs.front()
    }

    /// The caller consumed (or abandoned) the piece returned by
    /// [`Self::output_piece`].
    pub fn output_consumed(&mut self, _ok: bool) {
        self.outputs.pop_front();
    }

    /// All requested bytes emitted?
    pub fn done(&self) -> bool {
        self.output_file_pos >= self.end && self.outputs.is_empty()
    }

    // ── Stripe assembly ──────────────────────────────────────────────────

    /// Emit as many whole lines as every needed part can serve, XOR-
    /// reconstructing the spare, then trim to the requested window.
    fn assemble(&mut self) {
        if !self.raid {
            return;
        }
        loop {
            if self.output_file_pos >= self.end {
                return;
            }

            let line_idx = self.line_pos / RAIDSECTOR;
            let end_line = self.end.div_ceil(RAIDLINE);
            let remaining_lines = end_line.saturating_sub(line_idx);
            if remaining_lines == 0 {
                return;
            }

            let mut lines = remaining_lines.min(MAX_DELIVERY_CHUNK / RAIDLINE);
            for (p, part) in self.parts.iter().enumerate() {
                if p == self.unused {
                    continue;
                }
                let have = part.buf.len() as u64;
                let lines_avail = if self.line_pos + have >= part.fetch_end {
                    // fully fetched: short tail counts as a padded sector
                    remaining_lines
                } else {
                    have / RAIDSECTOR
                };
                lines = lines.min(lines_avail);
            }
            if lines == 0 {
                return;
            }

            let mut out = BytesMut::with_capacity((lines * RAIDLINE) as usize);
            for l in 0..lines {
                let abs_line = line_idx + l;
                let line_file_off = abs_line * RAIDLINE;

                let mut sectors = [[0u8; RAIDSECTOR as usize]; RAIDPARTS];
                for (p, part) in self.parts.iter().enumerate() {
                    if p == self.unused {
                        continue;
                    }
                    let off = ((l * RAIDSECTOR) as usize).min(part.buf.len());
                    let avail = (part.buf.len() - off).min(RAIDSECTOR as usize);
                    sectors[p][..avail].copy_from_slice(&part.buf[off..off + avail]);
                }
                if self.unused < RAIDPARTS {
                    // spare = XOR of the five present sectors
                    let mut rec = [0u8; RAIDSECTOR as usize];
                    for (p, sector) in sectors.iter().enumerate() {
                        if p != self.unused {
                            for (r, b) in rec.iter_mut().zip(sector.iter()) {
                                *r ^= b;
                            }
                        }
                    }
                    sectors[self.unused] = rec;
                }

                for d in 1..RAIDPARTS {
                    let sector_file_off = line_file_off + (d as u64 - 1) * RAIDSECTOR;
                    let n = self
                        .file_size
                        .saturating_sub(sector_file_off)
                        .min(RAIDSECTOR) as usize;
                    out.extend_from_slice(&sectors[d][..n]);
                }
            }

            let consumed = lines * RAIDSECTOR;
            for (p, part) in self.parts.iter_mut().enumerate() {
                if p == self.unused {
                    continue;
                }
                let n = (consumed as usize).min(part.buf.len());
                let _ = part.buf.split_to(n);
            }
            self.line_pos += consumed;

            // trim to the requested window
            let piece_file_start = line_idx * RAIDLINE;
            let piece_file_end = piece_file_start + out.len() as u64;
            let skip = self.output_file_pos.saturating_sub(piece_file_start);
            let cap = piece_file_end.min(self.end);
            if cap > piece_file_start + skip {
                let lo = skip as usize;
                let hi = (cap - piece_file_start) as usize;
                let mut piece = out;
                let _ = piece.split_to(lo);
                piece.truncate(hi - lo);
                self.outputs.push_back(FilePiece {
                    pos: self.output_file_pos,
                    buf: piece,
                });
                self.output_file_pos = cap;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("http://api.test/part{i}")).collect()
    }

    /// Build the six part streams for `data` the way the service stripes
    /// them: five data sectors per line round-robin, parity = XOR.
    fn stripe(data: &[u8]) -> Vec<Vec<u8>> {
        let mut parts = vec![Vec::new(); RAIDPARTS];
        let lines = (data.len() as u64).div_ceil(RAIDLINE);
        for line in 0..lines {
            let mut parity = [0u8; RAIDSECTOR as usize];
            for d in 1..RAIDPARTS {
                let off = (line * RAIDLINE + (d as u64 - 1) * RAIDSECTOR) as usize;
                let mut sector = [0u8; RAIDSECTOR as usize];
                let n = data.len().saturating_sub(off).min(RAIDSECTOR as usize);
                sector[..n].copy_from_slice(&data[off..off + n]);
                parts[d].extend_from_slice(&sector[..n]);
                for (p, b) in parity.iter_mut().zip(sector.iter()) {
                    *p ^= b;
                }
            }
            // parity sector mirrors the first data part's length
            let p1_n = data
                .len()
                .saturating_sub((line * RAIDLINE) as usize)
                .min(RAIDSECTOR as usize);
            parts[0].extend_from_slice(&parity[..p1_n]);
        }
        parts
    }

    fn test_data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn drain(mgr: &mut RaidBufferManager) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(piece) = mgr.output_piece() {
            out.extend_from_slice(&piece.buf);
            mgr.output_consumed(true);
        }
        out
    }

    #[test]
    fn test_non_raid_passthrough() {
        let mut mgr = RaidBufferManager::new();
        mgr.set_is_raid(&urls(1), 10, 50, 100, 1 << 20, false);
        assert!(!mgr.is_raid());

        match mgr.next_n_pos_for_connection(0) {
            NextPos::Range { lo, hi } => {
                assert_eq!(lo, 10);
                assert_eq!(hi, 50);
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(mgr.submit_buffer(0, FilePiece::new(10, &[9u8; 40]), true));
        assert_eq!(drain(&mut mgr), vec![9u8; 40]);
    }

    #[test]
    fn test_raid_full_file_reassembly() {
        let data = test_data(400); // 5 full lines
        let parts = stripe(&data);

        let mut mgr = RaidBufferManager::new();
        mgr.set_is_raid(&urls(6), 0, 400, 400, 1 << 20, false);
        assert!(mgr.is_raid());
        assert_eq!(mgr.unused_raid_connection(), 0, "parity spare by default");

        for p in 1..RAIDPARTS {
            assert!(mgr.submit_buffer(p, FilePiece::new(0, &parts[p]), true));
        }
        assert_eq!(drain(&mut mgr), data);
        assert!(mgr.done());
    }

    #[test]
    fn test_raid_reconstructs_missing_data_part() {
        let data = test_data(400);
        let parts = stripe(&data);

        let mut mgr = RaidBufferManager::new();
        mgr.set_is_raid(&urls(6), 0, 400, 400, 1 << 20, false);
        mgr.set_unused_raid_connection(3);

        // all parts except the spare (3): parity included
        for p in 0..RAIDPARTS {
            if p != 3 {
                assert!(mgr.submit_buffer(p, FilePiece::new(0, &parts[p]), true));
            }
        }
        assert_eq!(drain(&mut mgr), data);
    }

    #[test]
    fn test_raid_short_tail() {
        let data = test_data(100); // one full line + 20-byte residue
        let parts = stripe(&data);

        let mut mgr = RaidBufferManager::new();
        mgr.set_is_raid(&urls(6), 0, 100, 100, 1 << 20, false);
        for p in 1..RAIDPARTS {
            assert!(mgr.submit_buffer(p, FilePiece::new(0, &parts[p]), true));
        }
        assert_eq!(drain(&mut mgr), data);
    }

    #[test]
    fn test_raid_window_trimming() {
        let data = test_data(400);
        let parts = stripe(&data);

        // request bytes 100..300: lines 1..4 are fetched
        let mut mgr = RaidBufferManager::new();
        mgr.set_is_raid(&urls(6), 100, 300, 400, 1 << 20, false);

        for p in 1..RAIDPARTS {
            let lo = (100 / RAIDLINE * RAIDSECTOR) as usize;
            let hi = parts[p].len().min((300u64.div_ceil(RAIDLINE) * RAIDSECTOR) as usize);
            assert!(mgr.submit_buffer(p, FilePiece::new(lo as u64, &parts[p][lo..hi]), true));
        }
        assert_eq!(drain(&mut mgr), &data[100..300]);
    }

    #[test]
    fn test_raid_rejects_misaligned_interim_piece() {
        let mut mgr = RaidBufferManager::new();
        mgr.set_is_raid(&urls(6), 0, 400, 400, 1 << 20, false);

        // 20 bytes is not sector-aligned: rejected while in flight...
        assert!(!mgr.submit_buffer(1, FilePiece::new(0, &[0u8; 20]), false));
        // ...but accepted as the closing tail
        assert!(mgr.submit_buffer(1, FilePiece::new(0, &[0u8; 20]), true));
    }

    #[test]
    fn test_raid_incremental_sector_feed() {
        let data = test_data(160); // two lines
        let parts = stripe(&data);

        let mut mgr = RaidBufferManager::new();
        mgr.set_is_raid(&urls(6), 0, 160, 160, 1 << 20, false);

        // feed one sector per part, then the second
        for round in 0..2u64 {
            for p in 1..RAIDPARTS {
                let lo = (round * RAIDSECTOR) as usize;
                let hi = lo + RAIDSECTOR as usize;
                assert!(mgr.submit_buffer(
                    p,
                    FilePiece::new(round * RAIDSECTOR, &parts[p][lo..hi]),
                    round == 1,
                ));
            }
            // after each full round a line batch is ready
            assert!(mgr.output_piece().is_some());
        }
        assert_eq!(drain(&mut mgr), data);
    }

    #[test]
    fn test_spare_switch_resets_to_boundary() {
        let data = test_data(400);
        let parts = stripe(&data);

        let mut mgr = RaidBufferManager::new();
        mgr.set_is_raid(&urls(6), 0, 400, 400, 1 << 20, false);

        // part 1 delivers its first two sectors, others deliver everything
        assert!(mgr.submit_buffer(1, FilePiece::new(0, &parts[1][..32]), false));
        for p in 2..RAIDPARTS {
            assert!(mgr.submit_buffer(p, FilePiece::new(0, &parts[p]), true));
        }
        let first = drain(&mut mgr);
        assert_eq!(first, &data[..160], "two assembled lines");

        // promote slow part 1 to spare; old spare (0, parity) rejoins
        mgr.set_unused_raid_connection(1);
        mgr.reset_part(1);
        mgr.reset_part(0);
        assert_eq!(mgr.transfer_pos(0), mgr.line_pos);

        // parity rejoins from the assembly boundary
        let lo = mgr.transfer_pos(0) as usize;
        assert!(mgr.submit_buffer(0, FilePiece::new(lo as u64, &parts[0][lo..]), true));
        assert_eq!(drain(&mut mgr), &data[160..], "no gap in delivered bytes");
    }

    #[test]
    fn test_pause_for_raid_when_too_far_ahead() {
        let mut mgr = RaidBufferManager::new();
        mgr.set_is_raid(&urls(6), 0, 1 << 20, 1 << 20, 4096, false);

        // pretend connection 1 fetched far ahead of the others
        mgr.set_transfer_pos(1, 64 * 1024);
        assert_eq!(mgr.next_n_pos_for_connection(1), NextPos::PauseForRaid);

        match mgr.next_n_pos_for_connection(2) {
            NextPos::Range { lo, hi } => assert!(lo < hi),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unused_connection_reports_new_buffer() {
        let data = test_data(80);
        let parts = stripe(&data);

        let mut mgr = RaidBufferManager::new();
        mgr.set_is_raid(&urls(6), 0, 80, 80, 1 << 20, false);
        for p in 1..RAIDPARTS {
            assert!(mgr.submit_buffer(p, FilePiece::new(0, &parts[p]), true));
        }
        assert_eq!(mgr.next_n_pos_for_connection(0), NextPos::NewBufferSupplied);
    }

    #[test]
    fn test_update_urls_keeps_downloaded_parts() {
        let data = test_data(160);
        let parts = stripe(&data);

        let mut mgr = RaidBufferManager::new();
        mgr.set_is_raid(&urls(6), 0, 160, 160, 1 << 20, false);
        // one sector buffered on part 1, nothing on the rest
        assert!(mgr.submit_buffer(1, FilePiece::new(0, &parts[1][..16]), false));
        mgr.set_transfer_pos(1, 160); // request was in flight

        let fresh = urls(6);
        mgr.update_urls_and_reset_pos(&fresh);
        assert_eq!(
            mgr.transfer_pos(1),
            16,
            "cursor resumes after buffered bytes, in-flight knowledge dropped"
        );
    }
}
