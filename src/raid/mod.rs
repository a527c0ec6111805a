//! Erasure-coded object layout.
//!
//! A raided object is striped across six part streams. Each 80-byte line
//! consists of five 16-byte data sectors (parts 1..=5) and one parity
//! sector (part 0) equal to their XOR, so any single part can be
//! reconstructed from the other five. Exactly one part is designated
//! *unused* (the spare) at any time and is never fetched.

pub mod buffer;

pub use buffer::{FilePiece, NextPos, RaidBufferManager};

/// Parts per raided object: five data streams plus one parity stream.
pub const RAIDPARTS: usize = 6;

/// Parts that carry file data.
pub const EFFECTIVE_RAIDPARTS: usize = 5;

/// Stripe unit in bytes. Part submissions are sector-aligned except for
/// the final tail of a stream.
pub const RAIDSECTOR: u64 = 16;

/// One stripe of file data: five sectors.
pub const RAIDLINE: u64 = RAIDSECTOR * EFFECTIVE_RAIDPARTS as u64;

/// Size in bytes of one part stream for a file of `file_size` bytes.
///
/// Whole lines distribute evenly; the residual line assigns its bytes to
/// data parts in order, a sector at a time. The parity part (0) is always
/// the size of part 1.
pub fn raid_part_size(part: usize, file_size: u64) -> u64 {
    debug_assert!(part < RAIDPARTS);
    let r = file_size % RAIDLINE;
    let data_index = part.saturating_sub(1) as u64;
    let t = (r as i64 - (data_index * RAIDSECTOR) as i64).clamp(0, RAIDSECTOR as i64) as u64;
    (file_size - r) / EFFECTIVE_RAIDPARTS as u64 + t
}
