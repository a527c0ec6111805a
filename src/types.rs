//! Shared value types: directions, transfer states, the decisecond clock,
//! node handles and cancellation tokens.
//!
//! Everything here is plain data — the engine is a single-threaded state
//! machine and time only advances when the embedder says so.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

// ── Decisecond clock ─────────────────────────────────────────────────────────

/// Engine time in deciseconds, injected by the embedder on every tick.
pub type Ds = u64;

/// Sentinel deadline meaning "never retry by time alone".
pub const NEVER: Ds = u64::MAX;

/// True for any real deadline (i.e. not [`NEVER`]).
#[inline]
pub fn ever(ds: Ds) -> bool {
    ds != NEVER
}

// ── Direction ────────────────────────────────────────────────────────────────

/// Transfer direction. The wire value (0/1) is part of the persisted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Download: remote object to local file(s).
    Get = 0,
    /// Upload: local file to the remote service.
    Put = 1,
}

impl Direction {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Direction::Get),
            1 => Some(Direction::Put),
            _ => None,
        }
    }

    /// Index into per-direction tables.
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

// ── Transfer state machine ───────────────────────────────────────────────────

/// All states a transfer can be in. Only `None` and `Paused` are ever
/// persisted; everything else is reconstructed at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferState {
    None = 0,
    /// Admitted to the queue, waiting for a slot.
    Queued = 1,
    /// Slot assigned, moving bytes.
    Active = 2,
    /// Explicitly paused by the user.
    Paused = 3,
    /// Transient failure, waiting out a backoff.
    Retrying = 4,
    /// All bytes moved, post-processing (verification, distribution).
    Completing = 5,
    Completed = 6,
    Cancelled = 7,
    Failed = 8,
}

impl TransferState {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => TransferState::None,
            1 => TransferState::Queued,
            2 => TransferState::Active,
            3 => TransferState::Paused,
            4 => TransferState::Retrying,
            5 => TransferState::Completing,
            6 => TransferState::Completed,
            7 => TransferState::Cancelled,
            8 => TransferState::Failed,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Cancelled | TransferState::Failed
        )
    }
}

// ── Size category ────────────────────────────────────────────────────────────

/// Files at or below this size are dispatched as `Small` (one connection is
/// certain; 131072 bytes is the smallest chunk).
pub const SMALLFILE_LIMIT: u64 = 131_072;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeCategory {
    Large = 0,
    Small = 1,
}

/// (direction × size) bucket used by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferCategory {
    pub direction: Direction,
    pub sizetype: SizeCategory,
}

impl TransferCategory {
    pub fn new(direction: Direction, size: u64) -> Self {
        let sizetype = if size > SMALLFILE_LIMIT {
            SizeCategory::Large
        } else {
            SizeCategory::Small
        };
        TransferCategory { direction, sizetype }
    }

    /// Bucket index in the scheduler's six-slot result array.
    pub fn index(&self) -> usize {
        2 + self.direction.index() * 2 + self.sizetype as usize
    }
}

// ── Node handle ──────────────────────────────────────────────────────────────

/// Width of a serialised node handle in bytes.
pub const NODEHANDLE_BYTES: usize = 6;

/// Compact handle of a node in the remote tree. Six significant bytes; the
/// all-ones value means "undefined".
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeHandle(pub u64);

impl NodeHandle {
    pub const UNDEF: NodeHandle = NodeHandle(0x0000_FFFF_FFFF_FFFF);

    pub fn is_undef(&self) -> bool {
        *self == Self::UNDEF
    }

    /// The six significant little-endian bytes.
    pub fn to_bytes(self) -> [u8; NODEHANDLE_BYTES] {
        let all = self.0.to_le_bytes();
        [all[0], all[1], all[2], all[3], all[4], all[5]]
    }

    pub fn from_bytes(b: [u8; NODEHANDLE_BYTES]) -> Self {
        let mut all = [0u8; 8];
        all[..NODEHANDLE_BYTES].copy_from_slice(&b);
        NodeHandle(u64::from_le_bytes(all))
    }
}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeHandle({})", self)
    }
}

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_undef() {
            write!(f, "undef")
        } else {
            write!(f, "{}", URL_SAFE_NO_PAD.encode(self.to_bytes()))
        }
    }
}

// ── Cancellation token ───────────────────────────────────────────────────────

/// Per-file cancellation flag, checked at each scheduling pass. Cloning
/// shares the flag; the engine is single-threaded so a `Cell` suffices.
#[derive(Clone, Default)]
pub struct CancelToken(Rc<Cell<bool>>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.set(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.get()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CancelToken({})", self.0.get())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_category_boundary() {
        assert_eq!(
            TransferCategory::new(Direction::Get, SMALLFILE_LIMIT).sizetype,
            SizeCategory::Small
        );
        assert_eq!(
            TransferCategory::new(Direction::Get, SMALLFILE_LIMIT + 1).sizetype,
            SizeCategory::Large
        );
    }

    #[test]
    fn test_category_index_distinct() {
        let mut seen = std::collections::HashSet::new();
        for (d, s) in [
            (Direction::Get, 1u64),
            (Direction::Get, 1 << 20),
            (Direction::Put, 1),
            (Direction::Put, 1 << 20),
        ] {
            assert!(seen.insert(TransferCategory::new(d, s).index()));
        }
    }

    #[test]
    fn test_node_handle_roundtrip() {
        let h = NodeHandle(0x0000_1234_5678_9abc);
        assert_eq!(NodeHandle::from_bytes(h.to_bytes()), h);
        assert!(NodeHandle::UNDEF.is_undef());
        assert!(!h.is_undef());
    }

    #[test]
    fn test_cancel_token_shared() {
        let t = CancelToken::new();
        let t2 = t.clone();
        assert!(!t2.is_cancelled());
        t.cancel();
        assert!(t2.is_cancelled());
    }

    #[test]
    fn test_state_persistable_roundtrip() {
        for s in [TransferState::None, TransferState::Paused] {
            assert_eq!(TransferState::from_u8(s as u8), Some(s));
        }
    }
}
