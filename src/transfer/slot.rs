//! Active context of a classic (non-streaming) transfer.
//!
//! A slot exists only while its transfer is active: it pins the open local
//! file, tracks contiguous progress, and owns the small retry timer used
//! while completion waits out transient destination errors. Destroying the
//! slot must leave the transfer resumable from its recorded chunk state.

use crate::backoff::BackoffTimer;
use crate::fs::FileAccess;
use crate::types::Ds;

pub struct TransferSlot {
    /// Open local file: upload source or download target.
    pub fa: Option<Box<dyn FileAccess>>,
    /// Completion hit a transient error and will be retried.
    pub retrying: bool,
    /// Timer pacing completion retries.
    pub retrybt: BackoffTimer,
    /// Tick the slot was created.
    pub starttime: Ds,
    /// Contiguous bytes confirmed from offset 0.
    pub progressreported: u64,
}

impl TransferSlot {
    pub fn new(fa: Option<Box<dyn FileAccess>>, now: Ds, max_backoff: Ds) -> Self {
        Self {
            fa,
            retrying: false,
            retrybt: BackoffTimer::new(max_backoff),
            starttime: now,
            progressreported: 0,
        }
    }
}

impl std::fmt::Debug for TransferSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferSlot")
            .field("has_fa", &self.fa.is_some())
            .field("retrying", &self.retrying)
            .field("starttime", &self.starttime)
            .finish()
    }
}
