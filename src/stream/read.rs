//! Streaming read descriptors.
//!
//! A [`DirectRead`] is one requested byte range on a remote file, owned by
//! its node. The consumer is driven through a single callback taking a
//! sum-type event: data delivery, failure (returning the desired retry
//! delay), validity probe, or revocation.

use crate::config::MAX_REQ_SIZE;
use crate::error::Error;
use crate::raid::{RaidBufferManager, EFFECTIVE_RAIDPARTS, RAIDPARTS};
use crate::types::Ds;

use super::slot::DirectReadSlot;

/// Identifier of a read within its streaming engine.
pub type ReadId = u64;

/// Event passed to a read's callback. Variants carry their reply slot, so
/// one callback serves all four interactions.
pub enum ReadEvent<'a> {
    /// Contiguous decoded bytes at `offset`. Set `proceed` to false to
    /// cancel the read.
    Data {
        buf: &'a [u8],
        offset: u64,
        speed: u64,
        mean_speed: u64,
        proceed: bool,
    },
    /// The read failed; reply with the desired retry delay in `retry_in`
    /// (0 = immediately, `NEVER` = give up).
    Failure {
        error: Error,
        retry_count: u32,
        timeleft: Ds,
        retry_in: Ds,
    },
    /// Liveness probe: set `valid` to false once the consumer is gone.
    IsValid { valid: bool },
    /// The engine is discarding the read; release consumer state.
    Revoke,
}

pub type ReadCallback = Box<dyn FnMut(&mut ReadEvent<'_>)>;

/// Deliver data; returns whether the consumer wants more.
pub fn cb_data(
    cb: &mut ReadCallback,
    buf: &[u8],
    offset: u64,
    speed: u64,
    mean_speed: u64,
) -> bool {
    let mut ev = ReadEvent::Data {
        buf,
        offset,
        speed,
        mean_speed,
        proceed: true,
    };
    cb(&mut ev);
    match ev {
        ReadEvent::Data { proceed, .. } => proceed,
        _ => false,
    }
}

/// Report a failure; returns the consumer's desired retry delay.
pub fn cb_failure(cb: &mut ReadCallback, error: Error, retry_count: u32, timeleft: Ds) -> Ds {
    let mut ev = ReadEvent::Failure {
        error,
        retry_count,
        timeleft,
        retry_in: 0,
    };
    cb(&mut ev);
    match ev {
        ReadEvent::Failure { retry_in, .. } => retry_in,
        _ => 0,
    }
}

/// Probe consumer liveness.
pub fn cb_is_valid(cb: &mut ReadCallback) -> bool {
    let mut ev = ReadEvent::IsValid { valid: true };
    cb(&mut ev);
    match ev {
        ReadEvent::IsValid { valid } => valid,
        _ => false,
    }
}

/// Tell the consumer the read is going away.
pub fn cb_revoke(cb: &mut ReadCallback) {
    let mut ev = ReadEvent::Revoke;
    cb(&mut ev);
}

/// One requested byte range under streaming read.
pub struct DirectRead {
    pub id: ReadId,
    pub offset: u64,
    pub count: u64,
    /// The requested range had an explicit length (bounded range suffix).
    pub bounded: bool,
    /// Bytes already delivered to the consumer.
    pub progress: u64,
    pub buf: RaidBufferManager,
    pub slot: Option<DirectReadSlot>,
    pub callback: ReadCallback,
    /// Owner cancelled the read; no further deliveries.
    pub revoked: bool,
}

impl DirectRead {
    pub fn new(id: ReadId, offset: u64, count: u64, bounded: bool, callback: ReadCallback) -> Self {
        Self {
            id,
            offset,
            count,
            bounded,
            progress: 0,
            buf: RaidBufferManager::new(),
            slot: None,
            callback,
            revoked: false,
        }
    }

    /// Alive and wanted by its consumer?
    pub fn has_valid_callback(&mut self) -> bool {
        !self.revoked && cb_is_valid(&mut self.callback)
    }

    /// Drop the active slot; buffered progress stays in `buf`.
    pub fn abort(&mut self) {
        self.slot = None;
    }

    /// Cancel from the owner's side.
    pub fn revoke(&mut self) {
        if !self.revoked {
            self.revoked = true;
            cb_revoke(&mut self.callback);
        }
    }
}

/// Largest single range request for a file of `size` bytes over `n_urls`
/// connections: an even share per effective part, floored at the engine's
/// request ceiling.
pub fn max_req_size(size: u64, n_urls: usize) -> u64 {
    let parts = if n_urls == RAIDPARTS {
        EFFECTIVE_RAIDPARTS as u64
    } else {
        n_urls.max(1) as u64
    };
    (size / parts).max(MAX_REQ_SIZE)
}
