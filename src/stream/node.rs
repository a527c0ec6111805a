//! Remote file under streaming read.
//!
//! A node coalesces every pending [`DirectRead`](super::read::DirectRead)
//! on one remote file: they share its size, cipher parameters and
//! temporary URL set. Retry policy and deadline scheduling are driven by
//! the owning [`StreamingEngine`](super::StreamingEngine), which holds the
//! shared deadline map and ready queue.

use crate::types::NodeHandle;

use super::read::{DirectRead, ReadId};

pub struct DirectReadNode {
    pub handle: NodeHandle,
    pub size: u64,
    /// Counter IV for the external cipher.
    pub ctriv: i64,
    /// One URL (plain) or six (raided); replaced atomically on refresh.
    pub tempurls: Vec<String>,
    pub reads: Vec<DirectRead>,
    /// A fetch-temporary-URLs command is in flight.
    pub pending_cmd: bool,
    pub retries: u32,
}

impl DirectReadNode {
    pub fn new(handle: NodeHandle, size: u64, ctriv: i64) -> Self {
        Self {
            handle,
            size,
            ctriv,
            tempurls: Vec::new(),
            reads: Vec::new(),
            pending_cmd: false,
            retries: 0,
        }
    }

    pub fn read_mut(&mut self, id: ReadId) -> Option<&mut DirectRead> {
        self.reads.iter_mut().find(|r| r.id == id)
    }

    pub fn read_index(&self, id: ReadId) -> Option<usize> {
        self.reads.iter().position(|r| r.id == id)
    }
}
