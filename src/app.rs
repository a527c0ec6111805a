//! Application notification contracts.
//!
//! The embedder observes the engine through [`AppListener`] and supplies
//! remote-tree knowledge through [`NodeStore`]. Every method has a default
//! no-op so tests and minimal embedders implement only what they watch.

use crate::error::Error;
use crate::fingerprint::FileFingerprint;
use crate::transfer::file::File;
use crate::transfer::Transfer;
use crate::types::{Ds, NodeHandle};

/// Progress, completion and failure notifications.
///
/// `transfer_update` fires on every state change; `transfer_failed` fires on
/// entering the retrying state; exactly one of `transfer_complete` or
/// `transfer_removed` fires terminally.
pub trait AppListener {
    fn transfer_update(&mut self, _t: &Transfer) {}
    fn transfer_failed(&mut self, _t: &Transfer, _e: Error, _timeleft: Ds) {}
    fn transfer_complete(&mut self, _t: &Transfer) {}
    fn transfer_removed(&mut self, _t: &Transfer) {}
    fn file_complete(&mut self, _f: &File) {}
    fn file_removed(&mut self, _f: &File, _e: Error) {}
}

/// Listener that ignores everything.
#[derive(Debug, Default)]
pub struct NullListener;

impl AppListener for NullListener {}

/// The engine's window onto the remote node graph.
pub trait NodeStore {
    /// Stored fingerprint of a node, if the node exists.
    fn fingerprint_of(&self, _h: NodeHandle) -> Option<FileFingerprint> {
        None
    }

    /// Queue a fingerprint attribute update. Returns false when an update
    /// with the same value is already pending, so callers avoid duplicates.
    fn queue_fingerprint_update(&mut self, _h: NodeHandle, _fp: &FileFingerprint) -> bool {
        false
    }
}

/// Node store that knows nothing.
#[derive(Debug, Default)]
pub struct NullNodeStore;

impl NodeStore for NullNodeStore {}
