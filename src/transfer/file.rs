//! Destinations attached to a transfer.
//!
//! A `File` binds one transfer to one local/remote target pair. Downloads
//! may fan out to several files; uploads usually carry one. The variants
//! need only a small dispatch surface: a retry vote on failure, completion
//! and termination notifications, and local-name access.

use std::path::PathBuf;

use crate::config::MAX_FILE_DEFERRALS;
use crate::distributor::CollisionResolution;
use crate::error::Error;
use crate::types::{CancelToken, NodeHandle};

/// What this destination is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Plain app-requested download.
    Download,
    /// Download requested by the sync engine.
    SyncDownload,
    /// Upload requested by the sync engine.
    SyncUpload,
    /// Upload addressed to the support inbox.
    SupportUpload,
}

/// One destination bound to a transfer.
#[derive(Debug, Clone)]
pub struct File {
    /// Display name (remote name).
    pub name: String,
    /// Local target path (GET) or source path (PUT).
    pub localname: PathBuf,
    /// Target node (GET) or parent node (PUT).
    pub handle: NodeHandle,
    /// The node lives in another account's storage.
    pub foreign: bool,
    /// The node is reachable through a private (owned) tree.
    pub private_node: bool,
    pub kind: FileKind,
    pub collision: CollisionResolution,
    pub cancel: CancelToken,
    /// Delete the local file once handed over (uploads from temp files).
    pub temporary: bool,
    /// App-side request tag.
    pub tag: u32,
}

impl File {
    pub fn new(name: String, localname: PathBuf, handle: NodeHandle, kind: FileKind) -> Self {
        Self {
            name,
            localname,
            handle,
            foreign: false,
            private_node: true,
            kind,
            collision: CollisionResolution::default(),
            cancel: CancelToken::new(),
            temporary: false,
            tag: 0,
        }
    }

    /// Does this destination belong to the sync engine?
    pub fn sync_transfer(&self) -> bool {
        matches!(self.kind, FileKind::SyncDownload | FileKind::SyncUpload)
    }

    pub fn is_support_upload(&self) -> bool {
        self.kind == FileKind::SupportUpload
    }

    /// Vote on whether the owning transfer should keep retrying after
    /// failing with `e` for the `failcount`-th time.
    pub fn retry_vote(&self, e: Error, failcount: u32) -> bool {
        if self.sync_transfer() && e == Error::Args {
            // the sync engine resolves dangling targets itself; defer
            return true;
        }
        if matches!(e, Error::OverQuota | Error::Paywall) {
            // the account-wide cooldown governs; keep the transfer queued
            return true;
        }
        e.is_transient() && failcount < MAX_FILE_DEFERRALS
    }
}
