//! Per-transfer lifecycle.
//!
//! A transfer is identified by (direction, content fingerprint) and moves
//! through queued → active → completing/retrying → terminal states. This
//! module owns the failure policy (who votes, what defers, what kills), the
//! completion path (mtime, fingerprint verification, distribution to all
//! destinations), temporary-URL hygiene, and the byte-exact record format
//! used for crash recovery.

pub mod file;
pub mod list;
pub mod slot;

use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::app::{AppListener, NodeStore};
use crate::backoff::BackoffTimer;
use crate::cache::{CacheableReader, CacheableWriter, DbCommitter};
use crate::chunkmac::{ChunkMacMap, CHUNKMAC_BYTES};
use crate::config::{
    COMPLETION_RETRY_DS, MAX_FILE_DEFERRALS, RETRY_BACKOFF_MAX_DS, TEMPURL_TIMEOUT_TS,
};
use crate::distributor::{DistributeError, FileDistributor};
use crate::error::Error;
use crate::fingerprint::FileFingerprint;
use crate::fs::FileSystem;
use crate::raid::RAIDPARTS;
use crate::types::{Direction, Ds, NodeHandle, TransferState, NEVER, NODEHANDLE_BYTES};

use self::file::File;
use self::slot::TransferSlot;

/// Upload completion token width.
pub const UPLOADTOKEN_BYTES: usize = 36;

/// Current record format version.
const RECORD_VERSION: u8 = 1;

// expansion flag bits
const XF_NODE_HANDLE: u8 = 1 << 0;
const XF_DISCARDED_TEMPURLS: u8 = 1 << 1;
const XF_STRUCTURED_PATH: u8 = 1 << 2;

/// Services a transfer mutator needs from its surroundings.
pub struct TransferCtx<'a> {
    pub app: &'a mut dyn AppListener,
    pub fs: &'a mut dyn FileSystem,
    pub nodes: &'a mut dyn NodeStore,
    pub committer: &'a mut DbCommitter,
    pub now: Ds,
    /// Wall-clock seconds, for mtimes and URL expiry.
    pub now_ts: i64,
}

/// What `failed` decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailOutcome {
    /// False: the transfer is terminal and must be destroyed.
    pub deferred: bool,
    /// Engine-wide over-quota to activate: (timeleft, paywall).
    pub activate_overquota: Option<(Ds, bool)>,
}

/// What `complete` decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteOutcome {
    /// All destinations served; destroy as COMPLETED.
    Completed,
    /// Some destinations pending; completion will be retried.
    Pending,
    /// Completion failed; route through `failed` with this error.
    Failed(Error),
}

/// One queued or active transfer.
pub struct Transfer {
    pub direction: Direction,
    /// Download target (temp path) or upload source.
    pub localfilename: PathBuf,
    /// Content identity; also carries size and mtime.
    pub fingerprint: FileFingerprint,
    /// On-disk fingerprint recorded after a failed verification, so a
    /// repeat offender is surrendered instead of looping.
    pub badfp: FileFingerprint,
    pub filekey: [u8; 32],
    pub ctriv: i64,
    pub metamac: i64,
    pub transferkey: [u8; 16],
    pub chunkmacs: ChunkMacMap,
    pub ultoken: Option<[u8; UPLOADTOKEN_BYTES]>,
    /// One URL (single-source) or six (raided). Replaced atomically.
    pub tempurls: Vec<String>,
    pub state: TransferState,
    pub priority: u64,
    pub lastaccesstime: i64,
    /// Pre-resolved target node for downloads started from a handle.
    pub download_file_handle: NodeHandle,
    /// How many temp URLs were discarded by expiry (distinguishes a
    /// single-source resume later served as raided).
    pub discarded_tempurls: u8,
    /// Current byte position (contiguous from 0).
    pub pos: u64,
    /// Bytes in finished chunks.
    pub progresscompleted: u64,
    pub failcount: u32,
    pub files: Vec<File>,
    pub slot: Option<TransferSlot>,
    pub bt: BackoffTimer,
    /// Distributor shared across completion retries.
    pub distributor: Option<FileDistributor>,
    /// Cache record id, 0 until first persisted.
    pub dbid: u64,
    pub tag: u32,
}

impl Transfer {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            localfilename: PathBuf::new(),
            fingerprint: FileFingerprint::default(),
            badfp: FileFingerprint::default(),
            filekey: [0; 32],
            ctriv: 0,
            metamac: 0,
            transferkey: [0; 16],
            chunkmacs: ChunkMacMap::new(),
            ultoken: None,
            tempurls: Vec::new(),
            state: TransferState::None,
            priority: 0,
            lastaccesstime: 0,
            download_file_handle: NodeHandle::UNDEF,
            discarded_tempurls: 0,
            pos: 0,
            progresscompleted: 0,
            failcount: 0,
            files: Vec::new(),
            slot: None,
            bt: BackoffTimer::new(RETRY_BACKOFF_MAX_DS[direction.index()]),
            distributor: None,
            dbid: 0,
            tag: 0,
        }
    }

    pub fn size(&self) -> u64 {
        self.fingerprint.size
    }

    pub fn mtime(&self) -> i64 {
        self.fingerprint.mtime
    }

    pub fn is_raid(&self) -> bool {
        self.tempurls.len() == RAIDPARTS
    }

    /// Upload addressed to the support inbox?
    pub fn is_for_support(&self) -> bool {
        self.direction == Direction::Put
            && self.files.last().is_some_and(|f| f.is_support_upload())
    }

    // ── Progress ─────────────────────────────────────────────────────────

    /// Record chunk state and refresh position/progress accounting.
    pub fn chunk_finished(
        &mut self,
        offset: u64,
        mac: [u8; CHUNKMAC_BYTES],
        finished: bool,
        partial_bytes: u32,
        now_ts: i64,
    ) {
        self.chunkmacs.insert(offset, mac, finished, partial_bytes);
        let p = self.chunkmacs.calc_progress(self.size());
        self.pos = p.pos;
        self.progresscompleted = p.completed.min(self.size());
        self.lastaccesstime = now_ts;
    }

    // ── Temporary URL hygiene ────────────────────────────────────────────

    /// Discard stale temporary URLs: a download that never produced a byte,
    /// or any transfer whose URLs outlived their lease. Uploads lose their
    /// partial state with the URLs; downloads remember how many URLs they
    /// had so a later raided resume can realign.
    pub fn discard_expired_tempurls(&mut self, now_ts: i64) {
        if self.tempurls.is_empty() {
            return;
        }
        let expired = now_ts - self.lastaccesstime >= TEMPURL_TIMEOUT_TS;
        let no_data_download = self.direction == Direction::Get && self.pos == 0;
        if !expired && !no_data_download {
            return;
        }

        warn!(
            event = "tempurls_discarded",
            direction = ?self.direction,
            pos = self.pos,
            age = now_ts - self.lastaccesstime,
            count = self.tempurls.len(),
            "Discarding temporary URLs"
        );

        match self.direction {
            Direction::Get => {
                self.discarded_tempurls = self.tempurls.len() as u8;
            }
            Direction::Put => {
                self.chunkmacs.clear();
                self.progresscompleted = 0;
                self.ultoken = None;
                self.pos = 0;
            }
        }
        self.tempurls.clear();
    }

    /// A transfer that previously ran single-source and now resumes with
    /// six URLs must discard progress that is not stripe-aligned.
    pub fn adjust_progress_for_raid_resume(&mut self) {
        let from_single_to_raid = self.discarded_tempurls == 1 && self.is_raid();
        if !from_single_to_raid {
            return;
        }

        let mut realigned = ChunkMacMap::new();
        self.pos = self
            .chunkmacs
            .copy_entries_until_raidline_before_pos(self.pos, &mut realigned);
        self.chunkmacs = realigned;

        let p = self.chunkmacs.calc_progress(self.size());
        self.pos = p.pos;
        self.progresscompleted = p.completed.min(self.size());
        debug!(
            event = "raid_resume_realigned",
            pos = self.pos,
            completed = self.progresscompleted,
            partial = p.partial,
            "Realigned single-source progress to stripe boundary"
        );
        self.discarded_tempurls = 0;
    }

    // ── Cancellation ─────────────────────────────────────────────────────

    /// Drop files whose cancellation token fired.
    pub fn purge_cancelled_files(&mut self, app: &mut dyn AppListener) {
        let mut i = 0;
        while i < self.files.len() {
            if self.files[i].cancel.is_cancelled() {
                let f = self.files.remove(i);
                app.file_removed(&f, Error::Incomplete);
            } else {
                i += 1;
            }
        }
    }

    // ── Failure policy ───────────────────────────────────────────────────

    /// Transfer attempt failed: apply the policy table, let every attached
    /// file vote, and either defer with backoff or report terminal.
    pub fn failed(&mut self, e: Error, timeleft: Ds, ctx: &mut TransferCtx<'_>) -> FailOutcome {
        let mut defer = false;
        let mut activate_overquota = None;

        debug!(event = "transfer_failed", error = %e, timeleft, "Transfer failed");

        match e {
            Error::OverQuota | Error::Paywall => {
                let paywall = e == Error::Paywall;
                if self.slot.is_none() {
                    self.bt.backoff_for(ctx.now, if timeleft > 0 { timeleft } else { NEVER });
                    activate_overquota = Some((timeleft, paywall));
                    ctx.app.transfer_failed(self, e, timeleft);
                } else {
                    let all_foreign = self.files.iter().all(|f| f.foreign);
                    if timeleft == 0 && all_foreign {
                        // foreign-only targets with no bandwidth reprieve
                        ctx.app.transfer_failed(self, e, 0);
                    } else {
                        self.bt
                            .backoff_for(ctx.now, if timeleft > 0 { timeleft } else { NEVER });
                        activate_overquota = Some((timeleft, paywall));
                    }
                }
            }
            Error::Args
            | Error::SubUserKeyMissing => {
                ctx.app.transfer_failed(self, e, 0);
            }
            Error::Blocked | Error::TooMany { extra_info: true }
                if self.direction == Direction::Get =>
            {
                ctx.app.transfer_failed(self, e, 0);
            }
            Error::BusinessPastDue => {
                // no retry, no backoff: the account must be settled first
            }
            _ => {
                self.bt.backoff(ctx.now);
                self.state = TransferState::Retrying;
                ctx.app.transfer_failed(self, e, timeleft);
            }
        }

        // per-file pass: drop casualties, collect votes
        let storage_overquota = e == Error::OverQuota && timeleft == 0;
        let terminal_kind = e == Error::Args
            || e == Error::SubUserKeyMissing
            || (self.direction == Direction::Get
                && (e == Error::Blocked || e == Error::TooMany { extra_info: true }));

        let mut i = 0;
        while i < self.files.len() {
            let f = &self.files[i];

            if storage_overquota && f.foreign {
                let f = self.files.remove(i);
                ctx.app.file_removed(&f, e);
                continue;
            }

            if terminal_kind {
                if f.sync_transfer() && e == Error::Args {
                    // the action packet will remove the target; sync defers
                    defer = true;
                    i += 1;
                } else {
                    let f = self.files.remove(i);
                    ctx.app.file_removed(&f, e);
                }
                continue;
            }

            let votes_retry = f.retry_vote(e, self.failcount) && !e.is_fatal_for_transfer();
            let put_waiting_for_storage = e == Error::NotFound
                && self.direction == Direction::Put
                && self.tempurls.is_empty()
                && self.failcount < MAX_FILE_DEFERRALS;
            if votes_retry || put_waiting_for_storage {
                defer = true;
            }
            i += 1;
        }

        self.tempurls.clear();
        if self.direction == Direction::Put {
            self.chunkmacs.clear();
            self.progresscompleted = 0;
            self.ultoken = None;
            self.pos = 0;

            // a deferral is pointless if the source changed under us
            if let Some(slot) = &self.slot {
                if let Some(fa) = &slot.fa {
                    if fa.mtime() != self.mtime() || fa.size() != self.size() {
                        warn!(
                            event = "upload_source_modified",
                            size = self.size(),
                            mtime = self.mtime(),
                            fa_size = fa.size(),
                            fa_mtime = fa.mtime(),
                            "Modification detected during active upload"
                        );
                        defer = false;
                    }
                }
            }
        }

        if defer {
            self.failcount += 1;
            self.slot = None;
            self.serialize_to(ctx.committer);
            debug!(
                event = "transfer_deferred",
                failcount = self.failcount,
                retry_in_ds = self.bt.retryin(ctx.now),
                "Deferring transfer"
            );
        } else {
            info!(event = "transfer_surrendered", error = %e, "Removing transfer");
            self.state = TransferState::Failed;
        }

        FailOutcome {
            deferred: defer,
            activate_overquota,
        }
    }

    // ── Completion ───────────────────────────────────────────────────────

    /// All bytes moved: verify, place at destinations, notify. The caller
    /// destroys the transfer on `Completed`, reschedules on `Pending`, and
    /// routes `Failed` back through [`Self::failed`].
    pub fn complete(&mut self, ctx: &mut TransferCtx<'_>) -> CompleteOutcome {
        self.state = TransferState::Completing;
        ctx.app.transfer_update(self);

        match self.direction {
            Direction::Get => self.complete_download(ctx),
            Direction::Put => self.complete_upload(ctx),
        }
    }

    fn complete_download(&mut self, ctx: &mut TransferCtx<'_>) -> CompleteOutcome {
        debug!(
            event = "download_complete",
            files = self.files.len(),
            name = self.files.first().map(|f| f.name.as_str()).unwrap_or("NO_FILES"),
            "Download complete"
        );

        // release the slot's handle before touching the file
        if let Some(slot) = &mut self.slot {
            slot.fa = None;
        }

        let mut transient_error = false;
        let mtime_ok = match ctx.fs.set_mtime(&self.localfilename, self.mtime()) {
            Ok(()) => true,
            Err(e) => {
                transient_error = e == crate::fs::FsError::Transient;
                debug!(event = "setmtime_failed", transient = transient_error, "setmtime failed");
                false
            }
        };

        let syncxfer = self.files.iter().any(|f| f.sync_transfer());

        // a node whose stored fingerprint already diverges from ours means
        // the mismatch was fixed remotely; skip local verification
        let fixed_remotely = self.files.iter().any(|f| {
            ctx.nodes
                .fingerprint_of(f.handle)
                .is_some_and(|nfp| nfp.isvalid && !nfp.matches(&self.fingerprint))
        });

        let mut fixfingerprint = false;
        let mut disk_fp = None;
        if !fixed_remotely && mtime_ok {
            disk_fp = ctx.fs.fingerprint(&self.localfilename);
            if let Some(fp) = disk_fp {
                if self.fingerprint.isvalid && !self.fingerprint.matches(&fp) {
                    warn!(
                        event = "fingerprint_mismatch",
                        expected_size = self.size(),
                        disk_size = fp.size,
                        "Fingerprint mismatch on completed download"
                    );
                    if syncxfer && (!self.badfp.isvalid || !self.badfp.matches(&fp)) {
                        // first offence: remember and retry from scratch
                        self.badfp = fp;
                        self.chunkmacs.clear();
                        let _ = ctx.fs.unlink(&self.localfilename);
                        return CompleteOutcome::Failed(Error::Write);
                    }
                    // mtime setters on some filesystems silently fail;
                    // within their resolution, trust the content
                    if (self.mtime() - fp.mtime).abs() <= 2 {
                        fixfingerprint = true;
                    } else {
                        warn!(event = "setmtime_silent_failure", "Silent failure setting mtime");
                    }
                }
            } else if syncxfer {
                transient_error = true;
            }
        }

        if transient_error {
            return self.completion_pending(ctx);
        }

        // repair stale node fingerprints
        if let Some(fp) = disk_fp {
            if fp.isvalid {
                for f in &self.files {
                    if f.private_node && !f.foreign {
                        let node_fp = ctx.nodes.fingerprint_of(f.handle);
                        let stale = node_fp.map_or(false, |nfp| {
                            (!nfp.isvalid || fixfingerprint)
                                && !nfp.matches(&fp)
                                && fp.size == self.size()
                        });
                        if stale && ctx.nodes.queue_fingerprint_update(f.handle, &fp) {
                            debug!(event = "fingerprint_fix_queued", handle = %f.handle, "Queued fingerprint repair");
                        }
                    }
                }
            }
        }

        if self.distributor.is_none() {
            self.distributor = Some(FileDistributor::new(
                self.localfilename.clone(),
                self.files.len(),
                self.mtime(),
            ));
        }

        // place the artefact at every non-sync destination
        let mut i = 0;
        while i < self.files.len() {
            if self.files[i].sync_transfer() {
                // handed to the sync engine with the shared distributor
                let f = self.files.remove(i);
                ctx.app.file_complete(&f);
                continue;
            }

            let mut finalpath = self.files[i].localname.clone();
            let resolution = self.files[i].collision;
            let distributor = self.distributor.as_mut().expect("distributor exists");
            match distributor.distribute_to(&mut finalpath, ctx.fs, resolution) {
                Ok(()) => {
                    self.files[i].localname = finalpath;
                    let f = self.files.remove(i);
                    ctx.app.file_complete(&f);
                }
                Err(DistributeError::Transient) => {
                    debug!(event = "completion_transient", "Transient error completing file");
                    i += 1;
                }
                Err(err) => {
                    if self.files[i].retry_vote(Error::Again, self.failcount) {
                        self.failcount += 1;
                        debug!(
                            event = "completion_persistent_deferred",
                            failcount = self.failcount,
                            name_too_long = err == DistributeError::NameTooLong,
                            "Persistent error completing file"
                        );
                        i += 1;
                    } else {
                        let f = self.files.remove(i);
                        warn!(event = "completion_target_dropped", name = %f.name, "Unable to complete transfer target");
                        if let Some(d) = self.distributor.as_mut() {
                            d.remove_target();
                        }
                        ctx.app.file_removed(&f, Error::Write);
                    }
                }
            }
        }

        if self.files.is_empty() {
            self.distributor = None;
            self.state = TransferState::Completed;
            self.pos = self.size();
            self.progresscompleted = self.size();
            ctx.app.transfer_complete(self);
            CompleteOutcome::Completed
        } else {
            self.completion_pending(ctx)
        }
    }

    fn completion_pending(&mut self, ctx: &mut TransferCtx<'_>) -> CompleteOutcome {
        debug!(
            event = "completion_pending",
            files = self.files.len(),
            "Files pending completion, waiting for a retry"
        );
        if let Some(slot) = &mut self.slot {
            slot.fa = None;
            slot.retrying = true;
            slot.retrybt.backoff_for(ctx.now, COMPLETION_RETRY_DS);
        }
        CompleteOutcome::Pending
    }

    fn complete_upload(&mut self, ctx: &mut TransferCtx<'_>) -> CompleteOutcome {
        debug!(
            event = "upload_complete",
            files = self.files.len(),
            name = self.files.first().map(|f| f.name.as_str()).unwrap_or("NO_FILES"),
            "Upload complete"
        );

        if let Some(slot) = &mut self.slot {
            slot.fa = None;
        }

        // sources must not have changed during the upload
        let mut i = 0;
        while i < self.files.len() {
            let f = &self.files[i];
            let on_disk = ctx.fs.fingerprint(&f.localname);
            let missing = on_disk.is_none();
            let changed = on_disk.is_some_and(|fp| !fp.matches(&self.fingerprint));

            if (missing && !f.sync_transfer()) || changed {
                if missing {
                    warn!(event = "upload_source_deleted", name = %f.name, "Deletion detected after upload");
                } else {
                    warn!(event = "upload_source_changed", name = %f.name, "Modification detected after upload");
                }
                let f = self.files.remove(i);
                ctx.app.file_removed(&f, Error::Read);
                continue;
            }
            i += 1;
        }

        if self.files.is_empty() {
            return CompleteOutcome::Failed(Error::Read);
        }

        // hand over: every surviving file completes
        for f in self.files.drain(..) {
            ctx.app.file_complete(&f);
        }
        self.state = TransferState::Completed;
        self.pos = self.size();
        self.progresscompleted = self.size();
        ctx.app.transfer_complete(self);
        CompleteOutcome::Completed
    }

    // ── Serialisation ────────────────────────────────────────────────────

    /// Persist this transfer's record under the committer's batch.
    pub fn serialize_to(&mut self, committer: &mut DbCommitter) {
        if self.dbid != 0 {
            committer.put(self.dbid, self.serialize());
        }
    }

    /// Byte-exact crash-recovery record.
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = CacheableWriter::new();
        w.write_u8(self.direction as u8);
        w.write_string(&self.localfilename.to_string_lossy());
        w.write_bytes(&self.filekey);
        w.write_i64(self.ctriv);
        w.write_i64(self.metamac);
        w.write_bytes(&self.transferkey);
        self.chunkmacs.serialize(&mut w);
        self.fingerprint.serialize(&mut w);
        self.badfp.serialize(&mut w);
        w.write_i64(self.lastaccesstime);

        match &self.ultoken {
            Some(token) => {
                w.write_u8(2);
                w.write_bytes(token);
            }
            None => w.write_u8(0),
        }

        let combined = self.tempurls.join("\0");
        w.write_string(&combined);

        let persisted_state = if self.state == TransferState::Paused {
            TransferState::Paused
        } else {
            TransferState::None
        };
        w.write_u8(persisted_state as u8);
        w.write_u64(self.priority);

        w.write_u8(RECORD_VERSION);
        let mut flags = XF_STRUCTURED_PATH;
        if !self.download_file_handle.is_undef() {
            flags |= XF_NODE_HANDLE;
        }
        flags |= XF_DISCARDED_TEMPURLS;
        w.write_u8(flags);
        if !self.download_file_handle.is_undef() {
            w.write_bytes(&self.download_file_handle.to_bytes());
        }
        w.write_u8(self.discarded_tempurls);

        let record = w.into_bytes();

        // quick self-check: a record we write must read back identically
        // (skipped for URL sets the reader is specified to refuse)
        #[cfg(debug_assertions)]
        if matches!(self.tempurls.len(), 0 | 1 | RAIDPARTS) {
            let t = Transfer::unserialize(&record).expect("own record must round-trip");
            debug_assert_eq!(t.localfilename, self.localfilename);
            debug_assert_eq!(t.tempurls, self.tempurls);
            debug_assert_eq!(t.priority, self.priority);
            debug_assert_eq!(t.discarded_tempurls, self.discarded_tempurls);
        }

        record
    }

    /// Rebuild a transfer from a crash-recovery record.
    pub fn unserialize(data: &[u8]) -> Option<Transfer> {
        let mut r = CacheableReader::new(data);

        let direction = Direction::from_u8(r.read_u8()?)?;
        let localpath = r.read_string()?;

        let mut t = Transfer::new(direction);
        r.read_exact(&mut t.filekey)?;
        t.ctriv = r.read_i64()?;
        t.metamac = r.read_i64()?;
        r.read_exact(&mut t.transferkey)?;
        t.chunkmacs = ChunkMacMap::unserialize(&mut r)?;
        t.fingerprint = FileFingerprint::unserialize(&mut r)?;
        t.badfp = FileFingerprint::unserialize(&mut r)?;
        t.lastaccesstime = r.read_i64()?;

        let has_ultoken = r.read_u8()?;
        if has_ultoken != 0 && has_ultoken != 2 {
            warn!(event = "record_rejected", field = r.fieldnum(), "Bad upload token marker");
            return None;
        }
        if has_ultoken == 2 {
            let mut token = [0u8; UPLOADTOKEN_BYTES];
            r.read_exact(&mut token)?;
            t.ultoken = Some(token);
        }

        let combined = r.read_string()?;
        let state = r.read_u8()?;
        t.priority = r.read_u64()?;
        let version = r.read_u8()?;

        let mut flags = 0u8;
        if version > 0 {
            flags = r.read_u8()?;
            if flags & XF_NODE_HANDLE != 0 {
                let mut hb = [0u8; NODEHANDLE_BYTES];
                r.read_exact(&mut hb)?;
                t.download_file_handle = NodeHandle::from_bytes(hb);
            }
            if flags & XF_DISCARDED_TEMPURLS != 0 {
                t.discarded_tempurls = r.read_u8()?;
            }
        }
        if r.has_data_left() {
            warn!(event = "record_rejected", field = r.fieldnum(), "Trailing bytes in record");
            return None;
        }

        // flag bit 2 distinguishes structured paths from platform-encoded
        // ones; both decode to the same representation here
        let _ = flags & XF_STRUCTURED_PATH;
        t.localfilename = PathBuf::from(localpath);

        if !combined.is_empty() {
            t.tempurls = combined.split('\0').map(str::to_string).collect();
        }
        if !t.tempurls.is_empty() && t.tempurls.len() != 1 && t.tempurls.len() != RAIDPARTS {
            warn!(
                event = "record_rejected",
                urls = t.tempurls.len(),
                "Temp URL list has an invalid component count"
            );
            return None;
        }

        t.state = if TransferState::from_u8(state) == Some(TransferState::Paused) {
            TransferState::Paused
        } else {
            TransferState::None
        };

        let p = t.chunkmacs.calc_progress(t.size());
        t.pos = p.pos;
        t.progresscompleted = p.completed.min(t.size());

        Some(t)
    }
}

impl std::fmt::Debug for Transfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transfer")
            .field("direction", &self.direction)
            .field("size", &self.size())
            .field("state", &self.state)
            .field("priority", &self.priority)
            .field("files", &self.files.len())
            .field("failcount", &self.failcount)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::file::FileKind;
    use super::*;
    use crate::app::{NullListener, NullNodeStore};
    use crate::cache::DbCommitter;
    use crate::chunkmac::chunk_ceil;
    use crate::raid::RAIDLINE;
    use crate::testutil::{MockFileSystem, RecordingListener};

    fn sample_transfer(direction: Direction, size: u64) -> Transfer {
        let mut t = Transfer::new(direction);
        t.localfilename = PathBuf::from("/data/incoming/report.bin");
        t.fingerprint = FileFingerprint {
            size,
            mtime: 1_650_000_000,
            crc: [0x11, 0x22, 0x33, 0x44],
            isvalid: true,
        };
        t.filekey = [5u8; 32];
        t.ctriv = 42;
        t.metamac = -7;
        t.transferkey = [9u8; 16];
        t.priority = 0x8000_1000_0000;
        t.lastaccesstime = 1_650_000_100;
        t
    }

    fn ctx<'a>(
        app: &'a mut dyn AppListener,
        fs: &'a mut dyn FileSystem,
        nodes: &'a mut dyn NodeStore,
        committer: &'a mut DbCommitter,
    ) -> TransferCtx<'a> {
        TransferCtx {
            app,
            fs,
            nodes,
            committer,
            now: 100,
            now_ts: 1_650_000_200,
        }
    }

    // ── Serialisation ────────────────────────────────────────────────────

    #[test]
    fn test_record_roundtrip() {
        let mut t = sample_transfer(Direction::Put, 500_000);
        t.ultoken = Some([3u8; UPLOADTOKEN_BYTES]);
        t.chunkmacs.insert(0, [1u8; 16], true, 0);
        t.download_file_handle = NodeHandle(0xABCD_EF01_2345);
        t.discarded_tempurls = 1;
        t.state = TransferState::Paused;

        let back = Transfer::unserialize(&t.serialize()).unwrap();
        assert_eq!(back.direction, Direction::Put);
        assert_eq!(back.localfilename, t.localfilename);
        assert_eq!(back.filekey, t.filekey);
        assert_eq!(back.ctriv, 42);
        assert_eq!(back.metamac, -7);
        assert_eq!(back.transferkey, t.transferkey);
        assert_eq!(back.ultoken, t.ultoken);
        assert_eq!(back.priority, t.priority);
        assert_eq!(back.lastaccesstime, t.lastaccesstime);
        assert_eq!(back.download_file_handle, t.download_file_handle);
        assert_eq!(back.discarded_tempurls, 1);
        assert_eq!(back.state, TransferState::Paused);
        assert!(back.fingerprint == t.fingerprint);
        // progress recomputed from chunkmacs
        assert_eq!(back.pos, chunk_ceil(0, back.size()));
    }

    #[test]
    fn test_record_two_element_url_list() {
        // authoritative separator case: one '\0', two URLs
        let mut t = sample_transfer(Direction::Get, 1000);
        t.tempurls = vec![
            "http://gfs1.example.com/dl/a".to_string(),
            "http://gfs2.example.com/dl/b".to_string(),
        ];
        // two URLs is not a valid component count: record refused
        assert!(Transfer::unserialize(&t.serialize()).is_none());

        // but the parse itself must split on the separator: with six
        // entries the list survives byte-exactly
        t.tempurls = (0..6)
            .map(|i| format!("http://gfs{i}.example.com/dl/x"))
            .collect();
        let back = Transfer::unserialize(&t.serialize()).unwrap();
        assert_eq!(back.tempurls, t.tempurls);
    }

    #[test]
    fn test_record_single_url_roundtrip() {
        let mut t = sample_transfer(Direction::Get, 1000);
        t.tempurls = vec!["http://gfs1.example.com/dl/a".to_string()];
        let back = Transfer::unserialize(&t.serialize()).unwrap();
        assert_eq!(back.tempurls, t.tempurls);
    }

    #[test]
    fn test_record_active_state_clamped() {
        let mut t = sample_transfer(Direction::Get, 1000);
        t.state = TransferState::Active;
        let back = Transfer::unserialize(&t.serialize()).unwrap();
        assert_eq!(back.state, TransferState::None);
    }

    #[test]
    fn test_record_rejects_garbage() {
        assert!(Transfer::unserialize(&[]).is_none());
        assert!(Transfer::unserialize(&[7, 0, 0]).is_none());

        let t = sample_transfer(Direction::Get, 10);
        let mut record = t.serialize();
        record.push(0); // trailing byte
        assert!(Transfer::unserialize(&record).is_none());
    }

    // ── Temp URL expiry ──────────────────────────────────────────────────

    #[test]
    fn test_download_tempurl_discarded_without_data() {
        let mut t = sample_transfer(Direction::Get, 1000);
        t.tempurls = vec!["http://gfs1.example.com/dl/a".into()];
        t.lastaccesstime = 1_000;
        t.pos = 0;

        t.discard_expired_tempurls(1_000 + 1);
        assert!(t.tempurls.is_empty(), "no data downloaded: URL dropped");
        assert_eq!(t.discarded_tempurls, 1);
    }

    #[test]
    fn test_download_tempurl_kept_while_fresh() {
        let mut t = sample_transfer(Direction::Get, 1000);
        t.tempurls = vec!["http://gfs1.example.com/dl/a".into()];
        t.lastaccesstime = 1_000;
        t.pos = 100; // bytes flowed

        t.discard_expired_tempurls(1_000 + 10);
        assert_eq!(t.tempurls.len(), 1);
    }

    #[test]
    fn test_upload_tempurl_expiry_clears_partial_state() {
        let mut t = sample_transfer(Direction::Put, 1000);
        t.tempurls = vec!["http://ul.example.com/u/a".into()];
        t.ultoken = Some([1u8; UPLOADTOKEN_BYTES]);
        t.chunkmacs.insert(0, [1u8; 16], true, 0);
        t.pos = 500;
        t.progresscompleted = 500;
        t.lastaccesstime = 1_000;

        t.discard_expired_tempurls(1_000 + TEMPURL_TIMEOUT_TS);
        assert!(t.tempurls.is_empty());
        assert!(t.ultoken.is_none());
        assert!(t.chunkmacs.is_empty());
        assert_eq!(t.pos, 0);
        assert_eq!(t.progresscompleted, 0);
    }

    // ── RAID resume realignment ──────────────────────────────────────────

    #[test]
    fn test_raid_resume_discards_unaligned_progress() {
        let mut t = sample_transfer(Direction::Get, 10_000_000);
        t.discarded_tempurls = 1;
        t.tempurls = (0..6).map(|i| format!("http://gfs{i}.example.com/p")).collect();
        t.chunkmacs.insert(0, [1u8; 16], true, 0);
        t.pos = chunk_ceil(0, t.size()) + 37; // past the chunk, unaligned

        t.adjust_progress_for_raid_resume();
        assert_eq!(t.pos % RAIDLINE, 0);
        assert_eq!(t.discarded_tempurls, 0);
        assert!(t.progresscompleted <= t.size());
    }

    // ── Failure policy ───────────────────────────────────────────────────

    #[test]
    fn test_transient_failure_defers_with_backoff() {
        let mut t = sample_transfer(Direction::Get, 1000);
        t.files.push(File::new(
            "a".into(),
            PathBuf::from("/t/a"),
            NodeHandle(1),
            FileKind::Download,
        ));

        let mut app = RecordingListener::default();
        let mut fs = MockFileSystem::new();
        let mut nodes = NullNodeStore;
        let mut committer = DbCommitter::default();
        let mut c = ctx(&mut app, &mut fs, &mut nodes, &mut committer);

        let out = t.failed(Error::Again, 0, &mut c);
        assert!(out.deferred);
        assert_eq!(t.state, TransferState::Retrying);
        assert_eq!(t.failcount, 1);
        assert!(t.slot.is_none());
        assert!(!t.bt.armed(100), "backoff scheduled");
        assert_eq!(app.failed.len(), 1);
    }

    #[test]
    fn test_fatal_failure_terminal() {
        let mut t = sample_transfer(Direction::Get, 1000);
        t.files.push(File::new(
            "a".into(),
            PathBuf::from("/t/a"),
            NodeHandle(1),
            FileKind::Download,
        ));

        let mut app = RecordingListener::default();
        let mut fs = MockFileSystem::new();
        let mut nodes = NullNodeStore;
        let mut committer = DbCommitter::default();
        let mut c = ctx(&mut app, &mut fs, &mut nodes, &mut committer);

        let out = t.failed(Error::BusinessPastDue, 0, &mut c);
        assert!(!out.deferred);
        assert_eq!(t.state, TransferState::Failed);
    }

    #[test]
    fn test_args_drops_plain_files_immediately() {
        let mut t = sample_transfer(Direction::Get, 1000);
        t.files.push(File::new(
            "a".into(),
            PathBuf::from("/t/a"),
            NodeHandle(1),
            FileKind::Download,
        ));

        let mut app = RecordingListener::default();
        let mut fs = MockFileSystem::new();
        let mut nodes = NullNodeStore;
        let mut committer = DbCommitter::default();
        let mut c = ctx(&mut app, &mut fs, &mut nodes, &mut committer);

        let out = t.failed(Error::Args, 0, &mut c);
        assert!(!out.deferred);
        assert!(t.files.is_empty());
        assert_eq!(app.file_removed.len(), 1);
    }

    #[test]
    fn test_overquota_activates_engine_state() {
        let mut t = sample_transfer(Direction::Get, 1000);
        t.files.push(File::new(
            "a".into(),
            PathBuf::from("/t/a"),
            NodeHandle(1),
            FileKind::Download,
        ));

        let mut app = RecordingListener::default();
        let mut fs = MockFileSystem::new();
        let mut nodes = NullNodeStore;
        let mut committer = DbCommitter::default();
        let mut c = ctx(&mut app, &mut fs, &mut nodes, &mut committer);

        let out = t.failed(Error::OverQuota, 600, &mut c);
        assert_eq!(out.activate_overquota, Some((600, false)));
        assert!(!t.bt.armed(100));
    }

    // ── Upload source modified during transfer ───────────────────────────

    #[test]
    fn test_put_modified_during_upload_not_deferred() {
        let mut t = sample_transfer(Direction::Put, 1000);
        t.files.push(File::new(
            "a".into(),
            PathBuf::from("/src/a"),
            NodeHandle(1),
            FileKind::Download,
        ));

        let mut fs = MockFileSystem::new();
        // the open handle observed a different mtime than the fingerprint
        let fa = fs.make_access(1000, t.mtime() + 50);
        t.slot = Some(TransferSlot::new(Some(fa), 0, 36_000));

        let mut app = RecordingListener::default();
        let mut nodes = NullNodeStore;
        let mut committer = DbCommitter::default();
        let mut c = ctx(&mut app, &mut fs, &mut nodes, &mut committer);

        let out = t.failed(Error::Again, 0, &mut c);
        assert!(!out.deferred, "mtime change aborts the deferral");
        assert_eq!(t.state, TransferState::Failed);
    }

    #[test]
    fn test_put_unchanged_source_defers() {
        let mut t = sample_transfer(Direction::Put, 1000);
        t.files.push(File::new(
            "a".into(),
            PathBuf::from("/src/a"),
            NodeHandle(1),
            FileKind::Download,
        ));

        let mut fs = MockFileSystem::new();
        let fa = fs.make_access(t.size(), t.mtime());
        t.slot = Some(TransferSlot::new(Some(fa), 0, 36_000));
        t.ultoken = Some([1u8; UPLOADTOKEN_BYTES]);

        let mut app = RecordingListener::default();
        let mut nodes = NullNodeStore;
        let mut committer = DbCommitter::default();
        let mut c = ctx(&mut app, &mut fs, &mut nodes, &mut committer);

        let out = t.failed(Error::Again, 0, &mut c);
        assert!(out.deferred);
        assert!(t.ultoken.is_none(), "PUT deferral clears the upload token");
        assert!(t.chunkmacs.is_empty());
        assert_eq!(t.pos, 0);
    }

    // ── Completion: download fingerprint verification ────────────────────

    fn download_with_sync_file(fs: &mut MockFileSystem, content: &[u8]) -> Transfer {
        let mut t = sample_transfer(Direction::Get, content.len() as u64);
        t.localfilename = PathBuf::from("/dl/part.0");
        fs.put_file("/dl/part.0", content, 1_650_000_000);
        // transfer fingerprint intentionally differs from on-disk content
        t.fingerprint.crc = [0xdead, 0xbeef, 0xcafe, 0xf00d];
        t.fingerprint.size = content.len() as u64;
        let mut f = File::new(
            "s".into(),
            PathBuf::from("/sync/s"),
            NodeHandle(1),
            FileKind::SyncDownload,
        );
        f.private_node = false;
        t.files.push(f);
        t
    }

    #[test]
    fn test_mac_mismatch_sets_badfp_then_surrenders() {
        let mut fs = MockFileSystem::new();
        let mut t = download_with_sync_file(&mut fs, b"actual content");

        let mut app = RecordingListener::default();
        let mut nodes = NullNodeStore;
        let mut committer = DbCommitter::default();

        // first completion: mismatch recorded, EWRITE requested
        let disk_fp = {
            let mut c = ctx(&mut app, &mut fs, &mut nodes, &mut committer);
            let out = t.complete(&mut c);
            assert_eq!(out, CompleteOutcome::Failed(Error::Write));
            t.badfp
        };
        assert!(disk_fp.isvalid, "bad fingerprint remembered");

        // the file reappears with the same wrong content
        fs.put_file("/dl/part.0", b"actual content", 1_650_000_000);
        let mut c = ctx(&mut app, &mut fs, &mut nodes, &mut committer);
        let out = t.complete(&mut c);
        assert_ne!(
            out,
            CompleteOutcome::Failed(Error::Write),
            "same badfp twice: no more EWRITE loops"
        );
    }

    #[test]
    fn test_mtime_tolerance_marks_fixfingerprint() {
        let mut fs = MockFileSystem::new();
        let content = b"stable bytes";
        let mut t = sample_transfer(Direction::Get, content.len() as u64);
        t.localfilename = PathBuf::from("/dl/part.1");
        fs.put_file("/dl/part.1", content, t.mtime() + 1); // within 2s
        fs.silent_mtime_failure = true;
        t.fingerprint.crc = [1, 2, 3, 9]; // differs from disk

        t.files.push(File::new(
            "f".into(),
            PathBuf::from("/out/f"),
            NodeHandle(2),
            FileKind::Download,
        ));

        let mut app = RecordingListener::default();
        let mut nodes = NullNodeStore;
        let mut committer = DbCommitter::default();
        let mut c = ctx(&mut app, &mut fs, &mut nodes, &mut committer);

        // non-sync transfer with |Δmtime| <= 2: presumed silent mtime
        // failure, completion proceeds
        let out = t.complete(&mut c);
        assert_eq!(out, CompleteOutcome::Completed);
        assert_eq!(app.file_complete.len(), 1);
    }

    #[test]
    fn test_download_distributes_and_completes() {
        let mut fs = MockFileSystem::new();
        let content = b"downloaded payload";
        let mut t = sample_transfer(Direction::Get, content.len() as u64);
        t.localfilename = PathBuf::from("/dl/part.2");
        fs.put_file("/dl/part.2", content, t.mtime());
        t.fingerprint = fs.fingerprint(&PathBuf::from("/dl/part.2")).unwrap();

        t.files.push(File::new(
            "a".into(),
            PathBuf::from("/out/a"),
            NodeHandle(2),
            FileKind::Download,
        ));
        t.files.push(File::new(
            "b".into(),
            PathBuf::from("/out/b"),
            NodeHandle(3),
            FileKind::Download,
        ));

        let mut app = RecordingListener::default();
        let mut nodes = NullNodeStore;
        let mut committer = DbCommitter::default();
        let mut c = ctx(&mut app, &mut fs, &mut nodes, &mut committer);

        let out = t.complete(&mut c);
        assert_eq!(out, CompleteOutcome::Completed);
        assert_eq!(t.state, TransferState::Completed);
        assert_eq!(app.file_complete.len(), 2);
        assert_eq!(app.transfer_complete, 1);
        assert_eq!(fs.read_file("/out/a").unwrap(), content.to_vec());
        assert_eq!(fs.read_file("/out/b").unwrap(), content.to_vec());
    }

    #[test]
    fn test_upload_source_changed_fails_with_eread() {
        let mut fs = MockFileSystem::new();
        let mut t = sample_transfer(Direction::Put, 100);
        let mut f = File::new(
            "u".into(),
            PathBuf::from("/src/u"),
            NodeHandle(2),
            FileKind::Download,
        );
        f.localname = PathBuf::from("/src/u");
        t.files.push(f);
        fs.put_file("/src/u", b"changed after upload", t.mtime());
        // fingerprint no longer matches /src/u
        t.fingerprint.crc = [7, 7, 7, 7];
        t.fingerprint.size = 100;

        let mut app = RecordingListener::default();
        let mut nodes = NullNodeStore;
        let mut committer = DbCommitter::default();
        let mut c = ctx(&mut app, &mut fs, &mut nodes, &mut committer);

        let out = t.complete(&mut c);
        assert_eq!(out, CompleteOutcome::Failed(Error::Read));
        assert!(t.files.is_empty());
    }

    // ── Cancellation sweep ───────────────────────────────────────────────

    #[test]
    fn test_purge_cancelled_files() {
        let mut t = sample_transfer(Direction::Get, 100);
        let keep = File::new("k".into(), PathBuf::from("/k"), NodeHandle(1), FileKind::Download);
        let drop_me = File::new("d".into(), PathBuf::from("/d"), NodeHandle(2), FileKind::Download);
        drop_me.cancel.cancel();
        t.files.push(keep);
        t.files.push(drop_me);

        let mut app = RecordingListener::default();
        t.purge_cancelled_files(&mut app);
        assert_eq!(t.files.len(), 1);
        assert_eq!(t.files[0].name, "k");
        assert_eq!(app.file_removed.len(), 1);
    }

    #[test]
    fn test_chunk_finished_updates_progress() {
        let mut t = sample_transfer(Direction::Get, 1 << 20);
        t.chunk_finished(0, [1u8; 16], true, 0, 1_650_000_300);
        assert_eq!(t.pos, chunk_ceil(0, t.size()));
        assert_eq!(t.progresscompleted, t.pos);
        assert_eq!(t.lastaccesstime, 1_650_000_300);
        assert!(t.progresscompleted <= t.size());
    }

    #[test]
    fn test_zero_size_transfer_completes_in_one_pass() {
        let mut fs = MockFileSystem::new();
        let mut t = sample_transfer(Direction::Get, 0);
        t.localfilename = PathBuf::from("/dl/empty");
        fs.put_file("/dl/empty", b"", t.mtime());
        t.fingerprint = fs.fingerprint(&PathBuf::from("/dl/empty")).unwrap();
        t.files.push(File::new(
            "e".into(),
            PathBuf::from("/out/e"),
            NodeHandle(2),
            FileKind::Download,
        ));

        let mut app = NullListener;
        let mut nodes = NullNodeStore;
        let mut committer = DbCommitter::default();
        let mut c = ctx(&mut app, &mut fs, &mut nodes, &mut committer);

        assert_eq!(t.complete(&mut c), CompleteOutcome::Completed);
        assert_eq!(t.state, TransferState::Completed);
        assert_eq!(t.progresscompleted, t.size());
    }
}
