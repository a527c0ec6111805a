//! The transfer engine facade.
//!
//! Owns the priority queues, the crash-recovery cache, the streaming
//! engine, and the external contracts (filesystem, node store, listener).
//! Every public mutator batches its cache writes under one committer and
//! commits on the way out, so the persisted state always moves in
//! consistent steps.

use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::app::{AppListener, NodeStore};
use crate::cache::{DbCommitter, TransferCache};
use crate::config::EngineConfig;
use crate::error::Error;
use crate::fingerprint::FileFingerprint;
use crate::fs::FileSystem;
use crate::stream::StreamingEngine;
use crate::transfer::file::File;
use crate::transfer::list::{ListCtx, TransferId, TransferList};
use crate::transfer::slot::TransferSlot;
use crate::transfer::{CompleteOutcome, Transfer, TransferCtx};
use crate::types::{Direction, Ds, TransferState};

/// Account-wide quota condition.
#[derive(Debug, Clone, Copy, Default)]
struct OverquotaState {
    until: Ds,
    paywalled: bool,
    /// Storage in the red: upload dispatch is held.
    storage_red: bool,
}

pub struct TransferEngine {
    pub config: EngineConfig,
    lists: TransferList,
    cache: TransferCache,
    fs: Box<dyn FileSystem>,
    app: Box<dyn AppListener>,
    nodes: Box<dyn NodeStore>,
    streaming: StreamingEngine,
    overquota: OverquotaState,
    now: Ds,
    now_ts: i64,
}

impl TransferEngine {
    pub fn new(
        config: EngineConfig,
        fs: Box<dyn FileSystem>,
        app: Box<dyn AppListener>,
        nodes: Box<dyn NodeStore>,
    ) -> Self {
        let streaming = StreamingEngine::new(&config);
        Self {
            config,
            lists: TransferList::new(),
            cache: TransferCache::ephemeral(),
            fs,
            app,
            nodes,
            streaming,
            overquota: OverquotaState::default(),
            now: 0,
            now_ts: 0,
        }
    }

    /// Attach a persistent cache and requeue every surviving record.
    pub fn open_cache(&mut self, path: PathBuf) -> anyhow::Result<usize> {
        self.cache = TransferCache::open(path)?;
        let records: Vec<(u64, Vec<u8>)> = self
            .cache
            .records()
            .map(|(dbid, r)| (*dbid, r.clone()))
            .collect();
        let mut committer = DbCommitter::default();
        let mut restored = 0;

        for (dbid, record) in records {
            match Transfer::unserialize(&record) {
                Some(mut t) => {
                    // the record keeps its store slot across restarts
                    t.dbid = dbid;
                    let mut ctx = ListCtx {
                        committer: &mut committer,
                        cache: &mut self.cache,
                        app: &mut *self.app,
                        now: self.now,
                        storage_red: self.overquota.storage_red,
                    };
                    self.lists.add_transfer(t, false, &mut ctx);
                    restored += 1;
                }
                None => {
                    warn!(event = "cache_record_dropped", "Dropping unreadable cache record");
                    committer.del(dbid);
                }
            }
        }
        self.cache.commit(committer);
        info!(event = "transfer_cache_restored", restored, "Requeued cached transfers");
        Ok(restored)
    }

    pub fn transfers(&self) -> &TransferList {
        &self.lists
    }

    pub fn transfers_mut(&mut self) -> &mut TransferList {
        &mut self.lists
    }

    pub fn streaming(&mut self) -> &mut StreamingEngine {
        &mut self.streaming
    }

    // ── Admission ────────────────────────────────────────────────────────

    /// Queue a transfer for `file`. An existing transfer with the same
    /// identity (direction + fingerprint) absorbs the file instead of
    /// duplicating work.
    pub fn start_transfer(
        &mut self,
        direction: Direction,
        fingerprint: FileFingerprint,
        localfilename: PathBuf,
        file: File,
        start_first: bool,
    ) -> TransferId {
        if let Some(id) = self.lists.lookup(direction, &fingerprint) {
            let t = self.lists.get_mut(id).expect("looked-up transfer exists");
            t.files.push(file);
            let t = self.lists.get(id).expect("transfer exists");
            self.app.transfer_update(t);
            debug!(event = "transfer_coalesced", "File attached to existing transfer");
            return id;
        }

        let mut t = Transfer::new(direction);
        t.fingerprint = fingerprint;
        t.localfilename = localfilename;
        t.lastaccesstime = self.now_ts;
        t.files.push(file);

        let mut committer = DbCommitter::default();
        let mut ctx = ListCtx {
            committer: &mut committer,
            cache: &mut self.cache,
            app: &mut *self.app,
            now: self.now,
            storage_red: self.overquota.storage_red,
        };
        let id = self.lists.add_transfer(t, start_first, &mut ctx);
        self.cache.commit(committer);

        let t = self.lists.get(id).expect("admitted transfer exists");
        self.app.transfer_update(t);
        id
    }

    pub fn pause_transfer(&mut self, id: TransferId, paused: bool) -> Result<(), Error> {
        let mut committer = DbCommitter::default();
        let mut ctx = ListCtx {
            committer: &mut committer,
            cache: &mut self.cache,
            app: &mut *self.app,
            now: self.now,
            storage_red: self.overquota.storage_red,
        };
        let result = self.lists.pause(id, paused, &mut ctx);
        self.cache.commit(committer);
        result
    }

    pub fn move_transfer_to_first(&mut self, id: TransferId) {
        let mut committer = DbCommitter::default();
        let mut ctx = ListCtx {
            committer: &mut committer,
            cache: &mut self.cache,
            app: &mut *self.app,
            now: self.now,
            storage_red: self.overquota.storage_red,
        };
        self.lists.move_to_first(id, &mut ctx);
        self.cache.commit(committer);
    }

    pub fn move_transfer_to_last(&mut self, id: TransferId) {
        let mut committer = DbCommitter::default();
        let mut ctx = ListCtx {
            committer: &mut committer,
            cache: &mut self.cache,
            app: &mut *self.app,
            now: self.now,
            storage_red: self.overquota.storage_red,
        };
        self.lists.move_to_last(id, &mut ctx);
        self.cache.commit(committer);
    }

    pub fn move_transfer_before(&mut self, id: TransferId, before: TransferId) {
        let mut committer = DbCommitter::default();
        let mut ctx = ListCtx {
            committer: &mut committer,
            cache: &mut self.cache,
            app: &mut *self.app,
            now: self.now,
            storage_red: self.overquota.storage_red,
        };
        self.lists.move_before(id, before, &mut ctx);
        self.cache.commit(committer);
    }

    // ── Quota state ──────────────────────────────────────────────────────

    /// Account-wide quota stop: holds same-direction dispatch until the
    /// deadline passes (or indefinitely for a paywall).
    pub fn activate_overquota(&mut self, timeleft: Ds, paywall: bool) {
        warn!(event = "overquota_activated", timeleft, paywall, "Account over quota");
        self.overquota.paywalled = paywall;
        if timeleft > 0 {
            // bandwidth flavour: downloads wait out the window
            self.overquota.until = self.now + timeleft;
        } else {
            // storage flavour: uploads blocked until the account changes
            self.overquota.storage_red = true;
        }
    }

    /// The storage/bandwidth condition cleared (plan upgrade, window end).
    pub fn clear_overquota(&mut self) {
        self.overquota = OverquotaState::default();
    }

    fn direction_blocked(&self, direction: Direction) -> bool {
        if self.overquota.paywalled {
            return true;
        }
        match direction {
            Direction::Get => self.now < self.overquota.until,
            Direction::Put => self.overquota.storage_red,
        }
    }

    // ── Scheduling ───────────────────────────────────────────────────────

    /// Advance engine time, expire temp URLs, retry pending completions,
    /// and dispatch ready transfers into free slots.
    pub fn tick(&mut self, now: Ds, now_ts: i64) {
        self.now = now;
        self.now_ts = now_ts;

        if self.overquota.until != 0 && now >= self.overquota.until && !self.overquota.paywalled {
            self.overquota.until = 0;
        }

        self.expire_tempurls();
        self.retry_pending_completions();
        self.dispatch();
    }

    /// Drop stale temporary URLs on queued transfers.
    fn expire_tempurls(&mut self) {
        let now_ts = self.now_ts;
        let ids: Vec<TransferId> = [Direction::Get, Direction::Put]
            .into_iter()
            .flat_map(|d| self.lists.iter(d).collect::<Vec<_>>())
            .collect();
        for id in ids {
            if let Some(t) = self.lists.get_mut(id) {
                if t.slot.is_none() {
                    t.discard_expired_tempurls(now_ts);
                }
            }
        }
    }

    fn retry_pending_completions(&mut self) {
        let now = self.now;
        let ids: Vec<TransferId> = [Direction::Get, Direction::Put]
            .into_iter()
            .flat_map(|d| self.lists.iter(d).collect::<Vec<_>>())
            .filter(|id| {
                self.lists.get(*id).is_some_and(|t| {
                    t.slot
                        .as_ref()
                        .is_some_and(|s| s.retrying && s.retrybt.armed(now))
                })
            })
            .collect();
        for id in ids {
            debug!(event = "completion_retry", "Retrying pending completion");
            self.transfer_complete(id);
        }
    }

    /// Fill free slots with the highest-priority ready transfers.
    fn dispatch(&mut self) {
        let mut active = [0usize; 2];
        for d in [Direction::Get, Direction::Put] {
            active[d.index()] = self
                .lists
                .iter(d)
                .filter(|id| self.lists.get(*id).is_some_and(|t| t.slot.is_some()))
                .count();
        }
        let max = self.config.max_active_transfers;
        let mut budget = [
            max.saturating_sub(active[0]),
            max.saturating_sub(active[1]),
        ];
        let blocked = [
            self.direction_blocked(Direction::Get),
            self.direction_blocked(Direction::Put),
        ];

        let mut committer = DbCommitter::default();
        let buckets = {
            let mut ctx = ListCtx {
                committer: &mut committer,
                cache: &mut self.cache,
                app: &mut *self.app,
                now: self.now,
                storage_red: self.overquota.storage_red,
            };
            let mut continue_fn = |t: &Transfer| {
                let d = t.direction.index();
                if budget[d] > 0 && !blocked[d] {
                    budget[d] -= 1;
                    true
                } else {
                    false
                }
            };
            let mut direction_fn = |d: Direction| !blocked[d.index()];
            self.lists
                .next_transfers(&mut continue_fn, &mut direction_fn, &mut ctx)
        };

        for id in buckets.into_iter().flatten() {
            self.start_slot(id, &mut committer);
        }
        self.cache.commit(committer);
    }

    fn start_slot(&mut self, id: TransferId, committer: &mut DbCommitter) {
        let now = self.now;
        let Some(t) = self.lists.get_mut(id) else {
            return;
        };

        // pin the upload source so later mutation is detectable
        let fa = match t.direction {
            Direction::Put => match self.fs.open(&t.localfilename) {
                Ok(fa) => Some(fa),
                Err(_) => {
                    warn!(event = "upload_source_unreadable", "Upload source cannot be opened");
                    None
                }
            },
            Direction::Get => None,
        };

        t.slot = Some(TransferSlot::new(
            fa,
            now,
            crate::config::RETRY_BACKOFF_MAX_DS[t.direction.index()],
        ));
        t.state = TransferState::Active;
        t.serialize_to(committer);
        let t = self.lists.get(id).expect("dispatched transfer exists");
        self.app.transfer_update(t);
        debug!(event = "transfer_activated", priority = t.priority, "Slot assigned");
    }

    // ── Transport feedback ───────────────────────────────────────────────

    /// Fresh temporary URLs arrived for an active transfer.
    pub fn tempurls_received(&mut self, id: TransferId, urls: Vec<String>) {
        let now_ts = self.now_ts;
        let mut committer = DbCommitter::default();
        if let Some(t) = self.lists.get_mut(id) {
            t.tempurls = urls;
            t.lastaccesstime = now_ts;
            t.adjust_progress_for_raid_resume();
            t.serialize_to(&mut committer);
        }
        self.cache.commit(committer);
    }

    /// A transfer attempt failed; apply policy, defer or destroy.
    pub fn transfer_failed(&mut self, id: TransferId, e: Error, timeleft: Ds) {
        let mut committer = DbCommitter::default();
        self.transfer_failed_inner(id, e, timeleft, &mut committer);
        self.cache.commit(committer);
    }

    fn transfer_failed_inner(
        &mut self,
        id: TransferId,
        e: Error,
        timeleft: Ds,
        committer: &mut DbCommitter,
    ) {
        let now = self.now;
        let now_ts = self.now_ts;
        let Some(t) = self.lists.get_mut(id) else {
            return;
        };

        let outcome = {
            let mut ctx = TransferCtx {
                app: &mut *self.app,
                fs: &mut *self.fs,
                nodes: &mut *self.nodes,
                committer,
                now,
                now_ts,
            };
            t.failed(e, timeleft, &mut ctx)
        };

        if let Some((left, paywall)) = outcome.activate_overquota {
            self.activate_overquota(left, paywall);
        }
        if !outcome.deferred {
            self.destroy_transfer(id, e, committer);
        }
    }

    /// All bytes are on the wire/disk: verify and finish.
    pub fn transfer_complete(&mut self, id: TransferId) {
        let now = self.now;
        let now_ts = self.now_ts;
        let mut committer = DbCommitter::default();

        let Some(t) = self.lists.get_mut(id) else {
            return;
        };
        let outcome = {
            let mut ctx = TransferCtx {
                app: &mut *self.app,
                fs: &mut *self.fs,
                nodes: &mut *self.nodes,
                committer: &mut committer,
                now,
                now_ts,
            };
            t.complete(&mut ctx)
        };

        match outcome {
            CompleteOutcome::Completed => {
                let t = self.lists.remove(id).expect("completed transfer exists");
                if t.dbid != 0 {
                    committer.del(t.dbid);
                }
                if t.direction == Direction::Get && !t.localfilename.as_os_str().is_empty() {
                    let _ = self.fs.unlink(&t.localfilename);
                }
                info!(event = "transfer_completed", "Transfer completed");
            }
            CompleteOutcome::Pending => {
                if let Some(t) = self.lists.get_mut(id) {
                    t.serialize_to(&mut committer);
                }
            }
            CompleteOutcome::Failed(err) => {
                self.transfer_failed_inner(id, err, 0, &mut committer);
            }
        }
        self.cache.commit(committer);
    }

    /// Cancel one destination; the transfer dies with its last file.
    pub fn cancel_transfer(&mut self, id: TransferId) {
        let Some(t) = self.lists.get(id) else {
            return;
        };
        for f in &t.files {
            f.cancel.cancel();
        }
        // the cancellation sweep in the next dispatch pass reaps it
    }

    fn destroy_transfer(&mut self, id: TransferId, e: Error, committer: &mut DbCommitter) {
        let Some(mut t) = self.lists.remove(id) else {
            return;
        };
        for f in t.files.drain(..) {
            self.app.file_removed(&f, e);
        }
        self.app.transfer_removed(&t);
        if t.dbid != 0 {
            committer.del(t.dbid);
        }
        if t.direction == Direction::Get && !t.localfilename.as_os_str().is_empty() {
            let _ = self.fs.unlink(&t.localfilename);
        }
    }
}
