//! Priority-ordered transfer queues.
//!
//! One ordered sequence per direction. Priorities are 64-bit values handed
//! out in `PRIORITY_STEP` strides on admission; moves bisect the gap
//! between neighbours and renumber the prefix when a bisection collides.
//! Entries are tombstoned rather than erased in place, so the consumer may
//! delete transfers while a traversal is in flight; the next full
//! traversal compacts.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::app::AppListener;
use crate::cache::{DbCommitter, TransferCache};
use crate::config::{PRIORITY_START, PRIORITY_STEP};
use crate::error::Error;
use crate::types::{Direction, Ds, TransferCategory, TransferState};

use super::Transfer;

/// Arena id of a queued transfer.
pub type TransferId = u64;

/// Scheduler result: six (direction × size) buckets; indices follow
/// [`TransferCategory::index`].
pub type NextTransfers = [Vec<TransferId>; 6];

/// Services list mutators need from the engine.
pub struct ListCtx<'a> {
    pub committer: &'a mut DbCommitter,
    pub cache: &'a mut TransferCache,
    pub app: &'a mut dyn AppListener,
    pub now: Ds,
    /// Storage is in the red: paused/displaced upload slots must not re-arm.
    pub storage_red: bool,
}

impl ListCtx<'_> {
    fn cache_add(&mut self, t: &mut Transfer) {
        if t.dbid == 0 {
            t.dbid = self.cache.assign_dbid();
        }
        t.serialize_to(self.committer);
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    priority: u64,
    id: TransferId,
    erased: bool,
}

/// The per-direction ordered queues and the arena that owns every
/// [`Transfer`].
pub struct TransferList {
    entries: [Vec<Entry>; 2],
    transfers: HashMap<TransferId, Transfer>,
    currentpriority: u64,
    next_id: TransferId,
}

impl Default for TransferList {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferList {
    pub fn new() -> Self {
        Self {
            entries: [Vec::new(), Vec::new()],
            transfers: HashMap::new(),
            currentpriority: PRIORITY_START,
            next_id: 1,
        }
    }

    pub fn get(&self, id: TransferId) -> Option<&Transfer> {
        self.transfers.get(&id)
    }

    pub fn get_mut(&mut self, id: TransferId) -> Option<&mut Transfer> {
        self.transfers.get_mut(&id)
    }

    pub fn len(&self, direction: Direction) -> usize {
        self.entries[direction.index()]
            .iter()
            .filter(|e| !e.erased)
            .count()
    }

    pub fn is_empty(&self, direction: Direction) -> bool {
        self.len(direction) == 0
    }

    /// Ids in priority order.
    pub fn iter(&self, direction: Direction) -> impl Iterator<Item = TransferId> + '_ {
        self.entries[direction.index()]
            .iter()
            .filter(|e| !e.erased)
            .map(|e| e.id)
    }

    /// Transfer at `position` in priority order.
    pub fn transfer_at(&self, direction: Direction, position: usize) -> Option<&Transfer> {
        let id = self.iter(direction).nth(position)?;
        self.transfers.get(&id)
    }

    /// Existing transfer with this identity (direction + fingerprint).
    pub fn lookup(
        &self,
        direction: Direction,
        fp: &crate::fingerprint::FileFingerprint,
    ) -> Option<TransferId> {
        self.iter(direction)
            .find(|id| self.transfers.get(id).is_some_and(|t| t.fingerprint == *fp))
    }

    // ── Admission ────────────────────────────────────────────────────────

    /// Admit a transfer, assigning a priority unless it already carries one
    /// (resumed records keep their persisted ordering).
    pub fn add_transfer(
        &mut self,
        mut t: Transfer,
        start_first: bool,
        ctx: &mut ListCtx<'_>,
    ) -> TransferId {
        if t.state != TransferState::Paused {
            t.state = TransferState::Queued;
        }
        let direction = t.direction;
        let id = self.next_id;
        self.next_id += 1;

        if t.priority == 0 {
            if start_first && !self.is_empty(direction) {
                let first = self.first_priority(direction).unwrap_or(PRIORITY_START);
                t.priority = first.saturating_sub(PRIORITY_STEP);
                self.displace_last_active(direction, t.priority, ctx);
                self.entries[direction.index()].insert(
                    0,
                    Entry {
                        priority: t.priority,
                        id,
                        erased: false,
                    },
                );
            } else {
                self.currentpriority += PRIORITY_STEP;
                t.priority = self.currentpriority;
                debug_assert!(self
                    .last_priority(direction)
                    .is_none_or(|p| p < t.priority));
                self.entries[direction.index()].push(Entry {
                    priority: t.priority,
                    id,
                    erased: false,
                });
            }
            ctx.cache_add(&mut t);
        } else {
            // resumed record: keep its ordering and make sure fresh
            // admissions land after it
            self.currentpriority = self.currentpriority.max(t.priority);
            self.compact(direction);
            let list = &mut self.entries[direction.index()];
            let at = list.partition_point(|e| e.priority < t.priority);
            debug_assert!(list.get(at).is_none_or(|e| e.priority != t.priority));
            list.insert(
                at,
                Entry {
                    priority: t.priority,
                    id,
                    erased: false,
                },
            );
        }

        debug!(
            event = "transfer_admitted",
            direction = ?direction,
            priority = t.priority,
            start_first,
            "Transfer admitted to queue"
        );
        self.transfers.insert(id, t);
        id
    }

    /// Detach a transfer from the list, returning ownership to the caller.
    /// The entry is tombstoned; in-flight traversals skip it.
    pub fn remove(&mut self, id: TransferId) -> Option<Transfer> {
        let t = self.transfers.remove(&id)?;
        if let Some(idx) = self.index_of(t.direction, t.priority, id) {
            self.entries[t.direction.index()][idx].erased = true;
        }
        Some(t)
    }

    // ── Moves ────────────────────────────────────────────────────────────

    pub fn move_to_first(&mut self, id: TransferId, ctx: &mut ListCtx<'_>) {
        self.move_to_position(id, 0, ctx);
    }

    pub fn move_to_last(&mut self, id: TransferId, ctx: &mut ListCtx<'_>) {
        let Some(t) = self.transfers.get(&id) else {
            return;
        };
        let len = self.len(t.direction);
        self.move_to_position(id, len, ctx);
    }

    pub fn move_up(&mut self, id: TransferId, ctx: &mut ListCtx<'_>) {
        let Some(pos) = self.position_of(id) else {
            return;
        };
        if pos == 0 {
            return;
        }
        self.move_to_position(id, pos - 1, ctx);
    }

    pub fn move_down(&mut self, id: TransferId, ctx: &mut ListCtx<'_>) {
        let Some(t) = self.transfers.get(&id) else {
            return;
        };
        let len = self.len(t.direction);
        let Some(pos) = self.position_of(id) else {
            return;
        };
        if pos + 1 >= len {
            return;
        }
        self.move_to_position(id, pos + 2, ctx);
    }

    /// Move `id` directly before `before`.
    pub fn move_before(&mut self, id: TransferId, before: TransferId, ctx: &mut ListCtx<'_>) {
        let Some(pos) = self.position_of(before) else {
            return;
        };
        self.move_to_position(id, pos, ctx);
    }

    /// Move a transfer so it lands at `position` (in the pre-move
    /// ordering), bisecting the surrounding priorities.
    pub fn move_to_position(&mut self, id: TransferId, position: usize, ctx: &mut ListCtx<'_>) {
        let Some(direction) = self.transfers.get(&id).map(|t| t.direction) else {
            return;
        };
        self.compact(direction);

        let Some(srcindex) = self.position_of(id) else {
            return;
        };
        let len = self.entries[direction.index()].len();
        let dstindex = position.min(len);

        if srcindex == dstindex || srcindex + 1 == dstindex {
            debug!(event = "transfer_move_noop", "Move to the same position");
            return;
        }

        if dstindex == len {
            // to the back: a fresh top priority
            self.prepare_decrease(direction, srcindex, len, ctx);
            let entry = self.entries[direction.index()].remove(srcindex);
            self.currentpriority += PRIORITY_STEP;
            let newpriority = self.currentpriority;
            self.entries[direction.index()].push(Entry {
                priority: newpriority,
                ..entry
            });
            let t = self.transfers.get_mut(&id).expect("moved transfer exists");
            t.priority = newpriority;
            ctx.cache_add(t);
            let t = self.transfers.get(&id).expect("moved transfer exists");
            ctx.app.transfer_update(t);
            return;
        }

        let nextpriority = self.entries[direction.index()][dstindex].priority;
        let prevpriority = if dstindex > 0 {
            self.entries[direction.index()][dstindex - 1].priority
        } else {
            nextpriority.saturating_sub(2 * PRIORITY_STEP)
        };

        let mut newpriority = (prevpriority + nextpriority) / 2;
        debug!(
            event = "transfer_move",
            from = srcindex,
            to = dstindex,
            between_low = prevpriority,
            between_high = nextpriority,
            new = newpriority,
            "Moving transfer"
        );

        if newpriority == prevpriority {
            // no gap left: renumber the prefix on full strides
            warn!(event = "priority_renumber", positions = dstindex, "No space for the move, adjusting priorities");
            let mut fixed = self.entries[direction.index()][0]
                .priority
                .saturating_sub(PRIORITY_STEP * (dstindex as u64 + 1));
            for i in 0..dstindex {
                let eid = self.entries[direction.index()][i].id;
                self.entries[direction.index()][i].priority = fixed;
                if let Some(t) = self.transfers.get_mut(&eid) {
                    t.priority = fixed;
                    ctx.cache_add(t);
                }
                if let Some(t) = self.transfers.get(&eid) {
                    ctx.app.transfer_update(t);
                }
                fixed += PRIORITY_STEP;
            }
            newpriority = fixed;
        }

        if srcindex > dstindex {
            self.displace_last_active(direction, newpriority, ctx);
        } else {
            self.prepare_decrease(direction, srcindex, dstindex, ctx);
        }

        let entry = self.entries[direction.index()].remove(srcindex);
        let insert_at = if srcindex < dstindex { dstindex - 1 } else { dstindex };
        debug_assert!(self.entries[direction.index()]
            .get(insert_at)
            .is_none_or(|e| e.priority != newpriority));
        self.entries[direction.index()].insert(
            insert_at,
            Entry {
                priority: newpriority,
                ..entry
            },
        );

        let t = self.transfers.get_mut(&id).expect("moved transfer exists");
        t.priority = newpriority;
        ctx.cache_add(t);
        let t = self.transfers.get(&id).expect("moved transfer exists");
        ctx.app.transfer_update(t);
    }

    // ── Pause / resume ───────────────────────────────────────────────────

    pub fn pause(&mut self, id: TransferId, enable: bool, ctx: &mut ListCtx<'_>) -> Result<(), Error> {
        let Some(t) = self.transfers.get_mut(&id) else {
            return Err(Error::NotFound);
        };

        if enable == (t.state == TransferState::Paused) {
            return Ok(());
        }

        if !enable {
            t.state = TransferState::Queued;
            let priority = t.priority;
            let direction = t.direction;
            ctx.cache_add(t);
            let t = self.transfers.get(&id).expect("paused transfer exists");
            ctx.app.transfer_update(t);
            // resuming above an active transfer displaces the lowest one
            self.displace_last_active(direction, priority, ctx);
            return Ok(());
        }

        if matches!(
            t.state,
            TransferState::Active | TransferState::Queued | TransferState::Retrying
        ) {
            if t.slot.is_some() {
                if !ctx.storage_red || t.direction == Direction::Get {
                    t.bt.arm(ctx.now);
                }
                t.slot = None;
            }
            t.state = TransferState::Paused;
            ctx.cache_add(t);
            let t = self.transfers.get(&id).expect("paused transfer exists");
            ctx.app.transfer_update(t);
            return Ok(());
        }

        Err(Error::Failed)
    }

    // ── Scheduling ───────────────────────────────────────────────────────

    /// Walk both directions in priority order, purge cancelled files, and
    /// bucket every dispatchable transfer by (direction × size class).
    /// `continue_fn` grants admission per transfer; `direction_fn` stops a
    /// direction's walk early. Cancelled-out transfers are destroyed here.
    pub fn next_transfers(
        &mut self,
        continue_fn: &mut dyn FnMut(&Transfer) -> bool,
        direction_fn: &mut dyn FnMut(Direction) -> bool,
        ctx: &mut ListCtx<'_>,
    ) -> NextTransfers {
        let mut chosen: NextTransfers = Default::default();

        for direction in [Direction::Put, Direction::Get] {
            self.compact(direction);
            let ids: Vec<TransferId> = self.iter(direction).collect();
            for id in ids {
                let Some(t) = self.transfers.get_mut(&id) else {
                    continue;
                };

                if t.slot.is_none() {
                    t.purge_cancelled_files(ctx.app);
                    if t.files.is_empty() {
                        let mut t = self.remove(id).expect("cancelled transfer exists");
                        t.state = TransferState::Cancelled;
                        ctx.app.transfer_removed(&t);
                        if t.dbid != 0 {
                            ctx.committer.del(t.dbid);
                        }
                        continue;
                    }
                }

                if !direction_fn(direction) {
                    break;
                }

                let t = self.transfers.get(&id).expect("transfer exists");
                let ready = t.slot.is_none()
                    && matches!(t.state, TransferState::Queued | TransferState::Retrying)
                    && t.bt.armed(ctx.now);
                if ready && continue_fn(t) {
                    let category = TransferCategory::new(direction, t.size());
                    chosen[category.index()].push(id);
                }
            }
        }
        chosen
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn first_priority(&self, direction: Direction) -> Option<u64> {
        self.entries[direction.index()]
            .iter()
            .find(|e| !e.erased)
            .map(|e| e.priority)
    }

    fn last_priority(&self, direction: Direction) -> Option<u64> {
        self.entries[direction.index()]
            .iter()
            .rev()
            .find(|e| !e.erased)
            .map(|e| e.priority)
    }

    /// Binary search by priority, then identity check.
    fn index_of(&self, direction: Direction, priority: u64, id: TransferId) -> Option<usize> {
        let list = &self.entries[direction.index()];
        let mut i = list.partition_point(|e| e.priority < priority);
        while let Some(e) = list.get(i) {
            if e.priority != priority {
                return None;
            }
            if e.id == id {
                return Some(i);
            }
            i += 1;
        }
        None
    }

    /// Position among live entries.
    fn position_of(&self, id: TransferId) -> Option<usize> {
        let t = self.transfers.get(&id)?;
        self.iter(t.direction).position(|eid| eid == id)
    }

    fn compact(&mut self, direction: Direction) {
        self.entries[direction.index()].retain(|e| !e.erased);
    }

    /// A transfer rose above the running set: release the slot of the
    /// lowest-priority active transfer that now ranks below it.
    fn displace_last_active(
        &mut self,
        direction: Direction,
        new_priority: u64,
        ctx: &mut ListCtx<'_>,
    ) {
        let displaced = self
            .transfers
            .iter()
            .filter(|(_, t)| {
                t.direction == direction
                    && t.slot.is_some()
                    && t.state == TransferState::Active
                    && t.priority > new_priority
            })
            .max_by_key(|(_, t)| t.priority)
            .map(|(id, _)| *id);

        if let Some(did) = displaced {
            let t = self.transfers.get_mut(&did).expect("displaced transfer exists");
            if !ctx.storage_red || t.direction == Direction::Get {
                t.bt.arm(ctx.now);
            }
            t.slot = None;
            t.state = TransferState::Queued;
            ctx.cache_add(t);
            let t = self.transfers.get(&did).expect("displaced transfer exists");
            ctx.app.transfer_update(t);
            debug!(event = "transfer_displaced", priority = t.priority, "Active transfer displaced from running set");
        }
    }

    /// A transfer sank below part of the queue: if a ready transfer now
    /// outranks it within the crossed range, release its slot.
    fn prepare_decrease(
        &mut self,
        direction: Direction,
        srcindex: usize,
        dstindex: usize,
        ctx: &mut ListCtx<'_>,
    ) {
        let id = self.entries[direction.index()][srcindex].id;
        let Some(t) = self.transfers.get(&id) else {
            return;
        };
        if t.slot.is_none() || t.state != TransferState::Active {
            return;
        }

        let crossed_ready = self.entries[direction.index()][srcindex + 1..dstindex.min(self.entries[direction.index()].len())]
            .iter()
            .any(|e| {
                self.transfers.get(&e.id).is_some_and(|c| {
                    c.slot.is_none()
                        && matches!(c.state, TransferState::Queued | TransferState::Retrying)
                        && c.bt.armed(ctx.now)
                })
            });

        if crossed_ready {
            let t = self.transfers.get_mut(&id).expect("transfer exists");
            if !ctx.storage_red || t.direction == Direction::Get {
                t.bt.arm(ctx.now);
            }
            t.slot = None;
            t.state = TransferState::Queued;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TransferCache;
    use crate::fingerprint::FileFingerprint;
    use crate::testutil::RecordingListener;
    use crate::transfer::file::{File, FileKind};
    use crate::transfer::slot::TransferSlot;
    use crate::types::NodeHandle;
    use std::path::PathBuf;

    fn make_transfer(direction: Direction, size: u64) -> Transfer {
        let mut t = Transfer::new(direction);
        t.fingerprint = FileFingerprint {
            size,
            mtime: 1_650_000_000 + size as i64,
            crc: [size as u32, 0, 0, 1],
            isvalid: true,
        };
        t.files.push(File::new(
            format!("f{size}"),
            PathBuf::from(format!("/t/f{size}")),
            NodeHandle(size),
            FileKind::Download,
        ));
        t
    }

    struct Env {
        cache: TransferCache,
        committer: DbCommitter,
        app: RecordingListener,
    }

    impl Env {
        fn new() -> Self {
            Self {
                cache: TransferCache::ephemeral(),
                committer: DbCommitter::default(),
                app: RecordingListener::default(),
            }
        }

        fn ctx(&mut self) -> ListCtx<'_> {
            ListCtx {
                committer: &mut self.committer,
                cache: &mut self.cache,
                app: &mut self.app,
                now: 100,
                storage_red: false,
            }
        }
    }

    fn priorities(list: &TransferList, d: Direction) -> Vec<u64> {
        list.iter(d)
            .map(|id| list.get(id).unwrap().priority)
            .collect()
    }

    #[test]
    fn test_priorities_strictly_increasing() {
        let mut env = Env::new();
        let mut list = TransferList::new();
        for i in 1..=5 {
            list.add_transfer(make_transfer(Direction::Get, i * 1000), false, &mut env.ctx());
        }
        let ps = priorities(&list, Direction::Get);
        assert!(ps.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(ps[0], PRIORITY_START + PRIORITY_STEP);
        assert_eq!(ps[4], PRIORITY_START + 5 * PRIORITY_STEP);
    }

    #[test]
    fn test_start_first_prepends() {
        let mut env = Env::new();
        let mut list = TransferList::new();
        let a = list.add_transfer(make_transfer(Direction::Get, 1), false, &mut env.ctx());
        let b = list.add_transfer(make_transfer(Direction::Get, 2), true, &mut env.ctx());

        let order: Vec<TransferId> = list.iter(Direction::Get).collect();
        assert_eq!(order, vec![b, a]);
        assert!(list.get(b).unwrap().priority < list.get(a).unwrap().priority);
    }

    #[test]
    fn test_move_between_assigns_midpoint() {
        let mut env = Env::new();
        let mut list = TransferList::new();
        let t1 = list.add_transfer(make_transfer(Direction::Get, 1), false, &mut env.ctx());
        let t2 = list.add_transfer(make_transfer(Direction::Get, 2), false, &mut env.ctx());
        let t3 = list.add_transfer(make_transfer(Direction::Get, 3), false, &mut env.ctx());

        let p1 = list.get(t1).unwrap().priority;
        let p2 = list.get(t2).unwrap().priority;
        assert_eq!(p1, PRIORITY_START + PRIORITY_STEP);
        assert_eq!(p2, PRIORITY_START + 2 * PRIORITY_STEP);

        // move #3 between #1 and #2
        list.move_before(t3, t2, &mut env.ctx());

        let order: Vec<TransferId> = list.iter(Direction::Get).collect();
        assert_eq!(order, vec![t1, t3, t2], "list order becomes {{1, 3, 2}}");
        let p3 = list.get(t3).unwrap().priority;
        assert_eq!(p3, (p1 + p2) / 2, "midpoint priority: 1.5 steps in");

        // persisted record reflects the new priority
        let record = list.get(t3).unwrap().serialize();
        let back = Transfer::unserialize(&record).unwrap();
        assert_eq!(back.priority, p3);
    }

    #[test]
    fn test_midpoint_collision_renumbers_prefix() {
        let mut env = Env::new();
        let mut list = TransferList::new();
        let t1 = list.add_transfer(make_transfer(Direction::Get, 1), false, &mut env.ctx());
        let t2 = list.add_transfer(make_transfer(Direction::Get, 2), false, &mut env.ctx());

        // squeeze the gap shut: consecutive priorities
        let p1 = list.get(t1).unwrap().priority;
        list.get_mut(t2).unwrap().priority = p1 + 1;
        list.entries[Direction::Get.index()][1].priority = p1 + 1;

        let t3 = list.add_transfer(make_transfer(Direction::Get, 3), false, &mut env.ctx());
        list.move_before(t3, t2, &mut env.ctx());

        let order: Vec<TransferId> = list.iter(Direction::Get).collect();
        assert_eq!(order, vec![t1, t3, t2]);
        let ps = priorities(&list, Direction::Get);
        assert!(ps.windows(2).all(|w| w[0] < w[1]), "renumbered: {ps:?}");
    }

    #[test]
    fn test_move_to_last_gets_fresh_priority() {
        let mut env = Env::new();
        let mut list = TransferList::new();
        let t1 = list.add_transfer(make_transfer(Direction::Get, 1), false, &mut env.ctx());
        let t2 = list.add_transfer(make_transfer(Direction::Get, 2), false, &mut env.ctx());

        list.move_to_last(t1, &mut env.ctx());
        let order: Vec<TransferId> = list.iter(Direction::Get).collect();
        assert_eq!(order, vec![t2, t1]);
        assert!(list.get(t1).unwrap().priority > list.get(t2).unwrap().priority);
    }

    #[test]
    fn test_move_up_down() {
        let mut env = Env::new();
        let mut list = TransferList::new();
        let t1 = list.add_transfer(make_transfer(Direction::Get, 1), false, &mut env.ctx());
        let t2 = list.add_transfer(make_transfer(Direction::Get, 2), false, &mut env.ctx());
        let t3 = list.add_transfer(make_transfer(Direction::Get, 3), false, &mut env.ctx());

        list.move_up(t3, &mut env.ctx());
        assert_eq!(list.iter(Direction::Get).collect::<Vec<_>>(), vec![t1, t3, t2]);

        list.move_down(t3, &mut env.ctx());
        assert_eq!(list.iter(Direction::Get).collect::<Vec<_>>(), vec![t1, t2, t3]);
    }

    #[test]
    fn test_pause_resume_cycle() {
        let mut env = Env::new();
        let mut list = TransferList::new();
        let id = list.add_transfer(make_transfer(Direction::Get, 1), false, &mut env.ctx());

        // activate
        {
            let t = list.get_mut(id).unwrap();
            t.state = TransferState::Active;
            t.slot = Some(TransferSlot::new(None, 100, 36_000));
        }

        list.pause(id, true, &mut env.ctx()).unwrap();
        {
            let t = list.get(id).unwrap();
            assert_eq!(t.state, TransferState::Paused);
            assert!(t.slot.is_none(), "slot destroyed on pause");
        }

        // paused transfers are never scheduled
        let buckets = list.next_transfers(&mut |_| true, &mut |_| true, &mut env.ctx());
        assert!(buckets.iter().all(|b| b.is_empty()));

        list.pause(id, false, &mut env.ctx()).unwrap();
        assert_eq!(list.get(id).unwrap().state, TransferState::Queued);

        let buckets = list.next_transfers(&mut |_| true, &mut |_| true, &mut env.ctx());
        let category = TransferCategory::new(Direction::Get, 1);
        assert_eq!(buckets[category.index()], vec![id]);
    }

    #[test]
    fn test_pause_idempotent() {
        let mut env = Env::new();
        let mut list = TransferList::new();
        let id = list.add_transfer(make_transfer(Direction::Get, 1), false, &mut env.ctx());
        assert!(list.pause(id, false, &mut env.ctx()).is_ok());
        assert!(list.pause(id, true, &mut env.ctx()).is_ok());
        assert!(list.pause(id, true, &mut env.ctx()).is_ok());
        assert!(list.pause(9999, true, &mut env.ctx()).is_err());
    }

    #[test]
    fn test_next_transfers_buckets_by_size() {
        let mut env = Env::new();
        let mut list = TransferList::new();
        let small = list.add_transfer(
            make_transfer(Direction::Get, crate::types::SMALLFILE_LIMIT),
            false,
            &mut env.ctx(),
        );
        let large = list.add_transfer(
            make_transfer(Direction::Get, crate::types::SMALLFILE_LIMIT + 1),
            false,
            &mut env.ctx(),
        );
        let up = list.add_transfer(make_transfer(Direction::Put, 10), false, &mut env.ctx());

        let buckets = list.next_transfers(&mut |_| true, &mut |_| true, &mut env.ctx());
        use crate::types::{SizeCategory, TransferCategory as TC};
        let idx = |d, s| TC { direction: d, sizetype: s }.index();
        assert_eq!(buckets[idx(Direction::Get, SizeCategory::Small)], vec![small]);
        assert_eq!(buckets[idx(Direction::Get, SizeCategory::Large)], vec![large]);
        assert_eq!(buckets[idx(Direction::Put, SizeCategory::Small)], vec![up]);
    }

    #[test]
    fn test_next_transfers_purges_cancelled() {
        let mut env = Env::new();
        let mut list = TransferList::new();
        let id = list.add_transfer(make_transfer(Direction::Get, 1), false, &mut env.ctx());
        list.get(id).unwrap().files[0].cancel.cancel();

        let buckets = list.next_transfers(&mut |_| true, &mut |_| true, &mut env.ctx());
        assert!(buckets.iter().all(|b| b.is_empty()));
        assert!(list.get(id).is_none(), "cancelled transfer destroyed");
        assert_eq!(env.app.transfer_removed, 1);
        assert_eq!(env.app.file_removed.len(), 1);
    }

    #[test]
    fn test_next_transfers_respects_backoff() {
        let mut env = Env::new();
        let mut list = TransferList::new();
        let id = list.add_transfer(make_transfer(Direction::Get, 1), false, &mut env.ctx());
        list.get_mut(id).unwrap().bt.backoff_for(100, 500);

        let buckets = list.next_transfers(&mut |_| true, &mut |_| true, &mut env.ctx());
        assert!(buckets.iter().all(|b| b.is_empty()), "backoff gates dispatch");
    }

    #[test]
    fn test_lazy_erase_tolerates_removal_mid_iteration() {
        let mut env = Env::new();
        let mut list = TransferList::new();
        let a = list.add_transfer(make_transfer(Direction::Get, 1), false, &mut env.ctx());
        let b = list.add_transfer(make_transfer(Direction::Get, 2), false, &mut env.ctx());

        // tombstone `a` while iterating
        let mut seen = Vec::new();
        for id in list.iter(Direction::Get).collect::<Vec<_>>() {
            if id == a {
                list.remove(a);
            } else {
                seen.push(id);
            }
        }
        assert_eq!(seen, vec![b]);
        assert_eq!(list.len(Direction::Get), 1);

        // next full traversal compacts
        let _ = list.next_transfers(&mut |_| true, &mut |_| true, &mut env.ctx());
        assert_eq!(list.entries[Direction::Get.index()].len(), 1);
    }

    #[test]
    fn test_displacement_on_priority_rise() {
        let mut env = Env::new();
        let mut list = TransferList::new();
        let active = list.add_transfer(make_transfer(Direction::Get, 1), false, &mut env.ctx());
        let riser = list.add_transfer(make_transfer(Direction::Get, 2), false, &mut env.ctx());

        {
            let t = list.get_mut(active).unwrap();
            t.state = TransferState::Active;
            t.slot = Some(TransferSlot::new(None, 100, 36_000));
        }

        // riser moves to the front, above the active transfer
        list.move_to_first(riser, &mut env.ctx());

        let t = list.get(active).unwrap();
        assert!(t.slot.is_none(), "displaced below the running-set boundary");
        assert_eq!(t.state, TransferState::Queued);
        assert!(t.bt.armed(100), "armed for re-admission on next tick");
    }

    #[test]
    fn test_unserialized_transfer_keeps_priority() {
        let mut env = Env::new();
        let mut list = TransferList::new();
        let mut t = make_transfer(Direction::Get, 1);
        t.priority = PRIORITY_START + 7 * PRIORITY_STEP;
        let high = list.add_transfer(t, false, &mut env.ctx());
        let t2 = list.add_transfer(make_transfer(Direction::Get, 2), false, &mut env.ctx());

        // the resumed record keeps its ordering; fresh admissions append
        let order: Vec<TransferId> = list.iter(Direction::Get).collect();
        assert_eq!(order, vec![high, t2]);
        assert!(list.get(t2).unwrap().priority > PRIORITY_START + 7 * PRIORITY_STEP);
    }

    #[test]
    fn test_lookup_by_identity() {
        let mut env = Env::new();
        let mut list = TransferList::new();
        let t = make_transfer(Direction::Get, 42);
        let fp = t.fingerprint;
        let id = list.add_transfer(t, false, &mut env.ctx());

        assert_eq!(list.lookup(Direction::Get, &fp), Some(id));
        assert_eq!(list.lookup(Direction::Put, &fp), None);
    }

    #[test]
    fn test_remove_detaches_cleanly() {
        let mut env = Env::new();
        let mut list = TransferList::new();
        let id = list.add_transfer(make_transfer(Direction::Get, 1), false, &mut env.ctx());
        let t = list.remove(id).unwrap();
        assert_eq!(t.direction, Direction::Get);
        assert!(list.get(id).is_none());
        assert_eq!(list.len(Direction::Get), 0);
    }
}
