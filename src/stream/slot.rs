//! Active streaming slot: the per-read connection pool.
//!
//! One slot drives one read: a single connection for plain objects, six
//! for raided ones (five fetching, one spare). Each pass over the pool
//! drains arrived bytes into the reassembly buffer in adaptively sized
//! chunks, schedules the next range requests, polices per-connection
//! throughput, and consults the mean-speed watchdog. All I/O is
//! declarative: posts are emitted as actions, failures arrive as statuses.

use tracing::{debug, warn};

use crate::config::{
    CONNECTION_SWITCHES_LIMIT_RESET_DS, DEFAULT_MIN_COMPARABLE_THROUGHPUT, MAX_CONN_SWITCHES_BELOW_SPEED_THRESHOLD,
    MAX_CONN_SWITCHES_SLOWEST_PART, MAX_DELIVERY_CHUNK, MAX_SIMULTANEOUS_SLOW_RAIDED_CONNS,
    MEAN_SPEED_INTERVAL_DS, MIN_BYTES_PER_SECOND, MIN_CHUNK_DIVISIBLE_SIZE,
    OVER_TRANSFER_QUOTA_BACKOFF_DS, SLOWEST_TO_FASTEST_THROUGHPUT_RATIO, TEMPURL_TIMEOUT_DS,
};
use crate::error::Error;
use crate::net::{adjust_url_port, HttpReq, ReqStatus};
use crate::raid::{FilePiece, NextPos, RaidBufferManager, EFFECTIVE_RAIDPARTS, RAIDPARTS, RAIDSECTOR};
use crate::types::{Ds, NodeHandle};

use super::read::{cb_data, cb_is_valid, ReadCallback, ReadId};
use super::StreamingAction;

/// Spare slot index when none is designated.
const DEFAULT_UNUSED_CONN_INDEX: usize = 0;

/// What one `doio` pass decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStep {
    Continue,
    /// The read finished, was cancelled, or its consumer vanished.
    FinishRead,
    /// Give up on the current URL set and retry through the node.
    RetryTransfer { error: Error, timeleft: Ds },
}

/// Why the spare was moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplacementReason {
    RaidedError,
    SlowestPart,
    UnderThreshold,
}

/// Why a part is sitting unused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnusedReason {
    NotError,
    DefinitiveError,
}

/// The spare connection designation.
#[derive(Debug, Clone, Copy)]
pub struct UnusedConn {
    num: usize,
    reason: UnusedReason,
}

impl UnusedConn {
    fn cleared() -> Self {
        Self {
            num: 0,
            reason: UnusedReason::NotError,
        }
    }

    pub fn num(&self) -> usize {
        self.num
    }

    /// A spare that was retired for a definitive error must not rejoin.
    pub fn can_be_reused(&self) -> bool {
        self.reason == UnusedReason::NotError
    }

    fn set(&mut self, num: usize, reason: UnusedReason) {
        self.num = num;
        self.reason = reason;
    }

    /// Classify an HTTP status: is this part's URL definitively dead?
    pub fn reason_from_http_status(status: u16) -> UnusedReason {
        match status {
            403 | 404 | 416 => UnusedReason::DefinitiveError,
            _ => UnusedReason::NotError,
        }
    }
}

/// Per-tick environment handed in by the engine.
#[derive(Debug, Clone, Copy)]
pub struct SlotEnv {
    pub now: Ds,
    pub now_ms: u64,
    /// Bytes/s; 0 disables the minimum-rate check, negative = default.
    pub min_streaming_rate: i64,
    pub use_alt_down_port: bool,
}

/// Borrowed pieces of the owning read, plus the action sink.
pub struct SlotIo<'a> {
    pub buf: &'a mut RaidBufferManager,
    pub callback: &'a mut ReadCallback,
    pub progress: &'a mut u64,
    pub revoked: bool,
    pub bounded: bool,
    pub node: NodeHandle,
    pub read_id: ReadId,
    pub env: SlotEnv,
    pub actions: &'a mut Vec<StreamingAction>,
    /// Out-parameter: push the node's activity deadline this far out.
    pub reschedule: Option<Ds>,
}

impl SlotIo<'_> {
    fn valid(&mut self) -> bool {
        !self.revoked && cb_is_valid(self.callback)
    }
}

/// Active streaming context for one read.
pub struct DirectReadSlot {
    pub reqs: Vec<HttpReq>,
    /// Rolling (bytes, milliseconds) per connection.
    throughput: Vec<(u64, u64)>,
    unused: UnusedConn,
    num_reqs_inflight: usize,
    /// All parts in flight: hold scheduling until one drains.
    wait_for_parts: bool,
    unused_counted_inflight: bool,
    /// Largest chunk submitted so far; dampens chunk-size oscillation.
    max_chunk_submitted: u64,
    max_chunk_size: u64,
    min_comparable_throughput: u64,
    /// Next delivery offset (absolute).
    pub pos: u64,
    slot_start_ms: u64,
    slot_throughput: (u64, u64),
    /// Replacement budgets and their reset clock.
    switches_slowest: u32,
    switches_below_threshold: u32,
    switches_reset_at: Ds,
    /// Watchdog window: bytes delivered since `partial_start`.
    partial_len: u64,
    partial_start: Ds,
}

impl DirectReadSlot {
    pub fn new(buf: &mut RaidBufferManager, offset: u64, progress: u64, env: &SlotEnv) -> Self {
        let raid = buf.is_raid();
        let nreqs = if raid { RAIDPARTS } else { 1 };
        let mut reqs = Vec::with_capacity(nreqs);
        for _ in 0..nreqs {
            reqs.push(HttpReq::new());
        }

        let mut unused = UnusedConn::cleared();
        if raid {
            let prev = buf.unused_raid_connection();
            let aux = if prev < nreqs { prev } else { DEFAULT_UNUSED_CONN_INDEX };
            buf.set_unused_raid_connection(aux);
            unused.set(aux, UnusedReason::NotError);
        } else {
            unused.set(nreqs, UnusedReason::NotError);
        }

        let mut max_chunk_size =
            MAX_DELIVERY_CHUNK / if raid { EFFECTIVE_RAIDPARTS as u64 } else { 1 };
        if raid {
            max_chunk_size -= max_chunk_size % RAIDSECTOR;
        }

        debug!(
            event = "read_slot_created",
            raid,
            connections = nreqs,
            unused = unused.num(),
            pos = offset + progress,
            "Streaming slot created"
        );

        Self {
            reqs,
            throughput: vec![(0, 0); nreqs],
            unused,
            num_reqs_inflight: 0,
            wait_for_parts: false,
            unused_counted_inflight: false,
            max_chunk_submitted: 0,
            max_chunk_size,
            min_comparable_throughput: DEFAULT_MIN_COMPARABLE_THROUGHPUT,
            pos: offset + progress,
            slot_start_ms: env.now_ms,
            slot_throughput: (0, 0),
            switches_slowest: 0,
            switches_below_threshold: 0,
            switches_reset_at: env.now,
            partial_len: 0,
            partial_start: env.now,
        }
    }

    pub fn unused_connection(&self) -> usize {
        self.unused.num()
    }

    pub fn reqs_inflight(&self) -> usize {
        self.num_reqs_inflight
    }

    // ── Throughput helpers ───────────────────────────────────────────────

    fn calc_throughput(bytes: u64, ms: u64) -> u64 {
        if bytes != 0 && ms != 0 {
            bytes / ms
        } else {
            0
        }
    }

    /// Bytes per millisecond for one connection.
    fn throughput_of(&self, conn: usize) -> u64 {
        Self::calc_throughput(self.throughput[conn].0, self.throughput[conn].1)
    }

    fn has_comparable_throughput(&self, conn: usize) -> bool {
        self.throughput[conn].0 >= self.min_comparable_throughput
    }

    /// Per-connection floor in bytes/s, derived from the configured
    /// minimum streaming rate.
    fn min_speed_per_conn(&self, raid: bool, min_streaming_rate: i64) -> u64 {
        let parts = if raid { EFFECTIVE_RAIDPARTS as u64 } else { 1 };
        if min_streaming_rate < 0 {
            MIN_BYTES_PER_SECOND / parts
        } else if min_streaming_rate == 0 {
            0
        } else if (min_streaming_rate as u64) < parts {
            1
        } else {
            min_streaming_rate as u64 / parts
        }
    }

    // ── In-flight accounting ─────────────────────────────────────────────

    fn used_connections(&self, raid: bool) -> usize {
        if !raid {
            return self.reqs.len();
        }
        self.reqs.len() - usize::from(self.unused.num() != self.reqs.len())
    }

    fn increase_reqs_inflight(&mut self, raid: bool, now: Ds) {
        if !raid {
            return;
        }
        self.num_reqs_inflight += 1;
        if self.num_reqs_inflight == self.reqs.len() {
            self.wait_for_parts = true;
            self.reset_watchdog_window(now);
        }
    }

    fn decrease_reqs_inflight(&mut self, raid: bool) {
        if !raid {
            return;
        }
        self.num_reqs_inflight = self.num_reqs_inflight.saturating_sub(1);
        if self.unused.num() < self.reqs.len()
            && self.reqs[self.unused.num()].status != ReqStatus::Done
            && self.num_reqs_inflight == self.reqs.len() - self.used_connections(raid)
        {
            self.num_reqs_inflight = 0;
            self.unused_counted_inflight = false;
        }
        if self.num_reqs_inflight == 0 {
            self.wait_for_parts = false;
            self.max_chunk_submitted = 0;
        }
    }

    fn wait_for_parts_in_flight(&self, raid: bool) -> bool {
        raid && self.wait_for_parts
    }

    // ── Spare management ─────────────────────────────────────────────────

    fn reset_switch_counters_if_expired(&mut self, now: Ds) {
        if now.saturating_sub(self.switches_reset_at) > CONNECTION_SWITCHES_LIMIT_RESET_DS {
            self.switches_slowest = 0;
            self.switches_below_threshold = 0;
            self.switches_reset_at = now;
        }
    }

    fn switch_budget_reached(&self, reason: ReplacementReason) -> bool {
        match reason {
            ReplacementReason::RaidedError => false,
            ReplacementReason::SlowestPart => {
                self.switches_slowest >= MAX_CONN_SWITCHES_SLOWEST_PART
            }
            ReplacementReason::UnderThreshold => {
                self.switches_below_threshold >= MAX_CONN_SWITCHES_BELOW_SPEED_THRESHOLD
            }
        }
    }

    fn bump_switch_counter(&mut self, reason: ReplacementReason) {
        match reason {
            ReplacementReason::RaidedError => {}
            ReplacementReason::SlowestPart => self.switches_slowest += 1,
            ReplacementReason::UnderThreshold => self.switches_below_threshold += 1,
        }
    }

    /// Disconnect and fully reset one connection; its part rewinds to the
    /// assembly boundary.
    fn reset_connection(&mut self, conn: usize, buf: &mut RaidBufferManager) {
        debug!(event = "connection_reset", conn, "Resetting streaming connection");
        if conn < self.reqs.len() {
            self.reqs[conn].disconnect();
            self.throughput[conn] = (0, 0);
        }
        buf.reset_part(conn);
    }

    fn replace_connection_by_unused(
        &mut self,
        new_unused: usize,
        reason: ReplacementReason,
        unused_reason: UnusedReason,
        buf: &mut RaidBufferManager,
    ) -> bool {
        if !buf.is_raid()
            || !self.unused.can_be_reused()
            || self.switch_budget_reached(reason)
            || new_unused >= self.reqs.len()
        {
            warn!(
                event = "spare_replacement_refused",
                new_unused,
                reason = ?reason,
                "Cannot replace spare connection"
            );
            return false;
        }

        let prev = self.unused.num();
        debug!(
            event = "spare_replaced",
            new_unused,
            prev_unused = prev,
            reason = ?reason,
            "Replacing spare connection"
        );
        self.bump_switch_counter(reason);
        buf.set_unused_raid_connection(new_unused);
        self.reset_connection(prev, buf);
        self.unused.set(new_unused, unused_reason);
        self.reset_connection(new_unused, buf);
        true
    }

    fn replace_connection_by_unused_inflight(
        &mut self,
        new_unused: usize,
        reason: ReplacementReason,
        unused_reason: UnusedReason,
        buf: &mut RaidBufferManager,
    ) {
        let raid = buf.is_raid();
        if !self.replace_connection_by_unused(new_unused, reason, unused_reason, buf) {
            return;
        }
        self.decrease_reqs_inflight(raid);
        if self.unused_counted_inflight {
            if self.num_reqs_inflight > 0 {
                self.decrease_reqs_inflight(raid);
            }
            self.unused_counted_inflight = false;
        }
    }

    fn is_connection_done(&self, conn: usize, buf: &RaidBufferManager) -> bool {
        self.reqs[conn].status == ReqStatus::Done
            || self.reqs[conn].pos == buf.transfer_size(conn)
    }

    /// Only switch spares while every request is quiescent, to avoid
    /// disconnecting live sockets.
    fn exit_due_reqs_in_flight(&self) -> bool {
        if self.num_reqs_inflight == 0 {
            return false;
        }
        if self.num_reqs_inflight > 1 {
            return true;
        }
        self.reqs.iter().any(|r| r.status != ReqStatus::Ready)
    }

    fn search_slowest_and_fastest(
        &self,
        conn: usize,
        buf: &RaidBufferManager,
    ) -> Option<(usize, usize)> {
        let n = self.reqs.len();
        let mut slowest = conn;
        let mut fastest = conn;
        for other in (0..n).rev() {
            if other == conn || other == self.unused.num() {
                continue;
            }
            if !self.has_comparable_throughput(other) || self.is_connection_done(other, buf) {
                // not enough samples, or a finished part we must not reset
                return None;
            }
            let tp = self.throughput_of(other);
            if tp < self.throughput_of(slowest) {
                slowest = other;
            }
            if tp > self.throughput_of(fastest) {
                fastest = other;
            }
        }
        Some((slowest, fastest))
    }

    fn slowest_too_slow_vs_fastest(&self, conn: usize, slowest: usize, fastest: usize) -> bool {
        let slowest_applicable = slowest == conn
            || (slowest < self.reqs.len() && self.reqs[slowest].status == ReqStatus::Ready);
        if !slowest_applicable || fastest == slowest {
            return false;
        }
        let slow_tp = self.throughput_of(slowest);
        let fast_tp = self.throughput_of(fastest);
        if fast_tp * SLOWEST_TO_FASTEST_THROUGHPUT_RATIO[0]
            > slow_tp * SLOWEST_TO_FASTEST_THROUGHPUT_RATIO[1]
        {
            warn!(
                event = "slow_connection_detected",
                conn = slowest,
                slow_bps = slow_tp * 1000,
                fast_bps = fast_tp * 1000,
                switches = self.switches_slowest,
                "Connection dramatically slower than its fastest sibling"
            );
            return true;
        }
        false
    }

    /// Throughput-divergence trigger: retire the slowest part to spare.
    fn search_and_disconnect_slowest_connection(
        &mut self,
        conn: usize,
        buf: &mut RaidBufferManager,
    ) -> bool {
        if !buf.is_raid()
            || !self.unused.can_be_reused()
            || self.exit_due_reqs_in_flight()
            || conn == self.unused.num()
            || !self.has_comparable_throughput(conn)
            || self.switch_budget_reached(ReplacementReason::SlowestPart)
        {
            return false;
        }

        let Some((slowest, fastest)) = self.search_slowest_and_fastest(conn, buf) else {
            return false;
        };
        if self.slowest_too_slow_vs_fastest(conn, slowest, fastest) {
            return self.replace_connection_by_unused(
                slowest,
                ReplacementReason::SlowestPart,
                UnusedReason::NotError,
                buf,
            );
        }
        false
    }

    /// Per-request-error trigger: a part failed definitively.
    fn retry_on_error(&mut self, conn: usize, http_status: u16, buf: &mut RaidBufferManager) -> SlotStep {
        if !buf.is_raid() {
            debug!(event = "retry_non_raid", "Retrying non-raided transfer");
            return self.retry_entire_transfer(Error::Read, 0);
        }

        if conn >= self.reqs.len() || conn == self.unused.num() {
            return self.retry_entire_transfer(Error::Read, 0);
        }
        if UnusedConn::reason_from_http_status(http_status) != UnusedReason::DefinitiveError {
            return self.retry_entire_transfer(Error::Read, 0);
        }
        if !self.unused.can_be_reused() {
            debug!(
                event = "spare_exhausted",
                "Failed part cannot be replaced, spare also failed; retrying entire transfer"
            );
            return self.retry_entire_transfer(Error::Read, 0);
        }
        self.replace_connection_by_unused_inflight(
            conn,
            ReplacementReason::RaidedError,
            UnusedReason::DefinitiveError,
            buf,
        );
        SlotStep::Continue
    }

    fn retry_entire_transfer(&mut self, error: Error, timeleft: Ds) -> SlotStep {
        self.switches_slowest = 0;
        self.switches_below_threshold = 0;
        self.unused = UnusedConn::cleared();
        SlotStep::RetryTransfer { error, timeleft }
    }

    // ── Watchdog ─────────────────────────────────────────────────────────

    fn reset_watchdog_window(&mut self, now: Ds) {
        self.partial_len = 0;
        self.partial_start = now;
    }

    fn search_slow_conns_under_threshold(
        &self,
        raid: bool,
        min_streaming_rate: i64,
    ) -> (Vec<usize>, usize) {
        let floor = self.min_speed_per_conn(raid, min_streaming_rate);
        if floor == 0 || !raid {
            return (Vec::new(), self.reqs.len());
        }

        let mut slow = Vec::new();
        let mut slowest = self.reqs.len();
        let mut slowest_tp = 0u64;
        for i in 0..self.reqs.len() {
            if i == self.unused.num() || self.reqs[i].status != ReqStatus::Inflight {
                continue;
            }
            let tp = self.throughput_of(i);
            if tp * 1000 < floor {
                slow.push(i);
                if slowest == self.reqs.len() || tp < slowest_tp {
                    slowest = i;
                    slowest_tp = tp;
                }
            }
        }
        (slow, slowest)
    }

    fn all_reqs_ready_or_inflight(&self) -> bool {
        self.reqs
            .iter()
            .all(|r| matches!(r.status, ReqStatus::Ready | ReqStatus::Inflight))
    }

    fn watch_over_performance(&mut self, io: &mut SlotIo<'_>) -> Option<SlotStep> {
        let ds_since = io.env.now.saturating_sub(self.partial_start);
        if ds_since <= MEAN_SPEED_INTERVAL_DS {
            return None;
        }

        let raid = io.buf.is_raid();
        let mean_bps = 10 * self.partial_len / ds_since;
        let min_bps = if io.env.min_streaming_rate < 0 {
            MIN_BYTES_PER_SECOND
        } else {
            io.env.min_streaming_rate as u64
        };

        if !io.valid() {
            warn!(event = "watchdog_dead_consumer", "Watchdog: consumer is gone");
            return Some(SlotStep::FinishRead);
        }

        if min_bps == 0 {
            self.reset_watchdog_window(io.env.now);
            return None;
        }

        if raid && self.reqs.iter().any(|r| r.status == ReqStatus::Failure) {
            // the failure path owns this situation
            self.reset_watchdog_window(io.env.now);
            return None;
        }

        let (slow, slowest) = self.search_slow_conns_under_threshold(raid, io.env.min_streaming_rate);
        debug!(
            event = "watchdog_pass",
            mean_bps,
            min_bps,
            slow_parts = slow.len(),
            "Watchdog assessed streaming performance"
        );

        if slow.is_empty() {
            if mean_bps < min_bps {
                warn!(
                    event = "watchdog_transfer_too_slow",
                    mean_bps, min_bps, "Overall transfer speed below the floor"
                );
                return Some(self.retry_entire_transfer(Error::Again, 0));
            }
            self.reset_watchdog_window(io.env.now);
            return None;
        }

        if slow.len() <= MAX_SIMULTANEOUS_SLOW_RAIDED_CONNS {
            let spare_unusable = !self.unused.can_be_reused()
                || self.switch_budget_reached(ReplacementReason::UnderThreshold);
            if spare_unusable || self.num_reqs_inflight < EFFECTIVE_RAIDPARTS {
                if self.num_reqs_inflight < EFFECTIVE_RAIDPARTS && self.all_reqs_ready_or_inflight()
                {
                    // parts are settling; burn budget instead of retrying
                    self.bump_switch_counter(ReplacementReason::UnderThreshold);
                    self.reset_watchdog_window(io.env.now);
                    return None;
                }
                warn!(
                    event = "watchdog_spare_unusable",
                    slowest, "Cannot rotate spare for slow part; retrying entire transfer"
                );
                return Some(self.retry_entire_transfer(Error::Again, 0));
            }

            self.replace_connection_by_unused_inflight(
                slowest,
                ReplacementReason::UnderThreshold,
                UnusedReason::NotError,
                io.buf,
            );
            self.reset_watchdog_window(io.env.now);
            return None;
        }

        warn!(
            event = "watchdog_too_many_slow",
            slow_parts = slow.len(),
            "Too many slow parts; retrying entire transfer"
        );
        Some(self.retry_entire_transfer(Error::Again, 0))
    }

    // ── Output delivery ──────────────────────────────────────────────────

    /// Drain assembled pieces to the consumer. Returns false when the read
    /// must be destroyed (cancel or dead consumer).
    fn process_any_output_pieces(&mut self, io: &mut SlotIo<'_>) -> bool {
        loop {
            let Some(piece) = io.buf.output_piece() else {
                return true;
            };
            let len = piece.len() as u64;
            let offset = piece.pos;

            self.slot_throughput.0 += len;
            self.slot_throughput.1 = io.env.now_ms.saturating_sub(self.slot_start_ms).max(1);
            let mean = Self::calc_throughput(self.slot_throughput.0, self.slot_throughput.1) * 1000;

            if io.revoked || !cb_is_valid(io.callback) {
                warn!(
                    event = "delivery_to_dead_consumer",
                    "Assembled piece ready but the consumer is gone; aborting"
                );
                io.buf.output_consumed(false);
                return false;
            }

            // borrow the piece again for delivery
            let piece = io.buf.output_piece().expect("piece still queued");
            let proceed = cb_data(io.callback, &piece.buf, offset, mean, mean);
            io.buf.output_consumed(proceed);
            if !proceed {
                debug!(event = "consumer_stopped", offset, "Consumer declined further data");
                return false;
            }

            self.pos = offset + len;
            *io.progress += len;
            self.partial_len += len;
            self.min_comparable_throughput = len.max(1);
        }
    }

    // ── Main pass ────────────────────────────────────────────────────────

    /// One cooperative pass over the connection pool.
    pub fn doio(&mut self, io: &mut SlotIo<'_>) -> SlotStep {
        let raid = io.buf.is_raid();
        let mut min_speed_per_conn = self
            .min_speed_per_conn(raid, io.env.min_streaming_rate)
            .max(1);
        if raid {
            min_speed_per_conn = min_speed_per_conn.next_multiple_of(RAIDSECTOR);
        }
        self.reset_switch_counters_if_expired(io.env.now);

        for conn in (0..self.reqs.len()).rev() {
            let not_unused = !raid || conn != self.unused.num();

            // 1) drain arrived bytes into the reassembly buffer
            let submit_condition = not_unused
                && matches!(
                    self.reqs[conn].status,
                    ReqStatus::Inflight | ReqStatus::Success
                );
            if submit_condition {
                if !self.reqs[conn].in_buf.is_empty() {
                    let n = self.drain_connection(conn, min_speed_per_conn, io);
                    if n > 0 {
                        self.reqs[conn].last_data = io.env.now;
                        if !self.process_any_output_pieces(io) {
                            return SlotStep::FinishRead;
                        }
                        io.reschedule = Some(TEMPURL_TIMEOUT_DS);
                    }
                }

                if self.reqs[conn].status == ReqStatus::Success
                    && self.reqs[conn].in_buf.is_empty()
                {
                    self.decrease_reqs_inflight(raid);
                    self.reqs[conn].status = ReqStatus::Ready;
                }
            }

            // 2) schedule the next range request
            if self.reqs[conn].status == ReqStatus::Ready {
                let step = self.schedule_connection(conn, raid, io);
                if step != SlotStep::Continue {
                    return step;
                }
            }

            // 3) failures map to spare rotation or a full retry
            if self.reqs[conn].status == ReqStatus::Failure {
                warn!(
                    event = "request_failed",
                    conn,
                    http_status = self.reqs[conn].http_status,
                    "Streaming request failed"
                );
                return self.on_request_failure(conn, io);
            }

            // 4) watchdog
            if let Some(step) = self.watch_over_performance(io) {
                return step;
            }
        }

        SlotStep::Continue
    }

    /// Compute an adaptive submit size for a connection's buffered bytes
    /// and feed the reassembly buffer. Returns the bytes submitted.
    fn drain_connection(&mut self, conn: usize, min_speed_per_conn: u64, io: &mut SlotIo<'_>) -> u64 {
        let raid = io.buf.is_raid();
        let avail = self.reqs[conn].in_buf.len() as u64;
        let elapsed_ms = io.env.now_ms.saturating_sub(self.reqs[conn].post_start_ms);
        let chunk_time = elapsed_ms.saturating_sub(self.throughput[conn].1);

        let n = if self.reqs[conn].status == ReqStatus::Inflight {
            // aggregate the chunk's own throughput with the rolling value
            let updated = Self::calc_throughput(
                self.throughput[conn].0 + avail,
                self.throughput[conn].1 + chunk_time,
            ) * 1000;
            let chunk_tp = Self::calc_throughput(avail, chunk_time) * 1000;
            let aggregated = (chunk_tp + updated) / 2;
            let mut max_chunk = aggregated;

            // submit floor: 16 KB, or the per-connection floor for very
            // slow consumers (divisible by the sector either way)
            let min_chunk_divisible = if max_chunk < MIN_CHUNK_DIVISIBLE_SIZE {
                min_speed_per_conn
            } else {
                MIN_CHUNK_DIVISIBLE_SIZE
            };

            if self.max_chunk_submitted != 0
                && max_chunk != 0
                && max_chunk.max(self.max_chunk_submitted) / max_chunk.min(self.max_chunk_submitted)
                    == 1
            {
                // a similar-but-different size would fragment the stream
                max_chunk = self.max_chunk_submitted;
            }

            let min_chunk = max_chunk.max(min_chunk_divisible);
            if avail >= min_chunk {
                (avail / min_chunk_divisible) * min_chunk_divisible
            } else {
                0
            }
        } else {
            // request finished: submit everything, including a short tail
            avail
        };

        if n == 0 {
            return 0;
        }
        if raid && self.reqs[conn].status != ReqStatus::Success && n % RAIDSECTOR != 0 {
            warn!(
                event = "misaligned_submit_skipped",
                conn, n, "Interim raid submit not sector-aligned"
            );
            return 0;
        }

        let req = &mut self.reqs[conn];
        let data = req.in_buf.split_to(n as usize);
        let piece = FilePiece {
            pos: req.pos,
            buf: data,
        };
        req.pos += n;
        self.throughput[conn].0 += n;
        self.throughput[conn].1 += chunk_time;

        let submitting = if raid { conn } else { 0 };
        let is_final = self.reqs[conn].status == ReqStatus::Success;
        io.buf.submit_buffer(submitting, piece, is_final);

        if n > self.max_chunk_submitted {
            self.max_chunk_submitted = n;
        }
        n
    }

    fn schedule_connection(&mut self, conn: usize, raid: bool, io: &mut SlotIo<'_>) -> SlotStep {
        if self.wait_for_parts_in_flight(raid) {
            return SlotStep::Continue;
        }

        if self.search_and_disconnect_slowest_connection(conn, io.buf) {
            debug!(
                event = "slow_connection_rotated",
                conn,
                unused = self.unused.num(),
                "Continuing pass after retiring slow connection"
            );
        }

        match io.buf.next_n_pos_for_connection(conn) {
            NextPos::NewBufferSupplied => {
                if conn == self.unused.num() && !self.unused_counted_inflight {
                    // reconstructed data counts as an in-flight part
                    self.increase_reqs_inflight(raid, io.env.now);
                    self.unused_counted_inflight = true;
                }
                if !self.process_any_output_pieces(io) {
                    return SlotStep::FinishRead;
                }
                SlotStep::Continue
            }
            NextPos::PauseForRaid => SlotStep::Continue,
            NextPos::Range { lo, hi } => {
                if lo >= hi {
                    self.reqs[conn].status = ReqStatus::Done;
                    if self
                        .reqs
                        .iter()
                        .all(|r| r.status == ReqStatus::Done)
                    {
                        debug!(event = "read_finished", "All requests done; read complete");
                        return SlotStep::FinishRead;
                    }
                    return SlotStep::Continue;
                }

                if !io.valid() {
                    warn!(event = "schedule_dead_consumer", "Chunk wanted but consumer is gone");
                    return SlotStep::FinishRead;
                }

                // non-raided: bound the request so congestion recovery
                // stays responsive on long reads
                let hi = if raid {
                    hi
                } else {
                    hi.min(lo + MAX_DELIVERY_CHUNK)
                };

                let mut url = adjust_url_port(io.buf.temp_url(conn), io.env.use_alt_down_port);
                url.push_str(&format!("/{lo}-"));
                if io.bounded {
                    url.push_str(&format!("{}", hi - 1));
                }

                let reserve = (self.max_chunk_size + self.max_chunk_size / 2) as usize;
                self.throughput[conn] = (0, 0);
                self.reqs[conn].post(url.clone(), lo, reserve, io.env.now_ms);
                io.actions.push(StreamingAction::HttpPost {
                    node: io.node,
                    read: io.read_id,
                    conn,
                    url,
                });
                io.buf.set_transfer_pos(conn, hi);
                self.increase_reqs_inflight(raid, io.env.now);
                debug!(
                    event = "range_requested",
                    conn,
                    lo,
                    hi,
                    inflight = self.num_reqs_inflight,
                    "Range request posted"
                );
                SlotStep::Continue
            }
        }
    }

    fn on_request_failure(&mut self, conn: usize, io: &mut SlotIo<'_>) -> SlotStep {
        if !io.valid() {
            warn!(event = "failure_dead_consumer", "Request failed for a dead consumer");
            return SlotStep::FinishRead;
        }

        let http_status = self.reqs[conn].http_status;
        if http_status == 509 {
            let backoff = if self.reqs[conn].retry_after_ds > 0 {
                self.reqs[conn].retry_after_ds
            } else {
                OVER_TRANSFER_QUOTA_BACKOFF_DS
            };
            warn!(
                event = "bandwidth_overquota",
                backoff, "Storage server reported bandwidth over-quota"
            );
            return self.retry_entire_transfer(Error::OverQuota, backoff);
        }
        self.retry_on_error(conn, http_status, io.buf)
    }
}
