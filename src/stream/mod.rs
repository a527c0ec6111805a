//! Streaming direct-read engine.
//!
//! Multiplexes byte-range reads over remote files: one connection for
//! plain objects, six for raided ones. The engine is a cooperative state
//! machine — `tick` advances everything once and returns the I/O the
//! embedder must perform (URL fetches, HTTP posts); the embedder feeds
//! received bytes and request statuses back between ticks.

pub mod node;
pub mod read;
pub mod slot;

use std::collections::{BTreeMap, HashMap, VecDeque};

use tracing::{debug, info, warn};

use crate::config::{EngineConfig, TIMEOUT_DS};
use crate::error::Error;
use crate::types::{ever, Ds, NodeHandle, NEVER};

use self::node::DirectReadNode;
use self::read::{cb_failure, max_req_size, DirectRead, ReadCallback, ReadId};
use self::slot::{DirectReadSlot, SlotEnv, SlotIo, SlotStep};

/// I/O the embedder must perform after a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamingAction {
    /// Ask the metadata service for fresh temporary URLs of this node.
    FetchUrls { node: NodeHandle },
    /// Issue the posted range request; deliver bytes and final status back
    /// through [`StreamingEngine::deliver`] / [`StreamingEngine::finish`].
    HttpPost {
        node: NodeHandle,
        read: ReadId,
        conn: usize,
        url: String,
    },
}

/// The streaming engine: every direct-read node, the shared deadline map
/// and the ready queue.
pub struct StreamingEngine {
    nodes: HashMap<NodeHandle, DirectReadNode>,
    /// Ordered deadlines `(due, seq) -> node` for next-wake computation.
    deadlines: BTreeMap<(Ds, u64), NodeHandle>,
    deadline_keys: HashMap<NodeHandle, (Ds, u64)>,
    /// Reads whose URLs arrived, awaiting slot creation.
    ready: VecDeque<(NodeHandle, ReadId)>,
    next_read_id: ReadId,
    seq: u64,
    now: Ds,
    /// Streaming disabled until this tick after an over-quota.
    pub overquota_until: Ds,
    pub use_alt_down_port: bool,
    auto_down_port: bool,
    min_streaming_rate: i64,
}

impl StreamingEngine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            nodes: HashMap::new(),
            deadlines: BTreeMap::new(),
            deadline_keys: HashMap::new(),
            ready: VecDeque::new(),
            next_read_id: 1,
            seq: 0,
            now: 0,
            overquota_until: 0,
            use_alt_down_port: false,
            auto_down_port: config.auto_down_port,
            min_streaming_rate: config.min_streaming_rate,
        }
    }

    pub fn now(&self) -> Ds {
        self.now
    }

    pub fn node(&self, handle: NodeHandle) -> Option<&DirectReadNode> {
        self.nodes.get(&handle)
    }

    pub fn node_mut(&mut self, handle: NodeHandle) -> Option<&mut DirectReadNode> {
        self.nodes.get_mut(&handle)
    }

    /// Next deadline the embedder should wake for, if any.
    pub fn next_wakeup(&self) -> Option<Ds> {
        self.deadlines.keys().next().map(|(due, _)| *due)
    }

    // ── Read admission ───────────────────────────────────────────────────

    /// Enqueue a byte-range read on a remote file. `count == 0` means
    /// "to the end of the file". The read starts on the next tick.
    pub fn begin_read(
        &mut self,
        handle: NodeHandle,
        size: u64,
        ctriv: i64,
        offset: u64,
        count: u64,
        callback: ReadCallback,
    ) -> ReadId {
        let id = self.next_read_id;
        self.next_read_id += 1;

        let node = self
            .nodes
            .entry(handle)
            .or_insert_with(|| DirectReadNode::new(handle, size, ctriv));

        let bounded = count > 0;
        let count = if bounded {
            count
        } else {
            size.saturating_sub(offset)
        };
        let mut dr = DirectRead::new(id, offset, count, bounded, callback);

        if !node.tempurls.is_empty() {
            // URLs on hand: queue for immediate fetching
            let mrs = max_req_size(node.size, node.tempurls.len());
            dr.buf
                .set_is_raid(&node.tempurls, offset, offset + count, node.size, mrs, false);
            node.reads.push(dr);
            self.ready.push_back((handle, id));
        } else {
            node.reads.push(dr);
            // a zero deadline fires dispatch on the next tick
            self.schedule(handle, 0);
        }

        info!(
            event = "direct_read_enqueued",
            node = %handle,
            offset,
            count,
            "Direct read enqueued"
        );
        id
    }

    /// Cancel a read from the owner's side; it is destroyed on the next
    /// delivery attempt or tick.
    pub fn cancel_read(&mut self, handle: NodeHandle, id: ReadId) {
        if let Some(node) = self.nodes.get_mut(&handle) {
            if let Some(dr) = node.read_mut(id) {
                dr.revoke();
            }
        }
    }

    // ── External command results ─────────────────────────────────────────

    /// Temporary URLs arrived (or failed) for a node's pending command.
    pub fn cmd_result(
        &mut self,
        handle: NodeHandle,
        result: Result<Vec<String>, (Error, Ds)>,
    ) -> Vec<StreamingAction> {
        let mut actions = Vec::new();
        let Some(node) = self.nodes.get_mut(&handle) else {
            return actions;
        };
        node.pending_cmd = false;

        match result {
            Ok(urls) => {
                node.tempurls = urls;
                let urls = node.tempurls.clone();
                let size = node.size;
                let mut ready_ids = Vec::new();
                for dr in &mut node.reads {
                    if dr.buf.temp_url_vector().is_empty() {
                        let mrs = max_req_size(size, urls.len());
                        debug!(
                            event = "direct_read_starting",
                            node = %handle,
                            size,
                            max_req_size = mrs,
                            "Direct read starting"
                        );
                        dr.buf
                            .set_is_raid(&urls, dr.offset, dr.offset + dr.count, size, mrs, false);
                    } else {
                        // URL refresh: keep everything fetched so far
                        dr.buf.update_urls_and_reset_pos(&urls);
                    }
                    ready_ids.push(dr.id);
                }
                for id in ready_ids {
                    self.ready.push_back((handle, id));
                }
                self.schedule(handle, TIMEOUT_DS);
            }
            Err((e, timeleft)) => {
                self.retry_node(handle, e, timeleft, &mut actions);
            }
        }
        actions
    }

    // ── Transport feedback ───────────────────────────────────────────────

    /// Append received bytes to a posted request.
    pub fn deliver(&mut self, handle: NodeHandle, read: ReadId, conn: usize, bytes: &[u8]) {
        let now = self.now;
        if let Some(req) = self.request_mut(handle, read, conn) {
            req.in_buf.extend_from_slice(bytes);
            req.last_data = now;
        }
    }

    /// Publish a request's final transport status.
    pub fn finish(
        &mut self,
        handle: NodeHandle,
        read: ReadId,
        conn: usize,
        http_status: u16,
        ok: bool,
    ) {
        if let Some(req) = self.request_mut(handle, read, conn) {
            req.http_status = http_status;
            req.status = if ok {
                crate::net::ReqStatus::Success
            } else {
                crate::net::ReqStatus::Failure
            };
        }
    }

    fn request_mut(
        &mut self,
        handle: NodeHandle,
        read: ReadId,
        conn: usize,
    ) -> Option<&mut crate::net::HttpReq> {
        let node = self.nodes.get_mut(&handle)?;
        let dr = node.read_mut(read)?;
        let slot = dr.slot.as_mut()?;
        slot.reqs.get_mut(conn)
    }

    // ── Tick ─────────────────────────────────────────────────────────────

    /// Advance the engine once: fire due deadlines, start ready reads,
    /// run every active slot. Returns the I/O to perform.
    pub fn tick(&mut self, now: Ds) -> Vec<StreamingAction> {
        self.now = now;
        let mut actions = Vec::new();

        self.fire_deadlines(&mut actions);
        self.start_ready_reads();
        self.run_slots(&mut actions);

        actions
    }

    fn fire_deadlines(&mut self, actions: &mut Vec<StreamingAction>) {
        loop {
            let Some((&key, &handle)) = self.deadlines.iter().next() else {
                break;
            };
            if key.0 > self.now {
                break;
            }
            self.deadlines.remove(&key);
            self.deadline_keys.remove(&handle);

            let Some(node) = self.nodes.get(&handle) else {
                continue;
            };
            if node.reads.is_empty() || node.tempurls.is_empty() {
                self.dispatch(handle, actions);
            } else {
                // activity deadline passed with URLs on hand: stale lease
                debug!(event = "tempurl_stale", node = %handle, "Temporary URLs went stale");
                self.retry_node(handle, Error::Again, 0, actions);
            }
        }
    }

    fn start_ready_reads(&mut self) {
        let env = self.slot_env();
        while let Some((handle, id)) = self.ready.pop_front() {
            let Some(node) = self.nodes.get_mut(&handle) else {
                continue;
            };
            let Some(dr) = node.read_mut(id) else {
                continue;
            };
            if dr.slot.is_none() {
                dr.slot = Some(DirectReadSlot::new(&mut dr.buf, dr.offset, dr.progress, &env));
            }
        }
    }

    fn run_slots(&mut self, actions: &mut Vec<StreamingAction>) {
        let env = self.slot_env();
        let handles: Vec<NodeHandle> = self.nodes.keys().copied().collect();

        for handle in handles {
            let mut i = 0;
            loop {
                let Some(node) = self.nodes.get_mut(&handle) else {
                    break;
                };
                if i >= node.reads.len() {
                    break;
                }

                let dr = &mut node.reads[i];
                let Some(slot) = dr.slot.as_mut() else {
                    i += 1;
                    continue;
                };

                let mut io = SlotIo {
                    buf: &mut dr.buf,
                    callback: &mut dr.callback,
                    progress: &mut dr.progress,
                    revoked: dr.revoked,
                    bounded: dr.bounded,
                    node: handle,
                    read_id: dr.id,
                    env,
                    actions: &mut *actions,
                    reschedule: None,
                };
                let step = slot.doio(&mut io);
                let reschedule = io.reschedule;

                match step {
                    SlotStep::Continue => {
                        if let Some(delta) = reschedule {
                            self.schedule(handle, delta);
                        }
                        i += 1;
                    }
                    SlotStep::FinishRead => {
                        let node = self.nodes.get_mut(&handle).expect("node exists");
                        let mut dr = node.reads.remove(i);
                        dr.revoke();
                        debug!(event = "direct_read_destroyed", node = %handle, "Direct read destroyed");
                        if node.reads.is_empty() {
                            self.remove_node(handle);
                            break;
                        }
                    }
                    SlotStep::RetryTransfer { error, timeleft } => {
                        self.retry_node(handle, error, timeleft, actions);
                        break;
                    }
                }
            }
        }
    }

    fn slot_env(&self) -> SlotEnv {
        SlotEnv {
            now: self.now,
            now_ms: self.now * 100,
            min_streaming_rate: self.min_streaming_rate,
            use_alt_down_port: self.use_alt_down_port,
        }
    }

    // ── Node-level control ───────────────────────────────────────────────

    /// Request temporary URLs for a node's pending reads, or reap an
    /// abandoned node.
    fn dispatch(&mut self, handle: NodeHandle, actions: &mut Vec<StreamingAction>) {
        let Some(node) = self.nodes.get(&handle) else {
            return;
        };
        if node.reads.is_empty() {
            debug!(event = "direct_read_node_removed", node = %handle, "Removing idle node");
            self.remove_node(handle);
            return;
        }

        let node = self.nodes.get_mut(&handle).expect("node exists");
        if !node.pending_cmd {
            node.pending_cmd = true;
            actions.push(StreamingAction::FetchUrls { node: handle });
        }
        self.schedule(handle, TIMEOUT_DS);
    }

    /// Abort all active reads, collect the minimum desired retry delay
    /// from their consumers, and reschedule (or reap) the node.
    fn retry_node(
        &mut self,
        handle: NodeHandle,
        e: Error,
        timeleft: Ds,
        actions: &mut Vec<StreamingAction>,
    ) {
        if self.auto_down_port {
            self.use_alt_down_port = !self.use_alt_down_port;
        }

        let Some(node) = self.nodes.get(&handle) else {
            return;
        };
        if node.reads.is_empty() {
            self.remove_node(handle);
            return;
        }

        let mut min_retry = NEVER;
        let retries;
        {
            let node = self.nodes.get_mut(&handle).expect("node exists");
            node.retries += 1;
            retries = node.retries;

            for dr in &mut node.reads {
                dr.abort();
                if dr.has_valid_callback() {
                    let retry_ds = cb_failure(&mut dr.callback, e, retries, timeleft);
                    let terminal_toomany = e == Error::TooMany { extra_info: true };
                    if retry_ds < min_retry && !terminal_toomany {
                        min_retry = retry_ds;
                    }
                }
            }
            // consumers may abandon their reads inside the failure callback
            node.reads.retain_mut(|dr| dr.has_valid_callback());
            node.tempurls.clear();
        }
        self.ready.retain(|(h, _)| *h != handle);
        warn!(
            event = "streaming_retry",
            node = %handle,
            error = %e,
            retries,
            "Streaming transfer retry"
        );

        let reads_left = self.nodes.get(&handle).map_or(0, |n| n.reads.len());
        if reads_left == 0 {
            debug!(event = "direct_read_node_removed", node = %handle, "No reads left to retry");
            self.remove_node(handle);
            return;
        }

        match e {
            Error::OverQuota if timeleft > 0 => {
                // hold every read until the quota window passes
                self.overquota_until = self.now + timeleft;
                min_retry = min_retry.max(timeleft);
            }
            Error::Paywall => min_retry = NEVER,
            _ => {}
        }

        if min_retry == 0 {
            self.dispatch(handle, actions);
        } else if ever(min_retry) {
            self.schedule(handle, min_retry);
        } else {
            debug!(event = "direct_read_node_removed", node = %handle, "Too many errors, removing node");
            self.remove_node(handle);
        }
    }

    /// Place (or replace) the node's deadline `delta` ticks out.
    fn schedule(&mut self, handle: NodeHandle, delta: Ds) {
        if let Some(key) = self.deadline_keys.remove(&handle) {
            self.deadlines.remove(&key);
        }
        if ever(delta) {
            self.seq += 1;
            let key = (self.now + delta, self.seq);
            self.deadlines.insert(key, handle);
            self.deadline_keys.insert(handle, key);
        }
    }

    fn remove_node(&mut self, handle: NodeHandle) {
        if let Some(key) = self.deadline_keys.remove(&handle) {
            self.deadlines.remove(&key);
        }
        self.ready.retain(|(h, _)| *h != handle);
        if let Some(mut node) = self.nodes.remove(&handle) {
            for dr in &mut node.reads {
                dr.revoke();
            }
        }
    }
}
