//! Centralized configuration constants for the transfer engine.
//!
//! All tunable parameters live here so they can be reviewed and adjusted in
//! a single place. Wire-format constants (record field widths, RAID sector
//! geometry) stay in their respective modules.

use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::types::Ds;

// ── Priorities ───────────────────────────────────────────────────────────────

/// First priority handed out. Large enough that front-of-queue insertions
/// (which subtract [`PRIORITY_STEP`]) never underflow in practice.
pub const PRIORITY_START: u64 = 0x0000_8000_0000_0000;

/// Distance between consecutively appended transfers. Midpoint moves bisect
/// this gap; when a bisection collides the prefix is renumbered on full
/// strides.
pub const PRIORITY_STEP: u64 = 0x0000_0000_1000_0000;

// ── Classic transfers ────────────────────────────────────────────────────────

/// Largest single range request issued by a classic transfer slot.
pub const MAX_REQ_SIZE: u64 = 4 * 1024 * 1024;

/// A temporary URL older than this (seconds) is discarded and re-acquired.
pub const TEMPURL_TIMEOUT_TS: i64 = 172_500;

/// Maximum times a file may vote to defer a failing transfer before the
/// engine surrenders it.
pub const MAX_FILE_DEFERRALS: u32 = 16;

/// Backoff applied between attempts to place a completed download at a
/// destination that reported a transient error.
pub const COMPLETION_RETRY_DS: Ds = 11;

// ── Streaming (direct reads) ─────────────────────────────────────────────────

/// Largest contiguous piece delivered to a streaming consumer in one call.
/// Also bounds per-request ranges on non-RAID reads: re-requesting in
/// bounded chunks keeps TCP congestion recovery responsive.
pub const MAX_DELIVERY_CHUNK: u64 = 16 * 1024 * 1024;

/// Watchdog interval: the mean transfer speed is assessed every time this
/// many deciseconds have elapsed since the last partial-counter reset.
pub const MEAN_SPEED_INTERVAL_DS: Ds = 100;

/// Default minimum acceptable streaming rate when the embedder asks for the
/// default (`min_streaming_rate < 0`). Divided by the number of effective
/// connections to obtain the per-connection floor.
pub const MIN_BYTES_PER_SECOND: u64 = 15 * 1024;

/// Deadline for a direct-read command or a stalled slot before rescheduling.
pub const TIMEOUT_DS: Ds = 100;

/// A streaming temporary URL is considered stale after this long without
/// any request activity.
pub const TEMPURL_TIMEOUT_DS: Ds = 3000;

/// Hysteresis pair for slow-part replacement: the slowest connection is
/// retired to spare when `fastest * RATIO[0] > slowest * RATIO[1]`
/// (i.e. the slowest runs under RATIO[0]/RATIO[1] of the fastest).
pub const SLOWEST_TO_FASTEST_THROUGHPUT_RATIO: [u64; 2] = [2, 5];

/// Watchdog tolerance: with more than this many simultaneously slow parts
/// the whole transfer is retried instead of juggling spares.
pub const MAX_SIMULTANEOUS_SLOW_RAIDED_CONNS: usize = 2;

/// Connection-switch budgets reset after this long.
pub const CONNECTION_SWITCHES_LIMIT_RESET_DS: Ds = 600;

/// Budget for replacements triggered by slowest-vs-fastest divergence.
pub const MAX_CONN_SWITCHES_SLOWEST_PART: u32 = 6;

/// Budget for replacements triggered by the under-threshold watchdog.
pub const MAX_CONN_SWITCHES_BELOW_SPEED_THRESHOLD: u32 = 6;

/// A connection must have moved at least this many bytes before its
/// throughput is compared against its siblings.
pub const DEFAULT_MIN_COMPARABLE_THROUGHPUT: u64 = 64 * 1024;

/// Fallback cooldown after a bandwidth over-quota (HTTP 509) when the
/// server did not say how long to wait.
pub const OVER_TRANSFER_QUOTA_BACKOFF_DS: Ds = 600;

/// Minimum chunk granularity submitted to the reassembly buffer. Divisible
/// by the RAID sector, so it works for both layouts.
pub const MIN_CHUNK_DIVISIBLE_SIZE: u64 = 16 * 1024;

// ── Retry backoff tables ─────────────────────────────────────────────────────

/// Per-direction backoff ceilings in deciseconds (GET, PUT). The backoff
/// timer doubles from [`RETRY_BACKOFF_BASE_DS`] up to the ceiling.
pub const RETRY_BACKOFF_MAX_DS: [Ds; 2] = [36_000, 36_000];

/// First retry delay in deciseconds.
pub const RETRY_BACKOFF_BASE_DS: Ds = 10;

// ── Engine knobs (embedder-adjustable) ───────────────────────────────────────

/// Runtime-adjustable engine settings. Constants above are design choices;
/// these are per-deployment knobs the embedding application may persist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum concurrently active transfers per direction.
    pub max_active_transfers: usize,
    /// Minimum acceptable streaming rate in bytes/s.
    /// `0` disables the check, negative means "use the engine default".
    pub min_streaming_rate: i64,
    /// Probe the alternative download port (8080) after failures on the
    /// standard port.
    pub auto_down_port: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_active_transfers: 6,
            min_streaming_rate: -1,
            auto_down_port: true,
        }
    }
}

impl EngineConfig {
    /// Load settings from disk, falling back to defaults when absent.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Persist settings atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        crate::utils::atomic_write::atomic_write(path, content.as_bytes())
    }
}
