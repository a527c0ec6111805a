//! Byte-range request contract.
//!
//! The engine never performs network I/O. It creates [`HttpReq`] state
//! machines, announces each POST as a declarative action, and the embedding
//! transport advances the request by appending received bytes and
//! publishing a status. Everything the engine needs to observe lives here.

use bytes::BytesMut;

use crate::types::Ds;

/// Externally-published request status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqStatus {
    /// Idle, ready to be posted.
    Ready,
    /// Posted; bytes may be arriving.
    Inflight,
    /// Transport finished successfully; residual bytes may remain in the
    /// input buffer.
    Success,
    /// Transport failed; `http_status` carries the reason.
    Failure,
    /// This request's range is exhausted for the current window.
    Done,
}

/// One byte-range request over a temporary URL.
#[derive(Debug)]
pub struct HttpReq {
    pub status: ReqStatus,
    pub http_status: u16,
    /// Next submit position (part space for raided reads, file space
    /// otherwise). Advanced as buffered bytes are handed downstream.
    pub pos: u64,
    /// URL the request was posted to, range suffix included.
    pub post_url: String,
    /// Received bytes not yet submitted downstream.
    pub in_buf: BytesMut,
    /// Millisecond timestamp of the POST, for throughput accounting.
    pub post_start_ms: u64,
    /// Last tick any data arrived.
    pub last_data: Ds,
    /// Server-suggested wait after an over-quota reply (0 = none given).
    pub retry_after_ds: Ds,
}

impl HttpReq {
    pub fn new() -> Self {
        Self {
            status: ReqStatus::Ready,
            http_status: 0,
            pos: 0,
            post_url: String::new(),
            in_buf: BytesMut::new(),
            post_start_ms: 0,
            last_data: 0,
            retry_after_ds: 0,
        }
    }

    /// Record a POST; the transport owns delivery from here.
    pub fn post(&mut self, url: String, pos: u64, reserve: usize, now_ms: u64) {
        self.post_url = url;
        self.pos = pos;
        self.in_buf.clear();
        self.in_buf.reserve(reserve);
        self.post_start_ms = now_ms;
        self.http_status = 0;
        self.status = ReqStatus::Inflight;
    }

    /// Drop the connection and return to a fully reusable state.
    pub fn disconnect(&mut self) {
        self.in_buf.clear();
        self.post_url.clear();
        self.http_status = 0;
        self.status = ReqStatus::Ready;
    }
}

impl Default for HttpReq {
    fn default() -> Self {
        Self::new()
    }
}

/// Rewrite a plain-HTTP URL for the alternative download port.
///
/// With `use_alt` set and no explicit port present, `:8080` is inserted
/// before the path; with it clear, an explicit port is stripped. HTTPS
/// URLs pass through untouched.
pub fn adjust_url_port(url: &str, use_alt: bool) -> String {
    if !url.starts_with("http:") {
        return url.to_string();
    }
    // skip "http://" before scanning the authority for ':' and '/'
    let Some(path_start) = url[8..].find('/').map(|i| i + 8) else {
        return url.to_string();
    };
    let port_start = url[8..path_start].find(':').map(|i| i + 8);

    match port_start {
        None if use_alt => {
            let mut adjusted = url.to_string();
            adjusted.insert_str(path_start, ":8080");
            adjusted
        }
        Some(port_start) if !use_alt => {
            let mut adjusted = url.to_string();
            adjusted.replace_range(port_start..path_start, "");
            adjusted
        }
        _ => url.to_string(),
    }
}
