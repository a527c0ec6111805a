//! Engine error kinds and their retry semantics.
//!
//! HTTP-level failures are consumed first by the streaming slot and mapped
//! into {retry-same-part, promote-to-spare, retry-entire-transfer}.
//! Transfer-level failures consult each attached file, which votes whether
//! to keep retrying; only unanimous surrender or an explicitly fatal kind
//! terminates the transfer.

use std::fmt;

/// Error kinds surfaced by the engine and its collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Bad arguments — for a transfer this means the target handle is gone.
    Args,
    /// Transient condition, retry after backoff.
    Again,
    /// Rate limited by the service.
    RateLimit,
    /// Transfer failed (generic transport-level failure).
    Failed,
    /// Too many concurrent connections or transfers.
    TooMany { extra_info: bool },
    /// Resource temporarily unavailable.
    TempUnavail,
    /// Storage or bandwidth quota exceeded.
    OverQuota,
    /// Account is past the free-tier grace period (paywall).
    Paywall,
    /// Target node is blocked (takedown).
    Blocked,
    /// Sub-user key missing; uploads cannot be encrypted for the target.
    SubUserKeyMissing,
    /// Business account expired.
    BusinessPastDue,
    /// Request incomplete (cancellation).
    Incomplete,
    /// Local write failed or downloaded content failed verification.
    Write,
    /// Local read failed or source file changed during upload.
    Read,
    /// Decryption key or MAC mismatch.
    Key,
    /// No such object.
    NotFound,
}

impl Error {
    /// Errors that terminate a transfer regardless of file votes.
    pub fn is_fatal_for_transfer(&self) -> bool {
        matches!(self, Error::BusinessPastDue)
    }

    /// Transient kinds a file may vote to retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Again
                | Error::RateLimit
                | Error::TempUnavail
                | Error::TooMany { extra_info: false }
                | Error::Failed
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Error::Args => "invalid arguments",
            Error::Again => "try again",
            Error::RateLimit => "rate limited",
            Error::Failed => "failed",
            Error::TooMany { extra_info: false } => "too many requests",
            Error::TooMany { extra_info: true } => "too many requests (terminal)",
            Error::TempUnavail => "temporarily unavailable",
            Error::OverQuota => "over quota",
            Error::Paywall => "paywall",
            Error::Blocked => "blocked",
            Error::SubUserKeyMissing => "sub-user key missing",
            Error::BusinessPastDue => "business account past due",
            Error::Incomplete => "incomplete",
            Error::Write => "write error",
            Error::Read => "read error",
            Error::Key => "key or MAC mismatch",
            Error::NotFound => "not found",
        };
        f.write_str(s)
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Again.is_transient());
        assert!(Error::TooMany { extra_info: false }.is_transient());
        assert!(!Error::TooMany { extra_info: true }.is_transient());
        assert!(!Error::Paywall.is_transient());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::BusinessPastDue.is_fatal_for_transfer());
        assert!(!Error::OverQuota.is_fatal_for_transfer());
    }
}
