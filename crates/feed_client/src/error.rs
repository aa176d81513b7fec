//! Error taxonomy for the upstream feed.
//!
//! Nothing here is process-fatal: connection-level failures clear the
//! session and the next operation reconnects lazily.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    /// Socket-level failure (dial, TLS, write, or the reader task dying).
    /// The session is cleared; the next operation reconnects.
    #[error("upstream connection error: {0}")]
    Connection(String),

    /// Transport handshake succeeded but the session response carried no
    /// session id. Retried by the caller's own policy.
    #[error("upstream session handshake failed: {0}")]
    Session(String),

    /// One pending request timed out. The socket itself is not assumed
    /// broken.
    #[error("upstream request {rid} timed out after {timeout_ms}ms")]
    RequestTimeout { rid: String, timeout_ms: u64 },

    /// Application-level error: response frame with `code != 0`.
    #[error("upstream error code {code}: {message}")]
    Upstream { code: i64, message: String },

    /// Unparsable or unclassifiable inbound frame. Counted and dropped by
    /// the reader; only surfaced from explicit parse paths.
    #[error("protocol error: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, FeedError>;
