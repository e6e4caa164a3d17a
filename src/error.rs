use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias used throughout the worker.
pub type Result<T> = std::result::Result<T, WorkerError>;

/// Error types that can occur while talking to a PLC or servicing an RPC.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// IO error (network issues, connection problems).
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Protocol error (invalid packet format, unsupported features).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Tag not found in PLC.
    #[error("Tag not found: {0}")]
    TagNotFound(String),

    /// Invalid response from PLC.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Operation timed out.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Connection error (PLC not responding, session issues).
    #[error("Connection error: {0}")]
    Connection(String),

    /// A required RPC parameter was missing or malformed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Catch-all for failures that don't fit another variant.
    #[error("{0}")]
    Other(String),
}

impl WorkerError {
    /// True for the known recoverable session-teardown failure mode
    /// (large tag counts tripping a malformed forward-close reply). The
    /// Poll Group Runner treats these specially (§4.3); every other error
    /// is fatal to the session or the RPC call that raised it.
    ///
    /// Substring matching is a last resort: the underlying driver here
    /// doesn't expose a structured "session torn down mid-flight" variant,
    /// so we fall back to inspecting the rendered message the way the
    /// original worker did.
    pub fn is_recoverable_session_error(&self) -> bool {
        let msg = self.to_string().to_lowercase();
        msg.contains("forward_close") || msg.contains("failed to parse reply")
    }
}

/// JSON-RPC reserved error code: malformed request body.
pub const RPC_PARSE_ERROR: i64 = -32700;
/// JSON-RPC reserved error code: unknown method name.
pub const RPC_METHOD_NOT_FOUND: i64 = -32601;
/// Handler-level failure (precondition violation, driver error, ...).
pub const RPC_HANDLER_ERROR: i64 = -32000;
