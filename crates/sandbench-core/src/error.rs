//! Error types for sandbench-core.

use thiserror::Error;

/// Result type alias for sandbench-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur during sandbox operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// No provider registered under this name
    #[error("provider not found: {0}")]
    ProviderNotFound(String),

    /// Provider is registered but its backend is not usable on this host
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// A sandbox with this id is already registered or being created
    #[error("sandbox already exists: {0}")]
    DuplicateSandbox(String),

    #[error("sandbox not found: {0}")]
    SandboxNotFound(String),

    /// Backend failed to start the instance
    #[error("failed to create sandbox: {0}")]
    CreateFailed(String),

    /// Command could not be delivered or its output could not be collected
    #[error("exec transport failed: {0}")]
    ExecTransportFailed(String),

    /// Remote channel never became ready
    #[error("connection timed out after {attempts} attempt(s): {message}")]
    ConnectTimeout {
        /// Number of connection attempts made
        attempts: u32,
        /// Error from the last attempt
        message: String,
    },

    /// Non-root user could not be installed
    #[error("user setup failed: {0}")]
    UserSetupFailed(String),

    /// Framed output stream was malformed
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Statistics were requested over zero samples
    #[error("cannot summarize an empty sample set")]
    EmptySampleSet,

    /// Port counter ran past 65535
    #[error("no ports left to allocate")]
    PortsExhausted,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from decoding a multiplexed stdout/stderr stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Frame header carried a stream type other than stdout (1) or stderr (2)
    #[error("unknown stream type {stream_type} in frame at byte {offset}")]
    UnknownStreamType {
        /// The offending type byte
        stream_type: u8,
        /// Offset of the frame header from the start of the stream
        offset: u64,
    },

    /// Stream ended in the middle of a frame
    #[error("stream truncated: {remaining} byte(s) left over after the last complete frame")]
    Truncated {
        /// Bytes buffered when the stream ended
        remaining: usize,
    },
}
