//! Error types for sandbench-vm.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, VmError>;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("invalid VM config: {0}")]
    InvalidConfig(String),

    /// Firecracker process could not be set up
    #[error("failed to launch firecracker: {0}")]
    Launch(String),

    #[error("guest failed to boot: {0}")]
    Boot(String),

    #[error("failed to kill VM: {0}")]
    Kill(String),

    /// The API socket answered with a non-2xx status
    #[error("firecracker API {endpoint} returned {status}: {body}")]
    Api {
        endpoint: String,
        status: u16,
        body: String,
    },

    /// The API socket could not be reached
    #[error("firecracker API unreachable: {0}")]
    Transport(String),

    #[error("TAP network: {0}")]
    Network(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
