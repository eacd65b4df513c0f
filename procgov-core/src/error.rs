//! Error types for procgov

use thiserror::Error;

use crate::ProcessId;

/// Procgov error types
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `CGroup` operation failed
    #[error("CGroup error: {message}")]
    CGroup {
        /// Error message
        message: String,
    },

    /// Permission denied
    #[error("Permission denied: {operation}")]
    PermissionDenied {
        /// Operation that was denied
        operation: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// Error message
        message: String,
    },

    /// The running kernel does not offer this capability
    #[error("Unsupported capability: {capability}")]
    Unsupported {
        /// Capability that is missing
        capability: String,
    },

    /// Process exited (or became unqueryable) mid-operation
    #[error("Process {pid} is gone")]
    ProcessGone {
        /// Process that disappeared
        pid: ProcessId,
    },

    /// A background task did not stop within its bounded join
    #[error("{component} did not stop in time")]
    ShutdownTimeout {
        /// Component that failed to stop
        component: String,
    },

    /// System error from nix
    #[error("System error: {0}")]
    System(#[from] nix::Error),

    /// JSON (de)serialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Channel send error
    #[error("Channel send error")]
    ChannelSend,

    /// Task join error
    #[error("Task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

impl Error {
    /// Whether this failure is isolated to one resource dimension
    /// (capability absent) and must not fail the whole group.
    #[must_use]
    pub const fn is_soft_fail(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }

    /// Whether this failure means the target process no longer exists.
    #[must_use]
    pub fn is_process_gone(&self) -> bool {
        match self {
            Self::ProcessGone { .. } | Self::System(nix::Error::ESRCH) => true,
            Self::Io(e) => {
                e.kind() == std::io::ErrorKind::NotFound
                    || e.raw_os_error() == Some(nix::libc::ESRCH)
            }
            _ => false,
        }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::ChannelSend
    }
}

/// Result type alias for procgov operations
pub type Result<T> = std::result::Result<T, Error>;
