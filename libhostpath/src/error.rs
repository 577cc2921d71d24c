//! Hostpath CSI error types.
//!
//! All errors in the `libhostpath` crate are represented by the [`CsiError`]
//! enum, which derives [`thiserror::Error`] for ergonomic error handling and
//! also implements [`Serialize`]/[`Deserialize`] so errors can travel across
//! the QUIC transport layer.  Each variant is classified into a CSI status
//! code by [`CsiError::code`].

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for CSI operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone)]
pub enum CsiError {
    /// A volume with this ID or name already exists with different parameters.
    #[error("volume {0} already exists")]
    VolumeAlreadyExists(String),

    /// The requested volume was not found.
    #[error("volume {0} not found")]
    VolumeNotFound(String),

    /// A snapshot with this ID or name already exists.
    #[error("snapshot {0} already exists")]
    SnapshotAlreadyExists(String),

    /// The requested snapshot was not found.
    #[error("snapshot {0} not found")]
    SnapshotNotFound(String),

    /// No loop device is bound to the given backing file.
    #[error("no loop device attached to {0}")]
    LoopDeviceNotFound(String),

    /// A mount operation failed.
    #[error("mount failed at {path}: {reason}")]
    MountFailed {
        /// Filesystem path where the mount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// An unmount operation failed.
    #[error("unmount failed at {path}: {reason}")]
    UnmountFailed {
        /// Filesystem path where the unmount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// An external host tool (`losetup`, `tar`, `cp`, ...) failed.
    #[error("{command} failed: {output}")]
    ToolFailed {
        /// The command line that was executed.
        command: String,
        /// Captured stdout and stderr of the tool.
        output: String,
    },

    /// The caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The entity is not in a state that allows the operation.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// The requested capacity exceeds what the driver can provide.
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// The operation is not supported by this driver.
    #[error("unimplemented: {0}")]
    Unimplemented(String),

    /// A QUIC / transport-level error.
    #[error("transport error: {0}")]
    TransportError(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// CSI status code carried by every failed response.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StatusCode {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    OutOfRange,
    Internal,
    Unimplemented,
    Unavailable,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidArgument => "InvalidArgument",
            Self::NotFound => "NotFound",
            Self::AlreadyExists => "AlreadyExists",
            Self::FailedPrecondition => "FailedPrecondition",
            Self::OutOfRange => "OutOfRange",
            Self::Internal => "Internal",
            Self::Unimplemented => "Unimplemented",
            Self::Unavailable => "Unavailable",
        };
        f.write_str(s)
    }
}

impl CsiError {
    /// Classify the error into the status code reported to the orchestrator.
    pub fn code(&self) -> StatusCode {
        match self {
            Self::VolumeAlreadyExists(_) | Self::SnapshotAlreadyExists(_) => {
                StatusCode::AlreadyExists
            }
            Self::VolumeNotFound(_) | Self::SnapshotNotFound(_) | Self::LoopDeviceNotFound(_) => {
                StatusCode::NotFound
            }
            Self::InvalidArgument(_) => StatusCode::InvalidArgument,
            Self::FailedPrecondition(_) => StatusCode::FailedPrecondition,
            Self::OutOfRange(_) => StatusCode::OutOfRange,
            Self::Unimplemented(_) => StatusCode::Unimplemented,
            Self::TransportError(_) => StatusCode::Unavailable,
            Self::MountFailed { .. }
            | Self::UnmountFailed { .. }
            | Self::ToolFailed { .. }
            | Self::Internal(_) => StatusCode::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.code() == StatusCode::NotFound
    }

    pub fn is_already_exists(&self) -> bool {
        self.code() == StatusCode::AlreadyExists
    }

    /// Create a [`CsiError::TransportError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn transport<E: std::fmt::Display>(e: E) -> Self {
        Self::TransportError(e.to_string())
    }

    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Shorthand for [`CsiError::InvalidArgument`].
    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        Self::InvalidArgument(msg.into())
    }
}
