//! Unified error types for the Stockade workspace.
//!
//! Every privileged operation reports one of these variants. The variant
//! decides how the caller reacts: configuration problems abort before any
//! privileged action, restoration failures leave the server in an unsafe
//! state, everything else is fatal to the current construction attempt.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum StockadeError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value or request payload is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// An identity change could not be performed.
    #[error("privilege error: {message}")]
    Privilege {
        /// Description of the failed identity change.
        message: String,
    },

    /// The pre-call filesystem identity could not be restored.
    #[error("failed to restore filesystem identity: {message}")]
    IdentityRestore {
        /// Description of the identity left in place.
        message: String,
    },

    /// Joining a namespace failed; membership is unchanged.
    #[error("namespace error: {message}")]
    Namespace {
        /// Description of the failed namespace transition.
        message: String,
    },

    /// Returning to the caller's own namespace failed.
    #[error("failed to restore namespace: {message}")]
    NamespaceRestore {
        /// Description of the namespace left in place.
        message: String,
    },

    /// A step of the root filesystem switch failed.
    #[error("root switch failed during {step}: {message}")]
    RootSwitch {
        /// The step that failed.
        step: &'static str,
        /// Underlying failure.
        message: String,
    },

    /// A mount syscall failed.
    #[error("mount {spec} on {target} failed: {message}")]
    Mount {
        /// Mount source as given by the caller.
        spec: String,
        /// Mount target.
        target: PathBuf,
        /// Underlying kernel error.
        message: String,
    },

    /// Loop attachment or encrypted device unlock failed.
    #[error("device error: {message}")]
    Device {
        /// Description of the device failure.
        message: String,
    },

    /// Starting, signaling or reaping a contained process failed.
    #[error("process error: {message}")]
    Process {
        /// Description of the process failure.
        message: String,
    },

    /// The channel between supervisor and privileged server failed.
    #[error("transport error: {message}")]
    Transport {
        /// Description of the transport failure.
        message: String,
    },

    /// An error reported by the remote privileged server.
    #[error("remote {kind} error: {message}")]
    Remote {
        /// Class of the remote failure.
        kind: ErrorKind,
        /// Message produced by the server.
        message: String,
    },

    /// An internal invariant of the runtime was violated.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the violated invariant.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl StockadeError {
    /// Returns the serializable class of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } => ErrorKind::Io,
            Self::Config { .. } | Self::Serialization { .. } => ErrorKind::Config,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Privilege { .. } => ErrorKind::Privilege,
            Self::IdentityRestore { .. } | Self::NamespaceRestore { .. } => ErrorKind::Unsafe,
            Self::Namespace { .. } => ErrorKind::Namespace,
            Self::RootSwitch { .. } => ErrorKind::RootSwitch,
            Self::Mount { .. } => ErrorKind::Mount,
            Self::Device { .. } => ErrorKind::Device,
            Self::Process { .. } => ErrorKind::Process,
            Self::Transport { .. } => ErrorKind::Transport,
            Self::Remote { kind, .. } => *kind,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Returns whether the failing thread's identity or namespace state is
    /// no longer known, in which case no further request may be served.
    #[must_use]
    pub const fn is_unsafe(&self) -> bool {
        matches!(self.kind(), ErrorKind::Unsafe)
    }
}

/// Wire-level class of a [`StockadeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed request or configuration.
    Config,
    /// Unknown engine or missing resource.
    NotFound,
    /// Identity escalation failed.
    Privilege,
    /// Identity or namespace restoration failed.
    Unsafe,
    /// Namespace join failed.
    Namespace,
    /// Root switch failed.
    RootSwitch,
    /// Mount failed.
    Mount,
    /// Loop or crypt device failure.
    Device,
    /// Contained process failure.
    Process,
    /// Channel failure.
    Transport,
    /// Filesystem I/O failure.
    Io,
    /// Violated runtime invariant.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Config => "config",
            Self::NotFound => "not-found",
            Self::Privilege => "privilege",
            Self::Unsafe => "unsafe-state",
            Self::Namespace => "namespace",
            Self::RootSwitch => "root-switch",
            Self::Mount => "mount",
            Self::Device => "device",
            Self::Process => "process",
            Self::Transport => "transport",
            Self::Io => "io",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, StockadeError>;
