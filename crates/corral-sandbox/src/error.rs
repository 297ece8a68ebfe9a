//! Sandbox error types.

use std::fmt;
use std::io;
use thiserror::Error;

/// The ordered steps of [`SandboxBuilder::apply`](crate::SandboxBuilder::apply).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApplyPhase {
    /// Creating the new namespaces.
    Namespaces,

    /// Writing the user namespace UID/GID maps.
    UserMapping,

    /// Building the filesystem jail and switching into it.
    MountJail,

    /// Dropping capabilities.
    Capabilities,

    /// Loading the syscall filter.
    SyscallFilter,
}

impl ApplyPhase {
    /// Short human readable name of the phase.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Namespaces => "namespace creation",
            Self::UserMapping => "user namespace mapping",
            Self::MountJail => "filesystem jail",
            Self::Capabilities => "capability drop",
            Self::SyscallFilter => "syscall filter",
        }
    }
}

impl fmt::Display for ApplyPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while configuring or applying a sandbox.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Sandboxing (or one of its mechanisms) is unavailable here.
    #[error("Sandboxing not supported: {0}")]
    UnsupportedPlatform(String),

    /// Invalid configuration: duplicate or malformed filter rule, bad mount path.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The process is too privileged to be sandboxed.
    #[error("Privilege error: {0}")]
    Privilege(String),

    /// An OS call failed while the sandbox was being applied.
    #[error("Sandbox {phase} failed: {context}: {source}")]
    Apply {
        /// Phase that failed.
        phase: ApplyPhase,

        /// What was being done, including the path or syscall involved.
        context: String,

        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
}

impl SandboxError {
    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new unsupported platform error.
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedPlatform(msg.into())
    }

    /// Create a new privilege error.
    pub fn privilege(msg: impl Into<String>) -> Self {
        Self::Privilege(msg.into())
    }

    /// Create a new apply failure.
    pub fn apply(
        phase: ApplyPhase,
        context: impl Into<String>,
        source: impl Into<io::Error>,
    ) -> Self {
        Self::Apply {
            phase,
            context: context.into(),
            source: source.into(),
        }
    }

    /// Phase in which an apply failure happened.
    pub fn phase(&self) -> Option<ApplyPhase> {
        match self {
            Self::Apply { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// Check if this error may have left the process partially confined.
    ///
    /// The caller must terminate the process when this returns true.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Apply { .. })
    }
}
