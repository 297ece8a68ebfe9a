//! Irreversible confinement of the calling process.
//!
//! On Linux a [`SandboxBuilder`] collects what the process may keep and then
//! applies, in a fixed order:
//! - new namespaces (mount, user, IPC, UTS, network, PID, cgroup)
//! - a filesystem jail made of bind mounts on a read-only tmpfs root
//! - a full capability drop
//! - a seccomp syscall filter
//!
//! There is no undo. A failed [`SandboxBuilder::apply`] may leave the process
//! half confined, so callers must exit on error.
//!
//! Every other platform reports [`is_sandbox_supported`] as false and panics
//! if a builder is used anyway.

pub mod config;
pub mod error;
pub mod policy;

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(not(target_os = "linux"))]
mod unsupported;

pub use config::JailOptions;
pub use error::{ApplyPhase, SandboxError};
pub use policy::{BindMount, FilterRule, SyscallAction, SyscallPolicy};

#[cfg(target_os = "linux")]
pub use linux::{is_sandbox_supported, user_namespaces_available, SandboxBuilder};

#[cfg(not(target_os = "linux"))]
pub use unsupported::{is_sandbox_supported, user_namespaces_available, SandboxBuilder};

/// Result type for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;
