//! Stand-in for platforms without sandboxing.
//!
//! [`is_sandbox_supported`] returns false and every builder operation panics:
//! running unconfined after asking for a sandbox is never acceptable.

use crate::config::JailOptions;
use crate::policy::{SyscallAction, SyscallPolicy};
use crate::Result;
use std::path::PathBuf;

/// Check if sandboxing is supported on this platform.
pub fn is_sandbox_supported() -> bool {
    false
}

/// Check if unprivileged user namespaces look available.
pub fn user_namespaces_available() -> bool {
    false
}

fn unsupported(operation: &str) -> ! {
    panic!(
        "SandboxBuilder::{operation}() called on {}, which cannot be sandboxed",
        std::env::consts::OS
    )
}

/// Sandbox builder for platforms without sandboxing. Every method panics.
#[derive(Debug, Default)]
pub struct SandboxBuilder {
    _private: (),
}

impl SandboxBuilder {
    /// Create a builder. Succeeds; every later call panics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Panics: namespaces are Linux-only.
    pub fn isolate_process(&mut self) {
        unsupported("isolate_process")
    }

    /// Panics: the filesystem jail is Linux-only.
    pub fn mount_path(
        &mut self,
        _src: impl Into<PathBuf>,
        _dest: impl Into<PathBuf>,
        _readonly: bool,
    ) -> Result<()> {
        unsupported("mount_path")
    }

    /// Panics: the filesystem jail is Linux-only.
    pub fn reveal_paths<I, P>(&mut self, _paths: I, _readonly: bool) -> Result<()>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        unsupported("reveal_paths")
    }

    /// Panics: the filesystem jail is Linux-only.
    pub fn set_jail_options(&mut self, _options: JailOptions) {
        unsupported("set_jail_options")
    }

    /// Panics: seccomp is Linux-only.
    pub fn init_syscall_filter(&mut self, _default_action: SyscallAction) -> Result<()> {
        unsupported("init_syscall_filter")
    }

    /// Panics: seccomp is Linux-only.
    pub fn filter_syscalls<I, S>(&mut self, _action: SyscallAction, _names: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        unsupported("filter_syscalls")
    }

    /// Panics: seccomp is Linux-only.
    pub fn filter_policy(&mut self, _policy: &SyscallPolicy) -> Result<()> {
        unsupported("filter_policy")
    }

    /// Panics: capability sets are Linux-only.
    pub fn drop_capabilities(&mut self) {
        unsupported("drop_capabilities")
    }

    /// Panics rather than leave the process unconfined.
    pub fn apply(self) -> Result<()> {
        unsupported("apply")
    }
}
