//! Sandbox policy definitions.
//!
//! These types describe *what* a sandbox allows. They carry no kernel state and
//! are identical on every platform; turning them into a confinement is the job
//! of [`SandboxBuilder`](crate::SandboxBuilder).

use crate::error::SandboxError;
use crate::Result;
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Action taken by the kernel when a filtered syscall is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyscallAction {
    /// Let the syscall through.
    Allow,

    /// Let the syscall through and log it to the audit log.
    Log,

    /// Fail the syscall with `EPERM`.
    Block,

    /// Send `SIGSYS` to the calling thread.
    Trap,

    /// Kill the process (or only the thread on kernels without process kill).
    Kill,
}

impl fmt::Display for SyscallAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Allow => "allow",
            Self::Log => "log",
            Self::Block => "block",
            Self::Trap => "trap",
            Self::Kill => "kill",
        };
        f.write_str(name)
    }
}

/// A single syscall rule.
///
/// `name` is either a plain syscall name (`"read"`) or a compound specifier
/// restricting one syscall by its arguments (`"ioctl/tty"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FilterRule {
    /// Syscall name or compound specifier.
    pub name: String,

    /// Action for matching calls.
    pub action: SyscallAction,
}

impl FilterRule {
    /// Create a new rule.
    pub fn new(name: impl Into<String>, action: SyscallAction) -> Self {
        Self {
            name: name.into(),
            action,
        }
    }
}

/// Syscall filter rules plus the action for everything they do not name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyscallPolicy {
    default_action: SyscallAction,
    rules: Vec<FilterRule>,
}

impl SyscallPolicy {
    /// Create an empty policy.
    pub fn new(default_action: SyscallAction) -> Self {
        Self {
            default_action,
            rules: Vec::new(),
        }
    }

    /// Add a rule.
    pub fn with_rule(mut self, name: impl Into<String>, action: SyscallAction) -> Self {
        self.rules.push(FilterRule::new(name, action));
        self
    }

    /// Add the same action for several syscalls.
    pub fn with_rules<I, S>(mut self, action: SyscallAction, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rules
            .extend(names.into_iter().map(|name| FilterRule::new(name, action)));
        self
    }

    /// Action for syscalls no rule names.
    pub fn default_action(&self) -> SyscallAction {
        self.default_action
    }

    /// All rules, in insertion order.
    pub fn rules(&self) -> &[FilterRule] {
        &self.rules
    }

    /// Rules that change the outcome, i.e. whose action differs from the default.
    pub fn effective_rules(&self) -> impl Iterator<Item = &FilterRule> {
        self.rules
            .iter()
            .filter(move |rule| rule.action != self.default_action)
    }
}

/// A path exposed inside the filesystem jail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    /// Host path to expose.
    pub source: PathBuf,

    /// Where it appears, relative to the jail root (but written as an absolute path).
    pub dest: PathBuf,

    /// Mount read-only.
    pub readonly: bool,
}

impl BindMount {
    /// Create a bind mount, rejecting relative or escaping paths.
    pub fn new(
        source: impl Into<PathBuf>,
        dest: impl Into<PathBuf>,
        readonly: bool,
    ) -> Result<Self> {
        let source = source.into();
        let dest = dest.into();

        check_path(&source, "source")?;
        check_path(&dest, "destination")?;
        if dest.components().all(|c| c == Component::RootDir) {
            return Err(SandboxError::config(format!(
                "Cannot bind mount '{}' over the sandbox root",
                source.display()
            )));
        }

        Ok(Self {
            source,
            dest,
            readonly,
        })
    }

    /// Expose a host path at the same location inside the jail.
    pub fn reveal(path: impl Into<PathBuf>, readonly: bool) -> Result<Self> {
        let path = path.into();
        Self::new(path.clone(), path, readonly)
    }

    /// Destination path under the given jail root.
    pub fn dest_under(&self, root: &Path) -> PathBuf {
        let relative: PathBuf = self
            .dest
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect();
        root.join(relative)
    }
}

fn check_path(path: &Path, what: &str) -> Result<()> {
    if !path.is_absolute() {
        return Err(SandboxError::config(format!(
            "Bind mount {what} '{}' is not an absolute path",
            path.display()
        )));
    }
    if path.components().any(|c| c == Component::ParentDir) {
        return Err(SandboxError::config(format!(
            "Bind mount {what} '{}' must not contain '..'",
            path.display()
        )));
    }
    Ok(())
}
