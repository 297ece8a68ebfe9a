//! The sandbox builder: configure, then apply once.

use super::capabilities;
use super::jail::FilesystemJail;
use super::namespace::{self, Credentials, Namespace, NamespaceSet};
use super::seccomp::{self, SyscallFilter};
use crate::config::JailOptions;
use crate::error::{ApplyPhase, SandboxError};
use crate::policy::{BindMount, SyscallAction, SyscallPolicy};
use crate::Result;
use seccompiler::BpfProgram;
use std::path::PathBuf;
use tracing::{debug, error};

/// How far [`SandboxBuilder::apply`] got.
///
/// Nothing is rolled back once the process is `Committed`: the namespaces,
/// mounts and privileges changed so far stay changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Configured,
    Committed,
}

impl Stage {
    /// Record the outcome of a step that changes the process.
    ///
    /// A failed `unshare` leaves the process untouched; any other outcome of
    /// a step that ran means something already changed.
    fn record(&mut self, outcome: &Result<()>) {
        let untouched =
            matches!(outcome, Err(e) if e.phase() == Some(ApplyPhase::Namespaces));
        if !untouched {
            *self = Stage::Committed;
        }
    }
}

/// Builds and applies the confinement of the calling process.
///
/// The builder is single use: [`apply`](Self::apply) consumes it. It is also
/// not `Clone`, since the filter it carries only makes sense applied once.
///
/// ```no_run
/// use corral_sandbox::{SandboxBuilder, SyscallAction};
///
/// let mut sandbox = SandboxBuilder::new();
/// sandbox.isolate_process();
/// sandbox.mount_path("/usr/lib", "/usr/lib", true)?;
/// sandbox.drop_capabilities();
/// sandbox.init_syscall_filter(SyscallAction::Kill)?;
/// sandbox.filter_syscalls(SyscallAction::Allow, ["read", "write", "exit_group"])?;
///
/// if let Err(err) = sandbox.apply() {
///     eprintln!("{err}");
///     std::process::exit(1);
/// }
/// # Ok::<(), corral_sandbox::SandboxError>(())
/// ```
#[derive(Debug, Default)]
pub struct SandboxBuilder {
    namespaces: NamespaceSet,
    jail: FilesystemJail,
    filter: Option<SyscallFilter>,
    drop_caps: bool,
}

impl SandboxBuilder {
    /// Create a builder that confines nothing yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request every namespace kind: mount, user, IPC, UTS, network, PID and cgroup.
    pub fn isolate_process(&mut self) {
        self.namespaces = NamespaceSet::all();
    }

    /// Expose `src` at `dest` inside the filesystem jail.
    ///
    /// Both paths must be absolute. Mounts are made in the order they are added.
    pub fn mount_path(
        &mut self,
        src: impl Into<PathBuf>,
        dest: impl Into<PathBuf>,
        readonly: bool,
    ) -> Result<()> {
        self.jail.add(BindMount::new(src, dest, readonly)?);
        Ok(())
    }

    /// Expose each path at the same location inside the jail.
    pub fn reveal_paths<I, P>(&mut self, paths: I, readonly: bool) -> Result<()>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        for path in paths {
            self.jail.add(BindMount::reveal(path, readonly)?);
        }
        Ok(())
    }

    /// Replace the jail tunables.
    pub fn set_jail_options(&mut self, options: JailOptions) {
        self.jail.set_options(options);
    }

    /// Enable syscall filtering with the action for unlisted syscalls.
    ///
    /// Probes kernel seccomp support, including whether the whole process can
    /// be killed on a violation.
    pub fn init_syscall_filter(&mut self, default_action: SyscallAction) -> Result<()> {
        if self.filter.is_some() {
            return Err(SandboxError::config("Syscall filter is already initialized"));
        }
        self.filter = Some(SyscallFilter::init(default_action)?);
        Ok(())
    }

    /// Apply `action` to each named syscall or compound specifier.
    pub fn filter_syscalls<I, S>(&mut self, action: SyscallAction, names: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.filter
            .as_mut()
            .ok_or_else(|| {
                SandboxError::config(
                    "init_syscall_filter() must be called before filter_syscalls()",
                )
            })?
            .filter_syscalls(action, names)
    }

    /// Initialize the syscall filter from a complete policy.
    pub fn filter_policy(&mut self, policy: &SyscallPolicy) -> Result<()> {
        self.init_syscall_filter(policy.default_action())?;
        for rule in policy.rules() {
            self.filter_syscalls(rule.action, [rule.name.as_str()])?;
        }
        Ok(())
    }

    /// Drop every capability when the sandbox is applied.
    pub fn drop_capabilities(&mut self) {
        self.drop_caps = true;
    }

    /// Check the configuration without touching the kernel.
    fn validate(&self) -> Result<()> {
        if !self.jail.mounts().is_empty() && !self.namespaces.contains(Namespace::Mount) {
            return Err(SandboxError::config(
                "Bind mounts need a mount namespace; call isolate_process()",
            ));
        }
        Ok(())
    }

    /// Confine the calling process.
    ///
    /// Runs, in order: namespace creation and ID mapping, the filesystem jail,
    /// the capability drop and the syscall filter. Configuration problems are
    /// reported before anything changes. Any [`SandboxError::Apply`] error may
    /// leave the process half confined; the caller must exit.
    pub fn apply(self) -> Result<()> {
        let creds = Credentials::current();
        creds.ensure_unprivileged()?;
        self.validate()?;

        let program = self.filter.as_ref().map(SyscallFilter::compile).transpose()?;

        let mut stage = Stage::Configured;
        let result = self.commit(&creds, program.as_ref(), &mut stage);
        if let Err(e) = &result {
            if stage == Stage::Committed {
                error!("Sandbox partially applied, the process must exit: {}", e);
            }
        }
        result
    }

    fn commit(
        &self,
        creds: &Credentials,
        program: Option<&BpfProgram>,
        stage: &mut Stage,
    ) -> Result<()> {
        if !self.namespaces.is_empty() {
            let entered = namespace::enter(self.namespaces, creds);
            stage.record(&entered);
            entered?;
        }

        if self.namespaces.contains(Namespace::Mount) {
            let jailed = self.jail.enter();
            stage.record(&jailed);
            jailed?;
        }

        if self.drop_caps {
            let dropped = capabilities::drop_all();
            stage.record(&dropped);
            dropped?;
        }

        if let Some(program) = program {
            debug!("Applying syscall filters");
            let loaded = seccomp::load(program);
            stage.record(&loaded);
            loaded?;
        }

        Ok(())
    }
}
