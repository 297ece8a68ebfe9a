//! Seccomp syscall filtering for Linux.

use super::bpf::{
    self, ArgCondition, ArgWidth, ConditionalRule, SyscallGroup, SECCOMP_RET_ALLOW,
    SECCOMP_RET_DATA, SECCOMP_RET_ERRNO, SECCOMP_RET_KILL_PROCESS, SECCOMP_RET_KILL_THREAD,
    SECCOMP_RET_LOG, SECCOMP_RET_TRAP,
};
use super::syscalls;
use crate::error::{ApplyPhase, SandboxError};
use crate::policy::SyscallAction;
use crate::Result;
use nix::errno::Errno;
use seccompiler::BpfProgram;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io;
use tracing::{debug, warn};

const SECCOMP_GET_ACTION_AVAIL: libc::c_ulong = 2;

/// Kernel action used for [`SyscallAction::Kill`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillAction {
    /// Kill the whole process (Linux 4.14+).
    Process,

    /// Kill only the offending thread.
    Thread,
}

impl KillAction {
    /// Ask the kernel whether process-level kill is available.
    pub fn probe() -> Self {
        let action: u32 = SECCOMP_RET_KILL_PROCESS;
        let ret = unsafe {
            libc::syscall(
                libc::SYS_seccomp,
                SECCOMP_GET_ACTION_AVAIL,
                0,
                &action as *const u32,
            )
        };

        if ret == 0 {
            Self::Process
        } else {
            warn!("Seccomp action KILL_PROCESS is not available; falling back to KILL_THREAD");
            Self::Thread
        }
    }

    fn code(self) -> u32 {
        match self {
            Self::Process => SECCOMP_RET_KILL_PROCESS,
            Self::Thread => SECCOMP_RET_KILL_THREAD,
        }
    }
}

/// A syscall restricted by its arguments, written `syscall/family`.
struct Specifier {
    name: &'static str,
    syscall: &'static str,
    /// Alternatives joined with OR; the conditions inside each one with AND.
    alternatives: fn() -> Result<Vec<Vec<ArgCondition>>>,
}

const SPECIFIERS: &[Specifier] = &[
    Specifier {
        name: "ioctl/tty",
        syscall: "ioctl",
        alternatives: tty_ioctl,
    },
    Specifier {
        name: "mmap/anon",
        syscall: "mmap",
        alternatives: anonymous_mmap,
    },
    Specifier {
        name: "mmap/shared",
        syscall: "mmap",
        alternatives: shared_mmap,
    },
    Specifier {
        name: "mprotect/noexec",
        syscall: "mprotect",
        alternatives: noexec_mprotect,
    },
    Specifier {
        name: "clone/thread",
        syscall: "clone",
        alternatives: thread_clone,
    },
];

/// Terminal ioctl request codes all live in the `'T'` (0x54) family.
const TTY_IOCTL_MASK: u64 = 0xFFFF_FFFF_FFFF_FF00;
const TTY_IOCTL_FAMILY: u64 = 0x5400;

fn tty_ioctl() -> Result<Vec<Vec<ArgCondition>>> {
    Ok(vec![vec![ArgCondition::masked_eq(
        1,
        ArgWidth::Qword,
        TTY_IOCTL_MASK,
        TTY_IOCTL_FAMILY,
    )?]])
}

fn prot_noexec(index: u8) -> Result<ArgCondition> {
    ArgCondition::masked_eq(index, ArgWidth::Dword, libc::PROT_EXEC as u64, 0)
}

fn anonymous_mmap() -> Result<Vec<Vec<ArgCondition>>> {
    let private_anon = (libc::MAP_PRIVATE | libc::MAP_ANONYMOUS) as u64;

    [
        private_anon,
        private_anon | libc::MAP_STACK as u64,
        private_anon | libc::MAP_NORESERVE as u64,
    ]
    .into_iter()
    .map(|flags| {
        Ok(vec![
            prot_noexec(2)?,
            ArgCondition::eq(3, ArgWidth::Dword, flags)?,
            // fd == -1
            ArgCondition::eq(4, ArgWidth::Dword, u64::from(u32::MAX))?,
        ])
    })
    .collect()
}

fn shared_mmap() -> Result<Vec<Vec<ArgCondition>>> {
    Ok(vec![vec![
        prot_noexec(2)?,
        ArgCondition::eq(3, ArgWidth::Dword, libc::MAP_SHARED as u64)?,
    ]])
}

fn noexec_mprotect() -> Result<Vec<Vec<ArgCondition>>> {
    Ok(vec![vec![prot_noexec(2)?]])
}

fn thread_clone() -> Result<Vec<Vec<ArgCondition>>> {
    let flags = (libc::CLONE_THREAD | libc::CLONE_SIGHAND | libc::CLONE_VM) as u64;
    Ok(vec![vec![ArgCondition::masked_eq(0, ArgWidth::Qword, flags, flags)?]])
}

/// Names of the supported compound specifiers.
pub fn specifier_names() -> impl Iterator<Item = &'static str> {
    SPECIFIERS.iter().map(|spec| spec.name)
}

#[derive(Debug)]
struct CompoundRule {
    nr: i64,
    action: SyscallAction,
    alternatives: Vec<Vec<ArgCondition>>,
}

/// Syscall filter under construction.
///
/// Created by [`SyscallFilter::init`], filled with [`SyscallFilter::filter_syscalls`]
/// and turned into a kernel program by [`SyscallFilter::compile`].
#[derive(Debug)]
pub struct SyscallFilter {
    default_action: SyscallAction,
    kill_action: KillAction,

    /// Every syscall number named by a plain rule, elided or not.
    seen_numbers: HashSet<i64>,
    /// Every compound specifier named, elided or not.
    seen_specifiers: HashSet<&'static str>,

    exact: BTreeMap<i64, SyscallAction>,
    compound: Vec<CompoundRule>,
}

impl SyscallFilter {
    /// Probe seccomp support and start an empty filter.
    pub fn init(default_action: SyscallAction) -> Result<Self> {
        if unsafe { libc::prctl(libc::PR_GET_SECCOMP, 0, 0, 0, 0) } < 0 {
            return Err(SandboxError::unsupported(format!(
                "seccomp is not available: {}",
                Errno::last()
            )));
        }
        if bpf::native_arch().is_none() {
            return Err(SandboxError::unsupported(
                "seccomp filtering is not supported on this CPU architecture",
            ));
        }

        Ok(Self::with_kill_action(default_action, KillAction::probe()))
    }

    /// Start an empty filter with an already known kill action.
    pub fn with_kill_action(default_action: SyscallAction, kill_action: KillAction) -> Self {
        Self {
            default_action,
            kill_action,
            seen_numbers: HashSet::new(),
            seen_specifiers: HashSet::new(),
            exact: BTreeMap::new(),
            compound: Vec::new(),
        }
    }

    /// Action for syscalls no rule matches.
    pub fn default_action(&self) -> SyscallAction {
        self.default_action
    }

    /// Kill action this filter compiles [`SyscallAction::Kill`] to.
    pub fn kill_action(&self) -> KillAction {
        self.kill_action
    }

    /// Number of rules that made it into the filter.
    ///
    /// Rules whose action equals the default and unknown syscall names do not count.
    pub fn rule_count(&self) -> usize {
        self.exact.len() + self.compound.len()
    }

    /// Add rules applying `action` to each named syscall or specifier.
    pub fn filter_syscalls<I, S>(&mut self, action: SyscallAction, names: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for name in names {
            self.add_rule(action, name.as_ref())?;
        }
        Ok(())
    }

    fn add_rule(&mut self, action: SyscallAction, name: &str) -> Result<()> {
        if let Some(spec) = SPECIFIERS.iter().find(|spec| spec.name == name) {
            if !self.seen_specifiers.insert(spec.name) {
                return Err(SandboxError::config(format!(
                    "Duplicate syscall filter for '{name}'"
                )));
            }
            if action == self.default_action {
                return Ok(());
            }

            let nr = syscalls::resolve(spec.syscall).ok_or_else(|| {
                SandboxError::config(format!(
                    "Syscall '{}' needed by '{name}' does not exist on this architecture",
                    spec.syscall
                ))
            })?;
            self.compound.push(CompoundRule {
                nr,
                action,
                alternatives: (spec.alternatives)()?,
            });
            return Ok(());
        }

        match syscalls::resolve(name) {
            Some(nr) => {
                if !self.seen_numbers.insert(nr) {
                    return Err(SandboxError::config(format!(
                        "Duplicate syscall filter for '{name}'"
                    )));
                }
                if action != self.default_action {
                    self.exact.insert(nr, action);
                }
            }
            None if name.contains('/') => {
                return Err(SandboxError::config(format!(
                    "Unknown syscall specifier '{name}'"
                )));
            }
            None => warn!("Ignoring unknown syscall '{}'", name),
        }

        Ok(())
    }

    fn translate(&self, action: SyscallAction) -> u32 {
        match action {
            SyscallAction::Allow => SECCOMP_RET_ALLOW,
            SyscallAction::Log => SECCOMP_RET_LOG,
            SyscallAction::Block => SECCOMP_RET_ERRNO | (libc::EPERM as u32 & SECCOMP_RET_DATA),
            SyscallAction::Trap => SECCOMP_RET_TRAP,
            SyscallAction::Kill => self.kill_action.code(),
        }
    }

    /// Build the BPF program. Pure: nothing is loaded into the kernel.
    pub fn compile(&self) -> Result<BpfProgram> {
        let arch = bpf::native_arch().ok_or_else(|| {
            SandboxError::unsupported("seccomp filtering is not supported on this CPU architecture")
        })?;

        let mut groups: BTreeMap<i64, SyscallGroup> = BTreeMap::new();
        for (nr, action) in &self.exact {
            groups.entry(*nr).or_default().fallback = Some(self.translate(*action));
        }
        for rule in &self.compound {
            let group = groups.entry(rule.nr).or_default();
            for conditions in &rule.alternatives {
                group.conditional.push(ConditionalRule {
                    conditions: conditions.clone(),
                    action: self.translate(rule.action),
                });
            }
        }

        let groups: Vec<_> = groups.into_iter().collect();
        let program = bpf::compile(
            arch,
            self.translate(self.default_action),
            self.kill_action.code(),
            &groups,
        )?;

        debug!(
            "Compiled syscall filter: {} rules, {} instructions",
            self.rule_count(),
            program.len()
        );
        Ok(program)
    }

    /// Numbers of every syscall with at least one rule.
    pub fn filtered_numbers(&self) -> BTreeSet<i64> {
        self.exact
            .keys()
            .copied()
            .chain(self.compound.iter().map(|rule| rule.nr))
            .collect()
    }
}

/// Load a compiled program into the kernel for the calling thread.
///
/// Also sets `PR_SET_NO_NEW_PRIVS`, which the kernel requires for unprivileged filters.
pub fn load(program: &BpfProgram) -> Result<()> {
    seccompiler::apply_filter(program).map_err(|e| {
        SandboxError::apply(
            ApplyPhase::SyscallFilter,
            "Failed to install syscall filters",
            io::Error::new(io::ErrorKind::Other, e),
        )
    })
}
