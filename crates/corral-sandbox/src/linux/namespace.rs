//! Linux namespace isolation.

use super::capabilities;
use crate::error::{ApplyPhase, SandboxError};
use crate::Result;
use nix::errno::Errno;
use nix::sched::{unshare, CloneFlags};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, getppid, setresgid, setresuid, ForkResult, Gid, Pid, Uid};
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A kind of Linux namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Mount,
    User,
    Ipc,
    Uts,
    Network,
    Pid,
    Cgroup,
}

impl Namespace {
    /// Every namespace kind, in the order they are reported.
    pub const ALL: [Namespace; 7] = [
        Namespace::Mount,
        Namespace::User,
        Namespace::Ipc,
        Namespace::Uts,
        Namespace::Network,
        Namespace::Pid,
        Namespace::Cgroup,
    ];

    /// The `unshare(2)` flag creating this namespace.
    pub fn clone_flag(self) -> CloneFlags {
        match self {
            Self::Mount => CloneFlags::CLONE_NEWNS,
            Self::User => CloneFlags::CLONE_NEWUSER,
            Self::Ipc => CloneFlags::CLONE_NEWIPC,
            Self::Uts => CloneFlags::CLONE_NEWUTS,
            Self::Network => CloneFlags::CLONE_NEWNET,
            Self::Pid => CloneFlags::CLONE_NEWPID,
            Self::Cgroup => CloneFlags::CLONE_NEWCGROUP,
        }
    }
}

/// Namespaces requested for creation.
///
/// Only the empty set and the full set can be built from outside this crate:
/// isolation is all or nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceSet {
    flags: CloneFlags,
}

impl Default for NamespaceSet {
    fn default() -> Self {
        Self::empty()
    }
}

impl NamespaceSet {
    /// No namespaces.
    pub fn empty() -> Self {
        Self {
            flags: CloneFlags::empty(),
        }
    }

    /// Every namespace kind.
    pub fn all() -> Self {
        let flags = Namespace::ALL
            .iter()
            .fold(CloneFlags::empty(), |flags, ns| flags | ns.clone_flag());
        Self { flags }
    }

    /// Check whether a namespace kind is requested.
    pub fn contains(&self, ns: Namespace) -> bool {
        self.flags.contains(ns.clone_flag())
    }

    /// Check whether no namespace is requested.
    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    /// Flags for a single `unshare(2)` call.
    pub fn clone_flags(&self) -> CloneFlags {
        self.flags
    }
}

/// Identity of the process before it is sandboxed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: Uid,
    pub gid: Gid,
    pub euid: Uid,
}

impl Credentials {
    /// Credentials of the calling process.
    pub fn current() -> Self {
        Self {
            uid: Uid::current(),
            gid: Gid::current(),
            euid: Uid::effective(),
        }
    }

    /// Refuse to sandbox a root process.
    ///
    /// Pure check on the captured identity; safe to call any number of times.
    pub fn ensure_unprivileged(&self) -> Result<()> {
        if self.uid.is_root() || self.euid.is_root() {
            return Err(SandboxError::privilege(format!(
                "Refusing to sandbox as root (uid {}, euid {})",
                self.uid, self.euid
            )));
        }
        Ok(())
    }
}

/// How the user namespace ID maps get written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceMethod {
    /// The process writes its own maps.
    Unprivileged,

    /// A helper child holding `CAP_SYS_ADMIN` in the parent namespace writes them.
    Privileged,
}

impl NamespaceMethod {
    /// Pick the method for the calling process.
    pub fn detect() -> Self {
        if capabilities::acquire_sys_admin() {
            Self::Privileged
        } else {
            Self::Unprivileged
        }
    }
}

/// Create the requested namespaces with one `unshare(2)` call and map the
/// caller's UID/GID 1:1 into the new user namespace.
pub fn enter(namespaces: NamespaceSet, creds: &Credentials) -> Result<()> {
    if namespaces.is_empty() {
        debug!("No namespaces to create");
        return Ok(());
    }

    let flags = namespaces.clone_flags();
    if !namespaces.contains(Namespace::User) {
        return unshare_namespaces(flags);
    }

    match NamespaceMethod::detect() {
        NamespaceMethod::Privileged => {
            debug!("Using CAP_SYS_ADMIN namespace method");
            enter_privileged(flags, creds)?;
        }
        NamespaceMethod::Unprivileged => {
            debug!("Using unprivileged namespace method");
            unshare_namespaces(flags)?;
            write_id_maps(Path::new("/proc/self"), creds.uid, creds.gid)?;
        }
    }

    debug!("Namespace isolation applied: {:?}", flags);
    Ok(())
}

fn unshare_namespaces(flags: CloneFlags) -> Result<()> {
    unshare(flags).map_err(|e| {
        SandboxError::apply(ApplyPhase::Namespaces, "Failed to create namespaces", e)
    })
}

/// Write a 1:1 UID/GID mapping for the process whose `/proc` directory is given.
///
/// `setgroups` is denied first; the kernel rejects an unprivileged GID map otherwise.
pub fn write_id_maps(proc_dir: &Path, uid: Uid, gid: Gid) -> Result<()> {
    write_proc_file(&proc_dir.join("setgroups"), "deny")?;
    write_proc_file(&proc_dir.join("uid_map"), &format!("{uid} {uid} 1\n"))?;
    write_proc_file(&proc_dir.join("gid_map"), &format!("{gid} {gid} 1\n"))?;

    debug!("User namespace mappings: uid {}, gid {}", uid, gid);
    Ok(())
}

fn write_proc_file(path: &Path, contents: &str) -> Result<()> {
    OpenOptions::new()
        .write(true)
        .open(path)
        .and_then(|mut file| file.write_all(contents.as_bytes()))
        .map_err(|e| {
            SandboxError::apply(
                ApplyPhase::UserMapping,
                format!("Failed to write '{}'", path.display()),
                e,
            )
        })
}

fn enter_privileged(flags: CloneFlags, creds: &Credentials) -> Result<()> {
    let (parent_end, helper_end) = UnixStream::pair().map_err(|e| {
        SandboxError::apply(
            ApplyPhase::Namespaces,
            "Failed to create sandbox helper channel",
            e,
        )
    })?;

    // SAFETY: the builder runs before any other thread exists.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            drop(parent_end);
            let code = match run_id_map_helper(helper_end, creds) {
                Ok(()) => 0,
                Err(e) => {
                    debug!("Sandbox helper failed: {}", e);
                    1
                }
            };
            // SAFETY: leaves the forked helper without running the parent's exit handlers.
            unsafe { libc::_exit(code) }
        }
        Ok(ForkResult::Parent { child }) => {
            drop(helper_end);
            let result = namespace_with_helper(child, parent_end, flags, creds);
            if result.is_err() {
                let _ = kill(child, Signal::SIGKILL);
                let _ = waitpid(child, None);
            }
            result
        }
        Err(e) => Err(SandboxError::apply(
            ApplyPhase::Namespaces,
            "Failed to fork sandbox helper",
            e,
        )),
    }
}

fn namespace_with_helper(
    helper: Pid,
    mut channel: UnixStream,
    flags: CloneFlags,
    creds: &Credentials,
) -> Result<()> {
    // Lets the helper open our /proc files while we are not root.
    set_dumpable(true)?;

    unshare_namespaces(flags)?;
    channel.write_all(&[1]).map_err(|e| {
        SandboxError::apply(
            ApplyPhase::UserMapping,
            "Failed to signal sandbox helper",
            e,
        )
    })?;

    let status = waitpid(helper, None).map_err(|e| {
        SandboxError::apply(
            ApplyPhase::UserMapping,
            "Failed to wait for sandbox helper",
            e,
        )
    })?;
    if status != WaitStatus::Exited(helper, 0) {
        return Err(SandboxError::apply(
            ApplyPhase::UserMapping,
            "Sandbox helper failed to write ID maps",
            io::Error::new(io::ErrorKind::Other, format!("helper status: {status:?}")),
        ));
    }

    setresgid(creds.gid, creds.gid, creds.gid)
        .and_then(|()| setresuid(creds.uid, creds.uid, creds.uid))
        .map_err(|e| {
            SandboxError::apply(ApplyPhase::UserMapping, "Cannot change UID or GID", e)
        })?;

    set_dumpable(false)
}

fn run_id_map_helper(mut channel: UnixStream, creds: &Credentials) -> Result<()> {
    let mut ready = [0u8; 1];
    channel.read_exact(&mut ready).map_err(|e| {
        SandboxError::apply(
            ApplyPhase::UserMapping,
            "Sandbox helper lost its parent",
            e,
        )
    })?;

    let proc_dir = PathBuf::from(format!("/proc/{}", getppid()));
    write_id_maps(&proc_dir, creds.uid, creds.gid)
}

fn set_dumpable(dumpable: bool) -> Result<()> {
    let ret = unsafe { libc::prctl(libc::PR_SET_DUMPABLE, libc::c_ulong::from(dumpable), 0, 0, 0) };
    if ret < 0 {
        return Err(SandboxError::apply(
            ApplyPhase::UserMapping,
            "Failed to change dumpable process attribute",
            Errno::last(),
        ));
    }
    Ok(())
}

/// Check if unprivileged user namespaces look available.
///
/// Advisory only: reads the sysctls distributions use to gate the feature.
pub fn user_namespaces_available() -> bool {
    let read = |path: &str| fs::read_to_string(path).ok();
    sysctls_allow_user_namespaces(read) && Path::new("/proc/self/ns/user").exists()
}

fn sysctls_allow_user_namespaces(read: impl Fn(&str) -> Option<String>) -> bool {
    let is = |path: &str, value: &str| read(path).is_some_and(|v| v.trim() == value);

    // Debian and older Ubuntu kernels
    if is("/proc/sys/kernel/unprivileged_userns_clone", "0") {
        return false;
    }
    if is("/proc/sys/user/max_user_namespaces", "0") {
        return false;
    }
    if is("/proc/sys/kernel/apparmor_restrict_unprivileged_userns", "1") {
        warn!("AppArmor restricts unprivileged user namespaces");
        return false;
    }
    true
}
