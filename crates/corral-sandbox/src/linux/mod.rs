//! Linux sandbox implementation.
//!
//! The confinement is made of:
//! - namespaces: a fresh mount, user, IPC, UTS, network, PID and cgroup view
//! - a filesystem jail: a private tmpfs root reached with `pivot_root`
//! - capabilities: every set emptied, `no_new_privs` set
//! - seccomp: a classic BPF syscall filter

pub mod bpf;
pub mod builder;
pub mod capabilities;
pub mod jail;
pub mod namespace;
pub mod seccomp;
pub mod syscalls;

pub use self::builder::SandboxBuilder;
pub use self::jail::FilesystemJail;
pub use self::namespace::{user_namespaces_available, Credentials, Namespace, NamespaceSet};
pub use self::seccomp::{KillAction, SyscallFilter};

/// Check if sandboxing is supported on this platform.
///
/// Always true on Linux; missing kernel features are reported when the
/// syscall filter is initialized or the sandbox is applied.
pub fn is_sandbox_supported() -> bool {
    true
}
