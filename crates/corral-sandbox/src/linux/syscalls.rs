//! Syscall name resolution for the build architecture.
//!
//! Names come from the kernel's complete syscall table for the architecture,
//! so a lookup miss means "not a syscall here" and callers decide whether
//! that is fatal.

use syscalls::Sysno;

/// Resolve a syscall name to its number on the build architecture.
pub fn resolve(name: &str) -> Option<i64> {
    name.parse::<Sysno>().ok().map(|sysno| i64::from(sysno.id()))
}

/// Names of every syscall known on the build architecture, by number.
pub fn names() -> impl Iterator<Item = &'static str> {
    Sysno::iter().map(|sysno| sysno.name())
}
