//! Shared helpers for the sandbox integration tests.
//!
//! A sandbox cannot be removed once applied, so every scenario runs in a
//! forked child and reports back through its exit status.

#![cfg(target_os = "linux")]

use anyhow::{bail, Context};
use corral_sandbox::linux::namespace::write_id_maps;
use nix::mount::{mount, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Gid, Uid};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub use nix::sys::signal::Signal;

/// Exit code of a child whose scenario panicked.
pub const PANIC_EXIT_CODE: i32 = 101;

/// How a forked child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildOutcome {
    Exited(i32),
    Signaled(Signal),
}

/// Install a `tracing` subscriber once per test binary.
///
/// Filtered with `RUST_LOG`, defaulting to debug output of the sandbox crate.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "corral_sandbox=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// Run `scenario` in a forked child and wait for it.
///
/// The child exits with the scenario's return value, or [`PANIC_EXIT_CODE`]
/// if it panics.
pub fn run_confined<F>(scenario: F) -> anyhow::Result<ChildOutcome>
where
    F: FnOnce() -> i32,
{
    match unsafe { fork() }.context("fork failed")? {
        ForkResult::Child => {
            let code = panic::catch_unwind(AssertUnwindSafe(scenario)).unwrap_or(PANIC_EXIT_CODE);
            unsafe { libc::_exit(code) }
        }
        ForkResult::Parent { child } => match waitpid(child, None).context("waitpid failed")? {
            WaitStatus::Exited(_, code) => Ok(ChildOutcome::Exited(code)),
            WaitStatus::Signaled(_, signal, _) => Ok(ChildOutcome::Signaled(signal)),
            status => bail!("unexpected child status: {status:?}"),
        },
    }
}

/// Check whether this process can create a user and mount namespace.
///
/// Tries it for real in a child, since distributions gate the feature in
/// different ways.
pub fn can_create_user_namespace() -> bool {
    let outcome = run_confined(|| {
        match unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNS) {
            Ok(()) => 0,
            Err(_) => 1,
        }
    });
    matches!(outcome, Ok(ChildOutcome::Exited(0)))
}

/// Move the calling process into a new user and mount namespace it owns.
///
/// The process keeps its UID and GID but holds every capability inside the
/// new namespace, the way a process with `CAP_SYS_ADMIN` would on the host.
/// Mounts made afterwards stay private to it.
pub fn enter_owned_namespace() -> anyhow::Result<()> {
    let (uid, gid) = (Uid::current(), Gid::current());
    unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNS)
        .context("failed to create user namespace")?;
    write_id_maps(Path::new("/proc/self"), uid, gid)?;
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .context("failed to make mounts private")?;
    Ok(())
}

/// Whether the end-to-end scenarios can run here, printing why not.
pub fn sandbox_scenarios_enabled() -> bool {
    if Uid::current().is_root() || Uid::effective().is_root() {
        eprintln!("skipping: sandboxing refuses to run as root");
        return false;
    }
    if !corral_sandbox::user_namespaces_available() || !can_create_user_namespace() {
        eprintln!("skipping: unprivileged user namespaces are not available");
        return false;
    }
    true
}
