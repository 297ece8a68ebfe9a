//! End-to-end confinement scenarios.
//!
//! Each scenario applies a sandbox inside a forked child, checks what the
//! child can still do, and encodes the first failed expectation in its exit
//! code.

#![cfg(target_os = "linux")]

use caps::{CapSet, Capability};
use corral_sandbox::linux::namespace::NamespaceMethod;
use corral_sandbox::{
    is_sandbox_supported, JailOptions, SandboxBuilder, SandboxError, SyscallAction, SyscallPolicy,
};
use corral_integration_tests::{
    enter_owned_namespace, init_tracing, run_confined, sandbox_scenarios_enabled, ChildOutcome,
    Signal,
};
use nix::mount::{mount, MsFlags};
use nix::unistd::{getresgid, getresuid, Gid, Uid};
use std::fs::{self, OpenOptions};
use std::path::Path;
use tempfile::TempDir;

/// Syscalls the test child needs after the filter is installed.
const MINIMAL_SYSCALLS: &[&str] = &[
    "read", "write", "close", "exit", "exit_group", "brk", "mmap", "munmap", "mremap",
    "mprotect", "madvise", "rt_sigaction", "rt_sigprocmask", "rt_sigreturn", "sigaltstack",
    "futex", "getrandom", "openat", "open", "fstat", "newfstatat", "statx", "lseek", "fcntl",
    "getdents64", "capget", "capset",
];

fn staging_options(scratch: &TempDir) -> JailOptions {
    JailOptions {
        staging_dir: scratch.path().join("staging"),
        ..JailOptions::default()
    }
}

fn can_create(path: &Path) -> bool {
    OpenOptions::new()
        .write(true)
        .create(true)
        .open(path)
        .is_ok()
}

fn can_write(path: &Path) -> bool {
    OpenOptions::new().write(true).open(path).is_ok()
}

#[test]
fn test_sandbox_supported_on_linux() {
    assert!(is_sandbox_supported());
}

#[test]
fn test_full_confinement() {
    init_tracing();
    if !sandbox_scenarios_enabled() || !Path::new("/usr/lib").is_dir() {
        return;
    }

    let scratch = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    let work_path = work.path().to_path_buf();
    let options = staging_options(&scratch);

    let outcome = run_confined(move || {
        let policy = SyscallPolicy::new(SyscallAction::Kill)
            .with_rules(SyscallAction::Allow, MINIMAL_SYSCALLS.iter().copied());

        let mut sandbox = SandboxBuilder::new();
        sandbox.isolate_process();
        sandbox.set_jail_options(options);
        if sandbox.mount_path("/usr/lib", "/usr/lib", true).is_err()
            || sandbox.mount_path(&work_path, "/tmp/work", false).is_err()
        {
            return 2;
        }
        sandbox.drop_capabilities();
        if sandbox.filter_policy(&policy).is_err() {
            return 3;
        }
        if let Err(e) = sandbox.apply() {
            eprintln!("apply failed: {e}");
            return 10;
        }

        if fs::read_dir("/usr/lib").is_err() {
            return 11;
        }
        if can_create(Path::new("/usr/lib/corral-marker")) {
            return 12;
        }
        if fs::write("/tmp/work/marker", b"confined").is_err() {
            return 13;
        }
        if caps::raise(None, CapSet::Effective, Capability::CAP_SYS_ADMIN).is_ok() {
            return 14;
        }

        // Outside the allow-list: the process must not survive this.
        unsafe { libc::syscall(libc::SYS_getppid) };
        0
    })
    .unwrap();

    assert_eq!(outcome, ChildOutcome::Signaled(Signal::SIGSYS));
    assert_eq!(
        fs::read_to_string(work.path().join("marker")).unwrap(),
        "confined"
    );
}

#[test]
fn test_bind_mounts_readonly_iff_requested() {
    init_tracing();
    if !sandbox_scenarios_enabled() {
        return;
    }

    let scratch = TempDir::new().unwrap();
    let host = TempDir::new().unwrap();
    let dirs = [("ro-dir", true), ("rw-dir", false)];
    let files = [("ro-file", true), ("rw-file", false)];
    for (name, _) in dirs {
        fs::create_dir(host.path().join(name)).unwrap();
    }
    for (name, _) in files {
        fs::write(host.path().join(name), "").unwrap();
    }

    let options = staging_options(&scratch);
    let host_path = host.path().to_path_buf();

    let outcome = run_confined(move || {
        let mut sandbox = SandboxBuilder::new();
        sandbox.isolate_process();
        sandbox.set_jail_options(options);
        for (name, readonly) in dirs.iter().chain(files.iter()) {
            let dest = Path::new("/data").join(name);
            if sandbox.mount_path(host_path.join(name), dest, *readonly).is_err() {
                return 2;
            }
        }
        if sandbox.apply().is_err() {
            return 10;
        }

        for (i, (name, readonly)) in dirs.iter().enumerate() {
            let dest = Path::new("/data").join(name);
            if !dest.is_dir() || can_create(&dest.join("marker")) == *readonly {
                return 20 + i as i32;
            }
        }
        for (i, (name, readonly)) in files.iter().enumerate() {
            let dest = Path::new("/data").join(name);
            if !dest.is_file() || can_write(&dest) == *readonly {
                return 30 + i as i32;
            }
        }

        // The jail root itself is sealed.
        if can_create(Path::new("/escape")) {
            return 40;
        }
        0
    })
    .unwrap();

    assert_eq!(outcome, ChildOutcome::Exited(0));
    assert!(host.path().join("rw-dir/marker").exists());
    assert!(!host.path().join("ro-dir/marker").exists());
}

#[test]
fn test_nested_mounts_follow_readonly_bind() {
    init_tracing();
    if !sandbox_scenarios_enabled() {
        return;
    }

    let scratch = TempDir::new().unwrap();
    let host = TempDir::new().unwrap();
    for dir in ["ro/nested", "rw/nested"] {
        fs::create_dir_all(host.path().join(dir)).unwrap();
    }

    let options = staging_options(&scratch);
    let host_path = host.path().to_path_buf();

    let outcome = run_confined(move || {
        // A tmpfs under each source, mounted where nobody else can see it.
        if enter_owned_namespace().is_err() {
            return 2;
        }
        for dir in ["ro/nested", "rw/nested"] {
            let target = host_path.join(dir);
            if mount(
                Some("tmpfs"),
                target.as_path(),
                Some("tmpfs"),
                MsFlags::empty(),
                None::<&str>,
            )
            .is_err()
            {
                return 3;
            }
        }

        let mut sandbox = SandboxBuilder::new();
        sandbox.isolate_process();
        sandbox.set_jail_options(options);
        if sandbox.mount_path(host_path.join("ro"), "/ro", true).is_err()
            || sandbox.mount_path(host_path.join("rw"), "/rw", false).is_err()
        {
            return 4;
        }
        if let Err(e) = sandbox.apply() {
            eprintln!("apply failed: {e}");
            return 10;
        }

        if can_create(Path::new("/ro/marker")) {
            return 11;
        }
        if can_create(Path::new("/ro/nested/marker")) {
            return 12;
        }
        if !can_create(Path::new("/rw/nested/marker")) {
            return 13;
        }
        0
    })
    .unwrap();

    assert_eq!(outcome, ChildOutcome::Exited(0));
}

#[test]
fn test_privileged_namespace_method() {
    init_tracing();
    if !sandbox_scenarios_enabled() {
        return;
    }

    let scratch = TempDir::new().unwrap();
    let options = staging_options(&scratch);

    let outcome = run_confined(move || {
        // Holds CAP_SYS_ADMIN from here on, without being root.
        if enter_owned_namespace().is_err() {
            return 2;
        }
        if NamespaceMethod::detect() != NamespaceMethod::Privileged {
            return 3;
        }
        let (uid, gid) = (Uid::current(), Gid::current());

        let mut sandbox = SandboxBuilder::new();
        sandbox.isolate_process();
        sandbox.set_jail_options(options);
        sandbox.drop_capabilities();
        if let Err(e) = sandbox.apply() {
            eprintln!("apply failed: {e}");
            return 10;
        }

        // Unmapped IDs would read back as the overflow ID.
        match (getresuid(), getresgid()) {
            (Ok(u), Ok(g))
                if [u.real, u.effective, u.saved] == [uid; 3]
                    && [g.real, g.effective, g.saved] == [gid; 3] => {}
            _ => return 11,
        }
        if unsafe { libc::prctl(libc::PR_GET_DUMPABLE, 0, 0, 0, 0) } != 0 {
            return 12;
        }
        if caps::has_cap(None, CapSet::Permitted, Capability::CAP_SYS_ADMIN).unwrap_or(true) {
            return 13;
        }
        0
    })
    .unwrap();

    assert_eq!(outcome, ChildOutcome::Exited(0));
}

#[test]
fn test_empty_jail_is_read_only() {
    init_tracing();
    if !sandbox_scenarios_enabled() {
        return;
    }

    let scratch = TempDir::new().unwrap();
    let options = staging_options(&scratch);

    let outcome = run_confined(move || {
        let mut sandbox = SandboxBuilder::new();
        sandbox.isolate_process();
        sandbox.set_jail_options(options);
        if sandbox.apply().is_err() {
            return 10;
        }

        match fs::read_dir("/").map(|mut entries| entries.next().is_none()) {
            Ok(true) => {}
            _ => return 11,
        }
        if can_create(Path::new("/file")) || fs::create_dir("/dir").is_ok() {
            return 12;
        }
        0
    })
    .unwrap();

    assert_eq!(outcome, ChildOutcome::Exited(0));
}

#[test]
fn test_blocked_syscall_returns_eperm() {
    init_tracing();
    if !sandbox_scenarios_enabled() {
        return;
    }

    let outcome = run_confined(|| {
        let mut sandbox = SandboxBuilder::new();
        if sandbox.init_syscall_filter(SyscallAction::Allow).is_err()
            || sandbox
                .filter_syscalls(SyscallAction::Block, ["getppid"])
                .is_err()
        {
            return 3;
        }
        if sandbox.apply().is_err() {
            return 10;
        }

        let ret = unsafe { libc::syscall(libc::SYS_getppid) };
        let errno = std::io::Error::last_os_error().raw_os_error();
        if ret == -1 && errno == Some(libc::EPERM) {
            0
        } else {
            11
        }
    })
    .unwrap();

    assert_eq!(outcome, ChildOutcome::Exited(0));
}

#[test]
fn test_root_is_refused_before_any_change() {
    if !Uid::effective().is_root() {
        eprintln!("skipping: only meaningful when running as root");
        return;
    }

    let scratch = TempDir::new().unwrap();
    for _ in 0..2 {
        let mut sandbox = SandboxBuilder::new();
        sandbox.isolate_process();
        sandbox.set_jail_options(staging_options(&scratch));
        sandbox.drop_capabilities();

        let err = sandbox.apply().unwrap_err();
        assert!(matches!(err, SandboxError::Privilege(_)), "{err}");
    }

    // Nothing was mounted or created.
    assert!(!scratch.path().join("staging").exists());
}
