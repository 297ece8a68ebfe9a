//! Configuration errors surface before anything is applied.

#![cfg(target_os = "linux")]

use corral_sandbox::{SandboxBuilder, SandboxError, SyscallAction, SyscallPolicy};

#[test]
fn test_policy_with_duplicate_rule_is_rejected() {
    let policy = SyscallPolicy::new(SyscallAction::Kill)
        .with_rules(SyscallAction::Allow, ["read", "write"])
        .with_rule("read", SyscallAction::Block);

    let mut sandbox = SandboxBuilder::new();
    let err = sandbox.filter_policy(&policy).unwrap_err();
    assert!(matches!(err, SandboxError::Config(_)), "{err}");
}

#[test]
fn test_policy_with_unknown_specifier_is_rejected() {
    let policy =
        SyscallPolicy::new(SyscallAction::Kill).with_rule("ioctl/net", SyscallAction::Allow);

    let mut sandbox = SandboxBuilder::new();
    let err = sandbox.filter_policy(&policy).unwrap_err();
    assert!(err.to_string().contains("ioctl/net"));
}

#[test]
fn test_policy_tolerates_unknown_syscalls() {
    let policy = SyscallPolicy::new(SyscallAction::Kill)
        .with_rules(SyscallAction::Allow, ["read", "not_a_real_syscall", "ioctl/tty"]);

    let mut sandbox = SandboxBuilder::new();
    sandbox.filter_policy(&policy).unwrap();
}

#[test]
fn test_relative_bind_mount_is_rejected() {
    let mut sandbox = SandboxBuilder::new();
    let err = sandbox.mount_path("lib", "/lib", true).unwrap_err();
    assert!(matches!(err, SandboxError::Config(_)));
    assert!(!err.is_fatal());
}
