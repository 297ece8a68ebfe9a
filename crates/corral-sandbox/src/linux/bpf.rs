//! Classic BPF emission for seccomp programs.
//!
//! A program has the shape:
//!
//! ```text
//! load arch; if arch != native: return KILL
//! load nr;   (x86_64) if nr >= X32_SYSCALL_BIT: return KILL
//! for each syscall group:
//!     if nr != group.nr: skip group
//!     for each conditional rule: if all conditions hold: return rule.action
//!     return group.fallback (or the default action)
//! return default action
//! ```
//!
//! Jumps never cross more than one syscall group, which keeps every offset
//! inside the 8-bit range classic BPF allows.

use crate::error::SandboxError;
use crate::Result;
use seccompiler::{sock_filter, BpfProgram};

// Instruction classes.
const BPF_LD: u16 = 0x00;
const BPF_ALU: u16 = 0x04;
const BPF_JMP: u16 = 0x05;
const BPF_RET: u16 = 0x06;

// Modifiers.
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_AND: u16 = 0x50;
const BPF_JEQ: u16 = 0x10;
const BPF_JGE: u16 = 0x30;
const BPF_K: u16 = 0x00;

/// Return values understood by the kernel.
pub const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
pub const SECCOMP_RET_KILL_THREAD: u32 = 0x0000_0000;
pub const SECCOMP_RET_TRAP: u32 = 0x0003_0000;
pub const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;
pub const SECCOMP_RET_LOG: u32 = 0x7ffc_0000;
pub const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
pub const SECCOMP_RET_DATA: u32 = 0x0000_ffff;

// Layout of `struct seccomp_data`.
const SECCOMP_DATA_NR_OFFSET: u32 = 0;
const SECCOMP_DATA_ARCH_OFFSET: u32 = 4;
const SECCOMP_DATA_ARGS_OFFSET: u32 = 16;
const SECCOMP_DATA_ARG_SIZE: u32 = 8;

const ARG_COUNT: u8 = 6;
const BPF_MAX_LEN: usize = 4096;

#[cfg(target_arch = "x86_64")]
const X32_SYSCALL_BIT: u32 = 0x4000_0000;

/// Audit architecture of the build target, if seccomp filtering supports it.
pub fn native_arch() -> Option<u32> {
    const AUDIT_ARCH_64BIT: u32 = 0x8000_0000;
    const AUDIT_ARCH_LE: u32 = 0x4000_0000;

    if cfg!(target_arch = "x86_64") {
        Some(62 | AUDIT_ARCH_64BIT | AUDIT_ARCH_LE)
    } else if cfg!(target_arch = "aarch64") {
        Some(183 | AUDIT_ARCH_64BIT | AUDIT_ARCH_LE)
    } else {
        None
    }
}

/// How much of a syscall argument a condition looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgWidth {
    /// Low 32 bits only (`int`-typed arguments).
    Dword,

    /// The full 64-bit register.
    Qword,
}

/// Check of one syscall argument: `(arg & mask) == value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgCondition {
    index: u8,
    width: ArgWidth,
    mask: u64,
    value: u64,
}

impl ArgCondition {
    /// Masked comparison of an argument.
    pub fn masked_eq(index: u8, width: ArgWidth, mask: u64, value: u64) -> Result<Self> {
        if index >= ARG_COUNT {
            return Err(SandboxError::config(format!(
                "Syscall argument index {index} is out of range"
            )));
        }

        let mask = match width {
            ArgWidth::Dword => mask & u64::from(u32::MAX),
            ArgWidth::Qword => mask,
        };
        if value & !mask != 0 {
            return Err(SandboxError::config(format!(
                "Condition value {value:#x} can never match mask {mask:#x}"
            )));
        }

        Ok(Self {
            index,
            width,
            mask,
            value,
        })
    }

    /// Exact comparison of an argument.
    pub fn eq(index: u8, width: ArgWidth, value: u64) -> Result<Self> {
        Self::masked_eq(index, width, u64::MAX, value)
    }

    /// Argument index (0 to 5).
    pub fn index(&self) -> u8 {
        self.index
    }

    /// Evaluate the condition against raw syscall arguments.
    pub fn matches(&self, args: &[u64; 6]) -> bool {
        args.get(usize::from(self.index))
            .is_some_and(|arg| arg & self.mask == self.value)
    }

    fn emit(&self, out: &mut Vec<sock_filter>) {
        let offset = SECCOMP_DATA_ARGS_OFFSET + u32::from(self.index) * SECCOMP_DATA_ARG_SIZE;

        // Both supported architectures are little-endian: low word first.
        let mut halves = vec![(offset, self.mask as u32, self.value as u32)];
        if self.width == ArgWidth::Qword {
            halves.push((offset + 4, (self.mask >> 32) as u32, (self.value >> 32) as u32));
        }

        for (offset, mask, value) in halves {
            if mask == 0 {
                continue;
            }
            out.push(bpf_stmt(BPF_LD | BPF_W | BPF_ABS, offset));
            if mask != u32::MAX {
                out.push(bpf_stmt(BPF_ALU | BPF_AND | BPF_K, mask));
            }
            // Fail offsets are patched once the rule length is known.
            out.push(bpf_jump(BPF_JMP | BPF_JEQ | BPF_K, value, 0, 0));
        }
    }
}

/// Conditions joined with AND, and the action returned when they all hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionalRule {
    pub conditions: Vec<ArgCondition>,
    pub action: u32,
}

/// Everything the program does for one syscall number.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyscallGroup {
    pub conditional: Vec<ConditionalRule>,
    pub fallback: Option<u32>,
}

/// Compile syscall groups into a seccomp program.
pub fn compile(
    arch: u32,
    default_action: u32,
    kill_action: u32,
    groups: &[(i64, SyscallGroup)],
) -> Result<BpfProgram> {
    let mut program = vec![
        bpf_stmt(BPF_LD | BPF_W | BPF_ABS, SECCOMP_DATA_ARCH_OFFSET),
        bpf_jump(BPF_JMP | BPF_JEQ | BPF_K, arch, 1, 0),
        bpf_stmt(BPF_RET | BPF_K, kill_action),
        bpf_stmt(BPF_LD | BPF_W | BPF_ABS, SECCOMP_DATA_NR_OFFSET),
    ];

    #[cfg(target_arch = "x86_64")]
    program.extend([
        bpf_jump(BPF_JMP | BPF_JGE | BPF_K, X32_SYSCALL_BIT, 0, 1),
        bpf_stmt(BPF_RET | BPF_K, kill_action),
    ]);

    for (nr, group) in groups {
        let nr = u32::try_from(*nr)
            .map_err(|_| SandboxError::config(format!("Invalid syscall number {nr}")))?;

        let mut body = Vec::new();
        for rule in &group.conditional {
            emit_rule(rule, &mut body)?;
        }
        body.push(bpf_stmt(BPF_RET | BPF_K, group.fallback.unwrap_or(default_action)));

        let skip = jump_offset(body.len())
            .ok_or_else(|| SandboxError::config(format!("Too many rules for syscall {nr}")))?;
        program.push(bpf_jump(BPF_JMP | BPF_JEQ | BPF_K, nr, 0, skip));
        program.extend(body);
    }

    program.push(bpf_stmt(BPF_RET | BPF_K, default_action));

    if program.len() > BPF_MAX_LEN {
        return Err(SandboxError::config(format!(
            "Syscall filter is too large ({} instructions)",
            program.len()
        )));
    }

    Ok(program)
}

fn emit_rule(rule: &ConditionalRule, out: &mut Vec<sock_filter>) -> Result<()> {
    let mut instructions = Vec::new();
    for condition in &rule.conditions {
        condition.emit(&mut instructions);
    }
    instructions.push(bpf_stmt(BPF_RET | BPF_K, rule.action));

    // A failed comparison skips to the first instruction after this rule.
    let len = instructions.len();
    for (i, insn) in instructions.iter_mut().enumerate() {
        if insn.code == BPF_JMP | BPF_JEQ | BPF_K {
            insn.jf = jump_offset(len - i - 1)
                .ok_or_else(|| SandboxError::config("Syscall rule has too many conditions"))?;
        }
    }

    out.extend(instructions);
    Ok(())
}

fn jump_offset(distance: usize) -> Option<u8> {
    u8::try_from(distance).ok()
}

fn bpf_stmt(code: u16, k: u32) -> sock_filter {
    sock_filter {
        code,
        jt: 0,
        jf: 0,
        k,
    }
}

fn bpf_jump(code: u16, k: u32, jt: u8, jf: u8) -> sock_filter {
    sock_filter { code, jt, jf, k }
}
