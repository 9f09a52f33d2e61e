//! Per-architecture register layouts and instruction encodings.
//!
//! Everything above this module (the traced program, the syscall invoker, the
//! code patcher, the image builder) is written against [`Arch`]. A backend
//! supplies four things: the shape of the register file, the syscall trap,
//! the absolute-jump stub and the relocation encoder.

use std::fmt;

use crate::error::{InjectError, Result};

pub mod arm64;
pub mod loongarch64;
pub mod x86_64;

/// Size of a runtime cell appended to an image for an unresolved symbol.
pub const CELL_SIZE: usize = 8;

/// The full register file of one stopped thread.
///
/// # Safety
/// Implementors must be `#[repr(C)]` and match the kernel's `NT_PRSTATUS`
/// regset for their architecture byte for byte; the tracer copies them in and
/// out of the kernel as raw memory.
pub unsafe trait RegisterFile: Copy + Default + PartialEq + fmt::Debug + 'static {
    fn pc(&self) -> u64;
    fn set_pc(&mut self, pc: u64);
}

/// A 4-byte field to be rewritten by a relocation.
///
/// `place` and `target` are offsets inside the image being built; the image
/// is assumed to be mapped at a page-aligned base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocationSite {
    pub r_type: u32,
    pub place: u64,
    pub target: u64,
    pub addend: i64,
}

impl RelocationSite {
    /// `target + addend - place`, the PC-relative distance to the referenced symbol.
    pub fn target_offset(&self) -> i64 {
        (self.target as i64)
            .wrapping_add(self.addend)
            .wrapping_sub(self.place as i64)
    }

    /// `target + addend`, the referenced location relative to the image base.
    pub fn target_address(&self) -> i64 {
        (self.target as i64).wrapping_add(self.addend)
    }
}

/// A target instruction set as seen by the injector.
pub trait Arch: 'static {
    const MACHINE: Machine;

    type Registers: RegisterFile;

    /// Encoded trap instruction that enters the kernel.
    const SYSCALL_INSN: &'static [u8];
    /// Number of syscall argument registers in the calling convention.
    const MAX_SYSCALL_ARGS: usize;
    /// Length of the sequence produced by [`Arch::jump_stub`].
    const JUMP_STUB_LEN: usize;
    /// Offset of the embedded 64-bit target address inside the jump stub.
    const JUMP_LITERAL_OFFSET: usize;

    const SYS_GETPID: u64;
    const SYS_MMAP: u64;
    const SYS_MUNMAP: u64;

    /// Place the syscall number and arguments into `regs`.
    ///
    /// Callers have already checked `args.len() <= MAX_SYSCALL_ARGS`.
    fn prepare_syscall(regs: &mut Self::Registers, number: u64, args: &[u64]);

    /// Read the value the kernel returned from a syscall.
    fn syscall_return(regs: &Self::Registers) -> u64;

    /// Instruction sequence that, executed at `origin`, jumps to `target`.
    fn jump_stub(origin: u64, target: u64) -> Vec<u8>;

    /// Rewrite the encoded field `insn` for the relocation described by `site`.
    fn relocate(insn: u32, site: &RelocationSite) -> Result<u32>;
}

#[cfg(target_arch = "x86_64")]
pub type HostArch = x86_64::X86_64;

#[cfg(target_arch = "aarch64")]
pub type HostArch = arm64::Arm64;

#[cfg(target_arch = "loongarch64")]
pub type HostArch = loongarch64::LoongArch64;

/// Runtime tag for a backend, used where the architecture comes from data
/// (an object file) rather than from the type system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Machine {
    LoongArch64,
    Aarch64,
    X86_64,
}

impl Machine {
    pub fn host() -> Option<Machine> {
        if cfg!(target_arch = "loongarch64") {
            Some(Machine::LoongArch64)
        } else if cfg!(target_arch = "aarch64") {
            Some(Machine::Aarch64)
        } else if cfg!(target_arch = "x86_64") {
            Some(Machine::X86_64)
        } else {
            None
        }
    }

    pub fn from_architecture(arch: object::Architecture) -> Option<Machine> {
        match arch {
            object::Architecture::LoongArch64 => Some(Machine::LoongArch64),
            object::Architecture::Aarch64 => Some(Machine::Aarch64),
            object::Architecture::X86_64 => Some(Machine::X86_64),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Machine::LoongArch64 => "loongarch64",
            Machine::Aarch64 => "aarch64",
            Machine::X86_64 => "x86_64",
        }
    }

    pub fn relocate(self, insn: u32, site: &RelocationSite) -> Result<u32> {
        match self {
            Machine::LoongArch64 => loongarch64::LoongArch64::relocate(insn, site),
            Machine::Aarch64 => arm64::Arm64::relocate(insn, site),
            Machine::X86_64 => x86_64::X86_64::relocate(insn, site),
        }
    }

    /// Alignment of runtime cells appended to an image.
    ///
    /// AArch64 scales the low-12 load offset by 8, so its cells must be
    /// 8-byte aligned; the other backends place cells right after the code.
    pub fn cell_align(self) -> usize {
        match self {
            Machine::Aarch64 => CELL_SIZE,
            Machine::LoongArch64 | Machine::X86_64 => 1,
        }
    }
}

impl fmt::Display for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub(crate) fn unsupported(machine: Machine, site: &RelocationSite) -> InjectError {
    InjectError::UnsupportedRelocation {
        machine,
        r_type: site.r_type,
        offset: site.place,
    }
}

/// Fail unless `value` is representable as a `bits`-wide two's complement field.
pub(crate) fn check_signed(
    machine: Machine,
    site: &RelocationSite,
    value: i64,
    bits: u32,
) -> Result<()> {
    let min = -(1i64 << (bits - 1));
    let max = (1i64 << (bits - 1)) - 1;
    if value < min || value > max {
        return Err(out_of_range(machine, site, value, bits));
    }
    Ok(())
}

/// Fail unless the low `shift` bits of `value` are zero (they are dropped by the encoding).
pub(crate) fn check_aligned(
    machine: Machine,
    site: &RelocationSite,
    value: i64,
    shift: u32,
    bits: u32,
) -> Result<()> {
    if value & ((1i64 << shift) - 1) != 0 {
        return Err(out_of_range(machine, site, value, bits));
    }
    Ok(())
}

fn out_of_range(machine: Machine, site: &RelocationSite, value: i64, bits: u32) -> InjectError {
    InjectError::RelocationOutOfRange {
        machine,
        r_type: site.r_type,
        offset: site.place,
        value,
        bits,
    }
}
