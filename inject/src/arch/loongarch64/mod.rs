pub mod relocator;
pub mod writer;

use log::warn;

use crate::arch::{Arch, Machine, RegisterFile, RelocationSite};
use crate::error::Result;
use writer::{LoongArch64Writer, Reg};

/// `struct user_pt_regs` from `arch/loongarch/include/uapi/asm/ptrace.h`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoongArch64Regs {
    pub regs: [u64; 32],
    pub orig_a0: u64,
    /// Exception return address, i.e. the program counter of a stopped thread.
    pub era: u64,
    pub badv: u64,
    pub reserved: [u64; 10],
}

unsafe impl RegisterFile for LoongArch64Regs {
    fn pc(&self) -> u64 {
        self.era
    }

    fn set_pc(&mut self, pc: u64) {
        self.era = pc;
    }
}

/// Syscall argument registers a0..a7. a7 is also the syscall number register.
const SYSCALL_ARG_REGS: [Reg; 8] = [
    Reg::A0,
    Reg::A1,
    Reg::A2,
    Reg::A3,
    Reg::A4,
    Reg::A5,
    Reg::A6,
    Reg::A7,
];

#[derive(Debug, Clone, Copy)]
pub struct LoongArch64;

impl Arch for LoongArch64 {
    const MACHINE: Machine = Machine::LoongArch64;

    type Registers = LoongArch64Regs;

    // syscall 0
    const SYSCALL_INSN: &'static [u8] = &0x002B_0000u32.to_le_bytes();
    const MAX_SYSCALL_ARGS: usize = SYSCALL_ARG_REGS.len();
    const JUMP_STUB_LEN: usize = 24;
    const JUMP_LITERAL_OFFSET: usize = 12;

    const SYS_GETPID: u64 = 172;
    const SYS_MMAP: u64 = 222;
    const SYS_MUNMAP: u64 = 215;

    fn prepare_syscall(regs: &mut LoongArch64Regs, number: u64, args: &[u64]) {
        for (reg, arg) in SYSCALL_ARG_REGS.iter().zip(args) {
            regs.regs[*reg as usize] = *arg;
        }
        if let Some(eighth) = args.get(7) {
            warn!(
                "syscall {}: eighth argument {:#x} shares a7 with the number and is dropped",
                number, eighth
            );
        }
        // The number goes in last so it wins over an eighth argument in a7.
        regs.regs[Reg::A7 as usize] = number;
    }

    fn syscall_return(regs: &LoongArch64Regs) -> u64 {
        regs.regs[Reg::A0 as usize]
    }

    fn jump_stub(origin: u64, target: u64) -> Vec<u8> {
        let mut w = LoongArch64Writer::new(origin);
        w.put_ld_jump_address(Reg::S7, target);
        w.into_bytes()
    }

    fn relocate(insn: u32, site: &RelocationSite) -> Result<u32> {
        relocator::relocate(insn, site)
    }
}
