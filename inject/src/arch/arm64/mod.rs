pub mod relocator;
pub mod writer;

use crate::arch::{Arch, Machine, RegisterFile, RelocationSite};
use crate::error::Result;
use writer::{Arm64Writer, Reg};

/// `struct user_pt_regs` from `arch/arm64/include/uapi/asm/ptrace.h`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Arm64Regs {
    pub regs: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
}

unsafe impl RegisterFile for Arm64Regs {
    fn pc(&self) -> u64 {
        self.pc
    }

    fn set_pc(&mut self, pc: u64) {
        self.pc = pc;
    }
}

const SYSCALL_ARG_REGS: [Reg; 6] = [Reg::X0, Reg::X1, Reg::X2, Reg::X3, Reg::X4, Reg::X5];

#[derive(Debug, Clone, Copy)]
pub struct Arm64;

impl Arch for Arm64 {
    const MACHINE: Machine = Machine::Aarch64;

    type Registers = Arm64Regs;

    // svc #0
    const SYSCALL_INSN: &'static [u8] = &0xD400_0001u32.to_le_bytes();
    const MAX_SYSCALL_ARGS: usize = SYSCALL_ARG_REGS.len();
    const JUMP_STUB_LEN: usize = 16;
    const JUMP_LITERAL_OFFSET: usize = 8;

    const SYS_GETPID: u64 = 172;
    const SYS_MMAP: u64 = 222;
    const SYS_MUNMAP: u64 = 215;

    fn prepare_syscall(regs: &mut Arm64Regs, number: u64, args: &[u64]) {
        regs.regs[Reg::X8 as usize] = number;
        for (reg, arg) in SYSCALL_ARG_REGS.iter().zip(args) {
            regs.regs[*reg as usize] = *arg;
        }
    }

    fn syscall_return(regs: &Arm64Regs) -> u64 {
        regs.regs[Reg::X0 as usize]
    }

    fn jump_stub(origin: u64, target: u64) -> Vec<u8> {
        let mut w = Arm64Writer::new(origin);
        w.put_ldr_br_address(Reg::X16, target);
        w.into_bytes()
    }

    fn relocate(insn: u32, site: &RelocationSite) -> Result<u32> {
        relocator::relocate(insn, site)
    }
}
