pub mod relocator;
pub mod writer;

use crate::arch::{Arch, Machine, RegisterFile, RelocationSite};
use crate::error::Result;
use writer::{Reg, X86_64Writer};

/// `struct user_regs_struct` from `arch/x86/include/asm/user_64.h`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct X86_64Regs {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub orig_rax: u64,
    pub rip: u64,
    pub cs: u64,
    pub eflags: u64,
    pub rsp: u64,
    pub ss: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,
}

unsafe impl RegisterFile for X86_64Regs {
    fn pc(&self) -> u64 {
        self.rip
    }

    fn set_pc(&mut self, pc: u64) {
        self.rip = pc;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct X86_64;

impl Arch for X86_64 {
    const MACHINE: Machine = Machine::X86_64;

    type Registers = X86_64Regs;

    const SYSCALL_INSN: &'static [u8] = &[0x0F, 0x05];
    const MAX_SYSCALL_ARGS: usize = 6;
    const JUMP_STUB_LEN: usize = 12;
    const JUMP_LITERAL_OFFSET: usize = 2;

    const SYS_GETPID: u64 = 39;
    const SYS_MMAP: u64 = 9;
    const SYS_MUNMAP: u64 = 11;

    fn prepare_syscall(regs: &mut X86_64Regs, number: u64, args: &[u64]) {
        regs.rax = number;
        // A stop inside an interrupted syscall would otherwise trigger the
        // kernel's restart logic when the thread resumes.
        regs.orig_rax = u64::MAX;
        let slots = [
            &mut regs.rdi,
            &mut regs.rsi,
            &mut regs.rdx,
            &mut regs.r10,
            &mut regs.r8,
            &mut regs.r9,
        ];
        for (slot, arg) in slots.into_iter().zip(args) {
            *slot = *arg;
        }
    }

    fn syscall_return(regs: &X86_64Regs) -> u64 {
        regs.rax
    }

    fn jump_stub(origin: u64, target: u64) -> Vec<u8> {
        let mut w = X86_64Writer::new(origin);
        w.put_movabs_jmp(Reg::Rax, target);
        w.into_bytes()
    }

    fn relocate(field: u32, site: &RelocationSite) -> Result<u32> {
        relocator::relocate(field, site)
    }
}
