//! Shared test utilities for the inject crate.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;

use crate::arch::{Arch, RegisterFile};
use crate::error::{Pid, TraceError};
use crate::trace::TraceAccess;

pub const FAKE_PID: Pid = 4242;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Attach,
    Detach,
    GetRegisters,
    SetRegisters,
    ReadWord,
    WriteWord,
    SingleStep,
}

impl Op {
    fn name(self) -> &'static str {
        match self {
            Op::Attach => "PTRACE_ATTACH",
            Op::Detach => "PTRACE_DETACH",
            Op::GetRegisters => "PTRACE_GETREGSET",
            Op::SetRegisters => "PTRACE_SETREGSET",
            Op::ReadWord => "PTRACE_PEEKDATA",
            Op::WriteWord => "PTRACE_POKEDATA",
            Op::SingleStep => "PTRACE_SINGLESTEP",
        }
    }

    fn mutates(self) -> bool {
        matches!(self, Op::SetRegisters | Op::WriteWord)
    }
}

type SyscallHandler<R> = Box<dyn FnMut(&mut R)>;

/// In-memory stand-in for a stopped target.
///
/// Memory is one flat window starting at `base`. `single_step` emulates the
/// trap instruction when the bytes at the program counter match it, and
/// otherwise just advances the program counter by one instruction.
pub struct FakeTracer<R: RegisterFile> {
    pub regs: R,
    base: u64,
    mem: Vec<u8>,
    trap: Vec<u8>,
    on_syscall: Option<SyscallHandler<R>>,
    attached: bool,
    calls: RefCell<HashMap<Op, usize>>,
    fail: Cell<Option<(Op, usize)>>,
}

impl<R: RegisterFile> FakeTracer<R> {
    pub fn new(base: u64, size: usize) -> Self {
        Self {
            regs: R::default(),
            base,
            mem: vec![0; size],
            trap: Vec::new(),
            on_syscall: None,
            attached: false,
            calls: RefCell::new(HashMap::new()),
            fail: Cell::new(None),
        }
    }

    /// A tracer whose target is stopped at `pc` and that emulates `A`'s trap.
    pub fn for_arch<A: Arch<Registers = R>>(base: u64, size: usize, pc: u64) -> Self {
        let mut t = Self::new(base, size);
        t.trap = A::SYSCALL_INSN.to_vec();
        t.regs.set_pc(pc);
        t
    }

    pub fn on_syscall(mut self, handler: impl FnMut(&mut R) + 'static) -> Self {
        self.on_syscall = Some(Box::new(handler));
        self
    }

    pub fn fill(&mut self, addr: u64, bytes: &[u8]) {
        let start = (addr - self.base) as usize;
        self.mem[start..start + bytes.len()].copy_from_slice(bytes);
    }

    pub fn memory(&self, addr: u64, len: usize) -> &[u8] {
        let start = (addr - self.base) as usize;
        &self.mem[start..start + len]
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn calls(&self, op: Op) -> usize {
        self.calls.borrow().get(&op).copied().unwrap_or(0)
    }

    /// Number of register and memory writes issued so far.
    pub fn mutations(&self) -> usize {
        self.calls.borrow().iter().filter(|(op, _)| op.mutates()).map(|(_, n)| n).sum()
    }

    /// Let `skip` calls of `op` succeed, then fail the next one.
    pub fn fail_on(&mut self, op: Op, skip: usize) {
        self.fail.set(Some((op, self.calls(op) + skip)));
    }

    fn record(&self, op: Op) -> Result<(), TraceError> {
        let index = {
            let mut calls = self.calls.borrow_mut();
            let n = calls.entry(op).or_insert(0);
            *n += 1;
            *n - 1
        };
        if self.fail.get() == Some((op, index)) {
            self.fail.set(None);
            return Err(TraceError::new(FAKE_PID, op.name(), io::Error::from_raw_os_error(libc::EIO)));
        }
        Ok(())
    }

    fn window(&self, addr: u64, op: Op) -> Result<usize, TraceError> {
        let end = self.base + self.mem.len() as u64;
        if addr < self.base || addr + 8 > end {
            return Err(TraceError::new(FAKE_PID, op.name(), io::Error::from_raw_os_error(libc::EFAULT)));
        }
        Ok((addr - self.base) as usize)
    }
}

impl<R: RegisterFile> TraceAccess<R> for FakeTracer<R> {
    fn attach(&mut self, _pid: Pid) -> Result<(), TraceError> {
        self.record(Op::Attach)?;
        self.attached = true;
        Ok(())
    }

    fn detach(&mut self, _pid: Pid) -> Result<(), TraceError> {
        self.record(Op::Detach)?;
        self.attached = false;
        Ok(())
    }

    fn get_registers(&self, _pid: Pid) -> Result<R, TraceError> {
        self.record(Op::GetRegisters)?;
        Ok(self.regs)
    }

    fn set_registers(&mut self, _pid: Pid, regs: &R) -> Result<(), TraceError> {
        self.record(Op::SetRegisters)?;
        self.regs = *regs;
        Ok(())
    }

    fn read_word(&self, _pid: Pid, addr: u64) -> Result<u64, TraceError> {
        self.record(Op::ReadWord)?;
        let at = self.window(addr, Op::ReadWord)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(&self.mem[at..at + 8]);
        Ok(u64::from_ne_bytes(word))
    }

    fn write_word(&mut self, _pid: Pid, addr: u64, word: u64) -> Result<(), TraceError> {
        self.record(Op::WriteWord)?;
        let at = self.window(addr, Op::WriteWord)?;
        self.mem[at..at + 8].copy_from_slice(&word.to_ne_bytes());
        Ok(())
    }

    fn single_step(&mut self, _pid: Pid) -> Result<(), TraceError> {
        self.record(Op::SingleStep)?;
        let pc = self.regs.pc();
        let at = self.window(pc, Op::SingleStep)?;
        let is_trap = !self.trap.is_empty() && self.mem[at..].starts_with(&self.trap);
        if is_trap {
            if let Some(handler) = self.on_syscall.as_mut() {
                handler(&mut self.regs);
            }
            self.regs.set_pc(pc + self.trap.len() as u64);
        } else {
            self.regs.set_pc(pc + 4);
        }
        Ok(())
    }
}
