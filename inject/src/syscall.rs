//! Run system calls inside the target.

use log::debug;

use crate::arch::Arch;
use crate::error::{InjectError, Pid, Result};
use crate::program::TracedProgram;
use crate::trace::TraceAccess;

/// Kernel return values in `[-4095, -1]` are negated errno codes.
const MAX_ERRNO: u64 = 4095;

const PROT_RWX: u64 = (libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC) as u64;
const MAP_PRIVATE_ANON: u64 = (libc::MAP_PRIVATE | libc::MAP_ANONYMOUS) as u64;

fn check_errno(number: u64, ret: u64) -> Result<u64> {
    if ret > u64::MAX - MAX_ERRNO {
        return Err(InjectError::RemoteSyscall {
            number,
            errno: ret.wrapping_neg() as i32,
        });
    }
    Ok(ret)
}

impl<A: Arch, T: TraceAccess<A::Registers>> TracedProgram<A, T> {
    /// Execute syscall `number` with `args` in the target and return the raw
    /// value of the return register.
    ///
    /// The target's registers and the code at its program counter are
    /// restored afterwards, whether or not the call succeeded.
    ///
    /// Up to [`Arch::MAX_SYSCALL_ARGS`] arguments are accepted. On LoongArch64
    /// the eighth argument register `a7` also carries the syscall number, so
    /// an eighth argument never reaches the kernel; a warning is logged.
    pub fn invoke_syscall(&mut self, number: u64, args: &[u64]) -> Result<u64> {
        if args.len() > A::MAX_SYSCALL_ARGS {
            return Err(InjectError::ArgumentCountExceeded {
                given: args.len(),
                max: A::MAX_SYSCALL_ARGS,
            });
        }
        self.protected(|p| {
            let mut regs = p.registers()?;
            A::prepare_syscall(&mut regs, number, args);
            p.set_registers(&regs)?;
            p.write_trap()?;
            p.step()?;
            let ret = A::syscall_return(&p.registers()?);
            debug!("syscall {}{:x?} in {} returned {:#x}", number, args, p.pid(), ret);
            Ok(ret)
        })
    }

    pub fn getpid(&mut self) -> Result<Pid> {
        let ret = self.invoke_syscall(A::SYS_GETPID, &[])?;
        Ok(check_errno(A::SYS_GETPID, ret)? as Pid)
    }

    /// Map `len` bytes of private anonymous read-write-execute memory.
    pub fn mmap(&mut self, len: u64) -> Result<u64> {
        let ret = self.invoke_syscall(
            A::SYS_MMAP,
            &[0, len, PROT_RWX, MAP_PRIVATE_ANON, u64::MAX, 0],
        )?;
        check_errno(A::SYS_MMAP, ret)
    }

    pub fn munmap(&mut self, addr: u64, len: u64) -> Result<()> {
        let ret = self.invoke_syscall(A::SYS_MUNMAP, &[addr, len])?;
        check_errno(A::SYS_MUNMAP, ret)?;
        Ok(())
    }
}
