//! One attach session against one target process.

use std::marker::PhantomData;

use log::{debug, info, warn};

use crate::arch::{Arch, RegisterFile};
use crate::error::{InjectError, Pid, Result, SessionState};
use crate::trace::TraceAccess;

/// Register file and trap-site bytes saved by [`TracedProgram::protect`].
#[derive(Debug)]
struct Snapshot<R> {
    regs: R,
    code: Vec<u8>,
    trap_written: bool,
}

/// A traced target: `Detached -> Attached -> Protected -> Attached -> Detached`.
///
/// The kernel ties a tracee to the thread that attached it, so a session is
/// neither `Send` nor `Sync`:
///
/// ```compile_fail
/// fn assert_send<T: Send>() {}
/// assert_send::<chaos_inject::HostProgram>();
/// ```
///
/// Dropping a session restores an open protected region and detaches.
pub struct TracedProgram<A: Arch, T: TraceAccess<A::Registers>> {
    pid: Pid,
    tracer: T,
    state: SessionState,
    snapshot: Option<Snapshot<A::Registers>>,
    _pinned: PhantomData<(A, *const ())>,
}

impl<A: Arch, T: TraceAccess<A::Registers>> TracedProgram<A, T> {
    /// A detached session; call [`attach`](Self::attach) before anything else.
    pub fn new(pid: Pid, tracer: T) -> Self {
        Self {
            pid,
            tracer,
            state: SessionState::Detached,
            snapshot: None,
            _pinned: PhantomData,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn tracer(&self) -> &T {
        &self.tracer
    }

    pub fn tracer_mut(&mut self) -> &mut T {
        &mut self.tracer
    }

    fn misuse(&self, operation: &'static str) -> InjectError {
        InjectError::Protocol {
            pid: self.pid,
            operation,
            state: self.state,
        }
    }

    fn require_attached(&self, operation: &'static str) -> Result<()> {
        match self.state {
            SessionState::Detached => Err(self.misuse(operation)),
            SessionState::Attached | SessionState::Protected => Ok(()),
        }
    }

    fn require_protected(&self, operation: &'static str) -> Result<()> {
        match self.state {
            SessionState::Protected => Ok(()),
            _ => Err(self.misuse(operation)),
        }
    }

    pub fn attach(&mut self) -> Result<()> {
        if self.state != SessionState::Detached {
            return Err(self.misuse("attach"));
        }
        self.tracer.attach(self.pid)?;
        self.state = SessionState::Attached;
        info!("attached to process {}", self.pid);
        Ok(())
    }

    pub fn detach(&mut self) -> Result<()> {
        if self.state != SessionState::Attached {
            return Err(self.misuse("detach"));
        }
        self.tracer.detach(self.pid)?;
        self.state = SessionState::Detached;
        info!("detached from process {}", self.pid);
        Ok(())
    }

    pub fn registers(&self) -> Result<A::Registers> {
        self.require_attached("read registers of")?;
        Ok(self.tracer.get_registers(self.pid)?)
    }

    pub fn set_registers(&mut self, regs: &A::Registers) -> Result<()> {
        self.require_attached("write registers of")?;
        self.tracer.set_registers(self.pid, regs)?;
        Ok(())
    }

    pub fn read_bytes(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        self.require_attached("read memory of")?;
        Ok(self.tracer.read_bytes(self.pid, addr, len)?)
    }

    pub fn write_bytes(&mut self, addr: u64, bytes: &[u8]) -> Result<()> {
        self.require_attached("write memory of")?;
        debug!("writing {} bytes at {:#x} in {}", bytes.len(), addr, self.pid);
        self.tracer.write_bytes(self.pid, addr, bytes)?;
        Ok(())
    }

    /// Save the register file and the bytes a trap would overwrite at the
    /// current program counter. Issues no writes.
    pub fn protect(&mut self) -> Result<()> {
        if self.state != SessionState::Attached {
            return Err(self.misuse("protect"));
        }
        let regs = self.tracer.get_registers(self.pid)?;
        let code = self
            .tracer
            .read_bytes(self.pid, regs.pc(), A::SYSCALL_INSN.len())?;
        debug!("protected {} at pc {:#x}", self.pid, regs.pc());
        self.snapshot = Some(Snapshot {
            regs,
            code,
            trap_written: false,
        });
        self.state = SessionState::Protected;
        Ok(())
    }

    /// Overwrite the saved program counter with the syscall trap. Reverted by
    /// [`restore`](Self::restore).
    pub(crate) fn write_trap(&mut self) -> Result<()> {
        self.require_protected("write trap into")?;
        let Some(snapshot) = self.snapshot.as_mut() else {
            return Err(self.misuse("write trap into"));
        };
        let pc = snapshot.regs.pc();
        // Marked before writing so a partial write is still reverted.
        snapshot.trap_written = true;
        self.tracer.write_bytes(self.pid, pc, A::SYSCALL_INSN)?;
        Ok(())
    }

    pub fn step(&mut self) -> Result<()> {
        self.require_protected("step")?;
        self.tracer.single_step(self.pid)?;
        Ok(())
    }

    /// Put back the saved register file, and the trap-site bytes if a trap was
    /// written. Bytes written by [`install_jump`](Self::install_jump) stay.
    ///
    /// The register file is written back even if the code write-back fails.
    /// On any failure the session stays protected so the restore can be
    /// retried; if both steps fail the code error is returned and the
    /// register error logged.
    pub fn restore(&mut self) -> Result<()> {
        self.require_protected("restore")?;
        let Some(snapshot) = self.snapshot.as_ref() else {
            return Err(self.misuse("restore"));
        };
        let code = if snapshot.trap_written {
            self.tracer
                .write_bytes(self.pid, snapshot.regs.pc(), &snapshot.code)
        } else {
            Ok(())
        };
        let regs = self.tracer.set_registers(self.pid, &snapshot.regs);
        match (code, regs) {
            (Ok(()), Ok(())) => {}
            (Err(e), Ok(())) | (Ok(()), Err(e)) => return Err(e.into()),
            (Err(code), Err(regs)) => {
                warn!("restoring registers of {} failed as well: {}", self.pid, regs);
                return Err(code.into());
            }
        }
        debug!("restored {} to pc {:#x}", self.pid, snapshot.regs.pc());
        self.snapshot = None;
        self.state = SessionState::Attached;
        Ok(())
    }

    /// Run `op` inside a protected region.
    ///
    /// The region is restored when `op` returns and while unwinding from a
    /// panic. If both `op` and the restore fail, both errors are returned in
    /// [`InjectError::RestoreAfterFailure`].
    pub fn protected<U>(&mut self, op: impl FnOnce(&mut Self) -> Result<U>) -> Result<U> {
        self.protect()?;
        let mut guard = RestoreGuard {
            program: self,
            armed: true,
        };
        let outcome = op(&mut *guard.program);
        guard.armed = false;
        let restored = guard.program.restore();
        match (outcome, restored) {
            (Ok(value), Ok(())) => Ok(value),
            (Err(e), Ok(())) => Err(e),
            (Ok(_), Err(restore)) => Err(restore),
            (Err(operation), Err(restore)) => Err(InjectError::RestoreAfterFailure {
                operation: Box::new(operation),
                restore: Box::new(restore),
            }),
        }
    }
}

struct RestoreGuard<'a, A: Arch, T: TraceAccess<A::Registers>> {
    program: &'a mut TracedProgram<A, T>,
    armed: bool,
}

impl<A: Arch, T: TraceAccess<A::Registers>> Drop for RestoreGuard<'_, A, T> {
    fn drop(&mut self) {
        if self.armed && self.program.state == SessionState::Protected {
            if let Err(e) = self.program.restore() {
                warn!("restore of {} while unwinding failed: {}", self.program.pid, e);
            }
        }
    }
}

impl<A: Arch, T: TraceAccess<A::Registers>> Drop for TracedProgram<A, T> {
    fn drop(&mut self) {
        if self.state == SessionState::Protected {
            if let Err(e) = self.restore() {
                warn!("failed to restore {} on drop: {}", self.pid, e);
            }
        }
        if self.state != SessionState::Detached {
            // Detach even after a failed restore; a target left stopped is worse.
            match self.tracer.detach(self.pid) {
                Ok(()) => info!("detached from process {} on drop", self.pid),
                Err(e) => warn!("failed to detach {} on drop: {}", self.pid, e),
            }
            self.state = SessionState::Detached;
        }
    }
}

#[cfg(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "loongarch64")
))]
impl TracedProgram<crate::arch::HostArch, crate::trace::ptrace::Ptrace> {
    /// Attach to `pid` on the host architecture through `ptrace`.
    pub fn trace(pid: Pid, config: crate::config::InjectConfig) -> Result<Self> {
        let mut program = Self::new(pid, crate::trace::ptrace::Ptrace::new(config));
        program.attach()?;
        Ok(program)
    }
}
