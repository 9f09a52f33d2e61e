//! `ptrace(2)` backed [`TraceAccess`].

use std::collections::HashMap;
use std::io;
use std::mem;
use std::ptr;
use std::thread;
use std::time::Instant;

use log::{debug, warn};

use super::{read_bytes_by_word, write_bytes_by_word, TraceAccess};
use crate::arch::RegisterFile;
use crate::config::InjectConfig;
use crate::error::{Pid, TraceError};

/// Signals intercepted while waiting for a particular stop. They are owed
/// back to the target and handed over on detach.
#[derive(Debug, Clone, Default)]
struct Deferred {
    /// A `SIGSTOP` sent by [`Ptrace::interrupt`] is still queued.
    stop_queued: bool,
    signals: Vec<libc::c_int>,
}

#[derive(Debug, Clone, Default)]
pub struct Ptrace {
    config: InjectConfig,
    deferred: HashMap<Pid, Deferred>,
}

fn is_fault(sig: libc::c_int) -> bool {
    matches!(sig, libc::SIGSEGV | libc::SIGBUS | libc::SIGILL | libc::SIGFPE)
}

/// The stop signal of a `waitpid` status, `None` for anything but a stop.
fn stop_signal(pid: Pid, operation: &'static str, status: libc::c_int) -> Result<Option<libc::c_int>, TraceError> {
    if libc::WIFSTOPPED(status) {
        return Ok(Some(libc::WSTOPSIG(status)));
    }
    if libc::WIFEXITED(status) || libc::WIFSIGNALED(status) {
        return Err(TraceError::new(
            pid,
            operation,
            io::Error::new(io::ErrorKind::NotFound, "process exited while traced"),
        ));
    }
    Ok(None)
}

fn tkill(pid: Pid, sig: libc::c_int) -> Result<(), TraceError> {
    let ret = unsafe { libc::syscall(libc::SYS_tkill, pid as libc::c_long, sig as libc::c_long) };
    if ret == -1 {
        return Err(TraceError::last_os_error(pid, "tkill"));
    }
    Ok(())
}

impl Ptrace {
    pub fn new(config: InjectConfig) -> Self {
        Self {
            config,
            deferred: HashMap::new(),
        }
    }

    pub fn config(&self) -> &InjectConfig {
        &self.config
    }

    /// Wait until `pid` stops with `expected`, resuming it with `resume` past
    /// any other signal stop. Those signals are deferred until detach.
    fn wait_for(
        &mut self,
        pid: Pid,
        operation: &'static str,
        resume: libc::c_uint,
        expected: libc::c_int,
    ) -> Result<(), TraceError> {
        let deadline = Instant::now() + self.config.step_timeout;
        loop {
            let sig = self.poll_stop(pid, operation, deadline)?;
            if sig == expected {
                return Ok(());
            }
            if resume == libc::PTRACE_SINGLESTEP && is_fault(sig) {
                return Err(TraceError::new(
                    pid,
                    operation,
                    io::Error::other(format!("instruction faulted with signal {}", sig)),
                ));
            }
            let deferred = self.deferred.entry(pid).or_default();
            if sig == libc::SIGSTOP && deferred.stop_queued {
                deferred.stop_queued = false;
                debug!("{} consumed its queued SIGSTOP", pid);
            } else {
                debug!("{} stopped by signal {} during {}, deferring it", pid, sig, operation);
                if !deferred.signals.contains(&sig) {
                    deferred.signals.push(sig);
                }
            }
            self.request(pid, operation, resume, 0, 0)?;
        }
    }

    /// Poll `waitpid` until `pid` reports a stop. Past `deadline` the target
    /// is interrupted, so it is stopped again when the timeout is returned.
    fn poll_stop(
        &mut self,
        pid: Pid,
        operation: &'static str,
        deadline: Instant,
    ) -> Result<libc::c_int, TraceError> {
        loop {
            let mut status: libc::c_int = 0;
            let ret = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG | libc::__WALL) };
            if ret == -1 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(TraceError::new(pid, operation, err));
            }
            if ret == pid {
                if let Some(sig) = stop_signal(pid, operation, status)? {
                    debug!("{} stopped with signal {}", pid, sig);
                    return Ok(sig);
                }
            }
            if Instant::now() >= deadline {
                warn!(
                    "{} reported no stop within {:?} after {}, interrupting it",
                    pid, self.config.step_timeout, operation
                );
                if let Err(e) = self.interrupt(pid) {
                    warn!("could not interrupt {}: {}", pid, e);
                }
                return Err(TraceError::new(
                    pid,
                    operation,
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no stop reported within {:?}", self.config.step_timeout),
                    ),
                ));
            }
            thread::sleep(self.config.poll_interval);
        }
    }

    /// Force a running tracee into a stop with `SIGSTOP` and block until it
    /// is reported. If a different stop wins the race the `SIGSTOP` stays
    /// queued and is consumed later.
    fn interrupt(&mut self, pid: Pid) -> Result<(), TraceError> {
        tkill(pid, libc::SIGSTOP)?;
        let sig = loop {
            let mut status: libc::c_int = 0;
            let ret = unsafe { libc::waitpid(pid, &mut status, libc::__WALL) };
            if ret == -1 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(TraceError::new(pid, "waitpid", err));
            }
            if let Some(sig) = stop_signal(pid, "waitpid", status)? {
                break sig;
            }
        };
        if sig != libc::SIGSTOP {
            let deferred = self.deferred.entry(pid).or_default();
            deferred.stop_queued = true;
            if sig != libc::SIGTRAP && !deferred.signals.contains(&sig) {
                deferred.signals.push(sig);
            }
        }
        debug!("interrupted {} (stop signal {})", pid, sig);
        Ok(())
    }

    /// Let a queued `SIGSTOP` arrive while still traced and suppress it.
    fn drain_queued_stop(&mut self, pid: Pid) -> Result<(), TraceError> {
        if let Some(deferred) = self.deferred.get_mut(&pid) {
            deferred.stop_queued = false;
        }
        self.request(pid, "PTRACE_CONT", libc::PTRACE_CONT, 0, 0)?;
        self.wait_for(pid, "PTRACE_CONT", libc::PTRACE_CONT, libc::SIGSTOP)
    }

    fn request(
        &self,
        pid: Pid,
        operation: &'static str,
        request: libc::c_uint,
        addr: usize,
        data: usize,
    ) -> Result<libc::c_long, TraceError> {
        let ret = unsafe {
            libc::ptrace(
                request,
                pid,
                addr as *mut libc::c_void,
                data as *mut libc::c_void,
            )
        };
        if ret == -1 {
            return Err(TraceError::last_os_error(pid, operation));
        }
        Ok(ret)
    }

    /// `process_vm_writev` in one call. Returns `false` if the kernel wrote
    /// less than everything (e.g. into a read-only text mapping).
    fn write_bulk(&self, pid: Pid, addr: u64, bytes: &[u8]) -> bool {
        let local = libc::iovec {
            iov_base: bytes.as_ptr() as *mut libc::c_void,
            iov_len: bytes.len(),
        };
        let remote = libc::iovec {
            iov_base: addr as usize as *mut libc::c_void,
            iov_len: bytes.len(),
        };
        let written = unsafe { libc::process_vm_writev(pid, &local, 1, &remote, 1, 0) };
        if written < 0 {
            debug!(
                "process_vm_writev {:#x}+{} on {}: {}",
                addr,
                bytes.len(),
                pid,
                io::Error::last_os_error()
            );
            return false;
        }
        written as usize == bytes.len()
    }

    fn read_bulk(&self, pid: Pid, addr: u64, len: usize) -> Option<Vec<u8>> {
        let mut out = vec![0u8; len];
        let local = libc::iovec {
            iov_base: out.as_mut_ptr() as *mut libc::c_void,
            iov_len: len,
        };
        let remote = libc::iovec {
            iov_base: addr as usize as *mut libc::c_void,
            iov_len: len,
        };
        let read = unsafe { libc::process_vm_readv(pid, &local, 1, &remote, 1, 0) };
        (read >= 0 && read as usize == len).then_some(out)
    }
}

impl<R: RegisterFile> TraceAccess<R> for Ptrace {
    fn attach(&mut self, pid: Pid) -> Result<(), TraceError> {
        self.request(pid, "PTRACE_ATTACH", libc::PTRACE_ATTACH, 0, 0)?;
        self.wait_for(pid, "PTRACE_ATTACH", libc::PTRACE_CONT, libc::SIGSTOP)
    }

    /// Detach, delivering any signal that arrived while the target was held.
    fn detach(&mut self, pid: Pid) -> Result<(), TraceError> {
        if self.deferred.get(&pid).is_some_and(|d| d.stop_queued) {
            self.drain_queued_stop(pid)?;
        }
        let signals = self.deferred.remove(&pid).map(|d| d.signals).unwrap_or_default();
        let first = signals.first().copied().unwrap_or(0);
        self.request(pid, "PTRACE_DETACH", libc::PTRACE_DETACH, 0, first as usize)?;
        for &sig in signals.iter().skip(1) {
            if let Err(e) = tkill(pid, sig) {
                warn!("could not redeliver signal {} to {}: {}", sig, pid, e);
            }
        }
        if !signals.is_empty() {
            debug!("redelivered signals {:?} to {}", signals, pid);
        }
        Ok(())
    }

    fn get_registers(&self, pid: Pid) -> Result<R, TraceError> {
        let mut regs = R::default();
        let mut iov = libc::iovec {
            iov_base: &mut regs as *mut R as *mut libc::c_void,
            iov_len: mem::size_of::<R>(),
        };
        self.request(
            pid,
            "PTRACE_GETREGSET",
            libc::PTRACE_GETREGSET,
            libc::NT_PRSTATUS as usize,
            &mut iov as *mut libc::iovec as usize,
        )?;
        if iov.iov_len != mem::size_of::<R>() {
            return Err(TraceError::new(
                pid,
                "PTRACE_GETREGSET",
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("kernel returned {} register bytes, expected {}", iov.iov_len, mem::size_of::<R>()),
                ),
            ));
        }
        Ok(regs)
    }

    fn set_registers(&mut self, pid: Pid, regs: &R) -> Result<(), TraceError> {
        let mut iov = libc::iovec {
            iov_base: regs as *const R as *mut libc::c_void,
            iov_len: mem::size_of::<R>(),
        };
        self.request(
            pid,
            "PTRACE_SETREGSET",
            libc::PTRACE_SETREGSET,
            libc::NT_PRSTATUS as usize,
            &mut iov as *mut libc::iovec as usize,
        )?;
        Ok(())
    }

    fn read_word(&self, pid: Pid, addr: u64) -> Result<u64, TraceError> {
        // PEEKDATA returns the word itself, so -1 is only an error if errno says so.
        unsafe { *libc::__errno_location() = 0 };
        let word = unsafe {
            libc::ptrace(
                libc::PTRACE_PEEKDATA,
                pid,
                addr as usize as *mut libc::c_void,
                ptr::null_mut::<libc::c_void>(),
            )
        };
        if word == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error().unwrap_or(0) != 0 {
                return Err(TraceError::new(pid, "PTRACE_PEEKDATA", err));
            }
        }
        Ok(word as u64)
    }

    fn write_word(&mut self, pid: Pid, addr: u64, word: u64) -> Result<(), TraceError> {
        debug!("poke {:#x} <- {:#018x} in {}", addr, word, pid);
        self.request(
            pid,
            "PTRACE_POKEDATA",
            libc::PTRACE_POKEDATA,
            addr as usize,
            word as usize,
        )?;
        Ok(())
    }

    fn single_step(&mut self, pid: Pid) -> Result<(), TraceError> {
        debug!("single-step {}", pid);
        self.request(pid, "PTRACE_SINGLESTEP", libc::PTRACE_SINGLESTEP, 0, 0)?;
        self.wait_for(pid, "PTRACE_SINGLESTEP", libc::PTRACE_SINGLESTEP, libc::SIGTRAP)
    }

    fn read_bytes(&self, pid: Pid, addr: u64, len: usize) -> Result<Vec<u8>, TraceError> {
        if len >= self.config.bulk_write_threshold {
            if let Some(bytes) = self.read_bulk(pid, addr, len) {
                return Ok(bytes);
            }
        }
        read_bytes_by_word::<R, _>(self, pid, addr, len)
    }

    fn write_bytes(&mut self, pid: Pid, addr: u64, bytes: &[u8]) -> Result<(), TraceError> {
        if bytes.len() >= self.config.bulk_write_threshold && self.write_bulk(pid, addr, bytes) {
            debug!("bulk wrote {} bytes at {:#x} in {}", bytes.len(), addr, pid);
            return Ok(());
        }
        write_bytes_by_word::<R, _>(self, pid, addr, bytes)
    }
}
