//! Register and memory access to a stopped target.
//!
//! [`TraceAccess`] is the narrow kernel boundary the rest of the crate is
//! written against. [`ptrace::Ptrace`] is the real implementation; tests drive
//! the same code through an in-memory tracer.

use crate::arch::RegisterFile;
use crate::error::{Pid, TraceError};

#[cfg(target_os = "linux")]
pub mod ptrace;

/// Width of one `PEEKDATA`/`POKEDATA` transfer.
pub const WORD_SIZE: usize = std::mem::size_of::<u64>();

pub trait TraceAccess<R: RegisterFile> {
    /// Stop `pid` and make the caller its tracer.
    fn attach(&mut self, pid: Pid) -> Result<(), TraceError>;

    /// Release `pid` and let it run.
    fn detach(&mut self, pid: Pid) -> Result<(), TraceError>;

    fn get_registers(&self, pid: Pid) -> Result<R, TraceError>;

    fn set_registers(&mut self, pid: Pid, regs: &R) -> Result<(), TraceError>;

    fn read_word(&self, pid: Pid, addr: u64) -> Result<u64, TraceError>;

    fn write_word(&mut self, pid: Pid, addr: u64, word: u64) -> Result<(), TraceError>;

    /// Resume exactly one instruction and block until the target stops again.
    fn single_step(&mut self, pid: Pid) -> Result<(), TraceError>;

    fn read_bytes(&self, pid: Pid, addr: u64, len: usize) -> Result<Vec<u8>, TraceError> {
        read_bytes_by_word::<R, Self>(self, pid, addr, len)
    }

    /// Write `bytes` at `addr` without touching anything outside the range.
    fn write_bytes(&mut self, pid: Pid, addr: u64, bytes: &[u8]) -> Result<(), TraceError> {
        write_bytes_by_word::<R, Self>(self, pid, addr, bytes)
    }
}

impl<R: RegisterFile, T: TraceAccess<R> + ?Sized> TraceAccess<R> for &mut T {
    fn attach(&mut self, pid: Pid) -> Result<(), TraceError> {
        (**self).attach(pid)
    }

    fn detach(&mut self, pid: Pid) -> Result<(), TraceError> {
        (**self).detach(pid)
    }

    fn get_registers(&self, pid: Pid) -> Result<R, TraceError> {
        (**self).get_registers(pid)
    }

    fn set_registers(&mut self, pid: Pid, regs: &R) -> Result<(), TraceError> {
        (**self).set_registers(pid, regs)
    }

    fn read_word(&self, pid: Pid, addr: u64) -> Result<u64, TraceError> {
        (**self).read_word(pid, addr)
    }

    fn write_word(&mut self, pid: Pid, addr: u64, word: u64) -> Result<(), TraceError> {
        (**self).write_word(pid, addr, word)
    }

    fn single_step(&mut self, pid: Pid) -> Result<(), TraceError> {
        (**self).single_step(pid)
    }

    fn read_bytes(&self, pid: Pid, addr: u64, len: usize) -> Result<Vec<u8>, TraceError> {
        (**self).read_bytes(pid, addr, len)
    }

    fn write_bytes(&mut self, pid: Pid, addr: u64, bytes: &[u8]) -> Result<(), TraceError> {
        (**self).write_bytes(pid, addr, bytes)
    }
}

pub fn read_bytes_by_word<R, T>(
    tracer: &T,
    pid: Pid,
    addr: u64,
    len: usize,
) -> Result<Vec<u8>, TraceError>
where
    R: RegisterFile,
    T: TraceAccess<R> + ?Sized,
{
    let mut out = Vec::with_capacity(len + WORD_SIZE);
    let mut cursor = addr;
    while out.len() < len {
        let word = tracer.read_word(pid, cursor)?;
        out.extend_from_slice(&word.to_ne_bytes());
        cursor = cursor.wrapping_add(WORD_SIZE as u64);
    }
    out.truncate(len);
    Ok(out)
}

/// Compose a byte-range write from word writes. A trailing partial word is
/// read first and only its leading bytes are replaced.
pub fn write_bytes_by_word<R, T>(
    tracer: &mut T,
    pid: Pid,
    addr: u64,
    bytes: &[u8],
) -> Result<(), TraceError>
where
    R: RegisterFile,
    T: TraceAccess<R> + ?Sized,
{
    let mut cursor = addr;
    let mut chunks = bytes.chunks_exact(WORD_SIZE);
    for chunk in &mut chunks {
        let mut word = [0u8; WORD_SIZE];
        word.copy_from_slice(chunk);
        tracer.write_word(pid, cursor, u64::from_ne_bytes(word))?;
        cursor = cursor.wrapping_add(WORD_SIZE as u64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut word = tracer.read_word(pid, cursor)?.to_ne_bytes();
        word[..tail.len()].copy_from_slice(tail);
        tracer.write_word(pid, cursor, u64::from_ne_bytes(word))?;
    }
    Ok(())
}
