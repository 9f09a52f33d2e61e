use std::fmt;
use std::io;

use thiserror::Error;

use crate::arch::Machine;

/// Process identifier of a traced target.
pub type Pid = libc::pid_t;

/// A tracing-facility call failed.
#[derive(Debug, Error)]
#[error("{operation} on process {pid} failed: {source}")]
pub struct TraceError {
    pub pid: Pid,
    pub operation: &'static str,
    #[source]
    pub source: io::Error,
}

impl TraceError {
    pub fn new(pid: Pid, operation: &'static str, source: io::Error) -> Self {
        Self { pid, operation, source }
    }

    /// Build an error from `errno` right after a failed libc call.
    pub fn last_os_error(pid: Pid, operation: &'static str) -> Self {
        Self::new(pid, operation, io::Error::last_os_error())
    }
}

/// Where an attach session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Detached,
    Attached,
    Protected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Detached => "detached",
            SessionState::Attached => "attached",
            SessionState::Protected => "protected",
        })
    }
}

#[derive(Debug, Error)]
pub enum InjectError {
    #[error(transparent)]
    Trace(#[from] TraceError),

    #[error("cannot {operation} process {pid} while {state}")]
    Protocol {
        pid: Pid,
        operation: &'static str,
        state: SessionState,
    },

    #[error("syscall takes at most {max} arguments, got {given}")]
    ArgumentCountExceeded { given: usize, max: usize },

    #[error("unsupported {machine} relocation type {r_type} at offset {offset:#x}")]
    UnsupportedRelocation {
        machine: Machine,
        r_type: u32,
        offset: u64,
    },

    #[error("{machine} relocation type {r_type} at offset {offset:#x}: value {value:#x} does not fit in {bits} bits")]
    RelocationOutOfRange {
        machine: Machine,
        r_type: u32,
        offset: u64,
        value: i64,
        bits: u32,
    },

    #[error("invalid relocatable object: {0}")]
    InvalidObject(String),

    #[error("symbol {0:?} is not part of the image")]
    UnknownSymbol(String),

    #[error("failed to parse object file: {0}")]
    Object(#[from] object::read::Error),

    #[error("remote syscall {number} failed with errno {errno}")]
    RemoteSyscall { number: u64, errno: i32 },

    #[error("restoring registers failed ({restore}) after: {operation}")]
    RestoreAfterFailure {
        #[source]
        operation: Box<InjectError>,
        restore: Box<InjectError>,
    },
}

pub type Result<T> = std::result::Result<T, InjectError>;
