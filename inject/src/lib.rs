//! chaos-inject: attach to a running process, run system calls on its behalf
//! and redirect its functions into injected replacement code.
//!
//! A typical injection, given a compiled replacement object:
//!
//! ```no_run
//! # #[cfg(target_os = "linux")]
//! # fn main() -> chaos_inject::Result<()> {
//! use chaos_inject::{load_image, HostProgram, InjectConfig};
//!
//! let image = load_image(&std::fs::read("fake_clock_gettime.o").unwrap())?;
//! let mut target = HostProgram::trace(1234, InjectConfig::from_env())?;
//! let base = target.mmap(image.image.len() as u64)?;
//! target.write_image(base, &image)?;
//! target.write_cell(base, &image, "TV_SEC_DELTA", 3600)?;
//! let entry = image.address_of(base, "fake_clock_gettime").unwrap();
//! target.install_jump(0x7fff_f7fd_0a40, entry)?;
//! target.detach()?;
//! # Ok(())
//! # }
//! # #[cfg(not(target_os = "linux"))]
//! # fn main() {}
//! ```

pub mod arch;
pub mod code;
pub mod config;
pub mod error;
pub mod image;
pub mod program;
pub mod syscall;
pub mod trace;

#[cfg(test)]
pub(crate) mod test_utils;

pub use arch::{Arch, Machine, RegisterFile};
pub use code::Patch;
pub use config::InjectConfig;
pub use error::{InjectError, Pid, Result, SessionState, TraceError};
pub use image::{load_image, Image, ImageBuilder, LoadedImage, RelocationEntry, SymbolOffsetMap};
pub use program::TracedProgram;
pub use trace::TraceAccess;

/// A `ptrace` session on the host architecture.
#[cfg(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "loongarch64")
))]
pub type HostProgram = TracedProgram<arch::HostArch, trace::ptrace::Ptrace>;
