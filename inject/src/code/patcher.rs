use log::info;
use object::Endian;

use crate::arch::{Arch, CELL_SIZE};
use crate::error::{InjectError, Result};
use crate::image::LoadedImage;
use crate::program::TracedProgram;
use crate::trace::TraceAccess;

/// A jump written over a function entry, with the bytes it replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    pub origin: u64,
    pub original: Vec<u8>,
    pub installed: Vec<u8>,
}

impl Patch {
    pub fn len(&self) -> usize {
        self.installed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.installed.is_empty()
    }
}

impl<A: Arch, T: TraceAccess<A::Registers>> TracedProgram<A, T> {
    /// Redirect execution at `origin` to `target` with an absolute jump.
    ///
    /// The write is permanent: it is not part of any protected region and
    /// [`restore`](Self::restore) leaves it in place. Keep the returned
    /// [`Patch`] to undo it with [`remove_jump`](Self::remove_jump).
    pub fn install_jump(&mut self, origin: u64, target: u64) -> Result<Patch> {
        let installed = A::jump_stub(origin, target);
        let original = self.read_bytes(origin, installed.len())?;
        self.write_bytes(origin, &installed)?;
        info!(
            "process {}: {:#x} now jumps to {:#x}",
            self.pid(),
            origin,
            target
        );
        Ok(Patch {
            origin,
            original,
            installed,
        })
    }

    pub fn remove_jump(&mut self, patch: &Patch) -> Result<()> {
        self.write_bytes(patch.origin, &patch.original)?;
        info!("process {}: removed jump at {:#x}", self.pid(), patch.origin);
        Ok(())
    }

    /// Copy a finished image into the target at `base`.
    pub fn write_image(&mut self, base: u64, image: &LoadedImage) -> Result<()> {
        self.write_bytes(base, image.image.as_bytes())?;
        info!(
            "process {}: wrote {} byte {} image at {:#x}",
            self.pid(),
            image.image.len(),
            image.machine,
            base
        );
        Ok(())
    }

    /// Store `value` in the runtime cell `name` of an image placed at `base`.
    pub fn write_cell(&mut self, base: u64, image: &LoadedImage, name: &str, value: u64) -> Result<()> {
        let addr = image
            .address_of(base, name)
            .ok_or_else(|| InjectError::UnknownSymbol(name.to_string()))?;
        let bytes: [u8; CELL_SIZE] = image.endian.write_u64_bytes(value);
        self.write_bytes(addr, &bytes)
    }
}
