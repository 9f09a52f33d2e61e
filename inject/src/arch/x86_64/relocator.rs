use object::elf::{
    R_X86_64_GOTPCREL, R_X86_64_GOTPCRELX, R_X86_64_PC32, R_X86_64_PLT32, R_X86_64_REX_GOTPCRELX,
};

use crate::arch::{check_signed, unsupported, Machine, RelocationSite};
use crate::error::Result;

const MACHINE: Machine = Machine::X86_64;

/// Resolve one x86-64 relocation. Every supported form is a 32-bit signed
/// PC-relative displacement; the addend (usually -4) accounts for the
/// displacement being relative to the end of the instruction.
///
/// GOT-style forms are not relaxed: the displacement points at the cell
/// itself, which plays the part of the GOT entry.
pub fn relocate(_field: u32, site: &RelocationSite) -> Result<u32> {
    match site.r_type {
        R_X86_64_PC32 | R_X86_64_PLT32 | R_X86_64_GOTPCREL | R_X86_64_GOTPCRELX
        | R_X86_64_REX_GOTPCRELX => {
            let disp = site.target_offset();
            check_signed(MACHINE, site, disp, 32)?;
            Ok(disp as i32 as u32)
        }
        _ => Err(unsupported(MACHINE, site)),
    }
}
