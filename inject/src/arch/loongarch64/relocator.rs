use object::elf::{
    R_LARCH_B26, R_LARCH_GOT_PC_HI20, R_LARCH_GOT_PC_LO12, R_LARCH_PCALA_HI20, R_LARCH_PCALA_LO12,
};

use crate::arch::{check_aligned, check_signed, unsupported, Machine, RelocationSite};
use crate::error::Result;

const MACHINE: Machine = Machine::LoongArch64;

/// Resolve one LoongArch64 relocation against the distance from `site.place`
/// to the referenced symbol.
///
/// `hi20` and `lo12` split the same 32-bit distance, so both halves reject a
/// distance outside the signed 32-bit range.
pub fn relocate(insn: u32, site: &RelocationSite) -> Result<u32> {
    let offset = site.target_offset();
    match site.r_type {
        R_LARCH_B26 => {
            // bl offs26: offs[15:0] in bits 10..25, offs[25:16] in bits 0..9
            check_aligned(MACHINE, site, offset, 2, 28)?;
            check_signed(MACHINE, site, offset, 28)?;
            let imm = (offset >> 2) as u32;
            let lo16 = imm & 0xffff;
            let hi10 = (imm >> 16) & 0x3ff;
            Ok((insn & !0x03ff_ffff) | (lo16 << 10) | hi10)
        }
        R_LARCH_GOT_PC_HI20 | R_LARCH_PCALA_HI20 => {
            // pcalau12i rd, si20
            check_signed(MACHINE, site, offset, 32)?;
            let hi20 = ((offset as u32) >> 12) & 0xf_ffff;
            Ok((insn & !(0xf_ffff << 5)) | (hi20 << 5))
        }
        R_LARCH_GOT_PC_LO12 | R_LARCH_PCALA_LO12 => {
            // ld.d rd, rj, si12
            check_signed(MACHINE, site, offset, 32)?;
            let lo12 = (offset as u32) & 0xfff;
            Ok((insn & !(0xfff << 10)) | (lo12 << 10))
        }
        _ => Err(unsupported(MACHINE, site)),
    }
}
