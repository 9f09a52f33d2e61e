use object::elf::{
    R_AARCH64_ADD_ABS_LO12_NC, R_AARCH64_ADR_GOT_PAGE, R_AARCH64_ADR_PREL_PG_HI21,
    R_AARCH64_CALL26, R_AARCH64_JUMP26, R_AARCH64_LD64_GOT_LO12_NC, R_AARCH64_LDST64_ABS_LO12_NC,
};

use crate::arch::{check_aligned, check_signed, unsupported, Machine, RelocationSite};
use crate::error::Result;

const MACHINE: Machine = Machine::Aarch64;

fn page(addr: i64) -> i64 {
    addr & !0xFFF
}

/// Resolve one AArch64 relocation. Page-relative forms assume the image is
/// mapped at a page-aligned base, so image offsets and addresses agree in
/// their low 12 bits.
pub fn relocate(insn: u32, site: &RelocationSite) -> Result<u32> {
    match site.r_type {
        R_AARCH64_CALL26 | R_AARCH64_JUMP26 => {
            // B/BL imm26, word offset
            let offset = site.target_offset();
            check_aligned(MACHINE, site, offset, 2, 28)?;
            check_signed(MACHINE, site, offset, 28)?;
            let imm26 = ((offset >> 2) as u32) & 0x03FF_FFFF;
            Ok((insn & !0x03FF_FFFF) | imm26)
        }
        R_AARCH64_ADR_PREL_PG_HI21 | R_AARCH64_ADR_GOT_PAGE => {
            // ADRP: immlo in bits 29..30, immhi in bits 5..23
            let pages = (page(site.target_address()) - page(site.place as i64)) >> 12;
            check_signed(MACHINE, site, pages, 21)?;
            let immlo = (pages as u32) & 0x3;
            let immhi = ((pages as u32) >> 2) & 0x7FFFF;
            Ok((insn & 0x9F00_001F) | (immlo << 29) | (immhi << 5))
        }
        R_AARCH64_ADD_ABS_LO12_NC => {
            let lo12 = (site.target_address() as u32) & 0xFFF;
            Ok((insn & !(0xFFF << 10)) | (lo12 << 10))
        }
        R_AARCH64_LDST64_ABS_LO12_NC | R_AARCH64_LD64_GOT_LO12_NC => {
            // LDR Xt, [Xn, #imm] scales the offset by 8
            let addr = site.target_address();
            check_aligned(MACHINE, site, addr, 3, 12)?;
            let imm12 = ((addr as u32) & 0xFFF) >> 3;
            Ok((insn & !(0xFFF << 10)) | (imm12 << 10))
        }
        _ => Err(unsupported(MACHINE, site)),
    }
}
