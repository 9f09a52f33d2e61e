//! Link replacement code into a self-contained injectable image.
//!
//! An [`ImageBuilder`] appends compiled bodies one after another and resolves
//! their relocations against offsets inside the image. A name that nothing in
//! the image defines gets an 8-byte runtime cell appended after the code; the
//! orchestrator fills it once the image is placed (see
//! [`TracedProgram::write_cell`](crate::TracedProgram::write_cell)).

use log::debug;
use object::{Endian, Endianness};

use crate::arch::{Machine, RelocationSite, CELL_SIZE};
use crate::error::{InjectError, Result};

pub mod elf;

pub use elf::load_image;

/// One row of a relocation table. `offset` is relative to the body it
/// belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocationEntry {
    pub offset: u64,
    pub r_type: u32,
    pub symbol: String,
    pub addend: i64,
}

/// Finished image bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Image {
    bytes: Vec<u8>,
}

impl Image {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Symbol name to image offset, in the order the names were assigned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolOffsetMap {
    entries: Vec<(String, u64)>,
}

impl SymbolOffsetMap {
    pub fn get(&self, name: &str) -> Option<u64> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, offset)| *offset)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.entries.iter().map(|(n, offset)| (n.as_str(), *offset))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record `name` unless it already has an offset. Returns whether it was added.
    fn insert(&mut self, name: &str, offset: u64) -> bool {
        if self.get(name).is_some() {
            return false;
        }
        self.entries.push((name.to_string(), offset));
        true
    }

    fn truncate(&mut self, len: usize) {
        self.entries.truncate(len);
    }
}

/// An image ready to be written into a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedImage {
    pub machine: Machine,
    pub endian: Endianness,
    pub image: Image,
    pub symbols: SymbolOffsetMap,
}

impl LoadedImage {
    /// Absolute address of `name` once the image is placed at `base`.
    pub fn address_of(&self, base: u64, name: &str) -> Option<u64> {
        self.symbols.get(name).map(|offset| base + offset)
    }
}

#[derive(Debug)]
pub struct ImageBuilder {
    machine: Machine,
    endian: Endianness,
    bytes: Vec<u8>,
    symbols: SymbolOffsetMap,
}

impl ImageBuilder {
    pub fn new(machine: Machine, endian: Endianness) -> Self {
        Self {
            machine,
            endian,
            bytes: Vec::new(),
            symbols: SymbolOffsetMap::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn symbols(&self) -> &SymbolOffsetMap {
        &self.symbols
    }

    /// Append `body` as the definition of `name` and resolve its relocations.
    /// Returns the offset of the body in the image.
    pub fn emit(&mut self, name: &str, body: &[u8], relocations: &[RelocationEntry]) -> Result<u64> {
        self.emit_with_symbols(body, &[(name, 0)], relocations)
    }

    /// Append `body`, defining each `(name, offset)` of `definitions` relative
    /// to its start, and resolve its relocations.
    ///
    /// On error the image and symbol map are left exactly as before the call.
    pub fn emit_with_symbols(
        &mut self,
        body: &[u8],
        definitions: &[(&str, u64)],
        relocations: &[RelocationEntry],
    ) -> Result<u64> {
        let start = self.bytes.len();
        let symbols_before = self.symbols.len();
        let result = self.append(body, definitions, relocations);
        if result.is_err() {
            self.bytes.truncate(start);
            self.symbols.truncate(symbols_before);
        }
        result.map(|()| start as u64)
    }

    fn append(
        &mut self,
        body: &[u8],
        definitions: &[(&str, u64)],
        relocations: &[RelocationEntry],
    ) -> Result<()> {
        let start = self.bytes.len() as u64;
        self.bytes.extend_from_slice(body);
        for (name, offset) in definitions {
            if *offset > body.len() as u64 {
                return Err(InjectError::InvalidObject(format!(
                    "symbol {} at {:#x} lies outside its {} byte body",
                    name,
                    offset,
                    body.len()
                )));
            }
            if !self.symbols.insert(name, start + offset) {
                return Err(InjectError::InvalidObject(format!(
                    "symbol {} already has offset {:#x}",
                    name,
                    self.symbols.get(name).unwrap_or_default()
                )));
            }
        }
        for entry in relocations {
            let in_body = entry
                .offset
                .checked_add(4)
                .is_some_and(|end| end <= body.len() as u64);
            if !in_body {
                return Err(InjectError::InvalidObject(format!(
                    "relocation at {:#x} lies outside its {} byte body",
                    entry.offset,
                    body.len()
                )));
            }
            let site = RelocationSite {
                r_type: entry.r_type,
                place: start + entry.offset,
                target: self.resolve(&entry.symbol),
                addend: entry.addend,
            };
            self.apply(&site)?;
        }
        Ok(())
    }

    /// Offset of `name`, appending a zeroed runtime cell if nothing defines it yet.
    fn resolve(&mut self, name: &str) -> u64 {
        if let Some(offset) = self.symbols.get(name) {
            return offset;
        }
        let align = self.machine.cell_align();
        let padded = self.bytes.len().next_multiple_of(align);
        self.bytes.resize(padded + CELL_SIZE, 0);
        self.symbols.insert(name, padded as u64);
        debug!("allocated cell for {} at {:#x}", name, padded);
        padded as u64
    }

    fn apply(&mut self, site: &RelocationSite) -> Result<()> {
        let at = site.place as usize;
        let mut field = [0u8; 4];
        field.copy_from_slice(&self.bytes[at..at + 4]);
        let insn = self.endian.read_u32_bytes(field);
        let patched = self.machine.relocate(insn, site)?;
        self.bytes[at..at + 4].copy_from_slice(&self.endian.write_u32_bytes(patched));
        Ok(())
    }

    pub fn finish(self) -> LoadedImage {
        LoadedImage {
            machine: self.machine,
            endian: self.endian,
            image: Image { bytes: self.bytes },
            symbols: self.symbols,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::elf::{
        R_LARCH_32, R_LARCH_B26, R_LARCH_GOT_PC_HI20, R_LARCH_GOT_PC_LO12, R_X86_64_PC32,
    };

    const PCALAU12I_T0: u32 = 0x1A00_000C;
    const LD_D_T0_T0: u32 = 0x28C0_018C;
    const BL: u32 = 0x5400_0000;
    const NOP: u32 = 0x0340_0000;

    fn words(insns: &[u32]) -> Vec<u8> {
        insns.iter().flat_map(|i| i.to_le_bytes()).collect()
    }

    fn word_at(image: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes(image[offset..offset + 4].try_into().unwrap())
    }

    fn reloc(offset: u64, r_type: u32, symbol: &str) -> RelocationEntry {
        RelocationEntry {
            offset,
            r_type,
            symbol: symbol.into(),
            addend: 0,
        }
    }

    fn loongarch() -> ImageBuilder {
        ImageBuilder::new(Machine::LoongArch64, Endianness::Little)
    }

    #[test]
    fn hi20_against_cell_after_code() {
        // 0x40 bytes of code, pcalau12i at 0x34: the cell lands at 0x40
        let mut body = words(&[NOP; 16]);
        body[0x34..0x38].copy_from_slice(&(PCALAU12I_T0 | (0x12345 << 5)).to_le_bytes());
        let mut b = loongarch();
        b.emit("fake_gettimeofday", &body, &[reloc(0x34, R_LARCH_GOT_PC_HI20, "TV_SEC_DELTA")])
            .unwrap();
        let image = b.finish();

        assert_eq!(image.symbols.get("TV_SEC_DELTA"), Some(0x40));
        assert_eq!(image.image.len(), 0x48);
        assert_eq!(word_at(image.image.as_bytes(), 0x34), PCALAU12I_T0);
        assert_eq!(&image.image.as_bytes()[0x40..], &[0; 8]);
    }

    #[test]
    fn gettime_style_object() {
        // bl real_clock_gettime / pcalau12i + ld.d TV_SEC_DELTA
        let body = words(&[NOP, BL, NOP, PCALAU12I_T0, LD_D_T0_T0]);
        let mut b = loongarch();
        let start = b
            .emit(
                "fake_clock_gettime",
                &body,
                &[
                    reloc(4, R_LARCH_B26, "real_clock_gettime"),
                    reloc(12, R_LARCH_GOT_PC_HI20, "TV_SEC_DELTA"),
                    reloc(16, R_LARCH_GOT_PC_LO12, "TV_SEC_DELTA"),
                ],
            )
            .unwrap();
        let image = b.finish();
        let bytes = image.image.as_bytes();

        assert_eq!(start, 0);
        let names: Vec<_> = image.symbols.iter().collect();
        assert_eq!(
            names,
            vec![("fake_clock_gettime", 0), ("real_clock_gettime", 20), ("TV_SEC_DELTA", 28)]
        );
        assert_eq!(bytes.len(), 36);
        // bl +16 (4 words)
        assert_eq!(word_at(bytes, 4), BL | (4 << 10));
        assert_eq!(word_at(bytes, 12), PCALAU12I_T0);
        // 28 - 16 = 12
        assert_eq!(word_at(bytes, 16), LD_D_T0_T0 | (12 << 10));
    }

    #[test]
    fn referenced_name_gets_a_single_cell() {
        let body = words(&[PCALAU12I_T0, LD_D_T0_T0, PCALAU12I_T0, LD_D_T0_T0]);
        let mut b = loongarch();
        b.emit(
            "f",
            &body,
            &[
                reloc(0, R_LARCH_GOT_PC_HI20, "DELTA"),
                reloc(4, R_LARCH_GOT_PC_LO12, "DELTA"),
                reloc(8, R_LARCH_GOT_PC_HI20, "DELTA"),
                reloc(12, R_LARCH_GOT_PC_LO12, "DELTA"),
            ],
        )
        .unwrap();
        let image = b.finish();
        assert_eq!(image.image.len(), 16 + CELL_SIZE);
        assert_eq!(image.symbols.len(), 2);
        assert_eq!(word_at(image.image.as_bytes(), 12), LD_D_T0_T0 | (4 << 10));
    }

    #[test]
    fn later_body_calls_earlier_symbol() {
        let mut b = loongarch();
        b.emit("helper", &words(&[NOP, NOP]), &[]).unwrap();
        let start = b
            .emit("entry", &words(&[NOP, BL]), &[reloc(4, R_LARCH_B26, "helper")])
            .unwrap();
        assert_eq!(start, 8);
        let image = b.finish();
        // bl from 12 back to 0: -12 bytes, -3 words
        let imm = (-3i32 as u32) & 0x3ff_ffff;
        let expected = BL | ((imm & 0xffff) << 10) | (imm >> 16);
        assert_eq!(word_at(image.image.as_bytes(), 12), expected);
        assert_eq!(image.image.len(), 16);
    }

    #[test]
    fn unsupported_relocation_leaves_image_unchanged() {
        let mut b = loongarch();
        b.emit("first", &words(&[NOP]), &[]).unwrap();
        let before_len = b.len();
        let before_symbols = b.symbols().clone();

        let err = b
            .emit(
                "second",
                &words(&[PCALAU12I_T0, NOP]),
                &[reloc(0, R_LARCH_GOT_PC_HI20, "CELL"), reloc(4, R_LARCH_32, "CELL")],
            )
            .unwrap_err();

        assert!(matches!(
            err,
            InjectError::UnsupportedRelocation { machine: Machine::LoongArch64, r_type: R_LARCH_32, offset: 8 }
        ));
        assert_eq!(b.len(), before_len);
        assert_eq!(b.symbols(), &before_symbols);
    }

    #[test]
    fn relocation_outside_body_is_rejected() {
        let mut b = loongarch();
        let err = b.emit("f", &words(&[NOP]), &[reloc(2, R_LARCH_B26, "g")]).unwrap_err();
        assert!(matches!(err, InjectError::InvalidObject(_)));
        assert!(b.is_empty());
    }

    #[test]
    fn relocation_offset_near_u64_max_is_rejected() {
        let mut b = loongarch();
        let err = b
            .emit("f", &[0; 8], &[reloc(u64::MAX - 1, R_LARCH_B26, "g")])
            .unwrap_err();
        assert!(matches!(err, InjectError::InvalidObject(_)));
        assert!(b.is_empty());
        assert!(b.symbols().is_empty());
    }

    #[test]
    fn defining_a_name_that_already_has_a_cell_fails() {
        let mut b = loongarch();
        b.emit("entry", &words(&[NOP, BL]), &[reloc(4, R_LARCH_B26, "helper")])
            .unwrap();
        let cell = b.symbols().get("helper").unwrap();
        let len = b.len();

        let err = b.emit("helper", &words(&[NOP]), &[]).unwrap_err();
        assert!(matches!(err, InjectError::InvalidObject(msg) if msg.contains("helper")));
        assert_eq!(b.len(), len);
        assert_eq!(b.symbols().get("helper"), Some(cell));
    }

    #[test]
    fn aarch64_cells_are_aligned() {
        let mut b = ImageBuilder::new(Machine::Aarch64, Endianness::Little);
        // adrp x0, 0 / ldr x0, [x0] / ret
        let body = words(&[0x9000_0000, 0xF940_0000, 0xD65F_03C0]);
        b.emit(
            "f",
            &body,
            &[
                reloc(0, object::elf::R_AARCH64_ADR_GOT_PAGE, "DELTA"),
                reloc(4, object::elf::R_AARCH64_LD64_GOT_LO12_NC, "DELTA"),
            ],
        )
        .unwrap();
        let image = b.finish();
        assert_eq!(image.symbols.get("DELTA"), Some(16));
        assert_eq!(word_at(image.image.as_bytes(), 4), 0xF940_0000 | (2 << 10));
    }

    #[test]
    fn x86_64_displacement() {
        let mut b = ImageBuilder::new(Machine::X86_64, Endianness::Little);
        // mov rax, [rip + disp32]; ret
        let body = [0x48, 0x8B, 0x05, 0, 0, 0, 0, 0xC3];
        b.emit(
            "f",
            &body,
            &[RelocationEntry {
                offset: 3,
                r_type: R_X86_64_PC32,
                symbol: "DELTA".into(),
                addend: -4,
            }],
        )
        .unwrap();
        let image = b.finish();
        // cell at 8, displacement from the end of the instruction at 7
        assert_eq!(word_at(image.image.as_bytes(), 3), 1);
        assert_eq!(image.address_of(0x5000, "DELTA"), Some(0x5008));
    }

    #[test]
    fn big_endian_fields_round_trip() {
        let mut b = ImageBuilder::new(Machine::LoongArch64, Endianness::Big);
        let body = LD_D_T0_T0.to_be_bytes();
        b.emit("f", &body, &[reloc(0, R_LARCH_GOT_PC_LO12, "C")]).unwrap();
        let image = b.finish();
        assert_eq!(&image.image.as_bytes()[..4], &(LD_D_T0_T0 | (4 << 10)).to_be_bytes());
    }

    #[test]
    fn loaded_image_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<LoadedImage>();
    }
}
