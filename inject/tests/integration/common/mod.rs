//! Helpers shared by the integration tests and benches.

#![allow(dead_code)]

use object::write::{Object, Relocation, StandardSection, Symbol, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, RelocationFlags, SymbolFlags, SymbolKind, SymbolScope,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// One relocation to emit into a synthesised object.
pub struct Reloc<'a> {
    pub offset: u64,
    pub r_type: u32,
    pub symbol: &'a str,
    pub addend: i64,
}

pub fn words(insns: &[u32]) -> Vec<u8> {
    insns.iter().flat_map(|i| i.to_le_bytes()).collect()
}

pub fn word_at(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

/// Build a little-endian relocatable ELF object whose `.text` is `text`.
///
/// `functions` are defined in `.text` at the given offsets; any other name a
/// relocation mentions becomes an undefined symbol.
pub fn relocatable_object(
    arch: Architecture,
    text: &[u8],
    functions: &[(&str, u64)],
    relocs: &[Reloc<'_>],
) -> Vec<u8> {
    let mut obj = Object::new(BinaryFormat::Elf, arch, Endianness::Little);
    let section = obj.section_id(StandardSection::Text);
    obj.append_section_data(section, text, 16);

    for (name, offset) in functions {
        obj.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value: *offset,
            size: 0,
            kind: SymbolKind::Text,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Section(section),
            flags: SymbolFlags::None,
        });
    }

    for r in relocs {
        let symbol = match obj.symbol_id(r.symbol.as_bytes()) {
            Some(id) => id,
            None => obj.add_symbol(Symbol {
                name: r.symbol.as_bytes().to_vec(),
                value: 0,
                size: 0,
                kind: SymbolKind::Unknown,
                scope: SymbolScope::Linkage,
                weak: false,
                section: SymbolSection::Undefined,
                flags: SymbolFlags::None,
            }),
        };
        obj.add_relocation(
            section,
            Relocation {
                offset: r.offset,
                symbol,
                addend: r.addend,
                flags: RelocationFlags::Elf { r_type: r.r_type },
            },
        )
        .expect("add relocation");
    }

    obj.write().expect("write object")
}

/// `fake_clock_gettime` as gcc emits it for LoongArch64: a call to the real
/// implementation and a GOT-style load of `TV_SEC_DELTA`.
pub fn loongarch_fake_clock_gettime() -> Vec<u8> {
    use object::elf::{R_LARCH_B26, R_LARCH_GOT_PC_HI20, R_LARCH_GOT_PC_LO12, R_LARCH_RELAX};

    const NOP: u32 = 0x0340_0000;
    const BL: u32 = 0x5400_0000;
    const PCALAU12I_T0: u32 = 0x1A00_000C;
    const LD_D_T0_T0: u32 = 0x28C0_018C;
    const RET: u32 = 0x4C00_0020;

    let mut text = vec![NOP; 10];
    text.extend_from_slice(&[BL, NOP, NOP, PCALAU12I_T0, LD_D_T0_T0, NOP, RET]);
    let text = words(&text);

    relocatable_object(
        Architecture::LoongArch64,
        &text,
        &[("fake_clock_gettime", 0)],
        &[
            Reloc { offset: 0x28, r_type: R_LARCH_B26, symbol: "real_clock_gettime", addend: 0 },
            Reloc { offset: 0x34, r_type: R_LARCH_GOT_PC_HI20, symbol: "TV_SEC_DELTA", addend: 0 },
            Reloc { offset: 0x34, r_type: R_LARCH_RELAX, symbol: "TV_SEC_DELTA", addend: 0 },
            Reloc { offset: 0x38, r_type: R_LARCH_GOT_PC_LO12, symbol: "TV_SEC_DELTA", addend: 0 },
        ],
    )
}
