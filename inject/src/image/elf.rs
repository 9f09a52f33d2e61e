//! Relocatable ELF front-end for [`ImageBuilder`].

use log::{debug, info};
use object::elf::{R_LARCH_ALIGN, R_LARCH_RELAX};
use object::{
    Endianness, Object, ObjectKind, ObjectSection, ObjectSymbol, RelocationFlags,
    RelocationTarget, SymbolKind,
};

use super::{ImageBuilder, LoadedImage, RelocationEntry};
use crate::arch::Machine;
use crate::error::{InjectError, Result};

/// Relaxation hints carry no value to resolve and are safe to skip when no
/// relaxation is performed.
fn is_relaxation_hint(machine: Machine, r_type: u32) -> bool {
    machine == Machine::LoongArch64 && (r_type == R_LARCH_RELAX || r_type == R_LARCH_ALIGN)
}

/// Build an image from the `.text` section of a relocatable object, such as
/// the output of `gcc -c -fPIE fake_clock_gettime.c`.
///
/// Every named symbol defined in `.text` is recorded at its offset; every
/// other name a relocation refers to becomes a runtime cell.
pub fn load_image(data: &[u8]) -> Result<LoadedImage> {
    let file = object::File::parse(data)?;
    if file.kind() != ObjectKind::Relocatable {
        return Err(InjectError::InvalidObject(format!(
            "expected a relocatable object, found {:?}",
            file.kind()
        )));
    }
    let machine = Machine::from_architecture(file.architecture()).ok_or_else(|| {
        InjectError::InvalidObject(format!("unsupported architecture {:?}", file.architecture()))
    })?;
    let endian = if file.is_little_endian() {
        Endianness::Little
    } else {
        Endianness::Big
    };

    let text = file
        .section_by_name(".text")
        .ok_or_else(|| InjectError::InvalidObject("no .text section".into()))?;
    let body = text.data()?;

    let mut definitions = Vec::new();
    for symbol in file.symbols() {
        if symbol.section_index() != Some(text.index())
            || !symbol.is_definition()
            || matches!(symbol.kind(), SymbolKind::Section | SymbolKind::File)
        {
            continue;
        }
        let name = symbol.name()?;
        if !name.is_empty() {
            definitions.push((name, symbol.address()));
        }
    }
    definitions.sort_by_key(|(_, offset)| *offset);

    let mut relocations = Vec::new();
    for (offset, reloc) in text.relocations() {
        let RelocationFlags::Elf { r_type } = reloc.flags() else {
            return Err(InjectError::InvalidObject(format!(
                "relocation at {:#x} is not an ELF relocation",
                offset
            )));
        };
        if is_relaxation_hint(machine, r_type) {
            continue;
        }
        if reloc.has_implicit_addend() {
            return Err(InjectError::InvalidObject(format!(
                "relocation at {:#x} has an implicit addend",
                offset
            )));
        }
        let RelocationTarget::Symbol(index) = reloc.target() else {
            return Err(InjectError::InvalidObject(format!(
                "relocation at {:#x} does not refer to a symbol",
                offset
            )));
        };
        let name = file.symbol_by_index(index)?.name()?;
        if name.is_empty() {
            return Err(InjectError::InvalidObject(format!(
                "relocation at {:#x} refers to an unnamed symbol",
                offset
            )));
        }
        relocations.push(RelocationEntry {
            offset,
            r_type,
            symbol: name.to_string(),
            addend: reloc.addend(),
        });
    }
    debug!(
        "{} object: {} byte .text, {} symbols, {} relocations",
        machine,
        body.len(),
        definitions.len(),
        relocations.len()
    );

    let mut builder = ImageBuilder::new(machine, endian);
    builder.emit_with_symbols(body, &definitions, &relocations)?;
    let image = builder.finish();
    info!(
        "loaded {} image: {} bytes, {} symbols",
        machine,
        image.image.len(),
        image.symbols.len()
    );
    Ok(image)
}
