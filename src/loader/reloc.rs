//! RELA relocation processing for x86_64 and aarch64.

use super::elf::{Machine, Rela, RELA_SIZE};
use super::link_map::LinkMap;
use crate::config::types::{PalError, Result};
use std::ops::Range;

pub mod x86_64 {
    pub const R_X86_64_NONE: u32 = 0;
    pub const R_X86_64_64: u32 = 1;
    pub const R_X86_64_GLOB_DAT: u32 = 6;
    pub const R_X86_64_JUMP_SLOT: u32 = 7;
    pub const R_X86_64_RELATIVE: u32 = 8;
}

pub mod aarch64 {
    pub const R_AARCH64_NONE: u32 = 0;
    pub const R_AARCH64_ABS64: u32 = 257;
    pub const R_AARCH64_GLOB_DAT: u32 = 1025;
    pub const R_AARCH64_JUMP_SLOT: u32 = 1026;
    pub const R_AARCH64_RELATIVE: u32 = 1027;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelocKind {
    None,
    Relative,
    Absolute,
    GlobDat,
    JumpSlot,
}

fn classify(machine: Machine, reloc_type: u32) -> Result<RelocKind> {
    use self::aarch64::*;
    use self::x86_64::*;
    let kind = match (machine, reloc_type) {
        (Machine::X86_64, R_X86_64_NONE) | (Machine::Aarch64, R_AARCH64_NONE) => RelocKind::None,
        (Machine::X86_64, R_X86_64_RELATIVE) | (Machine::Aarch64, R_AARCH64_RELATIVE) => {
            RelocKind::Relative
        }
        (Machine::X86_64, R_X86_64_64) | (Machine::Aarch64, R_AARCH64_ABS64) => RelocKind::Absolute,
        (Machine::X86_64, R_X86_64_GLOB_DAT) | (Machine::Aarch64, R_AARCH64_GLOB_DAT) => {
            RelocKind::GlobDat
        }
        (Machine::X86_64, R_X86_64_JUMP_SLOT) | (Machine::Aarch64, R_AARCH64_JUMP_SLOT) => {
            RelocKind::JumpSlot
        }
        (machine, other) => {
            return Err(PalError::InvalidArgument(format!(
                "unsupported {:?} relocation type {}",
                machine, other
            )))
        }
    };
    Ok(kind)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelocStats {
    pub relative: usize,
    pub symbolic: usize,
}

/// Apply every RELA and PLT relocation of `map`.
///
/// `resolve` looks a symbol up in images loaded earlier; the image's own
/// definitions are used when it finds nothing. Weak undefined symbols
/// resolve to zero. An unresolved strong symbol fails the whole load.
pub fn relocate<F>(map: &mut LinkMap, resolve: F) -> Result<RelocStats>
where
    F: Fn(&[u8]) -> Option<usize>,
{
    if map.is_relocated() {
        return Ok(RelocStats::default());
    }
    if map.dynamic().has_rel {
        return Err(PalError::InvalidArgument(
            "REL relocations are not supported".to_string(),
        ));
    }

    let tables: Vec<Range<usize>> = [map.dynamic().rela.clone(), map.dynamic().jmprel.clone()]
        .into_iter()
        .flatten()
        .collect();

    // Compute every write before applying any, so the image is either fully
    // relocated or untouched.
    let mut writes = Vec::new();
    let mut stats = RelocStats::default();
    for table in tables {
        if table.len() % RELA_SIZE != 0 {
            return Err(PalError::InvalidArgument(format!(
                "relocation table size {:#x} is not a multiple of {}",
                table.len(),
                RELA_SIZE
            )));
        }
        for entry in table.step_by(RELA_SIZE) {
            let rela = Rela::parse(map.image().read(entry, RELA_SIZE)?)?;
            let target = map.load_bias().wrapping_add(rela.offset as usize);
            let value = match classify(map.machine(), rela.reloc_type())? {
                RelocKind::None => continue,
                RelocKind::Relative => {
                    stats.relative += 1;
                    (map.load_bias() as u64).wrapping_add(rela.addend as u64)
                }
                kind => {
                    stats.symbolic += 1;
                    let symbol = resolve_symbol(map, &resolve, rela.symbol())?;
                    let with_addend = symbol.wrapping_add(rela.addend as u64);
                    match (kind, map.machine()) {
                        (RelocKind::Absolute, _) => with_addend,
                        (_, Machine::Aarch64) => with_addend,
                        (_, Machine::X86_64) => symbol,
                    }
                }
            };
            writes.push((target, value));
        }
    }

    for &(target, _) in &writes {
        map.image().read(target, 8)?;
    }
    for (target, value) in writes {
        map.image_mut().write_u64(target, value)?;
    }
    map.mark_relocated();
    Ok(stats)
}

fn resolve_symbol<F>(map: &LinkMap, resolve: &F, index: u32) -> Result<u64>
where
    F: Fn(&[u8]) -> Option<usize>,
{
    if index == 0 {
        return Ok(0);
    }
    let sym = map.tables().symbol(map.image(), index)?;
    let name = map.tables().name(map.image(), sym.name)?;
    if let Some(addr) = resolve(name) {
        return Ok(addr as u64);
    }
    if sym.is_defined() {
        return Ok(map.load_bias().wrapping_add(sym.value as usize) as u64);
    }
    if sym.is_weak() {
        return Ok(0);
    }
    Err(PalError::NotFound(format!(
        "unresolved symbol {} in {}",
        String::from_utf8_lossy(name),
        map.name()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{ImageKind, MappedImage};
    use crate::testing::ImageBuilder;

    fn build(builder: ImageBuilder) -> (LinkMap, crate::testing::BuiltImage) {
        let built = builder.build();
        let image = MappedImage::from_bytes(built.bytes()).unwrap();
        let name = built.name().to_string();
        (LinkMap::build(&name, ImageKind::Library, image).unwrap(), built)
    }

    fn slot(map: &LinkMap, vaddr: u64) -> u64 {
        map.image()
            .read_u64(map.load_bias() + vaddr as usize)
            .unwrap()
    }

    #[test]
    fn test_relative_relocations_add_load_bias() {
        let (mut map, built) = build(ImageBuilder::new("librel.so").relative(0x40).relative(0x80));
        let stats = relocate(&mut map, |_| None).unwrap();
        assert_eq!(stats.relative, 2);
        for (i, addend) in [0x40u64, 0x80].into_iter().enumerate() {
            assert_eq!(slot(&map, built.relative_slot(i)), map.load_bias() as u64 + addend);
        }
        assert!(map.is_relocated());
    }

    #[test]
    fn test_imports_resolve_through_callback_then_self() {
        let (mut map, built) = build(
            ImageBuilder::new("libimp.so")
                .define("local_fn", 5)
                .import_data("shared_data")
                .import_function("shared_fn")
                .import_data("local_fn"),
        );
        let stats = relocate(&mut map, |name| match name {
            b"shared_data" => Some(0x1000),
            b"shared_fn" => Some(0x2000),
            _ => None,
        })
        .unwrap();
        assert_eq!(stats.symbolic, 3);
        assert_eq!(slot(&map, built.import_slot("shared_data").unwrap()), 0x1000);
        assert_eq!(slot(&map, built.import_slot("shared_fn").unwrap()), 0x2000);
        assert_eq!(
            slot(&map, built.import_slot("local_fn").unwrap()),
            (map.load_bias() as u64) + built.symbol_vaddr("local_fn").unwrap()
        );
    }

    #[test]
    fn test_weak_undefined_resolves_to_zero() {
        let (mut map, built) = build(ImageBuilder::new("libweak.so").import_weak("maybe"));
        relocate(&mut map, |_| None).unwrap();
        assert_eq!(slot(&map, built.import_slot("maybe").unwrap()), 0);
    }

    #[test]
    fn test_unresolved_strong_symbol_leaves_image_untouched() {
        let (mut map, built) = build(
            ImageBuilder::new("libstrong.so")
                .relative(0x10)
                .import_data("nowhere"),
        );
        let err = relocate(&mut map, |_| None).unwrap_err();
        assert!(matches!(err, PalError::NotFound(_)));
        assert_eq!(slot(&map, built.relative_slot(0)), 0);
        assert!(!map.is_relocated());
    }

    #[test]
    fn test_aarch64_glob_dat_includes_addend() {
        let (mut map, built) = build(
            ImageBuilder::new("libarm.so")
                .machine(Machine::Aarch64)
                .import_data_with_addend("table", 8)
                .relative(0x20),
        );
        relocate(&mut map, |name| (name == b"table").then_some(0x5000)).unwrap();
        assert_eq!(slot(&map, built.import_slot("table").unwrap()), 0x5008);
        assert_eq!(slot(&map, built.relative_slot(0)), map.load_bias() as u64 + 0x20);
    }

    #[test]
    fn test_unknown_relocation_type_is_rejected() {
        assert!(classify(Machine::X86_64, 37).is_err());
        assert!(classify(Machine::Aarch64, 7).is_err());
        assert_eq!(classify(Machine::Aarch64, 0).unwrap(), RelocKind::None);
    }
}
