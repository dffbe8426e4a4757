//! Per-image descriptors.

use super::elf::{
    DynamicEntry, ElfHeader, Machine, ProgramHeader, DT_GNU_HASH, DT_HASH, DT_JMPREL, DT_NEEDED,
    DT_NULL, DT_PLTREL, DT_PLTRELSZ, DT_REL, DT_RELA, DT_RELAENT, DT_RELASZ, DT_SONAME,
    DT_STRSZ, DT_STRTAB, DT_SYMENT, DT_SYMTAB, DYN_SIZE, PHDR_SIZE, PT_DYNAMIC,
    PT_GNU_RELRO, PT_LOAD, SYM_SIZE,
};
use super::hash::{SymbolHash, SymbolTables};
use super::image::{load_span, MappedImage};
use crate::config::types::{page_size, PalError, Result};
use serde::Serialize;
use std::ops::Range;
use std::sync::atomic::AtomicPtr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ImageKind {
    /// The runtime's own image, relocated before the loader runs
    Rtld,
    Executable,
    Library,
    /// Kernel-provided companion image
    Vdso,
}

impl ImageKind {
    /// Images this loader must relocate itself
    pub fn needs_relocation(self) -> bool {
        matches!(self, ImageKind::Executable | ImageKind::Library)
    }
}

/// Dynamic section contents the loader consumes, with pointers resolved to
/// absolute addresses.
#[derive(Debug, Clone, Default)]
pub struct DynamicInfo {
    pub strtab: usize,
    pub strsz: usize,
    pub symtab: usize,
    pub hash: Option<usize>,
    pub gnu_hash: Option<usize>,
    pub rela: Option<Range<usize>>,
    pub jmprel: Option<Range<usize>>,
    pub has_rel: bool,
    pub soname: Option<u32>,
    pub needed: Vec<u32>,
}

impl DynamicInfo {
    fn parse(image: &MappedImage, addr: usize, size: usize, bias: usize) -> Result<Self> {
        // Pointer entries of an image relocated by a host loader were already
        // adjusted in place; unrelocated ones are link-time addresses.
        let resolve = |ptr: u64| -> usize {
            let ptr = ptr as usize;
            if image.contains(ptr) {
                ptr
            } else {
                bias.wrapping_add(ptr)
            }
        };

        let mut info = DynamicInfo::default();
        let mut strtab = None;
        let mut symtab = None;
        let mut strsz = None;
        let (mut rela, mut relasz) = (None, 0usize);
        let (mut jmprel, mut pltrelsz, mut pltrel) = (None, 0usize, None);

        let mut terminated = false;
        for i in 0..size / DYN_SIZE {
            let entry = DynamicEntry::parse(image.read(addr + i * DYN_SIZE, DYN_SIZE)?)?;
            match entry.tag {
                DT_NULL => {
                    terminated = true;
                    break;
                }
                DT_STRTAB => strtab = Some(resolve(entry.val)),
                DT_SYMTAB => symtab = Some(resolve(entry.val)),
                DT_STRSZ => strsz = Some(entry.val as usize),
                DT_SYMENT => {
                    if entry.val as usize != SYM_SIZE {
                        return Err(PalError::InvalidArgument(format!(
                            "DT_SYMENT {} (expected {})",
                            entry.val, SYM_SIZE
                        )));
                    }
                }
                DT_HASH => info.hash = Some(resolve(entry.val)),
                DT_GNU_HASH => info.gnu_hash = Some(resolve(entry.val)),
                DT_RELA => rela = Some(resolve(entry.val)),
                DT_RELASZ => relasz = entry.val as usize,
                DT_RELAENT => {
                    if entry.val as usize != super::elf::RELA_SIZE {
                        return Err(PalError::InvalidArgument(format!(
                            "DT_RELAENT {}",
                            entry.val
                        )));
                    }
                }
                DT_JMPREL => jmprel = Some(resolve(entry.val)),
                DT_PLTRELSZ => pltrelsz = entry.val as usize,
                DT_PLTREL => pltrel = Some(entry.val as i64),
                DT_REL => info.has_rel = true,
                DT_SONAME => info.soname = Some(entry.val as u32),
                DT_NEEDED => info.needed.push(entry.val as u32),
                _ => {}
            }
        }
        if !terminated {
            return Err(PalError::InvalidArgument(
                "dynamic section is not DT_NULL terminated".to_string(),
            ));
        }

        info.strtab = strtab
            .ok_or_else(|| PalError::InvalidArgument("missing DT_STRTAB".to_string()))?;
        info.symtab = symtab
            .ok_or_else(|| PalError::InvalidArgument("missing DT_SYMTAB".to_string()))?;
        info.strsz =
            strsz.ok_or_else(|| PalError::InvalidArgument("missing DT_STRSZ".to_string()))?;
        if info.hash.is_none() && info.gnu_hash.is_none() {
            return Err(PalError::InvalidArgument(
                "missing DT_HASH and DT_GNU_HASH".to_string(),
            ));
        }
        info.rela = rela.map(|start| start..start.saturating_add(relasz));
        if let Some(start) = jmprel {
            if pltrel.is_some_and(|kind| kind != DT_RELA) {
                return Err(PalError::InvalidArgument(
                    "PLT relocations are not RELA".to_string(),
                ));
            }
            info.jmprel = Some(start..start.saturating_add(pltrelsz));
        }
        Ok(info)
    }
}

/// Loader descriptor for one mapped image
#[derive(Debug)]
pub struct LinkMap {
    name: String,
    kind: ImageKind,
    machine: Machine,
    image: MappedImage,
    load_bias: usize,
    dynamic_addr: usize,
    linked_dynamic: u64,
    entry: usize,
    phdr: usize,
    phnum: usize,
    text: Option<Range<usize>>,
    data: Option<Range<usize>>,
    relro: Option<Range<usize>>,
    dynamic: DynamicInfo,
    tables: SymbolTables,
    hash: SymbolHash,
    relocated: bool,
}

impl LinkMap {
    /// Build the descriptor for `image` without modifying it
    pub fn build(name: &str, kind: ImageKind, image: MappedImage) -> Result<Self> {
        let base = image.base();
        // The header page also holds the program header table.
        let header = ElfHeader::parse(image.read(base, image.len().min(page_size()))?)?;
        let phnum = header.phnum as usize;
        let phdr = base
            .checked_add(header.phoff as usize)
            .ok_or_else(|| PalError::InvalidArgument("program header offset".to_string()))?;
        let phdrs = ProgramHeader::parse_table(image.read(phdr, phnum * PHDR_SIZE)?, phnum)?;

        let (low, high) = load_span(&phdrs)?;
        if (high - low) as usize > image.len() {
            return Err(PalError::InvalidArgument(format!(
                "segments span {:#x} bytes but image holds {:#x}",
                high - low,
                image.len()
            )));
        }
        let load_bias = base.wrapping_sub(low as usize);
        let range = |ph: &ProgramHeader| {
            let start = load_bias.wrapping_add(ph.vaddr as usize);
            start..start.wrapping_add(ph.memsz as usize)
        };

        let dynamic_ph = phdrs
            .iter()
            .find(|ph| ph.p_type == PT_DYNAMIC)
            .ok_or_else(|| PalError::InvalidArgument("missing PT_DYNAMIC".to_string()))?;
        let dynamic_addr = load_bias.wrapping_add(dynamic_ph.vaddr as usize);
        let dynamic = DynamicInfo::parse(&image, dynamic_addr, dynamic_ph.memsz as usize, load_bias)?;

        let tables = SymbolTables {
            symtab: dynamic.symtab,
            strtab: dynamic.strtab,
            strsz: dynamic.strsz,
        };
        let hash = match (dynamic.gnu_hash, dynamic.hash) {
            (Some(addr), _) => SymbolHash::gnu(&image, addr)?,
            (None, Some(addr)) => SymbolHash::sysv(&image, addr)?,
            (None, None) => {
                return Err(PalError::InvalidArgument(
                    "missing DT_HASH and DT_GNU_HASH".to_string(),
                ))
            }
        };

        let loads = || phdrs.iter().filter(|ph| ph.p_type == PT_LOAD);
        let text = loads().find(|ph| ph.is_executable()).map(range);
        let data = loads().find(|ph| ph.is_writable()).map(range);
        let relro = phdrs.iter().find(|ph| ph.p_type == PT_GNU_RELRO).map(range);

        Ok(LinkMap {
            name: name.to_string(),
            kind,
            machine: header.machine,
            load_bias,
            dynamic_addr,
            linked_dynamic: dynamic_ph.vaddr,
            entry: if header.entry == 0 {
                0
            } else {
                load_bias.wrapping_add(header.entry as usize)
            },
            phdr,
            phnum,
            text,
            data,
            relro,
            dynamic,
            tables,
            hash,
            relocated: !kind.needs_relocation(),
            image,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ImageKind {
        self.kind
    }

    pub fn machine(&self) -> Machine {
        self.machine
    }

    pub fn image(&self) -> &MappedImage {
        &self.image
    }

    pub(crate) fn image_mut(&mut self) -> &mut MappedImage {
        &mut self.image
    }

    pub fn load_bias(&self) -> usize {
        self.load_bias
    }

    /// Address of the dynamic section in memory
    pub fn dynamic_addr(&self) -> usize {
        self.dynamic_addr
    }

    /// Link-time address of the dynamic section
    pub fn linked_dynamic(&self) -> u64 {
        self.linked_dynamic
    }

    pub fn entry(&self) -> usize {
        self.entry
    }

    pub fn phdr(&self) -> usize {
        self.phdr
    }

    pub fn phnum(&self) -> usize {
        self.phnum
    }

    pub fn text(&self) -> Option<Range<usize>> {
        self.text.clone()
    }

    pub fn data(&self) -> Option<Range<usize>> {
        self.data.clone()
    }

    pub fn relro(&self) -> Option<Range<usize>> {
        self.relro.clone()
    }

    pub fn dynamic(&self) -> &DynamicInfo {
        &self.dynamic
    }

    pub fn hash(&self) -> &SymbolHash {
        &self.hash
    }

    pub(crate) fn tables(&self) -> &SymbolTables {
        &self.tables
    }

    pub fn is_relocated(&self) -> bool {
        self.relocated
    }

    pub(crate) fn mark_relocated(&mut self) {
        self.relocated = true;
    }

    pub fn soname(&self) -> Option<String> {
        self.dynamic.soname.and_then(|off| self.string(off))
    }

    pub fn needed(&self) -> Vec<String> {
        self.dynamic
            .needed
            .iter()
            .filter_map(|&off| self.string(off))
            .collect()
    }

    fn string(&self, offset: u32) -> Option<String> {
        self.tables
            .name(&self.image, offset)
            .ok()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    /// Address of an exported symbol defined by this image
    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.lookup_bytes(name.as_bytes())
    }

    pub(crate) fn lookup_bytes(&self, name: &[u8]) -> Option<usize> {
        let index = self.hash.find(&self.image, &self.tables, name).ok()??;
        let sym = self.tables.symbol(&self.image, index).ok()?;
        Some(self.load_bias.wrapping_add(sym.value as usize))
    }
}

/// C-layout mirror of a `struct link_map` node, as debuggers walk it
#[repr(C)]
#[derive(Debug)]
pub struct RawLinkMap {
    pub l_addr: usize,
    pub l_name: *const libc::c_char,
    pub l_ld: usize,
    pub l_next: AtomicPtr<RawLinkMap>,
    pub l_prev: AtomicPtr<RawLinkMap>,
}

// SAFETY: `l_name` points into a string owned by the same registry node and
// is never written after construction; the links are atomics.
unsafe impl Send for RawLinkMap {}
unsafe impl Sync for RawLinkMap {}
