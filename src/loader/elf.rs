//! ELF64 little-endian structures and constants.
//!
//! File and program headers of an image file go through `elf_rs`. Tables the
//! loader reaches inside an image already in memory (program headers found
//! through the auxiliary vector, dynamic entries, symbols, relocations) are
//! read from byte slices with bounds checks. A truncated or inconsistent image
//! yields `InvalidArgument`, never a panic.

use crate::config::types::{PalError, Protection, Result};
use elf_rs::{Elf, ElfFile, ProgramHeaderFlags, ProgramType};

pub const ELFMAG: [u8; 4] = [0x7f, b'E', b'L', b'F'];
pub const ELFCLASS64: u8 = 2;
pub const ELFDATA2LSB: u8 = 1;
pub const EV_CURRENT: u8 = 1;

pub const ET_EXEC: u16 = 2;
pub const ET_DYN: u16 = 3;

pub const EM_X86_64: u16 = 62;
pub const EM_AARCH64: u16 = 183;

pub const PT_LOAD: u32 = 1;
pub const PT_DYNAMIC: u32 = 2;
pub const PT_INTERP: u32 = 3;
pub const PT_PHDR: u32 = 6;
pub const PT_GNU_RELRO: u32 = 0x6474_e552;

pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

pub const DT_NULL: i64 = 0;
pub const DT_NEEDED: i64 = 1;
pub const DT_PLTRELSZ: i64 = 2;
pub const DT_HASH: i64 = 4;
pub const DT_STRTAB: i64 = 5;
pub const DT_SYMTAB: i64 = 6;
pub const DT_RELA: i64 = 7;
pub const DT_RELASZ: i64 = 8;
pub const DT_RELAENT: i64 = 9;
pub const DT_STRSZ: i64 = 10;
pub const DT_SYMENT: i64 = 11;
pub const DT_SONAME: i64 = 14;
pub const DT_REL: i64 = 17;
pub const DT_PLTREL: i64 = 20;
pub const DT_JMPREL: i64 = 23;
pub const DT_GNU_HASH: i64 = 0x6fff_fef5;

pub const STB_LOCAL: u8 = 0;
pub const STB_GLOBAL: u8 = 1;
pub const STB_WEAK: u8 = 2;

pub const STT_NOTYPE: u8 = 0;
pub const STT_OBJECT: u8 = 1;
pub const STT_FUNC: u8 = 2;

pub const SHN_UNDEF: u16 = 0;

pub const EHDR_SIZE: usize = 64;
pub const PHDR_SIZE: usize = 56;
pub const SYM_SIZE: usize = 24;
pub const RELA_SIZE: usize = 24;
pub const DYN_SIZE: usize = 16;

fn field<const N: usize>(bytes: &[u8], offset: usize) -> Result<[u8; N]> {
    offset
        .checked_add(N)
        .and_then(|end| bytes.get(offset..end))
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| {
            PalError::InvalidArgument(format!("ELF field at {:#x} out of bounds", offset))
        })
}

pub(crate) fn u16_at(bytes: &[u8], offset: usize) -> Result<u16> {
    field::<2>(bytes, offset).map(u16::from_le_bytes)
}

pub(crate) fn u32_at(bytes: &[u8], offset: usize) -> Result<u32> {
    field::<4>(bytes, offset).map(u32::from_le_bytes)
}

pub(crate) fn u64_at(bytes: &[u8], offset: usize) -> Result<u64> {
    field::<8>(bytes, offset).map(u64::from_le_bytes)
}

pub(crate) fn i64_at(bytes: &[u8], offset: usize) -> Result<i64> {
    field::<8>(bytes, offset).map(i64::from_le_bytes)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum Machine {
    X86_64,
    Aarch64,
}

impl Machine {
    pub fn from_raw(machine: u16) -> Result<Self> {
        match machine {
            EM_X86_64 => Ok(Machine::X86_64),
            EM_AARCH64 => Ok(Machine::Aarch64),
            other => Err(PalError::InvalidArgument(format!(
                "unsupported ELF machine {}",
                other
            ))),
        }
    }

    pub fn raw(self) -> u16 {
        match self {
            Machine::X86_64 => EM_X86_64,
            Machine::Aarch64 => EM_AARCH64,
        }
    }

    /// Machine of the running process
    pub fn native() -> Option<Self> {
        if cfg!(target_arch = "x86_64") {
            Some(Machine::X86_64)
        } else if cfg!(target_arch = "aarch64") {
            Some(Machine::Aarch64)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ElfHeader {
    pub e_type: u16,
    pub machine: Machine,
    pub entry: u64,
    pub phoff: u64,
    pub phentsize: u16,
    pub phnum: u16,
}

impl ElfHeader {
    /// Parse the file header at the start of `bytes`. The slice must also
    /// cover the program header table.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let elf64 = match Elf::from_bytes(bytes).map_err(malformed)? {
            Elf::Elf64(elf64) => elf64,
            Elf::Elf32(_) => return Err(not_elf64()),
        };
        let ident: [u8; 16] = field(bytes, 0)?;
        if ident[5] != ELFDATA2LSB {
            return Err(PalError::InvalidArgument("not a little-endian image".to_string()));
        }
        if ident[6] != EV_CURRENT {
            return Err(PalError::InvalidArgument(format!("bad ELF version {}", ident[6])));
        }

        let e_type = u16_at(bytes, 16)?;
        if e_type != ET_EXEC && e_type != ET_DYN {
            return Err(PalError::InvalidArgument(format!(
                "ELF type {} is neither executable nor shared object",
                e_type
            )));
        }
        let elf_header = elf64.elf_header();
        let header = ElfHeader {
            e_type,
            machine: Machine::from_raw(u16_at(bytes, 18)?)?,
            entry: elf_header.entry_point(),
            phoff: elf_header.program_header_offset() as u64,
            phentsize: elf_header.program_header_entry_size() as u16,
            phnum: elf_header.program_header_entry_num() as u16,
        };
        if header.phentsize as usize != PHDR_SIZE {
            return Err(PalError::InvalidArgument(format!(
                "program header size {} (expected {})",
                header.phentsize, PHDR_SIZE
            )));
        }
        if header.phnum == 0 {
            return Err(PalError::InvalidArgument("image has no program headers".to_string()));
        }
        Ok(header)
    }

    pub fn is_position_independent(&self) -> bool {
        self.e_type == ET_DYN
    }
}

fn malformed<E: std::fmt::Debug>(e: E) -> PalError {
    PalError::InvalidArgument(format!("malformed ELF image: {:?}", e))
}

fn not_elf64() -> PalError {
    PalError::InvalidArgument("not an ELF64 image".to_string())
}

/// A PT_LOAD segment of an image file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadSegment {
    pub offset: u64,
    pub vaddr: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub prot: Protection,
}

impl LoadSegment {
    pub fn end(&self) -> Result<u64> {
        self.vaddr.checked_add(self.memsz).ok_or_else(|| {
            PalError::InvalidArgument(format!("segment at {:#x} overflows", self.vaddr))
        })
    }
}

/// Header and loadable segments of an ELF file held in `bytes`
pub fn load_segments(bytes: &[u8]) -> Result<(ElfHeader, Vec<LoadSegment>)> {
    let header = ElfHeader::parse(bytes)?;
    let elf64 = match Elf::from_bytes(bytes).map_err(malformed)? {
        Elf::Elf64(elf64) => elf64,
        Elf::Elf32(_) => return Err(not_elf64()),
    };

    let mut segments = Vec::new();
    for phdr in elf64.program_header_iter() {
        if phdr.ph_type() != ProgramType::LOAD || phdr.memsz() == 0 {
            continue;
        }
        let flags = phdr.flags();
        let mut prot = Protection::NONE;
        if flags.contains(ProgramHeaderFlags::READ) {
            prot = prot | Protection::READ;
        }
        if flags.contains(ProgramHeaderFlags::WRITE) {
            prot = prot | Protection::WRITE;
        }
        if flags.contains(ProgramHeaderFlags::EXECUTE) {
            prot = prot | Protection::EXEC;
        }
        segments.push(LoadSegment {
            offset: phdr.offset(),
            vaddr: phdr.vaddr(),
            filesz: phdr.filesz(),
            memsz: phdr.memsz(),
            prot,
        });
    }
    if segments.is_empty() {
        return Err(PalError::InvalidArgument("image has no loadable segments".to_string()));
    }
    Ok((header, segments))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub flags: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub align: u64,
}

impl ProgramHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        Ok(ProgramHeader {
            p_type: u32_at(bytes, 0)?,
            flags: u32_at(bytes, 4)?,
            offset: u64_at(bytes, 8)?,
            vaddr: u64_at(bytes, 16)?,
            filesz: u64_at(bytes, 32)?,
            memsz: u64_at(bytes, 40)?,
            align: u64_at(bytes, 48)?,
        })
    }

    /// Parse `count` consecutive headers
    pub fn parse_table(bytes: &[u8], count: usize) -> Result<Vec<Self>> {
        (0..count)
            .map(|i| {
                let start = i * PHDR_SIZE;
                let entry = bytes.get(start..start + PHDR_SIZE).ok_or_else(|| {
                    PalError::InvalidArgument("program header table truncated".to_string())
                })?;
                Self::parse(entry)
            })
            .collect()
    }

    pub fn end(&self) -> Result<u64> {
        self.vaddr.checked_add(self.memsz).ok_or_else(|| {
            PalError::InvalidArgument(format!("segment at {:#x} overflows", self.vaddr))
        })
    }

    pub fn is_executable(&self) -> bool {
        self.flags & PF_X != 0
    }

    pub fn is_writable(&self) -> bool {
        self.flags & PF_W != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynamicEntry {
    pub tag: i64,
    pub val: u64,
}

impl DynamicEntry {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        Ok(DynamicEntry {
            tag: i64_at(bytes, 0)?,
            val: u64_at(bytes, 8)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Symbol {
    pub name: u32,
    pub info: u8,
    pub other: u8,
    pub shndx: u16,
    pub value: u64,
    pub size: u64,
}

impl Symbol {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let info: [u8; 1] = field(bytes, 4)?;
        let other: [u8; 1] = field(bytes, 5)?;
        Ok(Symbol {
            name: u32_at(bytes, 0)?,
            info: info[0],
            other: other[0],
            shndx: u16_at(bytes, 6)?,
            value: u64_at(bytes, 8)?,
            size: u64_at(bytes, 16)?,
        })
    }

    pub fn binding(&self) -> u8 {
        self.info >> 4
    }

    pub fn sym_type(&self) -> u8 {
        self.info & 0xf
    }

    pub fn is_defined(&self) -> bool {
        self.shndx != SHN_UNDEF
    }

    pub fn is_weak(&self) -> bool {
        self.binding() == STB_WEAK
    }

    /// Defined global or weak symbol visible to other images
    pub fn is_exported(&self) -> bool {
        self.is_defined() && matches!(self.binding(), STB_GLOBAL | STB_WEAK)
    }
}

pub fn symbol_info(binding: u8, sym_type: u8) -> u8 {
    (binding << 4) | (sym_type & 0xf)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rela {
    pub offset: u64,
    pub info: u64,
    pub addend: i64,
}

impl Rela {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        Ok(Rela {
            offset: u64_at(bytes, 0)?,
            info: u64_at(bytes, 8)?,
            addend: i64_at(bytes, 16)?,
        })
    }

    pub fn symbol(&self) -> u32 {
        (self.info >> 32) as u32
    }

    pub fn reloc_type(&self) -> u32 {
        (self.info & 0xffff_ffff) as u32
    }

    pub fn info_for(symbol: u32, reloc_type: u32) -> u64 {
        ((symbol as u64) << 32) | reloc_type as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_bytes() -> Vec<u8> {
        let mut bytes = vec![0u8; EHDR_SIZE + 3 * PHDR_SIZE];
        bytes[..4].copy_from_slice(&ELFMAG);
        bytes[4] = ELFCLASS64;
        bytes[5] = ELFDATA2LSB;
        bytes[6] = EV_CURRENT;
        bytes[16..18].copy_from_slice(&ET_DYN.to_le_bytes());
        bytes[18..20].copy_from_slice(&EM_X86_64.to_le_bytes());
        bytes[24..32].copy_from_slice(&0x1040u64.to_le_bytes());
        bytes[32..40].copy_from_slice(&64u64.to_le_bytes());
        bytes[52..54].copy_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
        bytes[54..56].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        bytes[56..58].copy_from_slice(&3u16.to_le_bytes());
        bytes
    }

    #[test]
    fn test_parse_header() {
        let header = ElfHeader::parse(&header_bytes()).unwrap();
        assert_eq!(header.machine, Machine::X86_64);
        assert_eq!(header.entry, 0x1040);
        assert_eq!(header.phnum, 3);
        assert!(header.is_position_independent());
    }

    #[test]
    fn test_rejects_malformed_headers() {
        let mut bad_magic = header_bytes();
        bad_magic[1] = b'X';
        assert!(ElfHeader::parse(&bad_magic).unwrap_err().is_invalid_argument());

        let mut elf32 = header_bytes();
        elf32[4] = 1;
        assert!(ElfHeader::parse(&elf32).is_err());

        let mut riscv = header_bytes();
        riscv[18..20].copy_from_slice(&243u16.to_le_bytes());
        assert!(ElfHeader::parse(&riscv).is_err());

        let mut relocatable = header_bytes();
        relocatable[16..18].copy_from_slice(&1u16.to_le_bytes());
        assert!(ElfHeader::parse(&relocatable).is_err());

        assert!(ElfHeader::parse(&header_bytes()[..40]).is_err());
    }

    #[test]
    fn test_load_segments_carry_protections() {
        let built = crate::testing::ImageBuilder::new("libsegments.so")
            .define("x", 1)
            .build();
        let (header, segments) = load_segments(built.bytes()).unwrap();
        assert_eq!(header.entry, built.entry());
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].vaddr, 0);
        assert_eq!(segments[0].prot, Protection::READ | Protection::EXEC);
        assert_eq!(segments[1].vaddr, built.relro().start);
        assert_eq!(segments[1].prot, Protection::READ_WRITE);
    }

    #[test]
    fn test_load_segments_rejects_truncated_file() {
        assert!(load_segments(&header_bytes()[..EHDR_SIZE - 8]).is_err());
    }

    #[test]
    fn test_symbol_and_rela_fields() {
        let mut sym = vec![0u8; SYM_SIZE];
        sym[0..4].copy_from_slice(&7u32.to_le_bytes());
        sym[4] = symbol_info(STB_WEAK, STT_FUNC);
        sym[6..8].copy_from_slice(&5u16.to_le_bytes());
        let sym = Symbol::parse(&sym).unwrap();
        assert!(sym.is_weak());
        assert!(sym.is_exported());
        assert_eq!(sym.sym_type(), STT_FUNC);

        let rela = Rela {
            offset: 0,
            info: Rela::info_for(3, 7),
            addend: 0,
        };
        assert_eq!(rela.symbol(), 3);
        assert_eq!(rela.reloc_type(), 7);
    }
}
