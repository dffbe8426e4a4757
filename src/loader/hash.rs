//! Symbol hash table views.
//!
//! Both table formats are read in place from the image's hash section; the
//! loader never copies or rewrites them.

use super::elf::{Symbol, SYM_SIZE};
use super::image::MappedImage;
use crate::config::types::{PalError, Result};

/// SysV ELF hash
pub fn elf_hash(name: &[u8]) -> u32 {
    let mut h: u32 = 0;
    for &byte in name {
        h = (h << 4).wrapping_add(byte as u32);
        let g = h & 0xf000_0000;
        if g != 0 {
            h ^= g >> 24;
        }
        h &= !g;
    }
    h
}

/// GNU hash (djb2)
pub fn gnu_hash(name: &[u8]) -> u32 {
    name.iter()
        .fold(5381u32, |h, &byte| h.wrapping_mul(33).wrapping_add(byte as u32))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SysvTable {
    nbucket: u32,
    nchain: u32,
    buckets: usize,
    chains: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GnuTable {
    nbuckets: u32,
    symoffset: u32,
    bloom_size: u32,
    bloom_shift: u32,
    bloom: usize,
    buckets: usize,
    chains: usize,
}

/// Hash table of one image, by section format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolHash {
    Sysv(SysvTable),
    Gnu(GnuTable),
}

/// Where the dynamic symbol and string tables live
#[derive(Debug, Clone, Copy)]
pub struct SymbolTables {
    pub symtab: usize,
    pub strtab: usize,
    pub strsz: usize,
}

impl SymbolTables {
    pub fn symbol(&self, image: &MappedImage, index: u32) -> Result<Symbol> {
        let addr = (index as usize)
            .checked_mul(SYM_SIZE)
            .and_then(|off| self.symtab.checked_add(off))
            .ok_or_else(|| PalError::InvalidArgument(format!("symbol index {}", index)))?;
        Symbol::parse(image.read(addr, SYM_SIZE)?)
    }

    pub fn name<'a>(&self, image: &'a MappedImage, offset: u32) -> Result<&'a [u8]> {
        if offset as usize >= self.strsz {
            return Err(PalError::InvalidArgument(format!(
                "string offset {:#x} past table end",
                offset
            )));
        }
        image.read_cstr(self.strtab + offset as usize)
    }

    fn matches(&self, image: &MappedImage, sym: &Symbol, name: &[u8]) -> bool {
        sym.is_exported() && self.name(image, sym.name).map(|n| n == name).unwrap_or(false)
    }
}

impl SymbolHash {
    pub fn sysv(image: &MappedImage, addr: usize) -> Result<Self> {
        let nbucket = image.read_u32(addr)?;
        let nchain = image.read_u32(addr + 4)?;
        if nbucket == 0 {
            return Err(PalError::InvalidArgument("DT_HASH with zero buckets".to_string()));
        }
        let buckets = addr + 8;
        let chains = buckets + nbucket as usize * 4;
        // Both arrays must be inside the image.
        image.read(buckets, (nbucket as usize + nchain as usize) * 4)?;
        Ok(SymbolHash::Sysv(SysvTable {
            nbucket,
            nchain,
            buckets,
            chains,
        }))
    }

    pub fn gnu(image: &MappedImage, addr: usize) -> Result<Self> {
        let nbuckets = image.read_u32(addr)?;
        let symoffset = image.read_u32(addr + 4)?;
        let bloom_size = image.read_u32(addr + 8)?;
        let bloom_shift = image.read_u32(addr + 12)?;
        if nbuckets == 0 || bloom_size == 0 || !bloom_size.is_power_of_two() {
            return Err(PalError::InvalidArgument(format!(
                "DT_GNU_HASH with {} buckets and bloom size {}",
                nbuckets, bloom_size
            )));
        }
        let bloom = addr + 16;
        let buckets = bloom + bloom_size as usize * 8;
        let chains = buckets + nbuckets as usize * 4;
        image.read(bloom, bloom_size as usize * 8 + nbuckets as usize * 4)?;
        Ok(SymbolHash::Gnu(GnuTable {
            nbuckets,
            symoffset,
            bloom_size,
            bloom_shift,
            bloom,
            buckets,
            chains,
        }))
    }

    pub fn style(&self) -> &'static str {
        match self {
            SymbolHash::Sysv(_) => "sysv",
            SymbolHash::Gnu(_) => "gnu",
        }
    }

    /// Index of the exported symbol called `name`
    pub fn find(&self, image: &MappedImage, tables: &SymbolTables, name: &[u8]) -> Result<Option<u32>> {
        match self {
            SymbolHash::Sysv(t) => {
                let mut index = image.read_u32(t.buckets + (elf_hash(name) % t.nbucket) as usize * 4)?;
                let mut steps = 0;
                while index != 0 {
                    if index >= t.nchain || steps > t.nchain {
                        return Err(PalError::InvalidArgument("corrupt DT_HASH chain".to_string()));
                    }
                    let sym = tables.symbol(image, index)?;
                    if tables.matches(image, &sym, name) {
                        return Ok(Some(index));
                    }
                    index = image.read_u32(t.chains + index as usize * 4)?;
                    steps += 1;
                }
                Ok(None)
            }
            SymbolHash::Gnu(t) => {
                let h = gnu_hash(name);
                let word = image.read_u64(t.bloom + ((h / 64) % t.bloom_size) as usize * 8)?;
                let mask = (1u64 << (h % 64)) | (1u64 << ((h >> t.bloom_shift) % 64));
                if word & mask != mask {
                    return Ok(None);
                }
                let mut index = image.read_u32(t.buckets + (h % t.nbuckets) as usize * 4)?;
                if index == 0 {
                    return Ok(None);
                }
                if index < t.symoffset {
                    return Err(PalError::InvalidArgument("corrupt DT_GNU_HASH bucket".to_string()));
                }
                loop {
                    let chain_hash = image.read_u32(t.chains + (index - t.symoffset) as usize * 4)?;
                    if (chain_hash | 1) == (h | 1) {
                        let sym = tables.symbol(image, index)?;
                        if tables.matches(image, &sym, name) {
                            return Ok(Some(index));
                        }
                    }
                    if chain_hash & 1 != 0 {
                        return Ok(None);
                    }
                    index = index.checked_add(1).ok_or_else(|| {
                        PalError::InvalidArgument("corrupt DT_GNU_HASH chain".to_string())
                    })?;
                }
            }
        }
    }
}
