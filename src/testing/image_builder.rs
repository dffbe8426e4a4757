//! Synthetic ELF64 shared objects in load layout.
//!
//! Layout, by page: text (headers, dynamic symbols, strings, hash tables,
//! relocations, a few bytes of code), one unmapped gap page, a RELRO page
//! holding the dynamic section and GOT slots, then a writable data page with
//! one word per defined symbol and the RELATIVE slots. File offsets equal
//! virtual addresses, so the same bytes serve as a file and as a loaded image.

use crate::config::types::{align_up, page_size, Protection, Result};
use crate::kernel::host::{check, HostCalls};
use crate::loader::elf::*;
use crate::loader::hash::{elf_hash, gnu_hash};
use crate::loader::reloc::{aarch64, x86_64};
use crate::loader::MappedImage;
use std::collections::BTreeMap;
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashStyle {
    Sysv,
    Gnu,
    Both,
}

#[derive(Debug, Clone)]
struct Import {
    name: String,
    function: bool,
    weak: bool,
    addend: i64,
}

#[derive(Debug, Clone)]
pub struct ImageBuilder {
    name: String,
    machine: Machine,
    hash_style: HashStyle,
    defined: Vec<(String, u64)>,
    imports: Vec<Import>,
    relatives: Vec<i64>,
    needed: Vec<String>,
    omitted: Vec<i64>,
    with_dynamic: bool,
}

/// Output of [`ImageBuilder::build`], with the addresses tests check against
#[derive(Debug, Clone)]
pub struct BuiltImage {
    name: String,
    bytes: Vec<u8>,
    entry: u64,
    dynamic_vaddr: u64,
    text_end: u64,
    data_start: u64,
    relro: Range<u64>,
    symbols: BTreeMap<String, u64>,
    import_slots: BTreeMap<String, u64>,
    relative_slots: Vec<u64>,
}

struct Bytes(Vec<u8>);

impl Bytes {
    fn put_u16(&mut self, off: usize, v: u16) {
        self.0[off..off + 2].copy_from_slice(&v.to_le_bytes());
    }
    fn put_u32(&mut self, off: usize, v: u32) {
        self.0[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }
    fn put_u64(&mut self, off: usize, v: u64) {
        self.0[off..off + 8].copy_from_slice(&v.to_le_bytes());
    }
}

fn align8(v: usize) -> usize {
    (v + 7) & !7
}

impl ImageBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            machine: Machine::native().unwrap_or(Machine::X86_64),
            hash_style: HashStyle::Both,
            defined: Vec::new(),
            imports: Vec::new(),
            relatives: Vec::new(),
            needed: Vec::new(),
            omitted: Vec::new(),
            with_dynamic: true,
        }
    }

    pub fn machine(mut self, machine: Machine) -> Self {
        self.machine = machine;
        self
    }

    pub fn hash_style(mut self, style: HashStyle) -> Self {
        self.hash_style = style;
        self
    }

    /// Export `name` as a data word holding `value`
    pub fn define(mut self, name: &str, value: u64) -> Self {
        self.defined.push((name.to_string(), value));
        self
    }

    pub fn import_data(self, name: &str) -> Self {
        self.import(name, false, false, 0)
    }

    pub fn import_data_with_addend(self, name: &str, addend: i64) -> Self {
        self.import(name, false, false, addend)
    }

    pub fn import_function(self, name: &str) -> Self {
        self.import(name, true, false, 0)
    }

    pub fn import_weak(self, name: &str) -> Self {
        self.import(name, false, true, 0)
    }

    fn import(mut self, name: &str, function: bool, weak: bool, addend: i64) -> Self {
        self.imports.push(Import {
            name: name.to_string(),
            function,
            weak,
            addend,
        });
        self
    }

    pub fn relative(mut self, addend: i64) -> Self {
        self.relatives.push(addend);
        self
    }

    pub fn needed(mut self, name: &str) -> Self {
        self.needed.push(name.to_string());
        self
    }

    /// Leave a dynamic tag out of the dynamic section
    pub fn omit_tag(mut self, tag: i64) -> Self {
        self.omitted.push(tag);
        self
    }

    pub fn without_dynamic(mut self) -> Self {
        self.with_dynamic = false;
        self
    }

    fn reloc_types(&self) -> (u32, u32, u32) {
        match self.machine {
            Machine::X86_64 => (
                x86_64::R_X86_64_GLOB_DAT,
                x86_64::R_X86_64_JUMP_SLOT,
                x86_64::R_X86_64_RELATIVE,
            ),
            Machine::Aarch64 => (
                aarch64::R_AARCH64_GLOB_DAT,
                aarch64::R_AARCH64_JUMP_SLOT,
                aarch64::R_AARCH64_RELATIVE,
            ),
        }
    }

    pub fn build(self) -> BuiltImage {
        let page = page_size();
        let use_sysv = matches!(self.hash_style, HashStyle::Sysv | HashStyle::Both);
        let use_gnu = matches!(self.hash_style, HashStyle::Gnu | HashStyle::Both);

        // Symbol order: null, undefined imports, defined (GNU bucket order).
        let mut undefined: Vec<&Import> = Vec::new();
        for import in &self.imports {
            let is_defined = self.defined.iter().any(|(n, _)| *n == import.name);
            if !is_defined && !undefined.iter().any(|u| u.name == import.name) {
                undefined.push(import);
            }
        }
        let nbuckets = self.defined.len().max(1) as u32;
        let mut defined: Vec<(String, u64, u32)> = self
            .defined
            .iter()
            .map(|(n, v)| (n.clone(), *v, gnu_hash(n.as_bytes())))
            .collect();
        if use_gnu {
            defined.sort_by_key(|(_, _, h)| h % nbuckets);
        }
        let symoffset = 1 + undefined.len();
        let nsyms = symoffset + defined.len();
        let sym_index = |name: &str| -> u32 {
            if let Some(i) = defined.iter().position(|(n, _, _)| n == name) {
                (symoffset + i) as u32
            } else {
                undefined
                    .iter()
                    .position(|u| u.name == name)
                    .map(|i| (1 + i) as u32)
                    .unwrap_or(0)
            }
        };

        // String table
        fn intern(s: &str, table: &mut Vec<u8>) -> u32 {
            let off = table.len() as u32;
            table.extend_from_slice(s.as_bytes());
            table.push(0);
            off
        }
        let mut dynstr = vec![0u8];
        let undefined_names: Vec<u32> = undefined
            .iter()
            .map(|u| intern(&u.name, &mut dynstr))
            .collect();
        let defined_names: Vec<u32> = defined
            .iter()
            .map(|(n, _, _)| intern(n, &mut dynstr))
            .collect();
        let soname_off = intern(&self.name, &mut dynstr);
        let needed_offs: Vec<u32> = self.needed.iter().map(|n| intern(n, &mut dynstr)).collect();

        let data_relocs: Vec<&Import> = self.imports.iter().filter(|i| !i.function).collect();
        let plt_relocs: Vec<&Import> = self.imports.iter().filter(|i| i.function).collect();
        let nrela = data_relocs.len() + self.relatives.len();
        let njmprel = plt_relocs.len();

        // Text layout
        let nphdr = if self.with_dynamic { 4 } else { 3 };
        let phoff = EHDR_SIZE;
        let dynsym_off = align8(phoff + nphdr * PHDR_SIZE);
        let dynstr_off = dynsym_off + nsyms * SYM_SIZE;
        let sysv_off = align8(dynstr_off + dynstr.len());
        let sysv_len = if use_sysv { (2 + nsyms + nsyms) * 4 } else { 0 };
        let gnu_off = align8(sysv_off + sysv_len);
        let gnu_len = if use_gnu {
            16 + 8 + nbuckets as usize * 4 + defined.len() * 4
        } else {
            0
        };
        let rela_off = align8(gnu_off + gnu_len);
        let jmprel_off = rela_off + nrela * RELA_SIZE;
        let code_off = (jmprel_off + njmprel * RELA_SIZE + 15) & !15;
        let text_end = code_off + 16;
        let text_pages = align_up(text_end, page).unwrap_or(text_end);

        // Data layout: gap page, RELRO (dynamic + GOT), then RW words.
        let data_start = text_pages + page;
        let dyn_tags = self.dynamic_tags(
            use_sysv.then_some(sysv_off as u64),
            use_gnu.then_some(gnu_off as u64),
            dynsym_off as u64,
            dynstr_off as u64,
            dynstr.len() as u64,
            (nrela > 0).then_some((rela_off as u64, (nrela * RELA_SIZE) as u64)),
            (njmprel > 0).then_some((jmprel_off as u64, (njmprel * RELA_SIZE) as u64)),
            soname_off,
            &needed_offs,
        );
        let dynamic_len = dyn_tags.len() * DYN_SIZE;
        let got_off = data_start + dynamic_len;
        let relro_len = align_up(dynamic_len + self.imports.len() * 8, page).unwrap_or(page);
        let rw_off = data_start + relro_len;
        let words_len = (defined.len() + self.relatives.len()).max(1) * 8;
        let rw_len = align_up(words_len, page).unwrap_or(page);
        let total = rw_off + rw_len;

        let mut out = Bytes(vec![0u8; total]);

        // ELF header
        out.0[..4].copy_from_slice(&ELFMAG);
        out.0[4] = ELFCLASS64;
        out.0[5] = ELFDATA2LSB;
        out.0[6] = EV_CURRENT;
        out.put_u16(16, ET_DYN);
        out.put_u16(18, self.machine.raw());
        out.put_u32(20, 1);
        out.put_u64(24, code_off as u64);
        out.put_u64(32, phoff as u64);
        out.put_u16(52, EHDR_SIZE as u16);
        out.put_u16(54, PHDR_SIZE as u16);
        out.put_u16(56, nphdr as u16);
        out.put_u16(58, 64);

        // Program headers
        let mut phdrs = vec![
            (PT_LOAD, PF_R | PF_X, 0usize, text_end),
            (PT_LOAD, PF_R | PF_W, data_start, relro_len + rw_len),
        ];
        if self.with_dynamic {
            phdrs.push((PT_DYNAMIC, PF_R | PF_W, data_start, dynamic_len));
        }
        phdrs.push((PT_GNU_RELRO, PF_R, data_start, relro_len));
        for (i, (p_type, flags, vaddr, size)) in phdrs.into_iter().enumerate() {
            let at = phoff + i * PHDR_SIZE;
            out.put_u32(at, p_type);
            out.put_u32(at + 4, flags);
            out.put_u64(at + 8, vaddr as u64);
            out.put_u64(at + 16, vaddr as u64);
            out.put_u64(at + 24, vaddr as u64);
            out.put_u64(at + 32, size as u64);
            out.put_u64(at + 40, size as u64);
            out.put_u64(at + 48, if p_type == PT_LOAD { page as u64 } else { 8 });
        }

        // Symbols
        let mut symbols = BTreeMap::new();
        for (i, import) in undefined.iter().enumerate() {
            let at = dynsym_off + (1 + i) * SYM_SIZE;
            let binding = if import.weak { STB_WEAK } else { STB_GLOBAL };
            let sym_type = if import.function { STT_FUNC } else { STT_NOTYPE };
            out.put_u32(at, undefined_names[i]);
            out.0[at + 4] = symbol_info(binding, sym_type);
        }
        for (i, (name, value, _)) in defined.iter().enumerate() {
            let at = dynsym_off + (symoffset + i) * SYM_SIZE;
            let word = rw_off + i * 8;
            out.put_u32(at, defined_names[i]);
            out.0[at + 4] = symbol_info(STB_GLOBAL, STT_OBJECT);
            out.put_u16(at + 6, 1);
            out.put_u64(at + 8, word as u64);
            out.put_u64(at + 16, 8);
            out.put_u64(word, *value);
            symbols.insert(name.clone(), word as u64);
        }
        out.0[dynstr_off..dynstr_off + dynstr.len()].copy_from_slice(&dynstr);

        let all_names: Vec<Vec<u8>> = std::iter::once(Vec::new())
            .chain(undefined.iter().map(|u| u.name.as_bytes().to_vec()))
            .chain(defined.iter().map(|(n, _, _)| n.as_bytes().to_vec()))
            .collect();

        if use_sysv {
            let nbucket = nsyms;
            let mut buckets = vec![0u32; nbucket];
            let mut chains = vec![0u32; nsyms];
            for (i, name) in all_names.iter().enumerate().skip(1) {
                let b = elf_hash(name) as usize % nbucket;
                chains[i] = buckets[b];
                buckets[b] = i as u32;
            }
            out.put_u32(sysv_off, nbucket as u32);
            out.put_u32(sysv_off + 4, nsyms as u32);
            for (i, v) in buckets.iter().chain(chains.iter()).enumerate() {
                out.put_u32(sysv_off + 8 + i * 4, *v);
            }
        }

        if use_gnu {
            let bloom_shift = 6u32;
            let mut bloom = 0u64;
            let mut buckets = vec![0u32; nbuckets as usize];
            let mut chain = vec![0u32; defined.len()];
            for (i, (_, _, h)) in defined.iter().enumerate() {
                bloom |= (1u64 << (h % 64)) | (1u64 << ((h >> bloom_shift) % 64));
                let b = (h % nbuckets) as usize;
                if buckets[b] == 0 {
                    buckets[b] = (symoffset + i) as u32;
                }
                let last_in_bucket = defined
                    .get(i + 1)
                    .map(|(_, _, next)| next % nbuckets != h % nbuckets)
                    .unwrap_or(true);
                chain[i] = (h & !1) | u32::from(last_in_bucket);
            }
            out.put_u32(gnu_off, nbuckets);
            out.put_u32(gnu_off + 4, symoffset as u32);
            out.put_u32(gnu_off + 8, 1);
            out.put_u32(gnu_off + 12, bloom_shift);
            out.put_u64(gnu_off + 16, bloom);
            let buckets_off = gnu_off + 24;
            for (i, v) in buckets.iter().enumerate() {
                out.put_u32(buckets_off + i * 4, *v);
            }
            let chain_off = buckets_off + nbuckets as usize * 4;
            for (i, v) in chain.iter().enumerate() {
                out.put_u32(chain_off + i * 4, *v);
            }
        }

        // GOT slots and relocations
        let (glob_dat, jump_slot, relative) = self.reloc_types();
        let mut import_slots = BTreeMap::new();
        let mut slot_of = |import: &Import, index: usize| -> u64 {
            let slot = (got_off + index * 8) as u64;
            import_slots.insert(import.name.clone(), slot);
            slot
        };
        let mut rela_at = rela_off;
        let put_rela = |out: &mut Bytes, at: &mut usize, offset: u64, info: u64, addend: i64| {
            out.put_u64(*at, offset);
            out.put_u64(*at + 8, info);
            out.put_u64(*at + 16, addend as u64);
            *at += RELA_SIZE;
        };
        let mut slot_index = 0;
        for import in &data_relocs {
            let slot = slot_of(import, slot_index);
            slot_index += 1;
            let info = Rela::info_for(sym_index(&import.name), glob_dat);
            put_rela(&mut out, &mut rela_at, slot, info, import.addend);
        }
        let relatives_base = rw_off + defined.len() * 8;
        let mut relative_slots = Vec::new();
        for (i, addend) in self.relatives.iter().enumerate() {
            let slot = (relatives_base + i * 8) as u64;
            relative_slots.push(slot);
            put_rela(&mut out, &mut rela_at, slot, Rela::info_for(0, relative), *addend);
        }
        let mut jmprel_at = jmprel_off;
        for import in &plt_relocs {
            let slot = slot_of(import, slot_index);
            slot_index += 1;
            let info = Rela::info_for(sym_index(&import.name), jump_slot);
            put_rela(&mut out, &mut jmprel_at, slot, info, import.addend);
        }

        // Code: a few return instructions
        let ret: &[u8] = match self.machine {
            Machine::X86_64 => &[0xc3; 4],
            Machine::Aarch64 => &[0xc0, 0x03, 0x5f, 0xd6],
        };
        for chunk in 0..4 {
            let at = code_off + chunk * 4;
            out.0[at..at + 4].copy_from_slice(&ret[..4]);
        }

        // Dynamic section
        for (i, (tag, val)) in dyn_tags.iter().enumerate() {
            let at = data_start + i * DYN_SIZE;
            out.put_u64(at, *tag as u64);
            out.put_u64(at + 8, *val);
        }

        BuiltImage {
            name: self.name,
            bytes: out.0,
            entry: code_off as u64,
            dynamic_vaddr: data_start as u64,
            text_end: text_end as u64,
            data_start: data_start as u64,
            relro: data_start as u64..(data_start + relro_len) as u64,
            symbols,
            import_slots,
            relative_slots,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn dynamic_tags(
        &self,
        sysv: Option<u64>,
        gnu: Option<u64>,
        symtab: u64,
        strtab: u64,
        strsz: u64,
        rela: Option<(u64, u64)>,
        jmprel: Option<(u64, u64)>,
        soname: u32,
        needed: &[u32],
    ) -> Vec<(i64, u64)> {
        let mut tags: Vec<(i64, u64)> = needed.iter().map(|&n| (DT_NEEDED, n as u64)).collect();
        tags.push((DT_SONAME, soname as u64));
        if let Some(addr) = sysv {
            tags.push((DT_HASH, addr));
        }
        if let Some(addr) = gnu {
            tags.push((DT_GNU_HASH, addr));
        }
        tags.push((DT_STRTAB, strtab));
        tags.push((DT_SYMTAB, symtab));
        tags.push((DT_STRSZ, strsz));
        tags.push((DT_SYMENT, SYM_SIZE as u64));
        if let Some((addr, size)) = rela {
            tags.push((DT_RELA, addr));
            tags.push((DT_RELASZ, size));
            tags.push((DT_RELAENT, RELA_SIZE as u64));
        }
        if let Some((addr, size)) = jmprel {
            tags.push((DT_JMPREL, addr));
            tags.push((DT_PLTRELSZ, size));
            tags.push((DT_PLTREL, DT_RELA as u64));
        }
        tags.retain(|(tag, _)| !self.omitted.contains(tag));
        tags.push((DT_NULL, 0));
        tags
    }
}

impl BuiltImage {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn entry(&self) -> u64 {
        self.entry
    }

    pub fn dynamic_vaddr(&self) -> u64 {
        self.dynamic_vaddr
    }

    /// Link-time address of the data word behind an exported symbol
    pub fn symbol_vaddr(&self, name: &str) -> Option<u64> {
        self.symbols.get(name).copied()
    }

    /// Link-time address of the GOT slot filled for an import
    pub fn import_slot(&self, name: &str) -> Option<u64> {
        self.import_slots.get(name).copied()
    }

    pub fn relative_slot(&self, index: usize) -> u64 {
        self.relative_slots[index]
    }

    /// Link-time end of the text segment
    pub fn text_end(&self) -> u64 {
        self.text_end
    }

    /// Page-aligned hole between text and data
    pub fn gap(&self) -> Range<u64> {
        let page = page_size() as u64;
        let start = (self.text_end + page - 1) / page * page;
        start..self.data_start
    }

    pub fn relro(&self) -> Range<u64> {
        self.relro.clone()
    }

    /// Copy the image into fresh host memory and wrap it as host-mapped.
    /// The mapping is never released.
    pub fn map_with_host(&self, host: &dyn HostCalls) -> Result<MappedImage> {
        let len = self.bytes.len();
        let base = check(
            host.map_anonymous(0, len, Protection::READ_WRITE),
            "map test image",
        )?;
        // SAFETY: `base` is a fresh private mapping of `len` bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(self.bytes.as_ptr(), base as *mut u8, len);
            MappedImage::from_raw(base, len)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_separates_text_gap_and_data() {
        let built = ImageBuilder::new("liblayout.so").define("x", 1).build();
        let page = page_size() as u64;
        assert_eq!(built.gap().end - built.gap().start, page);
        assert_eq!(built.relro().start, built.data_start);
        assert_eq!(built.bytes().len() as u64 % page, 0);
        let header = ElfHeader::parse(built.bytes()).unwrap();
        assert_eq!(header.entry, built.entry());
    }
}
