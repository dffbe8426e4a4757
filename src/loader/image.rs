//! Images in load layout.
//!
//! A [`MappedImage`] is a byte range laid out the way the image appears in
//! memory after loading: segment `p_vaddr` offsets relative to the lowest
//! loadable page, bss zeroed. The range is host memory that outlives the
//! process (the running executable, the vDSO, pages mapped by a host loader),
//! pages this image mapped through [`HostCalls`], or a buffer this crate owns.

use super::elf::{
    load_segments, ElfHeader, LoadSegment, ProgramHeader, EHDR_SIZE, PHDR_SIZE, PT_LOAD, PT_PHDR,
};
use crate::config::types::{align_down, align_up, page_size, PalError, Protection, Result};
use crate::kernel::host::{check, HostCalls};
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageOrigin {
    /// Host memory; page protections may be changed
    Host,
    /// Host pages mapped for this image and unmapped when it drops
    Mapped,
    /// Heap buffer owned by the image
    Owned,
}

/// Final page protection of one loadable segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentProtection {
    pub range: Range<usize>,
    pub prot: Protection,
}

pub struct MappedImage {
    base: *mut u8,
    len: usize,
    origin: ImageOrigin,
    host: Option<Arc<dyn HostCalls>>,
    segments: Vec<SegmentProtection>,
}

// SAFETY: the range is either owned exclusively by this value or is
// process-lifetime host memory; mutation requires `&mut self`.
unsafe impl Send for MappedImage {}
unsafe impl Sync for MappedImage {}

impl MappedImage {
    /// Copy load-layout bytes into an owned image
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(PalError::InvalidArgument("empty image".to_string()));
        }
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(bytes.len())
            .map_err(|_| PalError::NoMemory(format!("image of {} bytes", bytes.len())))?;
        buffer.extend_from_slice(bytes);
        Ok(Self::owned(buffer.into_boxed_slice()))
    }

    fn owned(buffer: Box<[u8]>) -> Self {
        let len = buffer.len();
        let base = Box::into_raw(buffer) as *mut u8;
        MappedImage {
            base,
            len,
            origin: ImageOrigin::Owned,
            host: None,
            segments: Vec::new(),
        }
    }

    /// Wrap host memory already holding an image in load layout.
    ///
    /// # Safety
    /// Every byte covered by the image's loadable segments inside
    /// `[base, base + len)` must stay mapped and readable for the rest of the
    /// process, and nothing else may write to it while the loader relocates.
    pub unsafe fn from_raw(base: usize, len: usize) -> Result<Self> {
        if base == 0 || len < EHDR_SIZE || base.checked_add(len).is_none() {
            return Err(PalError::InvalidArgument(format!(
                "bad image range {:#x}+{:#x}",
                base, len
            )));
        }
        Ok(MappedImage {
            base: base as *mut u8,
            len,
            origin: ImageOrigin::Host,
            host: None,
            segments: Vec::new(),
        })
    }

    /// Read an ELF file and lay its loadable segments out in an owned buffer
    pub fn map_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = std::fs::read(path.as_ref())?;
        let (_, segments) = load_segments(&file)?;
        let (low, span) = segment_span(&segments)?;

        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(span)
            .map_err(|_| PalError::NoMemory(format!("image of {} bytes", span)))?;
        buffer.resize(span, 0u8);
        copy_segments(&file, &segments, low, &mut buffer)?;
        Ok(Self::owned(buffer.into_boxed_slice()))
    }

    /// Read an ELF file into fresh host pages.
    ///
    /// The pages stay writable until the loader applies
    /// [`segment_protections`](Self::segment_protections) after relocation.
    /// They are unmapped when the image drops.
    pub fn map_file_with_host<P: AsRef<Path>>(host: Arc<dyn HostCalls>, path: P) -> Result<Self> {
        let file = std::fs::read(path.as_ref())?;
        let (_, segments) = load_segments(&file)?;
        let (low, span) = segment_span(&segments)?;
        let page = page_size();
        let len = align_up(span, page)
            .ok_or_else(|| PalError::InvalidArgument("image span too large".to_string()))?;

        let base = check(
            host.map_anonymous(0, len, Protection::READ_WRITE),
            "map image file",
        )?;
        let mut image = MappedImage {
            base: base as *mut u8,
            len,
            origin: ImageOrigin::Mapped,
            host: Some(host),
            segments: Vec::new(),
        };
        {
            // SAFETY: `base` is a fresh private read/write mapping of `len`
            // bytes owned by `image`.
            let buffer = unsafe { std::slice::from_raw_parts_mut(image.base, len) };
            copy_segments(&file, &segments, low, buffer)?;
        }

        for segment in &segments {
            let start = align_down(base + (segment.vaddr - low) as usize, page);
            let end = align_up(base + (segment.end()? - low) as usize, page).unwrap_or(base + len);
            image.segments.push(SegmentProtection {
                range: start..end.min(base + len),
                prot: segment.prot,
            });
        }
        log::debug!(
            "Mapped {} at {:#x}+{:#x}",
            path.as_ref().display(),
            base,
            len
        );
        Ok(image)
    }

    /// Reconstruct the running executable from the auxiliary vector
    pub fn current_executable() -> Result<Self> {
        // SAFETY: getauxval only reads the process auxiliary vector.
        let (phdr_addr, phnum) = unsafe {
            (
                libc::getauxval(libc::AT_PHDR) as usize,
                libc::getauxval(libc::AT_PHNUM) as usize,
            )
        };
        if phdr_addr == 0 || phnum == 0 {
            return Err(PalError::NotFound("AT_PHDR missing from auxv".to_string()));
        }
        // SAFETY: the kernel maps the program header table of the running
        // executable for the lifetime of the process.
        let table = unsafe { std::slice::from_raw_parts(phdr_addr as *const u8, phnum * PHDR_SIZE) };
        let phdrs = ProgramHeader::parse_table(table, phnum)?;

        let bias = match phdrs.iter().find(|ph| ph.p_type == PT_PHDR) {
            Some(ph) => phdr_addr.wrapping_sub(ph.vaddr as usize),
            None => 0,
        };
        let (low, high) = load_span(&phdrs)?;
        let base = bias.wrapping_add(low as usize);
        // SAFETY: the executable's loadable segments stay mapped for the
        // life of the process.
        unsafe { Self::from_raw(base, (high - low) as usize) }
    }

    /// Locate the kernel-provided vDSO, if there is one
    pub fn vdso() -> Option<Self> {
        // SAFETY: getauxval only reads the process auxiliary vector.
        let base = unsafe { libc::getauxval(libc::AT_SYSINFO_EHDR) } as usize;
        if base == 0 {
            return None;
        }
        // SAFETY: the vDSO header page, which also holds its program
        // headers, is mapped for the process lifetime.
        let first_page = unsafe { std::slice::from_raw_parts(base as *const u8, page_size()) };
        let header = ElfHeader::parse(first_page).ok()?;
        let phoff = header.phoff as usize;
        // SAFETY: the vDSO program headers live in its first page.
        let table = unsafe {
            std::slice::from_raw_parts(
                (base + phoff) as *const u8,
                header.phnum as usize * PHDR_SIZE,
            )
        };
        let phdrs = ProgramHeader::parse_table(table, header.phnum as usize).ok()?;
        let (low, high) = load_span(&phdrs).ok()?;
        // SAFETY: the vDSO stays mapped for the process lifetime.
        unsafe { Self::from_raw(base, (high - low) as usize).ok() }
    }

    pub fn base(&self) -> usize {
        self.base as usize
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn origin(&self) -> ImageOrigin {
        self.origin
    }

    pub fn is_host_mapped(&self) -> bool {
        matches!(self.origin, ImageOrigin::Host | ImageOrigin::Mapped)
    }

    /// Protections to apply once relocation is done; empty unless the image
    /// was mapped from a file through the host
    pub fn segment_protections(&self) -> &[SegmentProtection] {
        &self.segments
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base() && addr - self.base() < self.len
    }

    /// Borrow `len` bytes at absolute address `addr`
    pub fn read(&self, addr: usize, len: usize) -> Result<&[u8]> {
        let offset = self.offset_of(addr, len)?;
        // SAFETY: bounds checked above; see the constructor contracts.
        Ok(unsafe { std::slice::from_raw_parts(self.base.add(offset), len) })
    }

    /// Bytes from `addr` up to (not including) the next NUL
    pub fn read_cstr(&self, addr: usize) -> Result<&[u8]> {
        let available = self
            .offset_of(addr, 0)
            .map(|offset| self.len - offset)?;
        let mut end = 0;
        while end < available {
            if self.read(addr + end, 1)?[0] == 0 {
                return self.read(addr, end);
            }
            end += 1;
        }
        Err(PalError::InvalidArgument(format!(
            "unterminated string at {:#x}",
            addr
        )))
    }

    pub fn read_u32(&self, addr: usize) -> Result<u32> {
        super::elf::u32_at(self.read(addr, 4)?, 0)
    }

    pub fn read_u64(&self, addr: usize) -> Result<u64> {
        super::elf::u64_at(self.read(addr, 8)?, 0)
    }

    pub fn write_u64(&mut self, addr: usize, value: u64) -> Result<()> {
        let offset = self.offset_of(addr, 8)?;
        let bytes = value.to_le_bytes();
        // SAFETY: bounds checked; `&mut self` guarantees exclusive access.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.add(offset), 8) };
        Ok(())
    }

    fn offset_of(&self, addr: usize, len: usize) -> Result<usize> {
        let offset = addr.wrapping_sub(self.base());
        if addr < self.base() || offset > self.len || self.len - offset < len {
            return Err(PalError::InvalidArgument(format!(
                "access {:#x}+{:#x} outside image {:#x}+{:#x}",
                addr,
                len,
                self.base(),
                self.len
            )));
        }
        Ok(offset)
    }
}

impl Drop for MappedImage {
    fn drop(&mut self) {
        match self.origin {
            ImageOrigin::Owned => {
                // SAFETY: `base`/`len` came from `Box::into_raw` in `owned`.
                unsafe {
                    drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                        self.base, self.len,
                    )));
                }
            }
            ImageOrigin::Mapped => {
                if let Some(host) = self.host.as_ref() {
                    if let Err(e) = check(host.unmap(self.base(), self.len), "unmap image") {
                        log::warn!("Leaking image at {:#x}: {}", self.base(), e);
                    }
                }
            }
            ImageOrigin::Host => {}
        }
    }
}

impl std::fmt::Debug for MappedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedImage")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("len", &self.len)
            .field("origin", &self.origin)
            .finish()
    }
}

/// Page-aligned lowest address of the file's segments and the byte length of
/// the layout from there to the highest segment end
fn segment_span(segments: &[LoadSegment]) -> Result<(u64, usize)> {
    let mut low = u64::MAX;
    let mut high = 0u64;
    for segment in segments {
        if segment.filesz > segment.memsz {
            return Err(PalError::InvalidArgument(format!(
                "segment at {:#x} has filesz > memsz",
                segment.vaddr
            )));
        }
        low = low.min(segment.vaddr);
        high = high.max(segment.end()?);
    }
    let low = align_down(low as usize, page_size()) as u64;
    let span = usize::try_from(high - low)
        .map_err(|_| PalError::InvalidArgument("image span too large".to_string()))?;
    Ok((low, span))
}

/// Copy file contents of each segment to its offset from `low` in `buffer`
fn copy_segments(file: &[u8], segments: &[LoadSegment], low: u64, buffer: &mut [u8]) -> Result<()> {
    let mut header_mapped = false;
    for segment in segments {
        let src_start = segment.offset as usize;
        let src = src_start
            .checked_add(segment.filesz as usize)
            .and_then(|end| file.get(src_start..end))
            .ok_or_else(|| {
                PalError::InvalidArgument(format!("segment at {:#x} outside file", segment.vaddr))
            })?;
        let dst = (segment.vaddr - low) as usize;
        buffer
            .get_mut(dst..dst + src.len())
            .ok_or_else(|| {
                PalError::InvalidArgument(format!("segment at {:#x} outside span", segment.vaddr))
            })?
            .copy_from_slice(src);
        if segment.offset == 0 && segment.vaddr == low {
            header_mapped = true;
        }
    }
    if !header_mapped {
        return Err(PalError::InvalidArgument(
            "first loadable segment does not map the ELF header".to_string(),
        ));
    }
    Ok(())
}

/// Page-aligned lowest address and highest end of the loadable segments
pub(crate) fn load_span(phdrs: &[ProgramHeader]) -> Result<(u64, u64)> {
    let mut low = u64::MAX;
    let mut high = 0u64;
    for ph in phdrs.iter().filter(|ph| ph.p_type == PT_LOAD) {
        low = low.min(ph.vaddr);
        high = high.max(ph.end()?);
    }
    if low == u64::MAX {
        return Err(PalError::InvalidArgument("image has no loadable segments".to_string()));
    }
    Ok((align_down(low as usize, page_size()) as u64, high))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{HostCall, ImageBuilder, MockHost};

    #[test]
    fn test_bounds_checked_reads() {
        let image = MappedImage::from_bytes(&[1, 2, 3, 4, 0, 9, 9, 9]).unwrap();
        let base = image.base();
        assert_eq!(image.read(base + 1, 2).unwrap(), &[2, 3]);
        assert_eq!(image.read_cstr(base).unwrap(), &[1, 2, 3, 4]);
        assert!(image.read(base + 6, 4).is_err());
        assert!(image.read(base.wrapping_sub(1), 1).is_err());
        assert!(image.read_cstr(base + 5).is_err());
    }

    #[test]
    fn test_write_then_read() {
        let mut image = MappedImage::from_bytes(&[0u8; 16]).unwrap();
        let base = image.base();
        image.write_u64(base + 8, 0xdead_beef).unwrap();
        assert_eq!(image.read_u64(base + 8).unwrap(), 0xdead_beef);
        assert!(image.write_u64(base + 9, 0).is_err());
    }

    #[test]
    fn test_map_file_lays_out_segments() {
        let built = ImageBuilder::new("libfile.so").define("answer", 42).build();
        let dir = std::env::temp_dir().join(format!("hostpal-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("libfile.so");
        std::fs::write(&path, built.bytes()).unwrap();

        let image = MappedImage::map_file(&path).unwrap();
        assert_eq!(image.len(), built.bytes().len());
        assert_eq!(image.read(image.base(), image.len()).unwrap(), built.bytes());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_map_file_with_host_records_segment_protections() {
        let built = ImageBuilder::new("libhost.so").define("answer", 42).build();
        let path = std::env::temp_dir().join(format!("hostpal-{}.so", uuid::Uuid::new_v4()));
        std::fs::write(&path, built.bytes()).unwrap();
        let host = Arc::new(MockHost::new());

        let image = MappedImage::map_file_with_host(host.clone(), &path);
        std::fs::remove_file(&path).unwrap();
        let image = image.unwrap();

        assert!(image.is_host_mapped());
        assert_eq!(image.origin(), ImageOrigin::Mapped);
        assert_eq!(image.read(image.base(), image.len()).unwrap(), built.bytes());
        let base = image.base();
        let page = page_size();
        let segments = image.segment_protections();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].range.start, base);
        assert_eq!(segments[0].prot, Protection::READ | Protection::EXEC);
        assert_eq!(segments[1].range.start, base + built.relro().start as usize);
        assert_eq!(segments[1].range.end, base + image.len());
        assert_eq!(segments[1].prot, Protection::READ_WRITE);
        assert_eq!(segments[0].range.end % page, 0);

        let len = image.len();
        drop(image);
        assert!(host.calls().contains(&HostCall::Unmap { addr: base, len }));
    }

    #[test]
    fn test_map_file_with_host_unmaps_on_bad_layout() {
        let mut bytes = ImageBuilder::new("libshort.so").define("x", 1).build().bytes().to_vec();
        bytes.truncate(page_size());
        let path = std::env::temp_dir().join(format!("hostpal-{}.so", uuid::Uuid::new_v4()));
        std::fs::write(&path, &bytes).unwrap();
        let host = Arc::new(MockHost::new());

        let result = MappedImage::map_file_with_host(host.clone(), &path);
        std::fs::remove_file(&path).unwrap();

        assert!(result.unwrap_err().is_invalid_argument());
        let calls = host.calls();
        assert!(matches!(calls.first(), Some(HostCall::MapAnonymous { addr: 0, .. })));
        assert!(matches!(calls.last(), Some(HostCall::Unmap { .. })));
    }

    #[test]
    fn test_current_executable_has_elf_header() {
        let image = MappedImage::current_executable().unwrap();
        assert!(image.is_host_mapped());
        let first_page = image.read(image.base(), image.len().min(page_size())).unwrap();
        let header = ElfHeader::parse(first_page).unwrap();
        assert!(header.phnum > 0);
    }
}
