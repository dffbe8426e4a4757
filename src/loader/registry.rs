//! Process-wide list of loaded images and the debugger rendezvous record.
//!
//! The registry keeps two views of the same list: the Rust-side
//! [`LinkMap`]s, and C-layout `r_debug`/`link_map` mirrors a debugger reads
//! from outside the process. Only the loader thread mutates the list; the
//! mirrors are updated with release stores so an observer that samples
//! `r_state == CONSISTENT` after trapping on the notifier sees a fully
//! linked list.

use super::image::MappedImage;
use super::link_map::{ImageKind, LinkMap, RawLinkMap};
use super::reloc;
use crate::config::types::{align_down, align_up, page_size, PalError, Protection, Result};
use crate::kernel::host::{check, HostCalls};
use serde::Serialize;
use std::ffi::{CStr, CString};
use std::sync::atomic::{AtomicI32, AtomicPtr, Ordering};
use std::sync::Arc;

pub const R_DEBUG_VERSION: i32 = 1;

/// Debugger-visible list state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(i32)]
pub enum DebugPhase {
    Consistent = 0,
    Add = 1,
    /// Part of the ABI; images are never unloaded
    Delete = 2,
}

impl DebugPhase {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(DebugPhase::Consistent),
            1 => Some(DebugPhase::Add),
            2 => Some(DebugPhase::Delete),
            _ => None,
        }
    }

    /// Every change passes through CONSISTENT
    pub fn advance(self, next: DebugPhase) -> Result<DebugPhase> {
        match (self, next) {
            (DebugPhase::Consistent, DebugPhase::Add)
            | (DebugPhase::Add, DebugPhase::Consistent)
            | (DebugPhase::Consistent, DebugPhase::Delete)
            | (DebugPhase::Delete, DebugPhase::Consistent) => Ok(next),
            (from, to) => Err(PalError::InvalidArgument(format!(
                "debug state cannot move from {:?} to {:?}",
                from, to
            ))),
        }
    }
}

/// C-layout mirror of `struct r_debug`
#[repr(C)]
#[derive(Debug)]
pub struct DebugRecord {
    pub r_version: i32,
    pub r_map: AtomicPtr<RawLinkMap>,
    pub r_brk: usize,
    pub r_state: AtomicI32,
    pub r_ldbase: usize,
}

impl DebugRecord {
    pub fn phase(&self) -> Option<DebugPhase> {
        DebugPhase::from_raw(self.r_state.load(Ordering::Acquire))
    }
}

/// Breakpoint address for debuggers. Called on every list change.
#[no_mangle]
#[inline(never)]
pub extern "C" fn hostpal_debug_state() {
    std::sync::atomic::compiler_fence(Ordering::SeqCst);
}

/// One node as seen by walking the C-layout list
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DebugEntry {
    pub name: String,
    pub l_addr: usize,
    pub l_ld: usize,
}

/// What an observer sees at a notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DebugSnapshot {
    pub phase: DebugPhase,
    pub entries: Vec<DebugEntry>,
}

/// In-process stand-in for a debugger trapping on [`hostpal_debug_state`]
pub trait DebugObserver: Send + Sync {
    fn on_debug_state(&self, snapshot: &DebugSnapshot);
}

impl<F> DebugObserver for F
where
    F: Fn(&DebugSnapshot) + Send + Sync,
{
    fn on_debug_state(&self, snapshot: &DebugSnapshot) {
        self(snapshot)
    }
}

struct Node {
    map: LinkMap,
    raw: Box<RawLinkMap>,
    _name: CString,
}

#[derive(Debug, Clone, Copy)]
pub struct LoaderOptions {
    /// Reserve the hole between text and data of loaded images as no-access
    pub reserve_gaps: bool,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self { reserve_gaps: true }
    }
}

pub struct LoaderRegistry {
    host: Arc<dyn HostCalls>,
    options: LoaderOptions,
    debug: Option<Box<DebugRecord>>,
    /// Load order; the list head is the last element
    nodes: Vec<Node>,
    observer: Option<Box<dyn DebugObserver>>,
}

impl LoaderRegistry {
    pub fn new(host: Arc<dyn HostCalls>, options: LoaderOptions) -> Self {
        Self {
            host,
            options,
            debug: None,
            nodes: Vec::new(),
            observer: None,
        }
    }

    pub fn set_observer(&mut self, observer: Box<dyn DebugObserver>) {
        self.observer = Some(observer);
    }

    /// Map `image` into the list. Any failure leaves the list unchanged.
    pub fn load(&mut self, name: &str, image: MappedImage, kind: ImageKind) -> Result<&LinkMap> {
        let mut map = LinkMap::build(name, kind, image)?;

        if !map.is_relocated() {
            let registry = &*self;
            let stats = reloc::relocate(&mut map, |symbol| registry.lookup_bytes(symbol))?;
            log::debug!(
                "Relocated {}: {} relative, {} symbolic",
                name,
                stats.relative,
                stats.symbolic
            );
        }

        if kind.needs_relocation() && map.image().is_host_mapped() {
            self.apply_segment_protections(&map)?;
            if self.options.reserve_gaps {
                self.reserve_gap(&map)?;
            }
            self.protect_relro(&map)?;
        }

        self.register(map)
    }

    /// Load an optional image; failure is logged and reported as `None`
    pub fn load_companion(
        &mut self,
        name: &str,
        image: MappedImage,
        kind: ImageKind,
    ) -> Option<&LinkMap> {
        match self.load(name, image, kind) {
            Ok(map) => Some(map),
            Err(e) => {
                log::debug!("Companion image {} unavailable: {}", name, e);
                None
            }
        }
    }

    fn apply_segment_protections(&self, map: &LinkMap) -> Result<()> {
        for segment in map.image().segment_protections() {
            check(
                self.host.protect(
                    segment.range.start,
                    segment.range.end - segment.range.start,
                    segment.prot,
                ),
                "protect image segment",
            )?;
        }
        Ok(())
    }

    fn reserve_gap(&self, map: &LinkMap) -> Result<()> {
        let (Some(text), Some(data)) = (map.text(), map.data()) else {
            return Ok(());
        };
        let page = page_size();
        let Some(gap_start) = align_up(text.end, page) else {
            return Ok(());
        };
        let gap_end = align_down(data.start, page);
        if gap_end <= gap_start {
            return Ok(());
        }
        check(
            self.host
                .map_anonymous(gap_start, gap_end - gap_start, Protection::NONE),
            "reserve image gap",
        )?;
        log::debug!(
            "Reserved {:#x}..{:#x} in {} as no-access",
            gap_start,
            gap_end,
            map.name()
        );
        Ok(())
    }

    fn protect_relro(&self, map: &LinkMap) -> Result<()> {
        let Some(relro) = map.relro() else {
            return Ok(());
        };
        let page = page_size();
        let start = align_down(relro.start, page);
        let end = align_down(relro.end, page);
        if end > start {
            check(
                self.host.protect(start, end - start, Protection::READ),
                "protect RELRO",
            )?;
        }
        Ok(())
    }

    fn register(&mut self, map: LinkMap) -> Result<&LinkMap> {
        let name = CString::new(map.name().replace('\0', "?")).map_err(|_| {
            PalError::InvalidArgument(format!("image name {:?}", map.name()))
        })?;
        let raw = Box::new(RawLinkMap {
            l_addr: map.load_bias(),
            l_name: name.as_ptr(),
            l_ld: map.dynamic_addr(),
            l_next: AtomicPtr::new(std::ptr::null_mut()),
            l_prev: AtomicPtr::new(std::ptr::null_mut()),
        });
        let raw_ptr = &*raw as *const RawLinkMap as *mut RawLinkMap;

        match self.debug.as_ref() {
            None => {
                self.debug = Some(Box::new(DebugRecord {
                    r_version: R_DEBUG_VERSION,
                    r_map: AtomicPtr::new(raw_ptr),
                    r_brk: hostpal_debug_state as usize,
                    r_state: AtomicI32::new(DebugPhase::Consistent as i32),
                    r_ldbase: map.image().base(),
                }));
            }
            Some(record) => {
                Self::set_phase(record, DebugPhase::Add)?;
                self.notify();

                let head = record.r_map.load(Ordering::Acquire);
                raw.l_next.store(head, Ordering::Release);
                if !head.is_null() {
                    // SAFETY: `head` is the boxed mirror of a node this
                    // registry owns; nodes are never removed.
                    unsafe { (*head).l_prev.store(raw_ptr, Ordering::Release) };
                }
                record.r_map.store(raw_ptr, Ordering::Release);
            }
        }

        log::info!(
            "Registered {:?} image {} at {:#x}",
            map.kind(),
            map.name(),
            map.load_bias()
        );
        self.nodes.push(Node {
            map,
            raw,
            _name: name,
        });

        if self.nodes.len() > 1 {
            if let Some(record) = self.debug.as_ref() {
                Self::set_phase(record, DebugPhase::Consistent)?;
            }
            self.notify();
        }

        self.nodes
            .last()
            .map(|node| &node.map)
            .ok_or_else(|| PalError::NotFound("registered image".to_string()))
    }

    fn set_phase(record: &DebugRecord, next: DebugPhase) -> Result<()> {
        let current = record.phase().ok_or_else(|| {
            PalError::InvalidArgument("debug record holds an unknown state".to_string())
        })?;
        let next = current.advance(next)?;
        record.r_state.store(next as i32, Ordering::Release);
        Ok(())
    }

    fn notify(&self) {
        hostpal_debug_state();
        if let (Some(observer), Some(phase)) = (self.observer.as_ref(), self.debug_phase()) {
            observer.on_debug_state(&DebugSnapshot {
                phase,
                entries: self.debugger_view(),
            });
        }
    }

    pub fn debug_record(&self) -> Option<&DebugRecord> {
        self.debug.as_deref()
    }

    pub fn debug_phase(&self) -> Option<DebugPhase> {
        self.debug.as_ref().and_then(|record| record.phase())
    }

    /// Walk the C-layout list from `r_map` the way a debugger does
    pub fn debugger_view(&self) -> Vec<DebugEntry> {
        let mut entries = Vec::new();
        let Some(record) = self.debug.as_ref() else {
            return entries;
        };
        let mut cursor = record.r_map.load(Ordering::Acquire);
        while !cursor.is_null() && entries.len() <= self.nodes.len() {
            // SAFETY: every pointer reachable from `r_map` is the boxed
            // mirror of a live node, and `l_name` its owned string.
            let node = unsafe { &*cursor };
            let name = unsafe { CStr::from_ptr(node.l_name) };
            entries.push(DebugEntry {
                name: name.to_string_lossy().into_owned(),
                l_addr: node.l_addr,
                l_ld: node.l_ld,
            });
            cursor = node.l_next.load(Ordering::Acquire);
        }
        entries
    }

    /// Images in list order, most recently loaded first
    pub fn maps(&self) -> impl Iterator<Item = &LinkMap> {
        self.nodes.iter().rev().map(|node| &node.map)
    }

    pub fn head(&self) -> Option<&LinkMap> {
        self.maps().next()
    }

    pub fn find(&self, name: &str) -> Option<&LinkMap> {
        self.maps().find(|map| map.name() == name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Resolve `symbol` in list order
    pub fn lookup(&self, symbol: &str) -> Option<(&LinkMap, usize)> {
        self.maps()
            .find_map(|map| map.lookup(symbol).map(|addr| (map, addr)))
    }

    fn lookup_bytes(&self, symbol: &[u8]) -> Option<usize> {
        self.maps().find_map(|map| map.lookup_bytes(symbol))
    }

    /// Number of nodes with a null `l_prev` in the C-layout list
    pub fn unlinked_prev_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|node| node.raw.l_prev.load(Ordering::Acquire).is_null())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::LinuxHost;
    use crate::testing::ImageBuilder;
    use std::sync::Mutex;

    fn registry() -> LoaderRegistry {
        LoaderRegistry::new(Arc::new(LinuxHost::new()), LoaderOptions::default())
    }

    fn owned(builder: ImageBuilder) -> MappedImage {
        MappedImage::from_bytes(builder.build().bytes()).unwrap()
    }

    #[test]
    fn test_phase_transitions() {
        use DebugPhase::*;
        assert_eq!(Consistent.advance(Add).unwrap(), Add);
        assert_eq!(Add.advance(Consistent).unwrap(), Consistent);
        assert!(Add.advance(Add).is_err());
        assert!(Add.advance(Delete).is_err());
        assert!(Consistent.advance(Consistent).is_err());
    }

    #[test]
    fn test_first_load_initializes_without_notifying() {
        let mut registry = registry();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        registry.set_observer(Box::new(move |s: &DebugSnapshot| {
            sink.lock().unwrap().push(s.phase)
        }));

        registry
            .load("rtld", owned(ImageBuilder::new("rtld")), ImageKind::Rtld)
            .unwrap();
        let record = registry.debug_record().unwrap();
        assert_eq!(record.r_version, R_DEBUG_VERSION);
        assert_eq!(record.r_brk, hostpal_debug_state as usize);
        assert_eq!(registry.debug_phase(), Some(DebugPhase::Consistent));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_add_protocol_hides_half_linked_list() {
        let mut registry = registry();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        registry.set_observer(Box::new(move |s: &DebugSnapshot| {
            sink.lock().unwrap().push(s.clone())
        }));

        registry
            .load("rtld", owned(ImageBuilder::new("rtld")), ImageKind::Rtld)
            .unwrap();
        registry
            .load("liba.so", owned(ImageBuilder::new("liba.so")), ImageKind::Library)
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].phase, DebugPhase::Add);
        let names: Vec<_> = seen[0].entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["rtld"]);
        assert_eq!(seen[1].phase, DebugPhase::Consistent);
        let names: Vec<_> = seen[1].entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["liba.so", "rtld"]);
        assert_eq!(registry.unlinked_prev_count(), 1);
    }

    #[test]
    fn test_failed_load_leaves_list_unchanged() {
        let mut registry = registry();
        registry
            .load("rtld", owned(ImageBuilder::new("rtld")), ImageKind::Rtld)
            .unwrap();
        let err = registry
            .load(
                "libbroken.so",
                owned(ImageBuilder::new("libbroken.so").import_data("absent")),
                ImageKind::Library,
            )
            .unwrap_err();
        assert!(matches!(err, PalError::NotFound(_)));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.debug_phase(), Some(DebugPhase::Consistent));
    }

    #[test]
    fn test_companion_failure_is_silent() {
        let mut registry = registry();
        let junk = MappedImage::from_bytes(&[0u8; 128]).unwrap();
        assert!(registry
            .load_companion("vdso", junk, ImageKind::Vdso)
            .is_none());
        assert!(registry.is_empty());
        assert!(registry.debug_record().is_none());
    }

    #[test]
    fn test_lookup_prefers_most_recent_image() {
        let mut registry = registry();
        registry
            .load("first.so", owned(ImageBuilder::new("first.so").define("shared", 1)), ImageKind::Library)
            .unwrap();
        registry
            .load("second.so", owned(ImageBuilder::new("second.so").define("shared", 2)), ImageKind::Library)
            .unwrap();
        let (map, _) = registry.lookup("shared").unwrap();
        assert_eq!(map.name(), "second.so");
        assert!(registry.lookup("nothing").is_none());
    }
}
