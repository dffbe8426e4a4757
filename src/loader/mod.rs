//! Dynamic loader.
//!
//! Builds a [`LinkMap`] for an image already in memory, relocates it when the
//! runtime is responsible for that, protects its layout, and registers it in
//! the [`LoaderRegistry`] under the debugger rendezvous protocol.

pub mod elf;
pub mod hash;
pub mod image;
pub mod link_map;
pub mod registry;
pub mod reloc;
pub mod vdso;

pub use elf::Machine;
pub use image::{ImageOrigin, MappedImage, SegmentProtection};
pub use link_map::{ImageKind, LinkMap, RawLinkMap};
pub use registry::{
    hostpal_debug_state, DebugEntry, DebugObserver, DebugPhase, DebugRecord, DebugSnapshot,
    LoaderOptions, LoaderRegistry,
};
pub use vdso::{load_vdso, FastClock, TimeSource};
