//! hostpal: host abstraction runtime for a library OS
//!
//! Presents a small, uniform set of primitives to a sandboxed application on
//! top of the Linux host kernel.
//!
//! # Architecture
//!
//! ## Host access ([`kernel`])
//! - [`kernel::host`]: the `HostCalls` seam; every host primitive returns a signed result
//! - [`kernel::linux`]: Linux backend
//!
//! ## Resources ([`handle`])
//! - Reference-counted handles over a closed set of kinds, with typed accessors
//!
//! ## IPC ([`channel`])
//! - [`channel::device`]: physical memory channel over the kernel device
//! - [`channel::loopback`]: in-process channel with the same semantics
//! - [`channel::wire`]: request layouts and control codes
//!
//! ## Loader ([`loader`])
//! - [`loader::elf`], [`loader::hash`], [`loader::reloc`]: ELF parsing, symbol hash tables, relocation
//! - [`loader::registry`]: link map list and debugger rendezvous state
//! - [`loader::vdso`]: vDSO fast clock
//!
//! ## Sandbox policy ([`policy`])
//! - [`policy::compiler`]: manifest to policy set
//! - [`policy::install`]: wire payload and installers
//!
//! ## Threads and synchronization ([`thread`], [`sync`])
//!
//! ## Bootstrap ([`bootstrap`])
//! - Runtime image, vDSO, preload libraries, policy installation
//!
//! ## Configuration ([`config`])
//! - [`config::types`]: error taxonomy and shared types
//! - [`config::settings`]: runtime configuration
//! - [`config::manifest`]: manifest access
//!
//! ## Testing Infrastructure ([`testing`])
//! - [`testing::image_builder`]: synthetic ELF images
//! - [`testing::mock_host`]: recording host backend

// Host access
pub mod kernel;

// Resources and IPC
pub mod channel;
pub mod handle;

// Loader
pub mod loader;

// Sandbox policy
pub mod policy;

// Threads and synchronization
pub mod sync;
pub mod thread;

pub mod bootstrap;

// Configuration
pub mod config;

// Testing Infrastructure
pub mod testing;

// CLI entrypoint wiring for the hostpal binary
pub mod cli;

pub use config::types::{PalError, Result};
