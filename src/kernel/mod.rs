//! Host kernel access.
//!
//! [`host::HostCalls`] is the only path to the host kernel; [`linux`] is the
//! Linux backend. All `unsafe` host interaction is concentrated in backends.

pub mod host;
pub mod linux;

pub use host::{check, HostCalls, HostClock, ThreadStart};
pub use linux::LinuxHost;
