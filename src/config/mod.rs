//! Configuration and shared types
//!
//! Error taxonomy, runtime settings and manifest access.

pub mod manifest;
pub mod settings;
pub mod types;
