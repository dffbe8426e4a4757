//! Test infrastructure shared by unit tests, integration tests and benches.
//!
//! Synthetic ELF images, a recording host backend and a recording policy
//! installer, so loader, channel and policy paths run without real devices
//! or host binaries.

pub mod image_builder;
pub mod mock_host;

pub use image_builder::{BuiltImage, HashStyle, ImageBuilder};
pub use mock_host::{HostCall, MockHost, SleepOutcome};

use crate::config::types::{PalError, Result};
use crate::policy::install::{decode, PolicyInstaller, WirePayload};
use crate::policy::PolicyRule;
use std::sync::Mutex;

/// Installer that decodes every request it receives.
#[derive(Default)]
pub struct RecordingInstaller {
    installs: Mutex<Vec<Vec<PolicyRule>>>,
    failure: Mutex<Option<PalError>>,
}

impl RecordingInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the next request, then fail it with `error`
    pub fn failing(error: PalError) -> Self {
        Self {
            installs: Mutex::new(Vec::new()),
            failure: Mutex::new(Some(error)),
        }
    }

    /// Decoded rule lists, one per install call
    pub fn installs(&self) -> Vec<Vec<PolicyRule>> {
        self.installs.lock().map(|i| i.clone()).unwrap_or_default()
    }
}

impl PolicyInstaller for RecordingInstaller {
    fn install(&self, payload: &WirePayload) -> Result<()> {
        // SAFETY: the payload outlives this call and was built by `stage`.
        let rules = unsafe { decode(payload.header()) }?;
        if let Ok(mut installs) = self.installs.lock() {
            installs.push(rules);
        }
        match self.failure.lock().ok().and_then(|mut f| f.take()) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}
