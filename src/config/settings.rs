/// Runtime configuration loading from a JSON file
use crate::config::types::{page_size, PalError, Result};
pub use crate::thread::DEFAULT_STACK_SIZE;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Host-side settings for one runtime instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PalConfig {
    /// Device implementing the physical memory channel control codes
    pub channel_device: PathBuf,
    /// Device accepting the sandbox policy installation call
    pub policy_device: PathBuf,
    /// Stack size for spawned threads (rounded up to the page size)
    pub thread_stack_size: usize,
    /// Reserve the gap between text and data segments of host-mapped images
    pub reserve_image_gaps: bool,
    /// Look up the vDSO clock entry point at bootstrap
    pub vdso_fast_path: bool,
}

impl Default for PalConfig {
    fn default() -> Self {
        Self {
            channel_device: PathBuf::from("/dev/gipc"),
            policy_device: PathBuf::from("/dev/libos-monitor"),
            thread_stack_size: DEFAULT_STACK_SIZE,
            reserve_image_gaps: true,
            vdso_fast_path: true,
        }
    }
}

impl PalConfig {
    /// Load configuration from a JSON file; missing fields take defaults
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&content).map_err(|e| match e {
            PalError::InvalidArgument(msg) => {
                PalError::InvalidArgument(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })?;
        log::debug!("Loaded runtime configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: PalConfig = serde_json::from_str(content)
            .map_err(|e| PalError::InvalidArgument(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.thread_stack_size < page_size() {
            return Err(PalError::InvalidArgument(format!(
                "thread_stack_size {} is smaller than one page",
                self.thread_stack_size
            )));
        }
        for (name, device) in [
            ("channel_device", &self.channel_device),
            ("policy_device", &self.policy_device),
        ] {
            if !device.is_absolute() {
                return Err(PalError::InvalidArgument(format!(
                    "{} must be an absolute path: {}",
                    name,
                    device.display()
                )));
            }
        }
        Ok(())
    }
}
