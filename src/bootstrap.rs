//! Process bootstrap.
//!
//! The sequence is fixed:
//! 1. register the runtime image (`Rtld`, never re-relocated)
//! 2. load the vDSO companion when the fast path is enabled
//! 3. compile the sandbox policy from the manifest
//! 4. load every preload library the compiled policy names
//! 5. install the policy in one call
//!
//! Every step except the vDSO is indispensable: the first failure ends the
//! sequence and is returned, and [`bootstrap_or_exit`] terminates the process.

use crate::channel::{ChannelDriver, DeviceChannelDriver};
use crate::config::manifest::ManifestSource;
use crate::config::settings::PalConfig;
use crate::config::types::{PalError, Result};
use crate::handle::Handle;
use crate::kernel::host::{HostCalls, HostClock};
use crate::loader::{
    load_vdso, ImageKind, LoaderOptions, LoaderRegistry, MappedImage, TimeSource,
};
use crate::policy::{compile, InstalledPolicy, PolicyInstaller, PolicyRule};
use crate::thread::{self, ThreadFlags};
use std::sync::Arc;
use std::time::Duration;

pub const RUNTIME_IMAGE_NAME: &str = "hostpal-rtld";

/// What to bootstrap beyond the manifest
pub struct BootstrapPlan {
    runtime_name: String,
    runtime: Option<MappedImage>,
    default_rules: Vec<PolicyRule>,
}

impl BootstrapPlan {
    /// Register the running executable as the runtime image
    pub fn current_executable() -> Self {
        Self {
            runtime_name: RUNTIME_IMAGE_NAME.to_string(),
            runtime: None,
            default_rules: Vec::new(),
        }
    }

    /// Register an image that is already in memory as the runtime image
    pub fn with_runtime(name: &str, image: MappedImage) -> Self {
        Self {
            runtime_name: name.to_string(),
            runtime: Some(image),
            default_rules: Vec::new(),
        }
    }

    /// Rules placed ahead of everything compiled from the manifest
    pub fn default_rules(mut self, rules: Vec<PolicyRule>) -> Self {
        self.default_rules = rules;
        self
    }
}

/// State of a bootstrapped process
pub struct Runtime {
    host: Arc<dyn HostCalls>,
    config: PalConfig,
    registry: LoaderRegistry,
    policy: InstalledPolicy,
    time: TimeSource,
}

impl Runtime {
    pub fn registry(&self) -> &LoaderRegistry {
        &self.registry
    }

    pub fn policy(&self) -> &InstalledPolicy {
        &self.policy
    }

    pub fn config(&self) -> &PalConfig {
        &self.config
    }

    pub fn host(&self) -> &Arc<dyn HostCalls> {
        &self.host
    }

    pub fn has_fast_clock(&self) -> bool {
        self.time.has_fast_path()
    }

    pub fn now(&self, clock: HostClock) -> Result<Duration> {
        self.time.now(clock)
    }

    /// Spawn with the configured stack size
    pub fn spawn<F>(&self, entry: F, flags: ThreadFlags) -> Result<Handle>
    where
        F: FnOnce() -> i32 + Send + 'static,
    {
        thread::spawn(
            self.host.clone(),
            entry,
            flags,
            self.config.thread_stack_size,
        )
    }

    /// Open the configured channel device
    pub fn channel_driver(&self) -> Result<Arc<dyn ChannelDriver>> {
        let driver = DeviceChannelDriver::new(self.host.clone(), &self.config.channel_device)?;
        Ok(Arc::new(driver))
    }
}

pub fn bootstrap(
    host: Arc<dyn HostCalls>,
    config: PalConfig,
    manifest: &dyn ManifestSource,
    plan: BootstrapPlan,
    installer: &dyn PolicyInstaller,
) -> Result<Runtime> {
    config.validate()?;
    let mut registry = LoaderRegistry::new(
        host.clone(),
        LoaderOptions {
            reserve_gaps: config.reserve_image_gaps,
        },
    );

    let runtime = match plan.runtime {
        Some(image) => image,
        None => MappedImage::current_executable()?,
    };
    registry
        .load(&plan.runtime_name, runtime, ImageKind::Rtld)
        .map_err(|e| context(e, &format!("runtime image {}", plan.runtime_name)))?;

    let fast = if config.vdso_fast_path {
        load_vdso(&mut registry)
    } else {
        None
    };
    let time = TimeSource::new(host.clone(), fast);

    let policy = compile(manifest, &plan.default_rules)?;
    for path in policy.preload_libraries() {
        let name = path.display().to_string();
        let image =
            MappedImage::map_file_with_host(host.clone(), path).map_err(|e| context(e, &name))?;
        registry
            .load(&name, image, ImageKind::Library)
            .map_err(|e| context(e, &name))?;
    }

    let policy = policy.install(installer)?;
    log::info!(
        "Bootstrap complete: {} images, {} policy rules, fast clock {}",
        registry.len(),
        policy.rules().len(),
        time.has_fast_path()
    );

    Ok(Runtime {
        host,
        config,
        registry,
        policy,
        time,
    })
}

/// [`bootstrap`], terminating the process on failure
pub fn bootstrap_or_exit(
    host: Arc<dyn HostCalls>,
    config: PalConfig,
    manifest: &dyn ManifestSource,
    plan: BootstrapPlan,
    installer: &dyn PolicyInstaller,
) -> Runtime {
    match bootstrap(host, config, manifest, plan, installer) {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Bootstrap failed: {}", e);
            eprintln!("hostpal: bootstrap failed: {}", e);
            std::process::exit(1);
        }
    }
}

fn context(error: PalError, what: &str) -> PalError {
    match error {
        PalError::InvalidArgument(msg) => PalError::InvalidArgument(format!("{}: {}", what, msg)),
        PalError::NotFound(msg) => PalError::NotFound(format!("{}: {}", what, msg)),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::manifest::Manifest;
    use crate::loader::DebugPhase;
    use crate::policy::Permissions;
    use crate::testing::{ImageBuilder, MockHost, RecordingInstaller};

    fn offline_config() -> PalConfig {
        PalConfig {
            vdso_fast_path: false,
            ..PalConfig::default()
        }
    }

    fn runtime_plan() -> BootstrapPlan {
        let built = ImageBuilder::new("rtld").define("rtld_entry", 0x10).build();
        let image = MappedImage::from_bytes(built.bytes()).unwrap();
        BootstrapPlan::with_runtime("rtld", image)
    }

    #[test]
    fn test_bootstrap_registers_runtime_and_installs_policy() {
        let host = Arc::new(MockHost::new());
        let manifest = Manifest::from_pairs([("fs.mount.root.uri", "file:/srv")]);
        let installer = RecordingInstaller::new();
        let plan = runtime_plan()
            .default_rules(vec![PolicyRule::path_exact("/etc/hosts", Permissions::READ)]);

        let runtime = bootstrap(host, offline_config(), &manifest, plan, &installer).unwrap();

        assert_eq!(runtime.registry().len(), 1);
        assert_eq!(runtime.registry().debug_phase(), Some(DebugPhase::Consistent));
        assert!(runtime.registry().head().unwrap().is_relocated());
        assert_eq!(runtime.policy().rules().len(), 2);
        assert_eq!(installer.installs().len(), 1);
        assert!(!runtime.has_fast_clock());
        assert!(runtime.now(HostClock::Monotonic).is_ok());
    }

    #[test]
    fn test_missing_preload_library_is_fatal() {
        let host = Arc::new(MockHost::new());
        let manifest =
            Manifest::from_pairs([("loader.preload", "file:/nonexistent/libmissing.so")]);
        let installer = RecordingInstaller::new();
        let result = bootstrap(host, offline_config(), &manifest, runtime_plan(), &installer);
        assert!(result.is_err());
        assert!(installer.installs().is_empty());
    }

    #[test]
    fn test_malformed_runtime_image_is_fatal() {
        let host = Arc::new(MockHost::new());
        let built = ImageBuilder::new("rtld").without_dynamic().build();
        let plan = BootstrapPlan::with_runtime("rtld", MappedImage::from_bytes(built.bytes()).unwrap());
        let installer = RecordingInstaller::new();
        let result = bootstrap(host, offline_config(), &Manifest::new(), plan, &installer);
        assert!(result.is_err());
        assert!(installer.installs().is_empty());
    }

    #[test]
    fn test_install_failure_aborts_bootstrap() {
        let host = Arc::new(MockHost::new());
        let installer = RecordingInstaller::failing(PalError::Denied("no monitor".into()));
        let result = bootstrap(host, offline_config(), &Manifest::new(), runtime_plan(), &installer);
        assert!(matches!(result, Err(PalError::Denied(_))));
    }
}
