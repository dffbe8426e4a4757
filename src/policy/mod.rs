//! Sandbox policy.
//!
//! [`compile`] turns a manifest into a [`PolicySet`]; installing the set
//! consumes it and hands back an [`InstalledPolicy`] that can only be read.

pub mod compiler;
pub mod install;
pub mod netrule;
pub mod rules;

pub use compiler::{compile, preload_paths, uri_to_path, MAX_PRELOAD_LIBRARIES};
pub use install::{DryRunInstaller, MonitorInstaller, PolicyInstaller, WirePayload};
pub use netrule::{AddressFamily, NetEndpoint, NetRule, PortRange};
pub use rules::{Permissions, PolicyRule, RuleKind, RuleValue};

use crate::config::types::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Where the rows of a policy set came from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySources {
    pub defaults: usize,
    pub preload: usize,
    pub mounts: usize,
    pub network: usize,
}

impl PolicySources {
    pub fn total(&self) -> usize {
        self.defaults + self.preload + self.mounts + self.network
    }
}

/// Compiled, not yet installed policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySet {
    rules: Vec<PolicyRule>,
    sources: PolicySources,
}

impl PolicySet {
    pub(crate) fn new(rules: Vec<PolicyRule>, sources: PolicySources) -> Self {
        Self { rules, sources }
    }

    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn sources(&self) -> PolicySources {
        self.sources
    }

    /// Preload library paths in the order they were compiled
    pub fn preload_libraries(&self) -> impl Iterator<Item = &Path> {
        self.rules
            .iter()
            .skip(self.sources.defaults)
            .take(self.sources.preload)
            .filter_map(PolicyRule::path)
    }

    /// SHA-256 of the canonical JSON rule list
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};
        let canonical = serde_json::to_string(&self.rules).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Install the whole set in one call.
    ///
    /// Staging buffers are released before this returns, on success or
    /// failure.
    pub fn install(self, installer: &dyn PolicyInstaller) -> Result<InstalledPolicy> {
        let fingerprint = self.fingerprint();
        {
            let payload = WirePayload::stage(&self.rules)?;
            installer.install(&payload)?;
        }
        log::info!(
            "Installed sandbox policy: {} rules, fingerprint {}",
            self.rules.len(),
            fingerprint
        );
        Ok(InstalledPolicy {
            set: self,
            fingerprint,
        })
    }
}

/// Policy in force for the rest of the process lifetime
#[derive(Debug, Clone)]
pub struct InstalledPolicy {
    set: PolicySet,
    fingerprint: String,
}

impl InstalledPolicy {
    pub fn rules(&self) -> &[PolicyRule] {
        self.set.rules()
    }

    pub fn sources(&self) -> PolicySources {
        self.set.sources()
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn preload_libraries(&self) -> impl Iterator<Item = &Path> {
        self.set.preload_libraries()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::manifest::Manifest;
    use crate::config::types::PalError;
    use crate::testing::RecordingInstaller;

    fn manifest() -> Manifest {
        Manifest::from_pairs([
            ("loader.preload", "file:/lib/liba.so,file:/lib/libb.so"),
            ("fs.mount.root.uri", "file:/"),
            ("net.rules.web", "10.0.0.1:80-81:10.0.0.2:443"),
        ])
    }

    #[test]
    fn test_fingerprint_is_stable_and_content_sensitive() {
        let a = compile(&manifest(), &[]).unwrap();
        let b = compile(&manifest(), &[]).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);

        let defaults = [PolicyRule::path_exact("/etc/hosts", Permissions::READ)];
        let c = compile(&manifest(), &defaults).unwrap();
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_preload_libraries_follow_defaults() {
        let defaults = [PolicyRule::path_exact("/etc/hosts", Permissions::READ)];
        let set = compile(&manifest(), &defaults).unwrap();
        let preload: Vec<_> = set.preload_libraries().collect();
        assert_eq!(preload, vec![Path::new("/lib/liba.so"), Path::new("/lib/libb.so")]);
    }

    #[test]
    fn test_install_hands_back_read_only_policy() {
        let set = compile(&manifest(), &[]).unwrap();
        let expected = set.rules().to_vec();
        let installer = RecordingInstaller::new();
        let installed = set.install(&installer).unwrap();
        assert_eq!(installed.rules(), expected.as_slice());
        assert_eq!(installer.installs(), vec![expected]);
    }

    #[test]
    fn test_install_failure_is_returned() {
        let set = compile(&manifest(), &[]).unwrap();
        let installer = RecordingInstaller::failing(PalError::Denied("monitor refused".into()));
        assert!(matches!(set.install(&installer), Err(PalError::Denied(_))));
    }
}
