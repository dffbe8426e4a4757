//! Manifest to policy set.
//!
//! Output order is fixed: caller defaults, preload libraries (exact,
//! read-only), filesystem mounts (recursive, read-write), network rules.
//! Individual preload, mount and network entries that fail to parse are
//! skipped with a warning; a skipped entry grants nothing.

use super::netrule::NetRule;
use super::rules::{Permissions, PolicyRule};
use super::{PolicySet, PolicySources};
use crate::config::manifest::ManifestSource;
use crate::config::types::{PalError, Result};
use std::path::PathBuf;

pub const PRELOAD_KEY: &str = "loader.preload";
pub const ROOT_MOUNT_KEY: &str = "fs.mount.root.uri";
pub const OTHER_MOUNTS_PREFIX: &str = "fs.mount.other";
pub const NET_RULES_PREFIX: &str = "net.rules";

pub const MAX_PRELOAD_LIBRARIES: usize = 16;

const FILE_SCHEME: &str = "file:";

/// Path named by a `file:` URI
pub fn uri_to_path(uri: &str) -> Option<PathBuf> {
    let path = uri.trim().strip_prefix(FILE_SCHEME)?;
    if path.is_empty() {
        return None;
    }
    Some(PathBuf::from(path))
}

fn staging<T>(capacity: usize, what: &str) -> Result<Vec<T>> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(capacity)
        .map_err(|_| PalError::NoMemory(format!("staging {} {}", capacity, what)))?;
    Ok(buffer)
}

/// Preload library paths, in manifest order, at most [`MAX_PRELOAD_LIBRARIES`]
pub fn preload_paths(manifest: &dyn ManifestSource) -> Result<Vec<PathBuf>> {
    let Some(list) = manifest.get(PRELOAD_KEY) else {
        return Ok(Vec::new());
    };
    let mut paths = staging(MAX_PRELOAD_LIBRARIES, "preload paths")?;
    for uri in list.split(',').map(str::trim).filter(|u| !u.is_empty()) {
        match uri_to_path(uri) {
            Some(path) if paths.len() < MAX_PRELOAD_LIBRARIES => paths.push(path),
            Some(_) => {
                log::warn!(
                    "Ignoring preload {}: more than {} libraries",
                    uri,
                    MAX_PRELOAD_LIBRARIES
                );
            }
            None => log::warn!("Ignoring preload {}: not a file: URI", uri),
        }
    }
    Ok(paths)
}

/// Root mount followed by named mounts in key order
fn mount_paths(manifest: &dyn ManifestSource) -> Result<Vec<PathBuf>> {
    let names = manifest.children(OTHER_MOUNTS_PREFIX);
    let mut paths = staging(names.len() + 1, "mount paths")?;

    let mut add = |key: String| match manifest.get(&key) {
        Some(uri) => match uri_to_path(&uri) {
            Some(path) => paths.push(path),
            None => log::warn!("Ignoring mount {}: {:?} is not a file: URI", key, uri),
        },
        None => log::warn!("Ignoring mount {}: no uri", key),
    };

    if manifest.get(ROOT_MOUNT_KEY).is_some() {
        add(ROOT_MOUNT_KEY.to_string());
    }
    for name in names {
        add(format!("{}.{}.uri", OTHER_MOUNTS_PREFIX, name));
    }
    Ok(paths)
}

fn net_rules(manifest: &dyn ManifestSource) -> Result<Vec<NetRule>> {
    let names = manifest.children(NET_RULES_PREFIX);
    let mut rules = staging(names.len(), "network rules")?;
    for name in names {
        let key = format!("{}.{}", NET_RULES_PREFIX, name);
        let Some(text) = manifest.get(&key) else {
            log::warn!("Ignoring {}: not a rule string", key);
            continue;
        };
        match NetRule::parse(&text) {
            Ok(rule) => rules.push(rule),
            Err(e) => log::warn!("Ignoring {}: {}", key, e),
        }
    }
    Ok(rules)
}

/// Build the policy set for `manifest` on top of `defaults`
pub fn compile(manifest: &dyn ManifestSource, defaults: &[PolicyRule]) -> Result<PolicySet> {
    for rule in defaults {
        rule.validate()?;
    }

    let preload = preload_paths(manifest)?;
    let mounts = mount_paths(manifest)?;
    let network = net_rules(manifest)?;

    let sources = PolicySources {
        defaults: defaults.len(),
        preload: preload.len(),
        mounts: mounts.len(),
        network: network.len(),
    };
    let mut rules = staging(sources.total(), "policy entries")?;
    rules.extend(defaults.iter().cloned());
    rules.extend(
        preload
            .into_iter()
            .map(|path| PolicyRule::path_exact(path, Permissions::READ)),
    );
    rules.extend(
        mounts
            .into_iter()
            .map(|path| PolicyRule::path_recursive(path, Permissions::READ | Permissions::WRITE)),
    );
    rules.extend(network.into_iter().map(PolicyRule::net));

    log::debug!(
        "Compiled policy: {} defaults, {} preload, {} mounts, {} network",
        sources.defaults,
        sources.preload,
        sources.mounts,
        sources.network
    );
    Ok(PolicySet::new(rules, sources))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::manifest::Manifest;
    use crate::policy::rules::RuleKind;

    #[test]
    fn test_empty_manifest_yields_defaults_only() {
        let defaults = vec![PolicyRule::path_exact("/etc/hosts", Permissions::READ)];
        let set = compile(&Manifest::new(), &defaults).unwrap();
        assert_eq!(set.rules(), defaults.as_slice());
        assert_eq!(set.sources().total(), 1);
    }

    #[test]
    fn test_preload_keeps_file_uris_only() {
        let manifest = Manifest::from_pairs([(
            PRELOAD_KEY,
            "file:/lib/liba.so, http://x/libb.so,,file:/lib/libc.so,file:",
        )]);
        let paths = preload_paths(&manifest).unwrap();
        assert_eq!(
            paths,
            vec![PathBuf::from("/lib/liba.so"), PathBuf::from("/lib/libc.so")]
        );
    }

    #[test]
    fn test_preload_list_is_capped() {
        let list = (0..20)
            .map(|i| format!("file:/lib/lib{}.so", i))
            .collect::<Vec<_>>()
            .join(",");
        let manifest = Manifest::from_pairs([(PRELOAD_KEY, list)]);
        let paths = preload_paths(&manifest).unwrap();
        assert_eq!(paths.len(), MAX_PRELOAD_LIBRARIES);
        assert_eq!(paths[15], PathBuf::from("/lib/lib15.so"));
    }

    #[test]
    fn test_mounts_are_recursive_read_write() {
        let manifest = Manifest::from_pairs([
            (ROOT_MOUNT_KEY, "file:/srv/root"),
            ("fs.mount.other.tmp.uri", "file:/tmp"),
            ("fs.mount.other.bad.uri", "dev:/dev/null"),
        ]);
        let set = compile(&manifest, &[]).unwrap();
        assert_eq!(set.len(), 2);
        for rule in set.rules() {
            assert_eq!(rule.kind, RuleKind::PathRecursive);
            assert_eq!(rule.perms, Permissions::READ | Permissions::WRITE);
        }
        assert_eq!(set.rules()[0].path(), Some(std::path::Path::new("/srv/root")));
    }

    #[test]
    fn test_invalid_default_rule_is_rejected() {
        let mut bad = PolicyRule::path_exact("/x", Permissions::READ);
        bad.kind = RuleKind::NetRange;
        assert!(compile(&Manifest::new(), &[bad]).unwrap_err().is_invalid_argument());
    }
}
