//! Manifest key/value access.
//!
//! The configuration store is an external collaborator; the policy compiler
//! and bootstrap only see it through [`ManifestSource`]. [`Manifest`] is the
//! in-tree implementation backed by a JSON document.

use crate::config::types::{PalError, Result};
use std::collections::BTreeMap;
use std::path::Path;

/// Read-only view of the manifest.
pub trait ManifestSource {
    /// Value stored under a fully qualified key
    fn get(&self, key: &str) -> Option<String>;

    /// Names of the immediate children of `prefix`, in key order.
    ///
    /// For keys `net.rules.web` and `net.rules.dns`, `children("net.rules")`
    /// yields `["dns", "web"]`.
    fn children(&self, prefix: &str) -> Vec<String>;
}

/// Flat, ordered manifest built from JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: BTreeMap<String, String>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Parse a JSON document. Nested objects are flattened with `.`;
    /// scalars are stored as strings, arrays are joined with `,`.
    pub fn from_json_str(content: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(content)
            .map_err(|e| PalError::InvalidArgument(format!("Failed to parse manifest: {}", e)))?;
        let mut manifest = Manifest::new();
        match value {
            serde_json::Value::Object(map) => {
                for (key, value) in map {
                    manifest.flatten_into(key, value);
                }
            }
            _ => {
                return Err(PalError::InvalidArgument(
                    "Manifest root must be a JSON object".to_string(),
                ))
            }
        }
        Ok(manifest)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let manifest = Self::from_json_str(&content)?;
        log::debug!(
            "Loaded manifest {} ({} keys)",
            path.as_ref().display(),
            manifest.len()
        );
        Ok(manifest)
    }

    fn flatten_into(&mut self, key: String, value: serde_json::Value) {
        use serde_json::Value;
        match value {
            Value::Object(map) => {
                for (child, value) in map {
                    self.flatten_into(format!("{}.{}", key, child), value);
                }
            }
            Value::Array(items) => {
                let joined = items
                    .iter()
                    .map(scalar_to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                self.entries.insert(key, joined);
            }
            Value::Null => {}
            other => {
                self.entries.insert(key, scalar_to_string(&other));
            }
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn scalar_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl ManifestSource for Manifest {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    fn children(&self, prefix: &str) -> Vec<String> {
        let scope = format!("{}.", prefix);
        let mut names: Vec<String> = Vec::new();
        for key in self.entries.range(scope.clone()..) {
            let Some(rest) = key.0.strip_prefix(&scope) else {
                break;
            };
            let name = rest.split('.').next().unwrap_or(rest);
            if !name.is_empty() && names.last().map(String::as_str) != Some(name) {
                names.push(name.to_string());
            }
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flattens_nested_json() {
        let manifest = Manifest::from_json_str(
            r#"{
                "loader": {"preload": "file:/lib/a.so,file:/lib/b.so"},
                "fs": {"mount": {"root": {"uri": "file:/"},
                                 "other": {"tmp": {"uri": "file:/tmp"}}}},
                "net": {"rules": {"web": "10.0.0.1:80-81:10.0.0.2:443"}}
            }"#,
        )
        .unwrap();

        assert_eq!(
            manifest.get("loader.preload").as_deref(),
            Some("file:/lib/a.so,file:/lib/b.so")
        );
        assert_eq!(manifest.get("fs.mount.root.uri").as_deref(), Some("file:/"));
        assert_eq!(manifest.get("fs.mount.other.tmp.uri").as_deref(), Some("file:/tmp"));
    }

    #[test]
    fn test_children_enumerates_unique_names() {
        let manifest = Manifest::from_pairs([
            ("fs.mount.other.data.uri", "file:/data"),
            ("fs.mount.other.data.type", "chroot"),
            ("fs.mount.other.home.uri", "file:/home"),
            ("fs.mount.otherwise", "x"),
            ("fs.mount.root.uri", "file:/"),
        ]);
        assert_eq!(manifest.children("fs.mount.other"), vec!["data", "home"]);
        assert!(manifest.children("net.rules").is_empty());
    }

    #[test]
    fn test_array_values_are_joined() {
        let manifest =
            Manifest::from_json_str(r#"{"loader.preload": ["file:/a.so", "file:/b.so"]}"#).unwrap();
        assert_eq!(
            manifest.get("loader.preload").as_deref(),
            Some("file:/a.so,file:/b.so")
        );
    }

    #[test]
    fn test_rejects_non_object_root() {
        assert!(Manifest::from_json_str("[1, 2]").is_err());
    }
}
