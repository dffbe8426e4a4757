/// Policy rule types
use super::netrule::NetRule;
use crate::config::types::{PalError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::BitOr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    PathExact,
    PathRecursive,
    NetRange,
}

impl RuleKind {
    pub fn wire(self) -> u32 {
        match self {
            RuleKind::PathExact => 1,
            RuleKind::PathRecursive => 2,
            RuleKind::NetRange => 3,
        }
    }

    pub fn from_wire(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(RuleKind::PathExact),
            2 => Some(RuleKind::PathRecursive),
            3 => Some(RuleKind::NetRange),
            _ => None,
        }
    }
}

/// Access bits granted by a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Permissions(u32);

impl Permissions {
    pub const NONE: Permissions = Permissions(0);
    pub const READ: Permissions = Permissions(1 << 0);
    pub const WRITE: Permissions = Permissions(1 << 1);
    pub const BIND: Permissions = Permissions(1 << 2);
    pub const CONNECT: Permissions = Permissions(1 << 3);

    const NAMES: [(&'static str, Permissions); 4] = [
        ("read", Permissions::READ),
        ("write", Permissions::WRITE),
        ("bind", Permissions::BIND),
        ("connect", Permissions::CONNECT),
    ];

    pub fn from_bits(bits: u32) -> Option<Self> {
        if bits & !0b1111 == 0 {
            Some(Permissions(bits))
        } else {
            None
        }
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: Permissions) -> bool {
        (self.0 & other.0) == other.0
    }

    fn names(&self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(_, p)| self.contains(*p))
            .map(|(n, _)| *n)
            .collect()
    }
}

impl BitOr for Permissions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Permissions(self.0 | rhs.0)
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.names().join("|"))
    }
}

impl Serialize for Permissions {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.names().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Permissions {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let names = Vec::<String>::deserialize(deserializer)?;
        let mut perms = Permissions::NONE;
        for name in names {
            let (_, bit) = Self::NAMES
                .iter()
                .find(|(n, _)| *n == name)
                .ok_or_else(|| serde::de::Error::custom(format!("unknown permission {}", name)))?;
            perms = perms | *bit;
        }
        Ok(perms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleValue {
    Path(PathBuf),
    Net(NetRule),
}

/// One entry of the policy array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub kind: RuleKind,
    pub perms: Permissions,
    pub value: RuleValue,
}

impl PolicyRule {
    pub fn path_exact<P: Into<PathBuf>>(path: P, perms: Permissions) -> Self {
        Self {
            kind: RuleKind::PathExact,
            perms,
            value: RuleValue::Path(path.into()),
        }
    }

    pub fn path_recursive<P: Into<PathBuf>>(path: P, perms: Permissions) -> Self {
        Self {
            kind: RuleKind::PathRecursive,
            perms,
            value: RuleValue::Path(path.into()),
        }
    }

    pub fn net(rule: NetRule) -> Self {
        Self {
            kind: RuleKind::NetRange,
            perms: Permissions::BIND | Permissions::CONNECT,
            value: RuleValue::Net(rule),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.value {
            RuleValue::Path(path) => Some(path),
            RuleValue::Net(_) => None,
        }
    }

    pub fn net_rule(&self) -> Option<&NetRule> {
        match &self.value {
            RuleValue::Net(rule) => Some(rule),
            RuleValue::Path(_) => None,
        }
    }

    /// Reject rules whose kind and value disagree
    pub fn validate(&self) -> Result<()> {
        match (self.kind, &self.value) {
            (RuleKind::PathExact | RuleKind::PathRecursive, RuleValue::Path(path)) => {
                if path.as_os_str().is_empty() {
                    return Err(PalError::InvalidArgument("empty path rule".to_string()));
                }
                Ok(())
            }
            (RuleKind::NetRange, RuleValue::Net(_)) => Ok(()),
            (kind, _) => Err(PalError::InvalidArgument(format!(
                "{:?} rule with mismatched value",
                kind
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permissions_serialize_as_names() {
        let perms = Permissions::READ | Permissions::WRITE;
        let json = serde_json::to_string(&perms).unwrap();
        assert_eq!(json, r#"["read","write"]"#);
        let back: Permissions = serde_json::from_str(&json).unwrap();
        assert_eq!(back, perms);
        assert!(serde_json::from_str::<Permissions>(r#"["execute"]"#).is_err());
    }

    #[test]
    fn test_validate_rejects_kind_mismatch() {
        let mut rule = PolicyRule::path_exact("/lib/libc.so.6", Permissions::READ);
        assert!(rule.validate().is_ok());
        rule.kind = RuleKind::NetRange;
        assert!(rule.validate().unwrap_err().is_invalid_argument());
        assert!(PolicyRule::path_recursive("", Permissions::READ)
            .validate()
            .is_err());
    }

    #[test]
    fn test_wire_kinds() {
        for kind in [RuleKind::PathExact, RuleKind::PathRecursive, RuleKind::NetRange] {
            assert_eq!(RuleKind::from_wire(kind.wire()), Some(kind));
        }
        assert_eq!(RuleKind::from_wire(0), None);
    }
}
