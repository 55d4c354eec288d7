//! Target asset descriptors.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Operating-system family of a target asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsFamily {
    Ubuntu,
    Debian,
    Rhel,
    Rocky,
    Amazon,
    Alpine,
    Other,
}

impl OsFamily {
    /// Parse a free-form OS string from scanner asset metadata.
    pub fn parse(raw: &str) -> Self {
        let lower = raw.to_lowercase();
        if lower.contains("ubuntu") {
            OsFamily::Ubuntu
        } else if lower.contains("debian") {
            OsFamily::Debian
        } else if lower.contains("rocky") {
            OsFamily::Rocky
        } else if lower.contains("rhel") || lower.contains("red hat") {
            OsFamily::Rhel
        } else if lower.contains("amazon") {
            OsFamily::Amazon
        } else if lower.contains("alpine") {
            OsFamily::Alpine
        } else {
            OsFamily::Other
        }
    }

    /// The package manager conventionally used by this family.
    pub fn default_package_manager(&self) -> PackageManager {
        match self {
            OsFamily::Ubuntu | OsFamily::Debian => PackageManager::Apt,
            OsFamily::Rhel | OsFamily::Rocky => PackageManager::Dnf,
            OsFamily::Amazon => PackageManager::Yum,
            OsFamily::Alpine => PackageManager::Apk,
            OsFamily::Other => PackageManager::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OsFamily::Ubuntu => "ubuntu",
            OsFamily::Debian => "debian",
            OsFamily::Rhel => "rhel",
            OsFamily::Rocky => "rocky",
            OsFamily::Amazon => "amazon",
            OsFamily::Alpine => "alpine",
            OsFamily::Other => "other",
        }
    }
}

impl std::fmt::Display for OsFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Package manager on a target asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageManager {
    Apt,
    Dnf,
    Yum,
    Zypper,
    Apk,
    Unknown,
}

impl PackageManager {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageManager::Apt => "apt",
            PackageManager::Dnf => "dnf",
            PackageManager::Yum => "yum",
            PackageManager::Zypper => "zypper",
            PackageManager::Apk => "apk",
            PackageManager::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for PackageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Functional role of an asset; selects the sandbox health-check suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AssetRole {
    #[default]
    Generic,
    WebServer,
    Database,
}

/// Descriptor of a production asset a finding or sandbox test refers to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetDescriptor {
    pub asset_id: String,
    pub hostname: String,
    pub os_family: OsFamily,
    pub os_version: String,
    pub role: AssetRole,
    pub tags: BTreeMap<String, String>,
}

impl AssetDescriptor {
    pub fn new(asset_id: &str, os_family: OsFamily, os_version: &str) -> Self {
        Self {
            asset_id: asset_id.to_string(),
            hostname: asset_id.to_string(),
            os_family,
            os_version: os_version.to_string(),
            role: AssetRole::Generic,
            tags: BTreeMap::new(),
        }
    }

    pub fn with_role(mut self, role: AssetRole) -> Self {
        self.role = role;
        self
    }

    /// Build a descriptor from the opaque metadata a scanner returns for
    /// an asset. Unknown or missing fields degrade to defaults rather
    /// than failing; the descriptor only needs to be good enough to
    /// pick a sandbox image and health-check suite.
    pub fn from_scanner_metadata(asset_id: &str, metadata: &serde_json::Value) -> Self {
        let os_raw = metadata
            .get("os")
            .or_else(|| metadata.get("os_name"))
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        let os_version = metadata
            .get("os_version")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .or_else(|| {
                // Trailing token of strings like "Ubuntu 22.04".
                os_raw
                    .rsplit(' ')
                    .next()
                    .filter(|tok| tok.chars().next().is_some_and(|c| c.is_ascii_digit()))
                    .map(|tok| tok.to_string())
            })
            .unwrap_or_default();

        let hostname = metadata
            .get("name")
            .or_else(|| metadata.get("hostname"))
            .and_then(|v| v.as_str())
            .unwrap_or(asset_id)
            .to_string();

        let role = match metadata.get("role").and_then(|v| v.as_str()) {
            Some("web_server") | Some("web") => AssetRole::WebServer,
            Some("database") | Some("db") => AssetRole::Database,
            _ => AssetRole::Generic,
        };

        let mut tags = BTreeMap::new();
        if let Some(map) = metadata.get("tags").and_then(|v| v.as_object()) {
            for (key, value) in map {
                if let Some(value) = value.as_str() {
                    tags.insert(key.clone(), value.to_string());
                }
            }
        }

        Self {
            asset_id: asset_id.to_string(),
            hostname,
            os_family: OsFamily::parse(os_raw),
            os_version,
            role,
            tags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_family_parse() {
        assert_eq!(OsFamily::parse("Ubuntu 22.04.3 LTS"), OsFamily::Ubuntu);
        assert_eq!(OsFamily::parse("Red Hat Enterprise Linux"), OsFamily::Rhel);
        assert_eq!(OsFamily::parse("Rocky Linux 9"), OsFamily::Rocky);
        assert_eq!(OsFamily::parse("Amazon Linux 2"), OsFamily::Amazon);
        assert_eq!(OsFamily::parse("FreeBSD"), OsFamily::Other);
    }

    #[test]
    fn test_default_package_manager() {
        assert_eq!(OsFamily::Ubuntu.default_package_manager(), PackageManager::Apt);
        assert_eq!(OsFamily::Rocky.default_package_manager(), PackageManager::Dnf);
        assert_eq!(OsFamily::Amazon.default_package_manager(), PackageManager::Yum);
        assert_eq!(OsFamily::Alpine.default_package_manager(), PackageManager::Apk);
    }

    #[test]
    fn test_asset_builder() {
        let asset = AssetDescriptor::new("web-01", OsFamily::Ubuntu, "22.04")
            .with_role(AssetRole::WebServer);
        assert_eq!(asset.role, AssetRole::WebServer);
        assert_eq!(asset.hostname, "web-01");
    }

    #[test]
    fn test_from_scanner_metadata_full() {
        let metadata = serde_json::json!({
            "name": "db-primary",
            "os": "Rocky Linux",
            "os_version": "9.3",
            "role": "database",
            "tags": {"env": "prod", "team": "data"}
        });
        let asset = AssetDescriptor::from_scanner_metadata("agent-42", &metadata);

        assert_eq!(asset.asset_id, "agent-42");
        assert_eq!(asset.hostname, "db-primary");
        assert_eq!(asset.os_family, OsFamily::Rocky);
        assert_eq!(asset.os_version, "9.3");
        assert_eq!(asset.role, AssetRole::Database);
        assert_eq!(asset.tags.get("env").map(|s| s.as_str()), Some("prod"));
    }

    #[test]
    fn test_from_scanner_metadata_version_embedded_in_os_string() {
        let metadata = serde_json::json!({"os": "Ubuntu 22.04"});
        let asset = AssetDescriptor::from_scanner_metadata("a-1", &metadata);
        assert_eq!(asset.os_family, OsFamily::Ubuntu);
        assert_eq!(asset.os_version, "22.04");
    }

    #[test]
    fn test_from_scanner_metadata_sparse_defaults() {
        let asset =
            AssetDescriptor::from_scanner_metadata("a-2", &serde_json::json!({}));
        assert_eq!(asset.hostname, "a-2");
        assert_eq!(asset.os_family, OsFamily::Other);
        assert_eq!(asset.role, AssetRole::Generic);
        assert!(asset.os_version.is_empty());
    }
}
