//! Sandbox image selection.
//!
//! Maps an asset's OS family and version onto a container image key. A
//! fallback table maps unknown versions to the nearest known release;
//! when the family itself cannot be determined the default is Ubuntu
//! 22.04.

use patchforge_core::OsFamily;
use tracing::debug;

/// The image used when no better match exists.
pub const DEFAULT_IMAGE: &str = "ubuntu:22.04";

/// Resolve the container image for an asset platform.
pub fn image_for(os_family: OsFamily, os_version: &str) -> String {
    let version = os_version.trim();

    let image = match os_family {
        OsFamily::Ubuntu => match version {
            "24.04" => "ubuntu:24.04".to_string(),
            "22.04" => "ubuntu:22.04".to_string(),
            "20.04" => "ubuntu:20.04".to_string(),
            v if v.starts_with("24") => "ubuntu:24.04".to_string(),
            v if v.starts_with("20") => "ubuntu:20.04".to_string(),
            _ => "ubuntu:22.04".to_string(),
        },
        OsFamily::Debian => match version {
            "12" => "debian:12".to_string(),
            "11" => "debian:11".to_string(),
            v if v.starts_with("11") => "debian:11".to_string(),
            _ => "debian:12".to_string(),
        },
        OsFamily::Rhel | OsFamily::Rocky => {
            if version.starts_with('8') {
                "rockylinux:8".to_string()
            } else {
                "rockylinux:9".to_string()
            }
        }
        OsFamily::Amazon => "amazonlinux:2".to_string(),
        OsFamily::Alpine => {
            if version.starts_with("3.") {
                format!("alpine:{version}")
            } else {
                "alpine:3.19".to_string()
            }
        }
        OsFamily::Other => {
            debug!("unknown os family, defaulting to {}", DEFAULT_IMAGE);
            DEFAULT_IMAGE.to_string()
        }
    };

    image
}
