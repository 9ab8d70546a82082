//! Robot metadata and the layered override model that produces it
//!
//! A snapshot is never edited in place. Every change recomputes it from fresh
//! defaults plus an ordered list of override sources; see [`merge::compute_metadata`].

pub mod cache;
pub mod fields;
pub mod merge;
pub mod settings;
pub mod sources;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use cache::MetadataCache;
pub use fields::{FieldError, MetadataField};
pub use merge::{compute_metadata, OverrideSource};

use crate::ipc::ASTORIA_VERSION;

const OS_RELEASE_PATH: &str = "/etc/os-release";
const KERNEL_RELEASE_PATH: &str = "/proc/sys/kernel/osrelease";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RobotMode {
    #[serde(rename = "COMP")]
    Competition,
    #[serde(rename = "DEV")]
    Development,
}

impl RobotMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RobotMode::Competition => "COMP",
            RobotMode::Development => "DEV",
        }
    }
}

impl fmt::Display for RobotMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RobotMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "COMP" => Ok(RobotMode::Competition),
            "DEV" => Ok(RobotMode::Development),
            _ => Err(format!("{} is not a robot mode (COMP or DEV)", s)),
        }
    }
}

/// Facts about the running system, read once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemInfo {
    pub kernel_version: String,
    pub arch: String,
    pub os_name: Option<String>,
    pub os_pretty_name: Option<String>,
    pub os_version: Option<String>,
}

impl SystemInfo {
    pub fn detect() -> Self {
        let kernel_version = std::fs::read_to_string(KERNEL_RELEASE_PATH)
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        let os_release = std::fs::read_to_string(OS_RELEASE_PATH)
            .map(|content| parse_os_release(&content))
            .unwrap_or_default();

        Self {
            kernel_version,
            arch: std::env::consts::ARCH.to_string(),
            os_name: os_release.get("NAME").cloned(),
            os_pretty_name: os_release.get("PRETTY_NAME").cloned(),
            os_version: os_release.get("VERSION").cloned(),
        }
    }
}

/// Parse `KEY=value` lines of an os-release file, stripping quotes.
pub fn parse_os_release(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| {
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                .unwrap_or(value);
            (key.trim().to_string(), value.to_string())
        })
        .collect()
}

/// Snapshot of robot metadata published by `astmetad`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Metadata {
    // System facts
    pub astoria_version: String,
    pub kernel_version: String,
    pub arch: String,
    pub os_name: Option<String>,
    pub os_pretty_name: Option<String>,
    pub os_version: Option<String>,

    // Match
    pub arena: String,
    pub zone: u32,
    pub mode: RobotMode,
    pub marker_offset: u32,
    pub game_timeout: Option<u32>,

    // WiFi
    pub wifi_enabled: bool,
    pub wifi_ssid: Option<String>,
    pub wifi_psk: Option<String>,
    pub wifi_region: Option<String>,

    pub usercode_entrypoint: String,
}

impl Metadata {
    /// Defaults for every mutable field.
    pub fn new(system: &SystemInfo, default_entrypoint: &str) -> Self {
        Self {
            astoria_version: ASTORIA_VERSION.to_string(),
            kernel_version: system.kernel_version.clone(),
            arch: system.arch.clone(),
            os_name: system.os_name.clone(),
            os_pretty_name: system.os_pretty_name.clone(),
            os_version: system.os_version.clone(),
            arena: "A".to_string(),
            zone: 0,
            mode: RobotMode::Development,
            marker_offset: 0,
            game_timeout: None,
            wifi_enabled: true,
            wifi_ssid: None,
            wifi_psk: None,
            wifi_region: None,
            usercode_entrypoint: default_entrypoint.to_string(),
        }
    }

    pub fn is_wifi_valid(&self) -> bool {
        self.wifi_ssid.is_some() && self.wifi_psk.is_some() && self.wifi_region.is_some()
    }
}

#[cfg(test)]
pub(crate) fn test_system() -> SystemInfo {
    SystemInfo {
        kernel_version: "6.1.0".to_string(),
        arch: "aarch64".to_string(),
        os_name: Some("Astoria OS".to_string()),
        os_pretty_name: None,
        os_version: None,
    }
}
