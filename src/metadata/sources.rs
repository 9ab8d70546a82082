use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use super::fields::{MetadataField, METADATA_DISK, USERCODE_DISK};
use super::settings::{RobotSettings, SettingsError, SETTINGS_FILENAME};
use crate::disks::classifier::{METADATA_FILE, USERCODE_BUNDLE};
use crate::disks::{DiskInfo, DiskType};

pub const BUNDLE_MANIFEST: &str = "bundle.toml";

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("{0} does not exist")]
    Missing(PathBuf),

    #[error("unable to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("{0} is not a JSON object")]
    NotAnObject(PathBuf),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error("invalid code bundle: {0}")]
    Bundle(String),
}

/// Reads metadata overrides from one kind of disk.
pub trait DiskMetadataSource: Send + Sync {
    fn name(&self) -> &'static str;

    fn permitted(&self) -> &'static [MetadataField];

    fn extract_diff(&self, mount_path: &Path) -> Result<BTreeMap<String, String>, SourceError>;
}

/// `astoria.json` on a metadata disk.
pub struct JsonDiskSource;

impl DiskMetadataSource for JsonDiskSource {
    fn name(&self) -> &'static str {
        "metadata disk"
    }

    fn permitted(&self) -> &'static [MetadataField] {
        METADATA_DISK
    }

    fn extract_diff(&self, mount_path: &Path) -> Result<BTreeMap<String, String>, SourceError> {
        let path = mount_path.join(METADATA_FILE);
        let content = std::fs::read_to_string(&path).map_err(|source| io_error(&path, source))?;

        let value: serde_json::Value = serde_json::from_str(&content)?;
        let object = value
            .as_object()
            .ok_or_else(|| SourceError::NotAnObject(path.clone()))?;

        let mut diff = BTreeMap::new();
        for (key, value) in object {
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                other => {
                    warn!("Ignoring {} in {}: unsupported value {}", key, path.display(), other);
                    continue;
                }
            };
            diff.insert(key.clone(), value);
        }
        Ok(diff)
    }
}

/// `robot-settings.toml` on a usercode disk.
pub struct RobotSettingsSource;

impl DiskMetadataSource for RobotSettingsSource {
    fn name(&self) -> &'static str {
        "robot settings"
    }

    fn permitted(&self) -> &'static [MetadataField] {
        USERCODE_DISK
    }

    fn extract_diff(&self, mount_path: &Path) -> Result<BTreeMap<String, String>, SourceError> {
        let settings = RobotSettings::load(&mount_path.join(SETTINGS_FILENAME))?;
        Ok(settings.to_diff())
    }
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct CodeBundle {
    bundle: BundleInfo,
    wifi: BundleWifi,
}

#[derive(Deserialize, Debug)]
struct BundleInfo {
    version: String,
}

#[derive(Deserialize, Debug)]
struct BundleWifi {
    ssid: String,
    psk: String,
    enabled: bool,
    region: String,
}

/// `bundle.toml` inside the `robot.zip` on a usercode disk.
pub struct CodeBundleSource;

impl DiskMetadataSource for CodeBundleSource {
    fn name(&self) -> &'static str {
        "code bundle"
    }

    fn permitted(&self) -> &'static [MetadataField] {
        USERCODE_DISK
    }

    fn extract_diff(&self, mount_path: &Path) -> Result<BTreeMap<String, String>, SourceError> {
        let path = mount_path.join(USERCODE_BUNDLE);
        let file = File::open(&path).map_err(|source| io_error(&path, source))?;
        let mut archive =
            zip::ZipArchive::new(file).map_err(|e| SourceError::Bundle(e.to_string()))?;

        let mut content = String::new();
        archive
            .by_name(BUNDLE_MANIFEST)
            .map_err(|e| SourceError::Bundle(format!("{}: {}", BUNDLE_MANIFEST, e)))?
            .read_to_string(&mut content)
            .map_err(|source| io_error(&path, source))?;

        let bundle: CodeBundle =
            toml::from_str(&content).map_err(|e| SourceError::Bundle(e.to_string()))?;
        info!("Found code bundle version {}", bundle.bundle.version);

        Ok([
            (MetadataField::WifiSsid, bundle.wifi.ssid),
            (MetadataField::WifiPsk, bundle.wifi.psk),
            (MetadataField::WifiRegion, bundle.wifi.region),
            (MetadataField::WifiEnabled, bundle.wifi.enabled.to_string()),
        ]
        .into_iter()
        .map(|(field, value)| (field.as_str().to_string(), value))
        .collect())
    }
}

fn io_error(path: &Path, source: std::io::Error) -> SourceError {
    if source.kind() == std::io::ErrorKind::NotFound {
        SourceError::Missing(path.to_path_buf())
    } else {
        SourceError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Pick the metadata source for a disk, if its role contributes metadata.
pub fn source_for(disk: &DiskInfo) -> Option<Box<dyn DiskMetadataSource>> {
    match disk.disk_type {
        DiskType::Metadata => Some(Box::new(JsonDiskSource)),
        DiskType::Usercode if disk.mount_path.join(SETTINGS_FILENAME).exists() => {
            Some(Box::new(RobotSettingsSource))
        }
        DiskType::Usercode => Some(Box::new(CodeBundleSource)),
        DiskType::Update | DiskType::NoAction => None,
    }
}

/// Overrides contributed by one inserted disk, read once at insertion.
#[derive(Debug, Clone)]
pub struct DiskOverrides {
    pub disk: DiskInfo,
    pub source_name: &'static str,
    pub permitted: &'static [MetadataField],
    pub diff: BTreeMap<String, String>,
}

impl DiskOverrides {
    /// Unreadable or invalid files degrade to an empty diff.
    pub fn load(disk: DiskInfo) -> Option<Self> {
        let source = source_for(&disk)?;
        let diff = match source.extract_diff(&disk.mount_path) {
            Ok(diff) => diff,
            Err(e) => {
                warn!(
                    "Unable to read {} on disk {}: {}",
                    source.name(),
                    disk.uuid,
                    e
                );
                BTreeMap::new()
            }
        };

        Some(Self {
            source_name: source.name(),
            permitted: source.permitted(),
            disk,
            diff,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disks::DiskUuid;
    use std::io::Write;

    fn disk(dir: &Path, disk_type: DiskType) -> DiskInfo {
        DiskInfo {
            uuid: DiskUuid::new("test-disk"),
            mount_path: dir.to_path_buf(),
            disk_type,
        }
    }

    #[test]
    fn test_json_source_stringifies_scalars() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(METADATA_FILE),
            r#"{"arena": "B", "zone": 2, "wifi_enabled": false, "nested": {"a": 1}}"#,
        )
        .unwrap();

        let diff = JsonDiskSource.extract_diff(dir.path()).unwrap();
        assert_eq!(diff["arena"], "B");
        assert_eq!(diff["zone"], "2");
        assert_eq!(diff["wifi_enabled"], "false");
        assert!(!diff.contains_key("nested"));
    }

    #[test]
    fn test_invalid_file_degrades_to_empty_diff() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(METADATA_FILE), "{broken").unwrap();

        let overrides = DiskOverrides::load(disk(dir.path(), DiskType::Metadata)).unwrap();
        assert!(overrides.diff.is_empty());
        assert_eq!(overrides.permitted, METADATA_DISK);
    }

    #[test]
    fn test_settings_preferred_over_bundle() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(SETTINGS_FILENAME),
            "team_tla = \"BEE\"\nusercode_entrypoint = \"main.py\"\nwifi_psk = \"password\"\n",
        )
        .unwrap();

        let overrides = DiskOverrides::load(disk(dir.path(), DiskType::Usercode)).unwrap();
        assert_eq!(overrides.source_name, "robot settings");
        assert_eq!(overrides.diff["wifi_ssid"], "robot-BEE");
    }

    #[test]
    fn test_bundle_source() {
        let dir = tempfile::tempdir().unwrap();
        let file = File::create(dir.path().join(USERCODE_BUNDLE)).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        zip.start_file(BUNDLE_MANIFEST, zip::write::FileOptions::default())
            .unwrap();
        zip.write_all(
            b"[bundle]\nversion = \"1\"\n\n[wifi]\nssid = \"robot-XYZ\"\npsk = \"pw\"\nenabled = false\nregion = \"US\"\n",
        )
        .unwrap();
        zip.finish().unwrap();

        let overrides = DiskOverrides::load(disk(dir.path(), DiskType::Usercode)).unwrap();
        assert_eq!(overrides.source_name, "code bundle");
        assert_eq!(overrides.diff["wifi_ssid"], "robot-XYZ");
        assert_eq!(overrides.diff["wifi_enabled"], "false");
        assert!(!overrides.diff.contains_key("usercode_entrypoint"));
    }

    #[test]
    fn test_no_source_for_other_roles() {
        let dir = tempfile::tempdir().unwrap();
        assert!(DiskOverrides::load(disk(dir.path(), DiskType::Update)).is_none());
        assert!(DiskOverrides::load(disk(dir.path(), DiskType::NoAction)).is_none());
    }
}
