use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::fields::MetadataField;

pub const SETTINGS_FILENAME: &str = "robot-settings.toml";
pub const SSID_PREFIX: &str = "robot-";
/// SSIDs are at most 32 octets.
pub const MAX_SSID_LENGTH: usize = 32;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("{0} does not exist")]
    Missing(PathBuf),

    #[error("unable to read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid TOML: {0}")]
    InvalidToml(#[from] toml::de::Error),

    #[error("settings did not match schema: {0}")]
    Invalid(String),
}

fn default_region() -> String {
    "GB".to_string()
}

fn default_true() -> bool {
    true
}

/// Contents of `robot-settings.toml` on a usercode disk.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RobotSettings {
    pub team_tla: String,
    pub usercode_entrypoint: String,
    pub wifi_psk: String,
    #[serde(default = "default_region")]
    pub wifi_region: String,
    #[serde(default = "default_true")]
    pub wifi_enabled: bool,
}

impl RobotSettings {
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                SettingsError::Missing(path.to_path_buf())
            } else {
                SettingsError::Unreadable {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, SettingsError> {
        let mut settings: Self = toml::from_str(content)?;
        settings.team_tla = validate_tla(&settings.team_tla)?;
        Ok(settings)
    }

    pub fn ssid(&self) -> String {
        format!("{}{}", SSID_PREFIX, self.team_tla)
    }

    pub fn to_diff(&self) -> BTreeMap<String, String> {
        [
            (MetadataField::UsercodeEntrypoint, self.usercode_entrypoint.clone()),
            (MetadataField::WifiSsid, self.ssid()),
            (MetadataField::WifiPsk, self.wifi_psk.clone()),
            (MetadataField::WifiRegion, self.wifi_region.clone()),
            (MetadataField::WifiEnabled, self.wifi_enabled.to_string()),
        ]
        .into_iter()
        .map(|(field, value)| (field.as_str().to_string(), value))
        .collect()
    }
}

/// Three letters then optional digits, upper-cased, short enough for the SSID.
fn validate_tla(tla: &str) -> Result<String, SettingsError> {
    let letters = tla.chars().take_while(|c| c.is_ascii_alphabetic()).count();
    let digits_ok = tla.chars().skip(letters).all(|c| c.is_ascii_digit());
    if letters != 3 || !digits_ok {
        return Err(SettingsError::Invalid(format!(
            "team name {:?} did not match format",
            tla
        )));
    }

    if tla.len() > MAX_SSID_LENGTH - SSID_PREFIX.len() {
        return Err(SettingsError::Invalid(format!(
            "SSID {}{} is longer than maximum length: {} octets",
            SSID_PREFIX, tla, MAX_SSID_LENGTH
        )));
    }

    Ok(tla.to_ascii_uppercase())
}
