use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use super::{Metadata, RobotMode};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FieldError {
    #[error("{0} is not a metadata attribute")]
    Unknown(String),

    #[error("invalid value {value:?} for {field}: {reason}")]
    InvalidValue {
        field: MetadataField,
        value: String,
        reason: String,
    },
}

/// Every metadata attribute an override source may set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetadataField {
    Arena,
    Zone,
    Mode,
    MarkerOffset,
    GameTimeout,
    WifiEnabled,
    WifiSsid,
    WifiPsk,
    WifiRegion,
    UsercodeEntrypoint,
}

/// Settable by the `mutate` request.
pub const REQUEST_MUTABLE: &[MetadataField] =
    &[MetadataField::Arena, MetadataField::Zone, MetadataField::Mode];

/// Remembered across restarts in the metadata cache.
pub const CACHED: &[MetadataField] = &[
    MetadataField::WifiSsid,
    MetadataField::WifiPsk,
    MetadataField::WifiRegion,
];

/// Settable by a usercode disk.
pub const USERCODE_DISK: &[MetadataField] = &[
    MetadataField::UsercodeEntrypoint,
    MetadataField::WifiSsid,
    MetadataField::WifiPsk,
    MetadataField::WifiRegion,
    MetadataField::WifiEnabled,
];

/// Settable by a metadata disk.
pub const METADATA_DISK: &[MetadataField] = &[
    MetadataField::Arena,
    MetadataField::Zone,
    MetadataField::Mode,
    MetadataField::MarkerOffset,
    MetadataField::GameTimeout,
    MetadataField::WifiEnabled,
];

impl MetadataField {
    pub const ALL: [MetadataField; 10] = [
        MetadataField::Arena,
        MetadataField::Zone,
        MetadataField::Mode,
        MetadataField::MarkerOffset,
        MetadataField::GameTimeout,
        MetadataField::WifiEnabled,
        MetadataField::WifiSsid,
        MetadataField::WifiPsk,
        MetadataField::WifiRegion,
        MetadataField::UsercodeEntrypoint,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataField::Arena => "arena",
            MetadataField::Zone => "zone",
            MetadataField::Mode => "mode",
            MetadataField::MarkerOffset => "marker_offset",
            MetadataField::GameTimeout => "game_timeout",
            MetadataField::WifiEnabled => "wifi_enabled",
            MetadataField::WifiSsid => "wifi_ssid",
            MetadataField::WifiPsk => "wifi_psk",
            MetadataField::WifiRegion => "wifi_region",
            MetadataField::UsercodeEntrypoint => "usercode_entrypoint",
        }
    }
}

impl fmt::Display for MetadataField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetadataField {
    type Err = FieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|field| field.as_str() == s)
            .ok_or_else(|| FieldError::Unknown(s.to_string()))
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn optional(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

impl Metadata {
    /// Parse and assign one attribute. On error the snapshot is left untouched.
    pub fn set(&mut self, field: MetadataField, value: &str) -> Result<(), FieldError> {
        let invalid = |reason: &str| FieldError::InvalidValue {
            field,
            value: value.to_string(),
            reason: reason.to_string(),
        };

        match field {
            MetadataField::Arena => {
                if value.is_empty() {
                    return Err(invalid("must not be empty"));
                }
                self.arena = value.to_string();
            }
            MetadataField::Zone => {
                self.zone = value.parse().map_err(|_| invalid("expected an integer >= 0"))?;
            }
            MetadataField::Mode => {
                self.mode = value.parse::<RobotMode>().map_err(|e| invalid(&e))?;
            }
            MetadataField::MarkerOffset => {
                self.marker_offset = value
                    .parse()
                    .map_err(|_| invalid("expected an integer >= 0"))?;
            }
            MetadataField::GameTimeout => {
                self.game_timeout = match value {
                    "" => None,
                    v => Some(v.parse().map_err(|_| invalid("expected seconds"))?),
                };
            }
            MetadataField::WifiEnabled => {
                self.wifi_enabled = parse_bool(value).ok_or_else(|| invalid("expected a boolean"))?;
            }
            MetadataField::WifiSsid => self.wifi_ssid = optional(value),
            MetadataField::WifiPsk => self.wifi_psk = optional(value),
            MetadataField::WifiRegion => self.wifi_region = optional(value),
            MetadataField::UsercodeEntrypoint => {
                if value.is_empty() {
                    return Err(invalid("must not be empty"));
                }
                self.usercode_entrypoint = value.to_string();
            }
        }
        Ok(())
    }

    /// Current value of an attribute in the form [`Metadata::set`] accepts.
    pub fn get(&self, field: MetadataField) -> Option<String> {
        match field {
            MetadataField::Arena => Some(self.arena.clone()),
            MetadataField::Zone => Some(self.zone.to_string()),
            MetadataField::Mode => Some(self.mode.to_string()),
            MetadataField::MarkerOffset => Some(self.marker_offset.to_string()),
            MetadataField::GameTimeout => self.game_timeout.map(|t| t.to_string()),
            MetadataField::WifiEnabled => Some(self.wifi_enabled.to_string()),
            MetadataField::WifiSsid => self.wifi_ssid.clone(),
            MetadataField::WifiPsk => self.wifi_psk.clone(),
            MetadataField::WifiRegion => self.wifi_region.clone(),
            MetadataField::UsercodeEntrypoint => Some(self.usercode_entrypoint.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::test_system;

    #[test]
    fn test_field_names_roundtrip() {
        for field in MetadataField::ALL {
            assert_eq!(field.as_str().parse::<MetadataField>(), Ok(field));
        }
        assert_eq!(
            "kernel_version".parse::<MetadataField>(),
            Err(FieldError::Unknown("kernel_version".to_string()))
        );
    }

    #[test]
    fn test_typed_setters() {
        let mut metadata = Metadata::new(&test_system(), "robot.py");
        metadata.set(MetadataField::Zone, "3").unwrap();
        metadata.set(MetadataField::Mode, "COMP").unwrap();
        metadata.set(MetadataField::GameTimeout, "150").unwrap();
        metadata.set(MetadataField::WifiEnabled, "False").unwrap();
        metadata.set(MetadataField::WifiSsid, "robot-ABC").unwrap();

        assert_eq!(metadata.zone, 3);
        assert_eq!(metadata.mode, RobotMode::Competition);
        assert_eq!(metadata.game_timeout, Some(150));
        assert!(!metadata.wifi_enabled);
        assert_eq!(metadata.get(MetadataField::WifiSsid).as_deref(), Some("robot-ABC"));
    }

    #[test]
    fn test_invalid_value_leaves_snapshot_untouched() {
        let mut metadata = Metadata::new(&test_system(), "robot.py");
        let before = metadata.clone();

        assert!(metadata.set(MetadataField::Zone, "-1").is_err());
        assert!(metadata.set(MetadataField::Mode, "RACE").is_err());
        assert!(metadata.set(MetadataField::WifiEnabled, "maybe").is_err());
        assert!(metadata.set(MetadataField::Arena, "").is_err());
        assert_eq!(metadata, before);
    }

    #[test]
    fn test_get_matches_set() {
        let mut metadata = Metadata::new(&test_system(), "robot.py");
        for field in MetadataField::ALL {
            if let Some(value) = metadata.clone().get(field) {
                metadata.set(field, &value).unwrap();
            }
        }
        assert_eq!(metadata, Metadata::new(&test_system(), "robot.py"));
    }
}
