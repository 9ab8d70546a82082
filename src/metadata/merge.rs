use std::collections::BTreeMap;

use tracing::{debug, warn};

use super::fields::MetadataField;
use super::Metadata;

/// One layer of overrides, limited to the attributes it is permitted to set.
#[derive(Debug, Clone, Copy)]
pub struct OverrideSource<'a> {
    pub name: &'a str,
    pub permitted: &'a [MetadataField],
    pub data: &'a BTreeMap<String, String>,
}

impl<'a> OverrideSource<'a> {
    pub fn new(
        name: &'a str,
        permitted: &'a [MetadataField],
        data: &'a BTreeMap<String, String>,
    ) -> Self {
        Self {
            name,
            permitted,
            data,
        }
    }
}

/// Apply sources lowest priority first on top of `defaults`; later sources win.
///
/// Unknown, disallowed and invalid entries are logged and skipped.
pub fn compute_metadata(defaults: Metadata, sources: &[OverrideSource<'_>]) -> Metadata {
    let mut metadata = defaults;

    for source in sources {
        for (key, value) in source.data {
            let field = match key.parse::<MetadataField>() {
                Ok(field) => field,
                Err(e) => {
                    warn!("Ignoring {} override: {}", source.name, e);
                    continue;
                }
            };

            if !source.permitted.contains(&field) {
                warn!("{} is not permitted to set {}", source.name, field);
                continue;
            }

            match metadata.set(field, value) {
                Ok(()) => debug!("{} set {} from {}", field, value, source.name),
                Err(e) => warn!("Ignoring {} override: {}", source.name, e),
            }
        }
    }

    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::fields::{CACHED, METADATA_DISK, REQUEST_MUTABLE, USERCODE_DISK};
    use crate::metadata::{test_system, RobotMode};

    fn defaults() -> Metadata {
        Metadata::new(&test_system(), "robot.py")
    }

    fn data(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_precedence_cache_request_disk() {
        let cache = data(&[]);
        let requests = data(&[("arena", "B")]);
        let disk = data(&[("arena", "C")]);

        let all = [
            OverrideSource::new("cache", CACHED, &cache),
            OverrideSource::new("request", REQUEST_MUTABLE, &requests),
            OverrideSource::new("metadata disk", METADATA_DISK, &disk),
        ];
        assert_eq!(compute_metadata(defaults(), &all).arena, "C");
        assert_eq!(compute_metadata(defaults(), &all[..2]).arena, "B");
        assert_eq!(compute_metadata(defaults(), &all[..1]).arena, "A");
    }

    #[test]
    fn test_disallowed_key_skipped_without_aborting() {
        let disk = data(&[("usercode_entrypoint", "evil.py"), ("zone", "2")]);
        let sources = [OverrideSource::new("metadata disk", METADATA_DISK, &disk)];

        let metadata = compute_metadata(defaults(), &sources);
        assert_eq!(metadata.usercode_entrypoint, "robot.py");
        assert_eq!(metadata.zone, 2);
    }

    #[test]
    fn test_unknown_and_invalid_entries_skipped() {
        let disk = data(&[("kernel_version", "hacked"), ("mode", "RACE"), ("arena", "D")]);
        let sources = [OverrideSource::new("metadata disk", METADATA_DISK, &disk)];

        let metadata = compute_metadata(defaults(), &sources);
        assert_eq!(metadata.kernel_version, "6.1.0");
        assert_eq!(metadata.mode, RobotMode::Development);
        assert_eq!(metadata.arena, "D");
    }

    #[test]
    fn test_usercode_disk_overrides_cached_wifi() {
        let cache = data(&[("wifi_ssid", "robot-OLD"), ("wifi_psk", "old")]);
        let disk = data(&[("wifi_ssid", "robot-NEW")]);
        let sources = [
            OverrideSource::new("cache", CACHED, &cache),
            OverrideSource::new("usercode disk", USERCODE_DISK, &disk),
        ];

        let metadata = compute_metadata(defaults(), &sources);
        assert_eq!(metadata.wifi_ssid.as_deref(), Some("robot-NEW"));
        assert_eq!(metadata.wifi_psk.as_deref(), Some("old"));
    }
}
