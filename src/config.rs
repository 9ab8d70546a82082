//! `astoria.toml`, shared by every daemon and the ctl commands.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bus::BusConfig;
use crate::error::{AstoriaError, Result};
use crate::update::default_install_command;
use crate::usercode::UsercodeSettings;

pub const CONFIG_FILENAME: &str = "astoria.toml";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/astoria.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct BrokerConfig {
    /// Unix socket the broker listens on; defaults to the runtime dir
    pub socket_path: Option<PathBuf>,
    pub topic_prefix: String,
    pub request_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            topic_prefix: crate::bus::wrapper::DEFAULT_TOPIC_PREFIX.to_string(),
            request_timeout_ms: crate::bus::wrapper::DEFAULT_REQUEST_TIMEOUT.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct SystemConfig {
    pub cache_dir: Option<PathBuf>,
    /// Shown at the top of every usercode log
    pub initial_log_lines: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct DiskConfig {
    pub mount_roots: Vec<PathBuf>,
    pub ignored_mounts: Vec<PathBuf>,
    pub poll_interval_ms: u64,
    pub settle_ms: u64,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            mount_roots: vec![PathBuf::from("/media")],
            ignored_mounts: Vec::new(),
            poll_interval_ms: 1000,
            settle_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct ProcessConfig {
    pub default_usercode_entrypoint: String,
    pub interpreter: Vec<String>,
    pub kill_grace_ms: u64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        let settings = UsercodeSettings::default();
        Self {
            default_usercode_entrypoint: "robot.py".to_string(),
            interpreter: settings.interpreter,
            kill_grace_ms: settings.kill_grace.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct UpdateConfig {
    pub install_command: Vec<String>,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            install_command: default_install_command(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct AstoriaConfig {
    pub broker: BrokerConfig,
    pub system: SystemConfig,
    pub astdiskd: DiskConfig,
    pub astprocd: ProcessConfig,
    pub astupdated: UpdateConfig,
    /// Added to the environment of every child process
    pub env: BTreeMap<String, String>,
}

impl AstoriaConfig {
    /// First config file that applies: `explicit`, `$ASTORIA_CONFIG`, `./astoria.toml`, `/etc/astoria.toml`.
    ///
    /// Explicitly named files must exist; the well-known locations are skipped when absent.
    pub fn locate(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit.map(Path::to_path_buf).or_else(crate::env::config_path) {
            if !path.is_file() {
                return Err(AstoriaError::Config(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            return Ok(Some(path));
        }

        Ok([PathBuf::from(CONFIG_FILENAME), PathBuf::from(SYSTEM_CONFIG_PATH)]
            .into_iter()
            .find(|p| p.is_file()))
    }

    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let Some(path) = Self::locate(explicit)? else {
            tracing::debug!("No config file found, using defaults");
            return Ok(Self::default());
        };

        tracing::debug!(path = %path.display(), "Loading config");
        let content = fs::read_to_string(&path)?;
        Self::parse(&content)
            .map_err(|e| AstoriaError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| AstoriaError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.astprocd.interpreter.is_empty() {
            return Err(AstoriaError::Config(
                "astprocd.interpreter must not be empty".to_string(),
            ));
        }
        if self.astupdated.install_command.is_empty() {
            return Err(AstoriaError::Config(
                "astupdated.install_command must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// `$ASTORIA_BROKER_SOCKET` > config > runtime dir.
    pub fn socket_path(&self) -> PathBuf {
        crate::env::broker_socket()
            .or_else(|| self.broker.socket_path.clone())
            .unwrap_or_else(crate::env::default_socket_path)
    }

    /// `$ASTORIA_CACHE_DIR` > config > user cache dir.
    pub fn cache_dir(&self) -> PathBuf {
        crate::env::cache_dir()
            .or_else(|| self.system.cache_dir.clone())
            .unwrap_or_else(crate::env::default_cache_dir)
    }

    pub fn bus_config(&self) -> BusConfig {
        BusConfig {
            topic_prefix: self.broker.topic_prefix.clone(),
            request_timeout: Duration::from_millis(self.broker.request_timeout_ms),
        }
    }

    pub fn usercode_settings(&self) -> UsercodeSettings {
        UsercodeSettings {
            interpreter: self.astprocd.interpreter.clone(),
            env: self.env.clone(),
            initial_log_lines: self.system.initial_log_lines.clone(),
            kill_grace: self.kill_grace(),
        }
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.astprocd.kill_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AstoriaConfig::parse("").unwrap();
        assert_eq!(config, AstoriaConfig::default());
        assert_eq!(config.broker.topic_prefix, "astoria");
        assert_eq!(config.astdiskd.mount_roots, vec![PathBuf::from("/media")]);
        assert_eq!(config.astupdated.install_command, vec!["rauc", "install"]);
        assert_eq!(config.kill_grace(), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_sections() {
        let config = AstoriaConfig::parse(
            r#"
[system]
initial_log_lines = ["Hello"]

[astprocd]
interpreter = ["python3"]

[env]
SR_ROBOT = "1"
"#,
        )
        .unwrap();

        let settings = config.usercode_settings();
        assert_eq!(settings.interpreter, vec!["python3"]);
        assert_eq!(settings.initial_log_lines, vec!["Hello"]);
        assert_eq!(settings.env["SR_ROBOT"], "1");
        assert_eq!(config.astprocd.default_usercode_entrypoint, "robot.py");
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(matches!(
            AstoriaConfig::parse("[broker]\nport = 1883\n"),
            Err(AstoriaError::Config(_))
        ));
        assert!(AstoriaConfig::parse("[astwifid]\n").is_err());
    }

    #[test]
    fn test_empty_commands_rejected() {
        assert!(AstoriaConfig::parse("[astprocd]\ninterpreter = []\n").is_err());
        assert!(AstoriaConfig::parse("[astupdated]\ninstall_command = []\n").is_err());
    }

    #[test]
    fn test_explicit_path_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        assert!(AstoriaConfig::load(Some(&missing)).is_err());

        let path = dir.path().join(CONFIG_FILENAME);
        fs::write(&path, "[broker]\ntopic_prefix = \"test\"\n").unwrap();
        let config = AstoriaConfig::load(Some(&path)).unwrap();
        assert_eq!(config.bus_config().topic_prefix, "test");
    }

    #[test]
    fn test_unreadable_config_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILENAME);
        fs::write(&path, b"\xff\xfe").unwrap();
        assert!(matches!(
            AstoriaConfig::load(Some(&path)),
            Err(AstoriaError::Io(_))
        ));
    }
}
