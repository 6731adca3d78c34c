//! usbfs-tool configuration management

use anyhow::{Context, Result, anyhow};
use engine::EngineConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolConfig {
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub transfers: TransferSettings,
    #[serde(default)]
    pub device: DeviceSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// trace, debug, info, warn or error; RUST_LOG overrides it
    #[serde(default = "LoggingSettings::default_level")]
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

impl LoggingSettings {
    fn default_level() -> String {
        "info".to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Upper bound on one reaper wait, in milliseconds
    #[serde(default = "EngineSettings::default_poll_interval")]
    pub reap_poll_interval_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            reap_poll_interval_ms: Self::default_poll_interval(),
        }
    }
}

impl EngineSettings {
    fn default_poll_interval() -> u64 {
        engine::DEFAULT_POLL_INTERVAL.as_millis() as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSettings {
    /// Timeout used when a command does not pass `--timeout` (0 = none)
    #[serde(default = "TransferSettings::default_timeout")]
    pub default_timeout_ms: u32,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: Self::default_timeout(),
        }
    }
}

impl TransferSettings {
    fn default_timeout() -> u32 {
        1000
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Device used when no selector is given, as `0xVVVV:0xPPPP`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

impl ToolConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            expand_path(&p)
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usbfs-tool/config.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: ToolConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usbfs-tool").join("config.toml")
        } else {
            PathBuf::from(".config/usbfs-tool/config.toml")
        }
    }

    /// Engine settings for opening a device
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::default()
            .with_poll_interval(Duration::from_millis(self.engine.reap_poll_interval_ms))
    }

    /// Configured default device, parsed
    pub fn default_device(&self) -> Result<Option<(u16, u16)>> {
        self.device
            .default
            .as_deref()
            .map(|s| common::parse_vid_pid(s).map_err(|e| anyhow!("[device] default: {}", e)))
            .transpose()
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        if self.engine.reap_poll_interval_ms == 0 {
            return Err(anyhow!("reap_poll_interval_ms must be greater than 0"));
        }

        self.default_device()?;
        Ok(())
    }
}

/// Expand a leading `~` in a user-supplied path
pub fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(&raw).as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ToolConfig::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.engine.reap_poll_interval_ms, 100);
        assert_eq!(config.transfers.default_timeout_ms, 1000);
        assert!(config.device.default.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ToolConfig = toml::from_str(
            r#"
[logging]
level = "debug"
"#,
        )
        .unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.engine.reap_poll_interval_ms, 100);
        assert_eq!(config.transfers.default_timeout_ms, 1000);
    }

    #[test]
    fn test_full_config() {
        let config: ToolConfig = toml::from_str(
            r#"
[logging]
level = "trace"

[engine]
reap_poll_interval_ms = 20

[transfers]
default_timeout_ms = 250

[device]
default = "0x04f9:0x0042"
"#,
        )
        .unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.default_device().unwrap(), Some((0x04f9, 0x0042)));
        assert_eq!(
            config.engine_config().poll_interval,
            Duration::from_millis(20)
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = ToolConfig::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());

        let mut config = ToolConfig::default();
        config.engine.reap_poll_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = ToolConfig::default();
        config.device.default = Some("printer".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = ToolConfig::default();
        config.device.default = Some("0x1234:0x5678".to_string());
        config.transfers.default_timeout_ms = 42;
        config.save(&path).unwrap();

        let loaded = ToolConfig::load(Some(path)).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[engine]\nreap_poll_interval_ms = 0\n").unwrap();

        assert!(ToolConfig::load(Some(path)).is_err());
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ToolConfig::load(Some(dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn test_expand_path() {
        assert_eq!(
            expand_path(Path::new("/etc/usbfs-tool/config.toml")),
            PathBuf::from("/etc/usbfs-tool/config.toml")
        );
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_path(Path::new("~/x.toml")), home.join("x.toml"));
        }
    }
}
