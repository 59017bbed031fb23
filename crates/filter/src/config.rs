//! Filter configuration management

use crate::rules::RuleKeys;
use crate::store::{MemoryStore, RegistryStore};
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(default)]
    pub logging: LoggingSettings,
    /// Redirection handshake bounds
    #[serde(default)]
    pub handshake: HandshakeSettings,
    /// Durable key/value store layout
    #[serde(default)]
    pub storage: StorageSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
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

/// Bounds of the blocking steps of a redirection
///
/// ```toml
/// [handshake]
/// attach_timeout = "2m"
/// handle_retry_interval = "20ms"
/// handle_open_timeout = "10s"
/// detach_timeout = "2m"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeSettings {
    /// Wait for the redirector device after the reset
    #[serde(default = "HandshakeSettings::default_attach_timeout", with = "duration_serde")]
    pub attach_timeout: Duration,
    /// Pause between attempts to open the redirector handle
    #[serde(default = "HandshakeSettings::default_retry_interval", with = "duration_serde")]
    pub handle_retry_interval: Duration,
    /// Total time spent retrying the handle open
    #[serde(default = "HandshakeSettings::default_open_timeout", with = "duration_serde")]
    pub handle_open_timeout: Duration,
    /// Wait for the redirected device to go away on removal
    #[serde(default = "HandshakeSettings::default_detach_timeout", with = "duration_serde")]
    pub detach_timeout: Duration,
}

impl Default for HandshakeSettings {
    fn default() -> Self {
        Self {
            attach_timeout: Self::default_attach_timeout(),
            handle_retry_interval: Self::default_retry_interval(),
            handle_open_timeout: Self::default_open_timeout(),
            detach_timeout: Self::default_detach_timeout(),
        }
    }
}

impl HandshakeSettings {
    fn default_attach_timeout() -> Duration {
        Duration::from_secs(120)
    }

    fn default_retry_interval() -> Duration {
        Duration::from_millis(20)
    }

    fn default_open_timeout() -> Duration {
        Duration::from_secs(10)
    }

    fn default_detach_timeout() -> Duration {
        Duration::from_secs(120)
    }

    /// Number of handle open attempts after the first one
    pub fn handle_open_retries(&self) -> u32 {
        let interval = self.handle_retry_interval.as_millis().max(1);
        u32::try_from(self.handle_open_timeout.as_millis() / interval).unwrap_or(u32::MAX)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Parent key of the persistent hide rules
    #[serde(default = "StorageSettings::default_hide_rules_key")]
    pub hide_rules_key: String,
    /// Root of the device enumeration keys scanned for drivers
    #[serde(default = "StorageSettings::default_enum_root")]
    pub enum_root: String,
    /// TOML file seeding the key/value store; empty store when unset
    #[serde(default)]
    pub store_path: Option<PathBuf>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            hide_rules_key: Self::default_hide_rules_key(),
            enum_root: Self::default_enum_root(),
            store_path: None,
        }
    }
}

impl StorageSettings {
    fn default_hide_rules_key() -> String {
        "Parameters\\HideRules".to_string()
    }

    fn default_enum_root() -> String {
        "Enum\\USB".to_string()
    }
}

/// Custom serde module for Duration
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        format_duration(*duration).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    /// Parse a duration string like "2m", "20ms", "1m30s"
    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim().to_lowercase();
        let mut total_ms: u64 = 0;
        let mut chars = s.chars().peekable();

        while chars.peek().is_some() {
            let mut number = String::new();
            while let Some(c) = chars.next_if(char::is_ascii_digit) {
                number.push(c);
            }
            let mut unit = String::new();
            while let Some(c) = chars.next_if(char::is_ascii_alphabetic) {
                unit.push(c);
            }

            if number.is_empty() {
                return Err(format!("Invalid duration format: {}", s));
            }
            let num: u64 = number
                .parse()
                .map_err(|_| format!("Invalid number in duration: {}", number))?;

            let scale = match unit.as_str() {
                "h" => 3_600_000,
                "m" => 60_000,
                // A bare number is seconds
                "s" | "" => 1_000,
                "ms" => 1,
                _ => return Err(format!("Invalid duration unit: {}", unit)),
            };
            total_ms = num
                .checked_mul(scale)
                .and_then(|ms| total_ms.checked_add(ms))
                .ok_or_else(|| format!("Duration too large: {}", s))?;
        }

        if total_ms == 0 {
            return Err("Duration must be greater than 0".to_string());
        }

        Ok(Duration::from_millis(total_ms))
    }

    pub fn format_duration(d: Duration) -> String {
        let total_ms = d.as_millis();
        let hours = total_ms / 3_600_000;
        let mins = (total_ms % 3_600_000) / 60_000;
        let secs = (total_ms % 60_000) / 1_000;
        let ms = total_ms % 1_000;

        let mut result = String::new();
        if hours > 0 {
            result.push_str(&format!("{}h", hours));
        }
        if mins > 0 {
            result.push_str(&format!("{}m", mins));
        }
        if secs > 0 {
            result.push_str(&format!("{}s", secs));
        }
        if ms > 0 || result.is_empty() {
            result.push_str(&format!("{}ms", ms));
        }
        result
    }
}

pub use duration_serde::{format_duration, parse_duration};

impl DriverConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usbdk-filter/filter.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: DriverConfig = toml::from_str(&content)
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
                tracing::warn!("Failed to load config: {}, using defaults", e);
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
            config_dir.join("usbdk-filter").join("filter.toml")
        } else {
            PathBuf::from(".config/usbdk-filter/filter.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        let handshake = &self.handshake;
        for (name, value) in [
            ("attach_timeout", handshake.attach_timeout),
            ("handle_retry_interval", handshake.handle_retry_interval),
            ("handle_open_timeout", handshake.handle_open_timeout),
            ("detach_timeout", handshake.detach_timeout),
        ] {
            if value.is_zero() {
                return Err(anyhow!("Handshake setting '{}' must be greater than 0", name));
            }
        }
        if handshake.handle_retry_interval > handshake.handle_open_timeout {
            return Err(anyhow!(
                "handle_retry_interval ({}) exceeds handle_open_timeout ({})",
                format_duration(handshake.handle_retry_interval),
                format_duration(handshake.handle_open_timeout)
            ));
        }

        if self.storage.hide_rules_key.is_empty() || self.storage.enum_root.is_empty() {
            return Err(anyhow!("Storage keys must not be empty"));
        }

        Ok(())
    }

    /// Store locations used by the rule store
    pub fn rule_keys(&self) -> RuleKeys {
        RuleKeys {
            hide_rules_key: self.storage.hide_rules_key.clone(),
            enum_root: self.storage.enum_root.clone(),
        }
    }

    /// Open the configured key/value store
    pub fn open_store(&self) -> Result<Arc<dyn RegistryStore>> {
        match &self.storage.store_path {
            Some(path) => {
                let path = PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref());
                Ok(Arc::new(MemoryStore::load(&path)?))
            }
            None => Ok(Arc::new(MemoryStore::new())),
        }
    }
}

/// Load a configuration file, expanding a leading `~`
pub fn load_config(path: &str) -> Result<DriverConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    DriverConfig::load(Some(path_buf))
}
