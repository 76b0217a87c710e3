//! File-based settings. Everything has a default, so the file is optional and may
//! be partial; command-line flags override what it says.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::actuation::ArbiterSettings;
use crate::hardware::soil::DEFAULT_SENSOR_ADDRESS;
use crate::mqtt::config::BackoffSettings;

const CONFIG_DIR: &str = ".config/garden-link";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid setting: {0}")]
    Invalid(String),
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct GardenConfig {
    pub mqtt: MqttSection,
    pub telemetry: TelemetrySection,
    pub arbiter: ArbiterSection,
    pub schedule: ScheduleSection,
    pub hardware: HardwareSection,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct MqttSection {
    pub port: u16,
    pub tls: bool,
    pub keep_alive_secs: u64,
    /// Absent means wait for the broker forever.
    pub connect_timeout_secs: Option<u64>,
    pub reconnect_initial_backoff_ms: u64,
    pub reconnect_max_backoff_secs: u64,
    pub channel_capacity: usize,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            port: 8883,
            tls: true,
            keep_alive_secs: 6,
            connect_timeout_secs: None,
            reconnect_initial_backoff_ms: 1000,
            reconnect_max_backoff_secs: 60,
            channel_capacity: 64,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TelemetrySection {
    pub interval_secs: u64,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self { interval_secs: 10 }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ArbiterSection {
    pub moisture_threshold: u16,
    pub pump_cooldown_secs: u64,
}

impl Default for ArbiterSection {
    fn default() -> Self {
        Self {
            moisture_threshold: 400,
            pump_cooldown_secs: 10 * 60,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ScheduleSection {
    /// Ticks between sun event fetches; 720 ticks of 10 s is roughly 12 hours.
    pub sun_refresh_ticks: u32,
}

impl Default for ScheduleSection {
    fn default() -> Self {
        Self {
            sun_refresh_ticks: 12 * 60,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct HardwareSection {
    pub light_pin: u8,
    pub pump_pin: u8,
    pub sensor_address: u16,
}

impl Default for HardwareSection {
    fn default() -> Self {
        Self {
            light_pin: 17,
            pump_pin: 23,
            sensor_address: DEFAULT_SENSOR_ADDRESS,
        }
    }
}

impl GardenConfig {
    /// Loads `path`, or the per-user config file when it exists, or defaults.
    pub async fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let default_path = default_config_path();
                let exists = tokio::fs::try_exists(&default_path).await.unwrap_or(false);
                if !exists {
                    debug!("No config file at {}, using defaults", default_path.display());
                    return Ok(Self::default());
                }
                default_path
            }
        };

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
        let config = Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        config.validate()?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.telemetry.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "telemetry.interval_secs must be at least 1".to_string(),
            ));
        }
        if self.mqtt.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "mqtt.channel_capacity must be at least 1".to_string(),
            ));
        }
        if self.mqtt.keep_alive_secs != 0 && self.mqtt.keep_alive_secs < 5 {
            return Err(ConfigError::Invalid(
                "mqtt.keep_alive_secs must be 0 or at least 5".to_string(),
            ));
        }
        if self.hardware.light_pin == self.hardware.pump_pin {
            return Err(ConfigError::Invalid(format!(
                "light and pump relays share GPIO {}",
                self.hardware.light_pin
            )));
        }
        Ok(())
    }

    pub fn arbiter_settings(&self) -> ArbiterSettings {
        ArbiterSettings {
            moisture_threshold: self.arbiter.moisture_threshold,
            pump_cooldown: chrono::Duration::seconds(self.arbiter.pump_cooldown_secs as i64),
        }
    }

    pub fn backoff_settings(&self) -> BackoffSettings {
        BackoffSettings {
            initial: Duration::from_millis(self.mqtt.reconnect_initial_backoff_ms),
            max: Duration::from_secs(self.mqtt.reconnect_max_backoff_secs),
        }
    }
}

fn default_config_path() -> PathBuf {
    let mut path = dirs::home_dir().unwrap_or_else(|| {
        debug!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    });
    path.push(CONFIG_DIR);
    path.push(CONFIG_FILE);
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = GardenConfig::parse(
            r#"
            [telemetry]
            interval_secs = 300

            [arbiter]
            moisture_threshold = 550
            "#,
        )
        .unwrap();
        assert_eq!(config.telemetry.interval_secs, 300);
        assert_eq!(config.arbiter.moisture_threshold, 550);
        assert_eq!(config.arbiter.pump_cooldown_secs, 600);
        assert_eq!(config.mqtt, MqttSection::default());
        assert_eq!(config.hardware.pump_pin, 23);
    }

    #[test]
    fn arbiter_settings_convert_seconds() {
        let config = GardenConfig::default();
        let settings = config.arbiter_settings();
        assert_eq!(settings.pump_cooldown, chrono::Duration::minutes(10));
        assert_eq!(settings.moisture_threshold, 400);
    }

    #[test]
    fn shared_relay_pin_is_invalid() {
        let mut config = GardenConfig::default();
        config.hardware.pump_pin = config.hardware.light_pin;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[tokio::test]
    async fn explicit_file_is_loaded() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[mqtt]\nport = 1883\ntls = false\nconnect_timeout_secs = 30").unwrap();

        let config = GardenConfig::load(Some(file.path())).await.unwrap();

        assert_eq!(config.mqtt.port, 1883);
        assert!(!config.mqtt.tls);
        assert_eq!(config.mqtt.connect_timeout_secs, Some(30));
        assert_eq!(config.mqtt.keep_alive_secs, 6);
    }

    #[tokio::test]
    async fn broken_file_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[telemetry\ninterval_secs = ").unwrap();

        match GardenConfig::load(Some(file.path())).await {
            Err(ConfigError::Parse { path, .. }) => assert_eq!(path, file.path()),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_explicit_file_is_an_error() {
        let result = GardenConfig::load(Some(Path::new("/nonexistent/garden.toml"))).await;
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
