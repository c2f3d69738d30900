//! Configuration file parsing and structures.
//!
//! emberd uses TOML for declarative configuration: a `[host]` section for the
//! connection to the automation host, and one `[apps.*]` section per app.
//! Required per-app keys are modelled as `Option` so a broken section aborts
//! that app's setup without taking the rest of the daemon down.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing_subscriber::filter::LevelFilter;

/// Top-level configuration structure
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    pub host: HostConfig,
    #[serde(default)]
    pub api: Option<ApiConfig>,
    #[serde(default)]
    pub apps: AppsConfig,
}

#[derive(Debug, Default, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub level: LogLevel,
}

/// Connection to the automation host.
#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    /// Base HTTP URL of the host (e.g. `http://homeassistant.local:8123`)
    pub url: String,

    /// Long-lived access token
    pub token: String,

    /// Optional direct broker connection for feedback publishes.
    /// When absent, publishes are relayed through the host's mqtt service.
    #[serde(default)]
    pub mqtt: Option<MqttConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub broker: String,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    #[serde(default = "default_mqtt_client_id")]
    pub client_id: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_mqtt_client_id() -> String {
    "emberd".to_string()
}

/// Status HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_listen")]
    pub listen: String,

    #[serde(default = "default_api_port")]
    pub port: u16,
}

fn default_api_listen() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    8565
}

/// App configuration container
#[derive(Debug, Default, Deserialize)]
pub struct AppsConfig {
    #[serde(default)]
    pub battery_watch: Option<BatteryWatchConfig>,

    /// One scene dispatcher per entry, keyed by instance name
    #[serde(default)]
    pub scenes: BTreeMap<String, SceneConfig>,
}

/// Battery monitor configuration
///
/// `threshold` and both notify-window bounds are required; a section missing
/// any of them logs an error at setup and registers nothing.
#[derive(Debug, Clone, Deserialize)]
pub struct BatteryWatchConfig {
    /// Charge percentage below which a sensor counts as low
    pub threshold: Option<i64>,

    /// First hour of the day (local) in which immediate notification is allowed
    pub notify_hour_start_hour: Option<u32>,

    /// Last hour of the day (local) in which immediate notification is allowed
    pub notify_hour_end_hour: Option<u32>,

    /// Notification service to deliver to
    #[serde(default = "default_notify_target")]
    pub notify_target: String,
}

fn default_notify_target() -> String {
    "mike_phone".to_string()
}

/// Scene dispatcher instance configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SceneConfig {
    /// Which binding table this instance uses
    pub profile: SceneProfile,

    /// Light entity the controller is wired to; the paddle sensors are
    /// derived from its object id
    pub light: Option<String>,

    /// Broker node name of the physical switch, used in feedback topics
    pub node_name: Option<String>,

    #[serde(default)]
    pub led_color_before: Option<String>,

    #[serde(default)]
    pub led_color_after: Option<String>,

    /// Cover driven by the office profile
    #[serde(default)]
    pub cover: Option<String>,

    /// Light groups toggled by the master_bedroom profile
    #[serde(default)]
    pub groups: Option<Vec<String>>,

    /// Group turned off by the entry profile
    #[serde(default)]
    pub group: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SceneProfile {
    Office,
    MasterBedroom,
    Entry,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().to_path_buf(), e))?;

        toml::from_str(&contents).map_err(ConfigError::Parse)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [logging]
            level = "debug"

            [host]
            url = "http://homeassistant.local:8123"
            token = "secret"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.host.url, "http://homeassistant.local:8123");
        assert!(config.host.mqtt.is_none());
        assert!(config.api.is_none());
        assert!(config.apps.battery_watch.is_none());
        assert!(config.apps.scenes.is_empty());
    }

    #[test]
    fn test_parse_battery_watch() {
        let toml = r#"
            [host]
            url = "http://localhost:8123"
            token = "secret"

            [apps.battery_watch]
            threshold = 20
            notify_hour_start_hour = 8
            notify_hour_end_hour = 22
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        let battery = config.apps.battery_watch.as_ref().unwrap();
        assert_eq!(battery.threshold, Some(20));
        assert_eq!(battery.notify_hour_start_hour, Some(8));
        assert_eq!(battery.notify_hour_end_hour, Some(22));
        assert_eq!(battery.notify_target, "mike_phone");
    }

    #[test]
    fn test_parse_scene_instances() {
        let toml = r#"
            [host]
            url = "http://localhost:8123"
            token = "secret"

            [host.mqtt]
            broker = "localhost"

            [apps.scenes.office]
            profile = "office"
            light = "light.office"
            node_name = "office_dimmer"
            led_color_before = "2"

            [apps.scenes.master_bedroom]
            profile = "master_bedroom"
            light = "light.master_bedroom"
            node_name = "master_bedroom_dimmer"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.apps.scenes.len(), 2);

        let office = config.apps.scenes.get("office").unwrap();
        assert_eq!(office.profile, SceneProfile::Office);
        assert_eq!(office.light.as_deref(), Some("light.office"));
        assert_eq!(office.led_color_before.as_deref(), Some("2"));
        assert!(office.led_color_after.is_none());

        let bedroom = config.apps.scenes.get("master_bedroom").unwrap();
        assert_eq!(bedroom.profile, SceneProfile::MasterBedroom);
        assert!(bedroom.groups.is_none());

        let mqtt = config.host.mqtt.as_ref().unwrap();
        assert_eq!(mqtt.broker, "localhost");
        assert_eq!(mqtt.port, 1883);
        assert_eq!(mqtt.client_id, "emberd");
    }

    #[test]
    fn test_unknown_profile_rejected() {
        let toml = r#"
            [host]
            url = "http://localhost:8123"
            token = "secret"

            [apps.scenes.porch]
            profile = "porch"
            light = "light.porch"
            node_name = "porch_dimmer"
        "#;

        assert!(toml::from_str::<Config>(toml).is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [host]
            url = "http://localhost:8123"
            token = "secret"
            "#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.logging.level, LogLevel::Info);

        let missing = Config::from_file("/nonexistent/emberd.toml");
        assert!(matches!(missing, Err(ConfigError::Io(_, _))));
    }
}
