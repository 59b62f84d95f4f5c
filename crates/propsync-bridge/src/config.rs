//! Bridge configuration.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Device connection configuration
    pub device: DeviceConfig,

    /// Accessory identity and feature flags
    pub accessory: AccessoryConfig,

    /// MQTT host configuration
    pub mqtt: MqttConfig,

    /// History log configuration
    pub history: HistoryConfig,
}

/// Device connection configuration.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Appliance base URL
    pub base_url: String,

    /// Bearer token for the appliance
    pub token: Option<String>,

    /// Poll interval
    pub poll_interval: Duration,
}

/// Accessory identity and feature flags.
#[derive(Debug, Clone)]
pub struct AccessoryConfig {
    /// Display name; also the topic identity, after sanitization
    pub name: String,

    /// Device model: "humidifier-h1" or "climate-sensor-c1"
    pub model: String,

    /// Serial number reported on the info service
    pub serial: Option<String>,

    /// Display name for the temperature sensor attribute
    pub temperature_name: Option<String>,

    /// Optional feature switches
    pub features: FeatureFlags,
}

/// Optional accessory features.
#[derive(Debug, Clone, Copy)]
pub struct FeatureFlags {
    /// Expose the built-in temperature sensor
    pub temperature: bool,

    /// Expose the child-lock switch
    pub child_lock: bool,

    /// Re-assert auto mode after target-humidity writes
    pub auto_mode: bool,

    /// Redirect target-humidity writes to the device's limit call
    pub limit_lock: bool,
}

/// MQTT host configuration.
#[derive(Debug, Clone)]
pub struct MqttConfig {
    /// Broker URL
    pub broker: String,
}

/// History log configuration.
#[derive(Debug, Clone)]
pub struct HistoryConfig {
    /// SQLite database path
    pub db_path: PathBuf,

    /// Window during which a channel's open entry keeps merging
    pub rollover: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig {
                base_url: "http://192.168.4.1".to_string(),
                token: None,
                poll_interval: Duration::from_secs(30),
            },
            accessory: AccessoryConfig {
                name: "Humidifier".to_string(),
                model: "humidifier-h1".to_string(),
                serial: None,
                temperature_name: None,
                features: FeatureFlags {
                    temperature: true,
                    child_lock: false,
                    auto_mode: false,
                    limit_lock: false,
                },
            },
            mqtt: MqttConfig {
                broker: "tcp://localhost:1883".to_string(),
            },
            history: HistoryConfig {
                db_path: PathBuf::from("./propsync-history.db"),
                rollover: Duration::from_secs(600),
            },
        }
    }
}

impl BridgeConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `PROPSYNC_DEVICE_URL`: Appliance base URL
    /// - `PROPSYNC_DEVICE_TOKEN`: Bearer token
    /// - `PROPSYNC_POLL_INTERVAL_SECS`: Poll interval in seconds
    /// - `PROPSYNC_ACCESSORY_NAME`: Accessory display name
    /// - `PROPSYNC_DEVICE_MODEL`: Device model identifier
    /// - `PROPSYNC_ACCESSORY_SERIAL`: Serial number for the info service
    /// - `PROPSYNC_TEMPERATURE_NAME`: Temperature attribute display name
    /// - `PROPSYNC_FEATURE_TEMPERATURE`: Expose the temperature sensor
    /// - `PROPSYNC_FEATURE_CHILD_LOCK`: Expose the child-lock switch
    /// - `PROPSYNC_AUTO_MODE`: Re-assert auto mode after setpoint writes
    /// - `PROPSYNC_LIMIT_LOCK`: Redirect setpoint writes to the limit call
    /// - `PROPSYNC_MQTT_BROKER`: MQTT broker URL
    /// - `PROPSYNC_DB_PATH`: History database path
    /// - `PROPSYNC_ROLLOVER_SECS`: History rollover window in seconds
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("PROPSYNC_DEVICE_URL") {
            config.device.base_url = url;
        }

        if let Ok(token) = std::env::var("PROPSYNC_DEVICE_TOKEN") {
            config.device.token = Some(token);
        }

        if let Ok(secs) = std::env::var("PROPSYNC_POLL_INTERVAL_SECS") {
            let secs = secs
                .parse()
                .context("Invalid PROPSYNC_POLL_INTERVAL_SECS")?;
            config.device.poll_interval = Duration::from_secs(secs);
        }

        if let Ok(name) = std::env::var("PROPSYNC_ACCESSORY_NAME") {
            config.accessory.name = name;
        }

        if let Ok(model) = std::env::var("PROPSYNC_DEVICE_MODEL") {
            config.accessory.model = model;
        }

        if let Ok(serial) = std::env::var("PROPSYNC_ACCESSORY_SERIAL") {
            config.accessory.serial = Some(serial);
        }

        if let Ok(name) = std::env::var("PROPSYNC_TEMPERATURE_NAME") {
            config.accessory.temperature_name = Some(name);
        }

        if let Ok(value) = std::env::var("PROPSYNC_FEATURE_TEMPERATURE") {
            config.accessory.features.temperature =
                parse_flag(&value).context("Invalid PROPSYNC_FEATURE_TEMPERATURE")?;
        }

        if let Ok(value) = std::env::var("PROPSYNC_FEATURE_CHILD_LOCK") {
            config.accessory.features.child_lock =
                parse_flag(&value).context("Invalid PROPSYNC_FEATURE_CHILD_LOCK")?;
        }

        if let Ok(value) = std::env::var("PROPSYNC_AUTO_MODE") {
            config.accessory.features.auto_mode =
                parse_flag(&value).context("Invalid PROPSYNC_AUTO_MODE")?;
        }

        if let Ok(value) = std::env::var("PROPSYNC_LIMIT_LOCK") {
            config.accessory.features.limit_lock =
                parse_flag(&value).context("Invalid PROPSYNC_LIMIT_LOCK")?;
        }

        if let Ok(broker) = std::env::var("PROPSYNC_MQTT_BROKER") {
            config.mqtt.broker = broker;
        }

        if let Ok(db_path) = std::env::var("PROPSYNC_DB_PATH") {
            config.history.db_path = PathBuf::from(db_path);
        }

        if let Ok(secs) = std::env::var("PROPSYNC_ROLLOVER_SECS") {
            let secs = secs.parse().context("Invalid PROPSYNC_ROLLOVER_SECS")?;
            config.history.rollover = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("unrecognized flag value '{other}'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_describe_a_humidifier() {
        let config = BridgeConfig::default();
        assert_eq!(config.accessory.model, "humidifier-h1");
        assert_eq!(config.device.poll_interval, Duration::from_secs(30));
        assert!(config.accessory.features.temperature);
        assert!(!config.accessory.features.limit_lock);
    }

    #[test]
    fn flags_parse_common_spellings() {
        for value in ["1", "true", "YES", " on "] {
            assert!(parse_flag(value).unwrap(), "{value}");
        }
        for value in ["0", "false", "No", "off"] {
            assert!(!parse_flag(value).unwrap(), "{value}");
        }
        assert!(parse_flag("maybe").is_err());
    }

    // All env manipulation stays inside this one test; the other tests in
    // this module never read the environment.
    #[test]
    fn from_env_overrides_defaults_and_rejects_bad_numbers() {
        let vars = [
            "PROPSYNC_DEVICE_URL",
            "PROPSYNC_DEVICE_TOKEN",
            "PROPSYNC_POLL_INTERVAL_SECS",
            "PROPSYNC_ACCESSORY_NAME",
            "PROPSYNC_DEVICE_MODEL",
            "PROPSYNC_ACCESSORY_SERIAL",
            "PROPSYNC_TEMPERATURE_NAME",
            "PROPSYNC_FEATURE_TEMPERATURE",
            "PROPSYNC_FEATURE_CHILD_LOCK",
            "PROPSYNC_AUTO_MODE",
            "PROPSYNC_LIMIT_LOCK",
            "PROPSYNC_MQTT_BROKER",
            "PROPSYNC_DB_PATH",
            "PROPSYNC_ROLLOVER_SECS",
        ];
        for var in vars {
            std::env::remove_var(var);
        }

        std::env::set_var("PROPSYNC_DEVICE_URL", "http://10.0.0.9");
        std::env::set_var("PROPSYNC_DEVICE_TOKEN", "s3cret");
        std::env::set_var("PROPSYNC_POLL_INTERVAL_SECS", "5");
        std::env::set_var("PROPSYNC_ACCESSORY_NAME", "Bedroom Humidifier");
        std::env::set_var("PROPSYNC_DEVICE_MODEL", "climate-sensor-c1");
        std::env::set_var("PROPSYNC_LIMIT_LOCK", "on");
        std::env::set_var("PROPSYNC_DB_PATH", "/tmp/propsync-test.db");
        std::env::set_var("PROPSYNC_ROLLOVER_SECS", "120");

        let config = BridgeConfig::from_env().unwrap();
        assert_eq!(config.device.base_url, "http://10.0.0.9");
        assert_eq!(config.device.token.as_deref(), Some("s3cret"));
        assert_eq!(config.device.poll_interval, Duration::from_secs(5));
        assert_eq!(config.accessory.name, "Bedroom Humidifier");
        assert_eq!(config.accessory.model, "climate-sensor-c1");
        assert!(config.accessory.features.limit_lock);
        assert_eq!(config.mqtt.broker, "tcp://localhost:1883");
        assert_eq!(
            config.history.db_path,
            PathBuf::from("/tmp/propsync-test.db")
        );
        assert_eq!(config.history.rollover, Duration::from_secs(120));
        assert_eq!(config.accessory.serial, None);
        assert!(config.accessory.features.temperature);

        std::env::set_var("PROPSYNC_POLL_INTERVAL_SECS", "soon");
        assert!(BridgeConfig::from_env().is_err());

        for var in vars {
            std::env::remove_var(var);
        }
    }
}
