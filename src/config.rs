use crate::db::SqliteMode;
use crate::mqtt_service::MqttConfig;
use crate::scheduler::SchedulerConfig;
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub db_path: String,
    pub sqlite_mode: SqliteMode,

    pub console_count: u32,
    pub default_price: i64,

    /// `None` runs against the in-memory endpoint.
    pub mqtt_host: Option<String>,
    pub mqtt_port: u16,
    pub mqtt_username: String,
    pub mqtt_password: String,
    pub mqtt_client_id: Option<String>,
    pub mqtt_prefix: String,
    pub mqtt_connect_attempts: usize,
    pub mqtt_retry_interval_ms: u64,
    pub mqtt_connect_timeout_ms: u64,

    pub command_timeout_ms: u64,
    pub fast_interval_ms: u64,
    pub slow_interval_ms: u64,
    pub warn_threshold_secs: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "console_switch.db".to_string(),
            sqlite_mode: SqliteMode::Balanced,
            console_count: 5,
            default_price: 40_000,
            mqtt_host: None,
            mqtt_port: 1883,
            mqtt_username: String::new(),
            mqtt_password: String::new(),
            mqtt_client_id: None,
            mqtt_prefix: "ps".to_string(),
            mqtt_connect_attempts: 3,
            mqtt_retry_interval_ms: 1000,
            mqtt_connect_timeout_ms: 10_000,
            command_timeout_ms: 3000,
            fast_interval_ms: 2000,
            slow_interval_ms: 10_000,
            warn_threshold_secs: 60,
        }
    }
}

impl Config {
    /// Validate timeout values and other critical configurations.
    fn validate(&self) -> Result<(), ConfigError> {
        const MIN_TIMEOUT: u64 = 100;
        const MAX_TIMEOUT: u64 = 1_000_000;

        for (name, value) in [
            ("MQTT_RETRY_INTERVAL_MS", self.mqtt_retry_interval_ms),
            ("MQTT_CONNECT_TIMEOUT_MS", self.mqtt_connect_timeout_ms),
            ("COMMAND_TIMEOUT_MS", self.command_timeout_ms),
            ("FAST_INTERVAL_MS", self.fast_interval_ms),
            ("SLOW_INTERVAL_MS", self.slow_interval_ms),
        ] {
            if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&value) {
                return Err(ConfigError::ParsingError(format!(
                    "{} must be between {} and {} ms",
                    name, MIN_TIMEOUT, MAX_TIMEOUT
                )));
            }
        }
        if self.fast_interval_ms > self.slow_interval_ms {
            return Err(ConfigError::ParsingError(
                "FAST_INTERVAL_MS must not exceed SLOW_INTERVAL_MS".to_string(),
            ));
        }
        if self.default_price <= 0 {
            return Err(ConfigError::ParsingError(
                "DEFAULT_PRICE must be positive".to_string(),
            ));
        }
        if self.mqtt_connect_attempts == 0 {
            return Err(ConfigError::ParsingError(
                "MQTT_CONNECT_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok(); // Load environment variables from .env file
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from any key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let sqlite_mode = match get("SQLITE_MODE") {
            Some(raw) => SqliteMode::parse(&raw)
                .ok_or_else(|| ConfigError::MissingOrInvalid("SQLITE_MODE".to_string()))?,
            None => defaults.sqlite_mode,
        };

        let config = Self {
            http_port: parse_or(&get, "PORT", defaults.http_port)?,
            db_path: get("DB_PATH").unwrap_or(defaults.db_path),
            sqlite_mode,
            console_count: parse_or(&get, "CONSOLE_COUNT", defaults.console_count)?,
            default_price: parse_or(&get, "DEFAULT_PRICE", defaults.default_price)?,

            // MQTT Configuration
            mqtt_host: get("MQTT_HOST"),
            mqtt_port: parse_or(&get, "MQTT_PORT", defaults.mqtt_port)?,
            mqtt_username: get("MQTT_USERNAME").unwrap_or_default(), // Default to empty
            mqtt_password: get("MQTT_PASSWORD").unwrap_or_default(), // Default to empty
            mqtt_client_id: get("MQTT_CLIENT_ID"),
            mqtt_prefix: get("MQTT_PREFIX")
                .map(|p| p.trim_end_matches('/').to_string())
                .unwrap_or(defaults.mqtt_prefix),
            mqtt_connect_attempts: parse_or(
                &get,
                "MQTT_CONNECT_ATTEMPTS",
                defaults.mqtt_connect_attempts,
            )?,
            mqtt_retry_interval_ms: parse_or(
                &get,
                "MQTT_RETRY_INTERVAL_MS",
                defaults.mqtt_retry_interval_ms,
            )?,
            mqtt_connect_timeout_ms: parse_or(
                &get,
                "MQTT_CONNECT_TIMEOUT_MS",
                defaults.mqtt_connect_timeout_ms,
            )?,

            // Scheduler and dispatch timing
            command_timeout_ms: parse_or(&get, "COMMAND_TIMEOUT_MS", defaults.command_timeout_ms)?,
            fast_interval_ms: parse_or(&get, "FAST_INTERVAL_MS", defaults.fast_interval_ms)?,
            slow_interval_ms: parse_or(&get, "SLOW_INTERVAL_MS", defaults.slow_interval_ms)?,
            warn_threshold_secs: parse_or(
                &get,
                "WARN_THRESHOLD_SECS",
                defaults.warn_threshold_secs,
            )?,
        };

        // Validate timeouts after constructing the configuration
        config.validate()?;

        Ok(config)
    }

    pub fn mqtt(&self) -> Option<MqttConfig> {
        let host = self.mqtt_host.clone()?;
        Some(MqttConfig {
            mqtt_host: host,
            mqtt_port: self.mqtt_port,
            mqtt_username: self.mqtt_username.clone(),
            mqtt_password: self.mqtt_password.clone(),
            mqtt_client_id: self.mqtt_client_id.clone(),
            mqtt_prefix: self.mqtt_prefix.clone(),
            mqtt_connect_attempts: self.mqtt_connect_attempts,
            mqtt_retry_interval_ms: self.mqtt_retry_interval_ms,
            mqtt_connect_timeout_ms: self.mqtt_connect_timeout_ms,
        })
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            fast_interval: time::Duration::milliseconds(self.fast_interval_ms as i64),
            slow_interval: time::Duration::milliseconds(self.slow_interval_ms as i64),
            warn_threshold: time::Duration::seconds(self.warn_threshold_secs as i64),
        }
    }

    pub fn command_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.command_timeout_ms)
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::ParsingError(format!("{} must be a valid number", key))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.sqlite_mode, SqliteMode::Balanced);
        assert_eq!(config.console_count, 5);
        assert_eq!(config.default_price, 40_000);
        assert!(config.mqtt().is_none());
        assert_eq!(config.scheduler(), SchedulerConfig::default());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = from_pairs(&[
            ("PORT", "9090"),
            ("SQLITE_MODE", "safe"),
            ("MQTT_HOST", "broker.local"),
            ("MQTT_PREFIX", "shop/ps/"),
            ("FAST_INTERVAL_MS", "500"),
        ])
        .unwrap();
        assert_eq!(config.http_port, 9090);
        assert_eq!(config.sqlite_mode, SqliteMode::Safe);
        let mqtt = config.mqtt().unwrap();
        assert_eq!(mqtt.mqtt_host, "broker.local");
        assert_eq!(mqtt.mqtt_prefix, "shop/ps");
        assert_eq!(mqtt.mqtt_connect_attempts, 3);
        assert_eq!(config.scheduler().fast_interval, time::Duration::milliseconds(500));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            from_pairs(&[("PORT", "http")]),
            Err(ConfigError::ParsingError(_))
        ));
        assert!(matches!(
            from_pairs(&[("SQLITE_MODE", "turbo")]),
            Err(ConfigError::MissingOrInvalid(_))
        ));
        assert!(matches!(
            from_pairs(&[("COMMAND_TIMEOUT_MS", "5")]),
            Err(ConfigError::ParsingError(_))
        ));
        assert!(matches!(
            from_pairs(&[("FAST_INTERVAL_MS", "20000")]),
            Err(ConfigError::ParsingError(_))
        ));
        assert!(matches!(
            from_pairs(&[("DEFAULT_PRICE", "0")]),
            Err(ConfigError::ParsingError(_))
        ));
    }
}
