//! # Forwarder Configuration
//!
//! Layered loading of the forwarder settings:
//!
//! 1. Built-in defaults.
//! 2. Optional JSON file (`--config-path` / `FORWARDER_CONFIG_PATH`, otherwise
//!    `canary_forwarder.conf` in the working directory if present).
//! 3. Legacy mixed-case variables (`Canary_Url`, `Canary_Dataset`,
//!    `Mqtt_Url`, `WAITTIME`, `LOGLEVEL`).
//! 4. Environment (including `.env`) and command line flags via `clap`.
//!
//! Later layers override earlier ones field by field. The merged
//! [`ConfigArgs`] is then validated into a [`ForwarderConfig`], reporting
//! every missing required key at once.

use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::broker::{ack_qos, from_canary_path, validate_publish_topic, MqttPublisherOptions};
use crate::core::{ForwardSettings, PermanentErrorPolicy, WatermarkSeed};
use crate::historian::{views_base_url, CanaryAuth, CanaryOptions};
use crate::loggers::{LogOptions, LogRotation};
use crate::retrieve::ApiClientOptions;

/// Config file looked up when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "canary_forwarder.conf";

const DEFAULT_PAGE_SIZE: u32 = 10_000;
const DEFAULT_MAX_PAGES: usize = 100;
const MAX_READ_WINDOW_SECONDS: u64 = 366 * 86_400;
const MIN_PACKET_BYTES: usize = 128;

/// # Configuration Error
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required configuration: {}", .0.join(", "))]
    Missing(Vec<&'static str>),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("cannot load config file {path}: {reason}")]
    File { path: PathBuf, reason: String },
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.into(),
    }
}

/// # Config Arguments
///
/// One layer of raw, unvalidated settings. Used for the CLI/environment
/// layer, the JSON file (camelCase keys) and the legacy variable layer.
#[derive(Parser, Deserialize, Debug, Clone, Default, PartialEq)]
#[command(name = "canary_forwarder", about = "Forwards a Canary historian dataset to an MQTT topic.", version)]
#[serde(rename_all = "camelCase")]
pub struct ConfigArgs {
    #[arg(long, env = "FORWARDER_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[arg(long, env = "CANARY_URL", help = "Canary Views host or URL.")]
    pub canary_url: Option<String>,

    #[arg(long, env = "CANARY_DATASET", help = "Dataset (tag path) to forward.")]
    pub canary_dataset: Option<String>,

    #[arg(long, env = "CANARY_API_TOKEN", hide_env_values = true, help = "Static Canary API token.")]
    pub canary_api_token: Option<String>,

    #[arg(long, env = "CANARY_USERNAME", help = "Canary user for session tokens.")]
    pub canary_username: Option<String>,

    #[arg(long, env = "CANARY_PASSWORD", hide_env_values = true, help = "Password of the Canary user.")]
    pub canary_password: Option<String>,

    #[arg(long, env = "CANARY_HTTP_TIMEOUT_SECONDS", help = "Timeout of a single Canary request.")]
    pub canary_http_timeout_seconds: Option<u64>,

    #[arg(long, env = "CANARY_READ_WINDOW_SECONDS", help = "Longest time span requested from Canary at once.")]
    pub canary_read_window_seconds: Option<u64>,

    #[arg(long, env = "MQTT_URL", help = "Broker host or mqtt://host[:port].")]
    pub mqtt_url: Option<String>,

    #[arg(long, env = "MQTT_PORT", help = "Broker port when the URL has none.")]
    pub mqtt_port: Option<u16>,

    #[arg(long, env = "MQTT_TOPIC", help = "Publish topic. Defaults to the dataset path with '/' separators.")]
    pub mqtt_topic: Option<String>,

    #[arg(long, env = "MQTT_CLIENT_ID", help = "MQTT client identifier.")]
    pub mqtt_client_id: Option<String>,

    #[arg(long, env = "MQTT_USERNAME", help = "Broker user name.")]
    pub mqtt_username: Option<String>,

    #[arg(long, env = "MQTT_PASSWORD", hide_env_values = true, help = "Broker password.")]
    pub mqtt_password: Option<String>,

    #[arg(long, env = "MQTT_QOS", help = "Publish QoS, 1 or 2.")]
    pub mqtt_qos: Option<u8>,

    #[arg(long, env = "MQTT_KEEP_ALIVE_SECONDS", help = "MQTT keep-alive interval.")]
    pub mqtt_keep_alive_seconds: Option<u64>,

    #[arg(long, env = "MQTT_ACK_TIMEOUT_SECONDS", help = "Time to wait for a publish acknowledgement.")]
    pub mqtt_ack_timeout_seconds: Option<u64>,

    #[arg(long, env = "MQTT_MAX_PACKET_BYTES", help = "Largest MQTT packet the broker accepts.")]
    pub mqtt_max_packet_bytes: Option<usize>,

    #[arg(long, env = "POLL_INTERVAL_SECONDS", help = "Seconds between polls of the historian.")]
    pub poll_interval_seconds: Option<f64>,

    #[arg(long, env = "RETRY_BASE_DELAY_MS", help = "First retry delay after a failed tick.")]
    pub retry_base_delay_ms: Option<u64>,

    #[arg(long, env = "RETRY_MAX_DELAY_MS", help = "Upper bound of the retry delay.")]
    pub retry_max_delay_ms: Option<u64>,

    #[arg(long, env = "WATERMARK_PATH", help = "File persisting the watermark. In-memory when unset.")]
    pub watermark_path: Option<PathBuf>,

    #[arg(long, env = "WATERMARK_SEED", help = "Initial watermark: now, start or an RFC 3339 time.")]
    pub watermark_seed: Option<String>,

    #[arg(long, env = "ON_PERMANENT_READ_ERROR", help = "exit or pause on permanent historian errors.")]
    pub on_permanent_read_error: Option<String>,

    #[arg(long, env = "LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[arg(long, env = "LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[arg(long, env = "LOG_ROTATION", help = "Log file rollover: minutely, hourly, daily or never.")]
    pub log_rotation: Option<String>,

    #[arg(long, env = "LOG_MAX_FILES", help = "Number of log files kept, the active one included.")]
    pub log_max_files: Option<usize>,

    #[arg(long, env = "HEALTH_PORT", help = "Port of the /health endpoint. Disabled when unset.")]
    pub health_port: Option<u16>,
}

impl ConfigArgs {
    /// Values used when no layer sets a key.
    pub fn defaults() -> Self {
        Self {
            canary_http_timeout_seconds: Some(10),
            canary_read_window_seconds: Some(86_400),
            mqtt_port: Some(1883),
            mqtt_qos: Some(1),
            mqtt_keep_alive_seconds: Some(30),
            mqtt_ack_timeout_seconds: Some(10),
            mqtt_max_packet_bytes: Some(256 * 1024),
            retry_base_delay_ms: Some(1000),
            retry_max_delay_ms: Some(60_000),
            watermark_seed: Some("now".to_string()),
            on_permanent_read_error: Some("exit".to_string()),
            log_level: Some("info".to_string()),
            log_dir: Some(PathBuf::from("./logs")),
            log_rotation: Some("daily".to_string()),
            log_max_files: Some(4),
            ..Default::default()
        }
    }

    /// Reads the mixed-case variable names of earlier deployments.
    pub fn from_legacy_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let poll_interval_seconds = match lookup("WAITTIME") {
            Some(raw) => Some(
                raw.trim()
                    .parse::<f64>()
                    .map_err(|e| invalid("WAITTIME", e.to_string()))?,
            ),
            None => None,
        };

        Ok(Self {
            canary_url: lookup("Canary_Url"),
            canary_dataset: lookup("Canary_Dataset"),
            mqtt_url: lookup("Mqtt_Url"),
            poll_interval_seconds,
            log_level: lookup("LOGLEVEL"),
            ..Default::default()
        })
    }

    // Merge two layers, where 'other' overrides 'self' for Some values
    pub fn merge(self, other: ConfigArgs) -> ConfigArgs {
        ConfigArgs {
            config_path: other.config_path.or(self.config_path),
            canary_url: other.canary_url.or(self.canary_url),
            canary_dataset: other.canary_dataset.or(self.canary_dataset),
            canary_api_token: other.canary_api_token.or(self.canary_api_token),
            canary_username: other.canary_username.or(self.canary_username),
            canary_password: other.canary_password.or(self.canary_password),
            canary_http_timeout_seconds: other.canary_http_timeout_seconds.or(self.canary_http_timeout_seconds),
            canary_read_window_seconds: other.canary_read_window_seconds.or(self.canary_read_window_seconds),
            mqtt_url: other.mqtt_url.or(self.mqtt_url),
            mqtt_port: other.mqtt_port.or(self.mqtt_port),
            mqtt_topic: other.mqtt_topic.or(self.mqtt_topic),
            mqtt_client_id: other.mqtt_client_id.or(self.mqtt_client_id),
            mqtt_username: other.mqtt_username.or(self.mqtt_username),
            mqtt_password: other.mqtt_password.or(self.mqtt_password),
            mqtt_qos: other.mqtt_qos.or(self.mqtt_qos),
            mqtt_keep_alive_seconds: other.mqtt_keep_alive_seconds.or(self.mqtt_keep_alive_seconds),
            mqtt_ack_timeout_seconds: other.mqtt_ack_timeout_seconds.or(self.mqtt_ack_timeout_seconds),
            mqtt_max_packet_bytes: other.mqtt_max_packet_bytes.or(self.mqtt_max_packet_bytes),
            poll_interval_seconds: other.poll_interval_seconds.or(self.poll_interval_seconds),
            retry_base_delay_ms: other.retry_base_delay_ms.or(self.retry_base_delay_ms),
            retry_max_delay_ms: other.retry_max_delay_ms.or(self.retry_max_delay_ms),
            watermark_path: other.watermark_path.or(self.watermark_path),
            watermark_seed: other.watermark_seed.or(self.watermark_seed),
            on_permanent_read_error: other.on_permanent_read_error.or(self.on_permanent_read_error),
            log_level: other.log_level.or(self.log_level),
            log_dir: other.log_dir.or(self.log_dir),
            log_rotation: other.log_rotation.or(self.log_rotation),
            log_max_files: other.log_max_files.or(self.log_max_files),
            health_port: other.health_port.or(self.health_port),
        }
    }

    /// Validates the merged layers.
    pub fn into_config(self) -> Result<ForwarderConfig, ConfigError> {
        // --- Phase 1: required keys, reported together ---
        let dataset = self.canary_dataset.map(|d| d.trim().to_string()).filter(|d| !d.is_empty());
        let canary_url = self.canary_url.filter(|u| !u.trim().is_empty());
        let mqtt_url = self.mqtt_url.filter(|u| !u.trim().is_empty());

        let mut missing = Vec::new();
        if canary_url.is_none() {
            missing.push("CANARY_URL");
        }
        if dataset.is_none() {
            missing.push("CANARY_DATASET");
        }
        if mqtt_url.is_none() {
            missing.push("MQTT_URL");
        }
        if self.poll_interval_seconds.is_none() {
            missing.push("POLL_INTERVAL_SECONDS");
        }
        let (Some(canary_url), Some(dataset), Some(mqtt_url), Some(poll_interval_seconds)) =
            (canary_url, dataset, mqtt_url, self.poll_interval_seconds)
        else {
            return Err(ConfigError::Missing(missing));
        };

        // --- Phase 2: historian ---
        let auth = match self.canary_api_token.filter(|t| !t.is_empty()) {
            Some(token) => CanaryAuth::ApiToken(token),
            None => CanaryAuth::User {
                username: self.canary_username,
                password: self.canary_password,
            },
        };
        let read_window_seconds = positive("CANARY_READ_WINDOW_SECONDS", self.canary_read_window_seconds.or(Some(86_400)))?;
        if read_window_seconds > MAX_READ_WINDOW_SECONDS {
            return Err(invalid(
                "CANARY_READ_WINDOW_SECONDS",
                format!("must not exceed {}", MAX_READ_WINDOW_SECONDS),
            ));
        }
        let canary = CanaryOptions {
            base_url: views_base_url(&canary_url),
            auth,
            http: ApiClientOptions {
                timeout: Duration::from_secs(positive("CANARY_HTTP_TIMEOUT_SECONDS", self.canary_http_timeout_seconds)?),
                ..Default::default()
            },
            page_size: DEFAULT_PAGE_SIZE,
            application: "CanaryForwarder".to_string(),
            read_window: Duration::from_secs(read_window_seconds),
            max_pages: DEFAULT_MAX_PAGES,
        };
        Url::parse(&canary.base_url).map_err(|e| invalid("CANARY_URL", e.to_string()))?;

        // --- Phase 3: broker ---
        let (host, port) = parse_mqtt_url(&mqtt_url, self.mqtt_port.unwrap_or(1883)).map_err(|e| invalid("MQTT_URL", e))?;
        let qos_level = self.mqtt_qos.unwrap_or(1);
        let qos = ack_qos(qos_level).ok_or_else(|| invalid("MQTT_QOS", format!("{} is not 1 or 2", qos_level)))?;
        let max_packet_bytes = self.mqtt_max_packet_bytes.unwrap_or(256 * 1024);
        if max_packet_bytes < MIN_PACKET_BYTES {
            return Err(invalid("MQTT_MAX_PACKET_BYTES", format!("must be at least {}", MIN_PACKET_BYTES)));
        }

        let topic = self
            .mqtt_topic
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| from_canary_path(&dataset));
        validate_publish_topic(&topic).map_err(|e| invalid("MQTT_TOPIC", e))?;

        let mqtt = MqttPublisherOptions {
            host,
            port,
            client_id: self
                .mqtt_client_id
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| format!("canary-forwarder-{}", std::process::id())),
            username: self.mqtt_username,
            password: self.mqtt_password,
            qos,
            keep_alive: Duration::from_secs(positive("MQTT_KEEP_ALIVE_SECONDS", self.mqtt_keep_alive_seconds)?),
            ack_timeout: Duration::from_secs(positive("MQTT_ACK_TIMEOUT_SECONDS", self.mqtt_ack_timeout_seconds)?),
            max_packet_bytes,
        };

        // --- Phase 4: loop ---
        if !poll_interval_seconds.is_finite() || poll_interval_seconds <= 0.0 {
            return Err(invalid("POLL_INTERVAL_SECONDS", "must be a positive number of seconds"));
        }
        let poll_interval = Duration::try_from_secs_f64(poll_interval_seconds)
            .map_err(|e| invalid("POLL_INTERVAL_SECONDS", e.to_string()))?;
        let retry_base_delay = Duration::from_millis(positive("RETRY_BASE_DELAY_MS", self.retry_base_delay_ms)?);
        let retry_max_delay = Duration::from_millis(self.retry_max_delay_ms.unwrap_or(60_000));
        if retry_max_delay < retry_base_delay {
            return Err(invalid("RETRY_MAX_DELAY_MS", "must not be below RETRY_BASE_DELAY_MS"));
        }
        let on_permanent_read_error =
            parse_policy(self.on_permanent_read_error.as_deref().unwrap_or("exit")).map_err(|e| invalid("ON_PERMANENT_READ_ERROR", e))?;
        let watermark_seed = WatermarkSeed::from_str(self.watermark_seed.as_deref().unwrap_or("now"))
            .map_err(|e| invalid("WATERMARK_SEED", e))?;

        let forward = ForwardSettings {
            dataset_id: dataset,
            topic,
            poll_interval,
            retry_base_delay,
            retry_max_delay,
            on_permanent_read_error,
        };

        // --- Phase 5: ambient ---
        let defaults = LogOptions::default();
        let logging = LogOptions {
            dir: self.log_dir.unwrap_or(defaults.dir),
            level: self.log_level.unwrap_or(defaults.level),
            file_name: defaults.file_name,
            rotation: match self.log_rotation {
                Some(raw) => LogRotation::from_str(&raw).map_err(|e| invalid("LOG_ROTATION", e))?,
                None => defaults.rotation,
            },
            max_files: positive("LOG_MAX_FILES", self.log_max_files.map(|n| n as u64).or(Some(defaults.max_files as u64)))?
                as usize,
        };

        Ok(ForwarderConfig {
            canary,
            mqtt,
            forward,
            watermark_path: self.watermark_path,
            watermark_seed,
            logging,
            health_port: self.health_port,
        })
    }
}

fn positive(key: &'static str, value: Option<u64>) -> Result<u64, ConfigError> {
    match value {
        Some(0) => Err(invalid(key, "must be greater than zero")),
        Some(v) => Ok(v),
        None => Err(ConfigError::Missing(vec![key])),
    }
}

fn parse_policy(raw: &str) -> Result<PermanentErrorPolicy, String> {
    match raw.trim().to_lowercase().as_str() {
        "exit" => Ok(PermanentErrorPolicy::Exit),
        "pause" => Ok(PermanentErrorPolicy::Pause),
        other => Err(format!("'{}' is not exit or pause", other)),
    }
}

/// Splits a broker address into host and port. Accepts a bare host,
/// `host:port`, or an `mqtt://` / `tcp://` URL; the port in the address wins
/// over `default_port`.
pub fn parse_mqtt_url(raw: &str, default_port: u16) -> Result<(String, u16), String> {
    let raw = raw.trim();
    if raw.contains("://") {
        let url = Url::parse(raw).map_err(|e| e.to_string())?;
        if !matches!(url.scheme(), "mqtt" | "tcp") {
            return Err(format!("unsupported scheme '{}'", url.scheme()));
        }
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| "missing host".to_string())?;
        return Ok((host.to_string(), url.port().unwrap_or(default_port)));
    }

    match raw.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port.parse::<u16>().map_err(|_| format!("invalid port '{}'", port))?;
            Ok((host.to_string(), port))
        }
        Some(_) => Err("missing host".to_string()),
        None if raw.is_empty() => Err("missing host".to_string()),
        None => Ok((raw.to_string(), default_port)),
    }
}

/// # Forwarder Configuration
///
/// Validated settings, already shaped as the options of each component.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    pub canary: CanaryOptions,
    pub mqtt: MqttPublisherOptions,
    pub forward: ForwardSettings,
    /// Watermark file; the watermark lives in memory when unset.
    pub watermark_path: Option<PathBuf>,
    pub watermark_seed: WatermarkSeed,
    pub logging: LogOptions,
    pub health_port: Option<u16>,
}

/// Stacks defaults, the JSON file, the legacy layer and the CLI/environment
/// layer.
pub fn resolve(cli: ConfigArgs, legacy: ConfigArgs) -> Result<ConfigArgs, ConfigError> {
    let explicit = cli.config_path.clone().or_else(|| legacy.config_path.clone());

    let mut current = ConfigArgs::defaults();
    if let Some(file) = read_config_file(explicit)? {
        current = current.merge(file);
    }
    Ok(current.merge(legacy).merge(cli))
}

fn read_config_file(explicit: Option<PathBuf>) -> Result<Option<ConfigArgs>, ConfigError> {
    let (path, required) = match explicit {
        Some(path) => (path, true),
        None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    };

    if !path.exists() {
        if required {
            return Err(ConfigError::File {
                path,
                reason: "file not found".to_string(),
            });
        }
        return Ok(None);
    }

    let text = fs::read_to_string(&path).map_err(|e| ConfigError::File {
        path: path.clone(),
        reason: e.to_string(),
    })?;
    serde_json::from_str::<ConfigArgs>(&text)
        .map(Some)
        .map_err(|e| ConfigError::File {
            path,
            reason: e.to_string(),
        })
}

/// Loads `.env`, parses flags and environment, and validates the result.
pub fn load_config() -> Result<ForwarderConfig, ConfigError> {
    // .env has to be in the process environment before clap reads it.
    dotenvy::dotenv().ok();

    let cli = ConfigArgs::parse();
    let legacy = ConfigArgs::from_legacy_vars(|key| std::env::var(key).ok())?;
    resolve(cli, legacy)?.into_config()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn minimal() -> ConfigArgs {
        ConfigArgs {
            canary_url: Some("historian.local".to_string()),
            canary_dataset: Some("Plant.Area".to_string()),
            mqtt_url: Some("broker.local".to_string()),
            poll_interval_seconds: Some(2.5),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_fill_optional_keys() {
        let config = ConfigArgs::defaults().merge(minimal()).into_config().unwrap();

        assert_eq!(config.canary.base_url, "https://historian.local:55236/");
        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.forward.topic, "Plant/Area");
        assert_eq!(config.forward.poll_interval, Duration::from_millis(2500));
        assert_eq!(config.forward.retry_base_delay, Duration::from_secs(1));
        assert_eq!(config.forward.retry_max_delay, Duration::from_secs(60));
        assert_eq!(config.forward.on_permanent_read_error, PermanentErrorPolicy::Exit);
        assert_eq!(config.watermark_seed, WatermarkSeed::Now);
        assert!(config.watermark_path.is_none());
        assert!(config.mqtt.client_id.starts_with("canary-forwarder-"));
        assert_eq!(config.logging.rotation, LogRotation::Daily);
        assert_eq!(config.logging.max_files, 4);
        assert_eq!(config.canary.read_window, Duration::from_secs(86_400));
        assert_eq!(config.canary.auth, CanaryAuth::User { username: None, password: None });
    }

    #[test]
    fn test_missing_keys_are_all_named() {
        let err = ConfigArgs::defaults().into_config().unwrap_err();
        assert_eq!(
            err,
            ConfigError::Missing(vec!["CANARY_URL", "CANARY_DATASET", "MQTT_URL", "POLL_INTERVAL_SECONDS"])
        );
        assert!(err.to_string().contains("CANARY_URL, CANARY_DATASET"));
    }

    #[test]
    fn test_qos_zero_rejected() {
        let args = ConfigArgs {
            mqtt_qos: Some(0),
            ..ConfigArgs::defaults().merge(minimal())
        };
        assert!(matches!(args.into_config(), Err(ConfigError::Invalid { key: "MQTT_QOS", .. })));
    }

    #[test]
    fn test_wildcard_topic_rejected() {
        let args = ConfigArgs {
            mqtt_topic: Some("plant/#".to_string()),
            ..ConfigArgs::defaults().merge(minimal())
        };
        assert!(matches!(args.into_config(), Err(ConfigError::Invalid { key: "MQTT_TOPIC", .. })));
    }

    #[test]
    fn test_non_positive_poll_interval_rejected() {
        for value in [0.0, -1.0, f64::NAN] {
            let args = ConfigArgs {
                poll_interval_seconds: Some(value),
                ..ConfigArgs::defaults().merge(minimal())
            };
            assert!(args.into_config().is_err(), "accepted {}", value);
        }
    }

    #[test]
    fn test_log_and_window_settings_validated() {
        let args = ConfigArgs {
            log_rotation: Some("weekly".to_string()),
            ..ConfigArgs::defaults().merge(minimal())
        };
        assert!(matches!(args.into_config(), Err(ConfigError::Invalid { key: "LOG_ROTATION", .. })));

        let args = ConfigArgs {
            log_max_files: Some(0),
            ..ConfigArgs::defaults().merge(minimal())
        };
        assert!(matches!(args.into_config(), Err(ConfigError::Invalid { key: "LOG_MAX_FILES", .. })));

        let args = ConfigArgs {
            canary_read_window_seconds: Some(0),
            ..ConfigArgs::defaults().merge(minimal())
        };
        assert!(matches!(args.into_config(), Err(ConfigError::Invalid { key: "CANARY_READ_WINDOW_SECONDS", .. })));

        let args = ConfigArgs {
            log_rotation: Some("Hourly".to_string()),
            canary_read_window_seconds: Some(3600),
            ..ConfigArgs::defaults().merge(minimal())
        };
        let config = args.into_config().unwrap();
        assert_eq!(config.logging.rotation, LogRotation::Hourly);
        assert_eq!(config.canary.read_window, Duration::from_secs(3600));
    }

    #[test]
    fn test_api_token_takes_precedence_over_user() {
        let args = ConfigArgs {
            canary_api_token: Some("secret".to_string()),
            canary_username: Some("operator".to_string()),
            ..ConfigArgs::defaults().merge(minimal())
        };
        let config = args.into_config().unwrap();
        assert_eq!(config.canary.auth, CanaryAuth::ApiToken("secret".to_string()));
    }

    #[test]
    fn test_parse_mqtt_url_forms() {
        assert_eq!(parse_mqtt_url("broker", 1883).unwrap(), ("broker".to_string(), 1883));
        assert_eq!(parse_mqtt_url("broker:1884", 1883).unwrap(), ("broker".to_string(), 1884));
        assert_eq!(parse_mqtt_url("mqtt://broker:2883", 1883).unwrap(), ("broker".to_string(), 2883));
        assert_eq!(parse_mqtt_url("tcp://broker", 1999).unwrap(), ("broker".to_string(), 1999));
        assert!(parse_mqtt_url("mqtts://broker", 1883).is_err());
        assert!(parse_mqtt_url("broker:notaport", 1883).is_err());
        assert!(parse_mqtt_url(":1883", 1883).is_err());
    }

    #[test]
    fn test_legacy_vars() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("Canary_Url", "legacy-host"),
            ("Canary_Dataset", "Legacy.Set"),
            ("Mqtt_Url", "legacy-broker"),
            ("WAITTIME", "5"),
            ("LOGLEVEL", "DEBUG"),
        ]);
        let legacy = ConfigArgs::from_legacy_vars(|k| vars.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(legacy.canary_url.as_deref(), Some("legacy-host"));
        assert_eq!(legacy.poll_interval_seconds, Some(5.0));
        assert_eq!(legacy.log_level.as_deref(), Some("DEBUG"));

        let bad = ConfigArgs::from_legacy_vars(|k| (k == "WAITTIME").then(|| "soon".to_string()));
        assert!(matches!(bad, Err(ConfigError::Invalid { key: "WAITTIME", .. })));
    }

    #[test]
    fn test_layer_precedence() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"canaryUrl": "file-host", "canaryDataset": "File.Set", "mqttUrl": "file-broker", "pollIntervalSeconds": 7, "mqttPort": 1999}}"#
        )
        .unwrap();

        let legacy = ConfigArgs {
            canary_dataset: Some("Legacy.Set".to_string()),
            mqtt_url: Some("legacy-broker".to_string()),
            ..Default::default()
        };
        let cli = ConfigArgs {
            config_path: Some(file.path().to_path_buf()),
            mqtt_url: Some("cli-broker".to_string()),
            ..Default::default()
        };

        let merged = resolve(cli, legacy).unwrap();
        assert_eq!(merged.canary_url.as_deref(), Some("file-host"));
        assert_eq!(merged.canary_dataset.as_deref(), Some("Legacy.Set"));
        assert_eq!(merged.mqtt_url.as_deref(), Some("cli-broker"));
        assert_eq!(merged.mqtt_port, Some(1999));
        assert_eq!(merged.mqtt_qos, Some(1));
        assert_eq!(merged.poll_interval_seconds, Some(7.0));
    }

    #[test]
    fn test_explicit_config_file_must_exist() {
        let cli = ConfigArgs {
            config_path: Some(PathBuf::from("/nonexistent/forwarder.conf")),
            ..Default::default()
        };
        assert!(matches!(resolve(cli, ConfigArgs::default()), Err(ConfigError::File { .. })));
    }

    #[test]
    fn test_clap_flags() {
        let args = ConfigArgs::try_parse_from([
            "canary_forwarder",
            "--canary-url",
            "flag-host",
            "--mqtt-qos",
            "2",
            "--poll-interval-seconds",
            "0.5",
        ])
        .unwrap();
        assert_eq!(args.canary_url.as_deref(), Some("flag-host"));
        assert_eq!(args.mqtt_qos, Some(2));
        assert_eq!(args.poll_interval_seconds, Some(0.5));
    }
}
