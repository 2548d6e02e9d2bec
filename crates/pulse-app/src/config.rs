//! Application configuration.
//!
//! Loaded from a TOML file layered with `PULSE__*` environment overrides,
//! e.g. `PULSE__PUSH_ENABLED=false` or `PULSE__TRANSPORT__POLL_INTERVAL_MS=5000`.

use crate::error::{AppError, AppResult};
use pulse_core::MoverVariant;
use pulse_feed::UnitHint;
use pulse_movers::RankOptions;
use pulse_transport::{ConnectionConfig, PollEndpoint, PushKind};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Device class the client runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceProfile {
    #[default]
    Desktop,
    /// Slower, lossier links: longer timeouts, gentler polling and backoff.
    Mobile,
}

/// Transport defaults for a device profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceTuning {
    pub request_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl DeviceProfile {
    pub fn tuning(&self) -> DeviceTuning {
        match self {
            Self::Desktop => DeviceTuning {
                request_timeout_ms: 8_000,
                poll_interval_ms: 10_000,
                reconnect_base_delay_ms: 1_000,
                reconnect_max_delay_ms: 30_000,
                max_reconnect_attempts: 8,
            },
            Self::Mobile => DeviceTuning {
                request_timeout_ms: 15_000,
                poll_interval_ms: 20_000,
                reconnect_base_delay_ms: 2_000,
                reconnect_max_delay_ms: 60_000,
                max_reconnect_attempts: 5,
            },
        }
    }
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Desktop => write!(f, "desktop"),
            Self::Mobile => write!(f, "mobile"),
        }
    }
}

impl FromStr for DeviceProfile {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "desktop" => Ok(Self::Desktop),
            "mobile" => Ok(Self::Mobile),
            other => Err(AppError::Config(format!("unknown device profile: {other}"))),
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// REST base URL.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Push channel URL (`ws://`, `wss://`, `http://` or `https://`).
    #[serde(default)]
    pub push_url: Option<String>,
    /// Set to false to go straight to polling.
    #[serde(default = "default_true")]
    pub push_enabled: bool,
    #[serde(default)]
    pub device: DeviceProfile,
    /// Explicit overrides on top of the device profile.
    #[serde(default)]
    pub transport: TransportOverrides,
    /// Unit of percentage fields in incoming payloads.
    #[serde(default)]
    pub unit_hint: UnitHint,
    /// Stream key a flat (unkeyed) `tables:update` is filed under.
    #[serde(default = "default_flat_stream_key")]
    pub flat_stream_key: String,
    #[serde(default = "default_lists")]
    pub lists: Vec<ListSpec>,
    /// Polled streams that feed prices but no mover list (banners).
    #[serde(default = "default_streams")]
    pub streams: Vec<StreamSpec>,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Periodic status log interval.
    #[serde(default = "default_metrics_log_interval_secs")]
    pub metrics_log_interval_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:5001".to_string()
}

fn default_true() -> bool {
    true
}

fn default_flat_stream_key() -> String {
    "t1m".to_string()
}

fn default_metrics_log_interval_secs() -> u64 {
    60
}

fn default_lists() -> Vec<ListSpec> {
    vec![
        ListSpec::new("gainers_1m", MoverVariant::Gainers)
            .with_keys(&["t1m"])
            .with_endpoint("/api/component/gainers-table-1min"),
        ListSpec::new("gainers_3m", MoverVariant::Gainers)
            .with_keys(&["t3m"])
            .with_endpoint("/api/component/gainers-table"),
        ListSpec::new("losers_3m", MoverVariant::Losers)
            .with_keys(&["t3m"])
            .with_endpoint("/api/component/losers-table"),
    ]
}

fn default_streams() -> Vec<StreamSpec> {
    vec![
        StreamSpec {
            key: "banner_1h_price".to_string(),
            endpoint: "/api/component/top-banner-scroll".to_string(),
        },
        StreamSpec {
            key: "banner_1h_volume".to_string(),
            endpoint: "/api/component/bottom-banner-scroll".to_string(),
        },
    ]
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            push_url: None,
            push_enabled: true,
            device: DeviceProfile::default(),
            transport: TransportOverrides::default(),
            unit_hint: UnitHint::default(),
            flat_stream_key: default_flat_stream_key(),
            lists: default_lists(),
            streams: default_streams(),
            storage: StorageConfig::default(),
            metrics_log_interval_secs: default_metrics_log_interval_secs(),
        }
    }
}

/// Per-field transport overrides. `None` keeps the device default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportOverrides {
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    #[serde(default)]
    pub poll_jitter_ms: Option<u64>,
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    /// 0 = retry forever.
    #[serde(default)]
    pub max_reconnect_attempts: Option<u32>,
    #[serde(default)]
    pub reconnect_base_delay_ms: Option<u64>,
    #[serde(default)]
    pub reconnect_max_delay_ms: Option<u64>,
    /// 0 disables the liveness watchdog.
    #[serde(default)]
    pub stale_after_ms: Option<u64>,
    #[serde(default)]
    pub poll_on_degraded: Option<bool>,
}

/// One mover list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListSpec {
    /// List name; also the stream key its polled endpoint publishes under.
    pub name: String,
    /// Push window ids the list is computed from (e.g. `t1m`).
    #[serde(default)]
    pub keys: Vec<String>,
    /// REST snapshot path polled during fallback.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub variant: MoverVariant,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default = "default_true")]
    pub continuity: bool,
}

fn default_limit() -> usize {
    20
}

impl ListSpec {
    pub fn new(name: impl Into<String>, variant: MoverVariant) -> Self {
        Self {
            name: name.into(),
            keys: Vec::new(),
            endpoint: None,
            variant,
            limit: default_limit(),
            continuity: true,
        }
    }

    pub fn with_keys(mut self, keys: &[&str]) -> Self {
        self.keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Whether an update to stream `key` feeds this list.
    pub fn reads(&self, key: &str) -> bool {
        self.name == key || self.keys.iter().any(|k| k == key)
    }

    pub fn rank_options(&self) -> RankOptions {
        RankOptions {
            variant: self.variant,
            limit: self.limit,
            continuity: self.continuity,
        }
    }
}

/// A polled stream outside any mover list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSpec {
    pub key: String,
    pub endpoint: String,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory of the JSON key/value store (watchlist).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Persist the last payload per stream across restarts.
    #[serde(default = "default_true")]
    pub session_cache: bool,
    /// Session cache file. Defaults to the OS temp directory.
    #[serde(default)]
    pub session_cache_path: Option<PathBuf>,
    #[serde(default = "default_session_max_age_secs")]
    pub session_max_age_secs: u64,
    /// How often the data directory is checked for writes by other processes.
    #[serde(default = "default_watch_interval_ms")]
    pub watch_interval_ms: u64,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_session_max_age_secs() -> u64 {
    900
}

fn default_watch_interval_ms() -> u64 {
    1_000
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            session_cache: true,
            session_cache_path: None,
            session_max_age_secs: default_session_max_age_secs(),
            watch_interval_ms: default_watch_interval_ms(),
        }
    }
}

impl StorageConfig {
    pub fn session_max_age(&self) -> Duration {
        Duration::from_secs(self.session_max_age_secs)
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms.max(10))
    }
}

impl AppConfig {
    /// Load `path` (if it exists) layered with `PULSE__*` environment
    /// variables.
    pub fn load(path: &str) -> AppResult<Self> {
        if !Path::new(path).exists() {
            tracing::warn!(path = %path, "Config file not found, using defaults and environment");
        }

        let settings = config::Config::builder()
            .add_source(config::File::new(path, config::FileFormat::Toml).required(false))
            .add_source(
                config::Environment::with_prefix("PULSE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a specific file, without environment overrides.
    pub fn from_file(path: &str) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> AppResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> AppResult<()> {
        if self.base_url.trim().is_empty() {
            return Err(AppError::Config("base_url must not be empty".to_string()));
        }
        if let (Some(url), true) = (&self.push_url, self.push_enabled) {
            PushKind::from_url(url)?;
        }
        if self.flat_stream_key.trim().is_empty() {
            return Err(AppError::Config(
                "flat_stream_key must not be empty".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for list in &self.lists {
            if !names.insert(list.name.as_str()) {
                return Err(AppError::Config(format!("duplicate list name: {}", list.name)));
            }
            if list.limit == 0 {
                return Err(AppError::Config(format!("list {} has limit 0", list.name)));
            }
        }
        for stream in &self.streams {
            if !names.insert(stream.key.as_str()) {
                return Err(AppError::Config(format!(
                    "stream key {} collides with another list or stream",
                    stream.key
                )));
            }
        }
        Ok(())
    }

    pub fn list(&self, name: &str) -> Option<&ListSpec> {
        self.lists.iter().find(|l| l.name == name)
    }

    /// Endpoints polled during fallback, keyed by list name or stream key.
    pub fn poll_endpoints(&self) -> Vec<PollEndpoint> {
        let lists = self
            .lists
            .iter()
            .filter_map(|l| l.endpoint.as_ref().map(|path| PollEndpoint::new(&l.name, path)));
        let streams = self
            .streams
            .iter()
            .map(|s| PollEndpoint::new(&s.key, &s.endpoint));
        lists.chain(streams).collect()
    }

    /// Transport configuration: device tuning, then explicit overrides.
    pub fn connection_config(&self) -> ConnectionConfig {
        let tuning = self.device.tuning();
        let overrides = &self.transport;
        let defaults = ConnectionConfig::default();

        ConnectionConfig {
            base_url: self.base_url.clone(),
            push_url: self.push_url.clone(),
            push_enabled: self.push_enabled,
            max_reconnect_attempts: overrides
                .max_reconnect_attempts
                .unwrap_or(tuning.max_reconnect_attempts),
            reconnect_base_delay_ms: overrides
                .reconnect_base_delay_ms
                .unwrap_or(tuning.reconnect_base_delay_ms),
            reconnect_max_delay_ms: overrides
                .reconnect_max_delay_ms
                .unwrap_or(tuning.reconnect_max_delay_ms),
            stale_after_ms: overrides.stale_after_ms.unwrap_or(defaults.stale_after_ms),
            poll_on_degraded: overrides
                .poll_on_degraded
                .unwrap_or(defaults.poll_on_degraded),
            poll_interval_ms: overrides.poll_interval_ms.unwrap_or(tuning.poll_interval_ms),
            poll_jitter_ms: overrides.poll_jitter_ms.unwrap_or(defaults.poll_jitter_ms),
            request_timeout_ms: overrides
                .request_timeout_ms
                .unwrap_or(tuning.request_timeout_ms),
            connect_timeout_ms: overrides
                .connect_timeout_ms
                .unwrap_or(defaults.connect_timeout_ms),
            poll_endpoints: self.poll_endpoints(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = AppConfig::from_toml_str("").unwrap();
        assert_eq!(config.base_url, "http://localhost:5001");
        assert!(config.push_enabled);
        assert_eq!(config.device, DeviceProfile::Desktop);
        assert_eq!(config.lists.len(), 3);
        assert_eq!(config.list("losers_3m").unwrap().variant, MoverVariant::Losers);
        assert_eq!(config.poll_endpoints().len(), 5);
    }

    #[test]
    fn test_mobile_profile_is_more_patient() {
        let desktop = AppConfig::default().connection_config();
        let mobile = AppConfig {
            device: DeviceProfile::Mobile,
            ..AppConfig::default()
        }
        .connection_config();

        assert!(mobile.request_timeout_ms > desktop.request_timeout_ms);
        assert!(mobile.poll_interval_ms > desktop.poll_interval_ms);
        assert!(mobile.reconnect_base_delay_ms > desktop.reconnect_base_delay_ms);
    }

    #[test]
    fn test_overrides_beat_device_tuning() {
        let config = AppConfig::from_toml_str(
            r#"
            device = "mobile"
            [transport]
            poll_interval_ms = 3000
            max_reconnect_attempts = 0
            "#,
        )
        .unwrap();
        let conn = config.connection_config();
        assert_eq!(conn.poll_interval_ms, 3000);
        assert_eq!(conn.max_reconnect_attempts, 0);
        assert_eq!(conn.request_timeout_ms, 15_000);
    }

    #[test]
    fn test_custom_lists() {
        let config = AppConfig::from_toml_str(
            r#"
            unit_hint = "fraction"
            streams = []

            [[lists]]
            name = "top"
            keys = ["t1m"]
            limit = 5

            [[lists]]
            name = "bottom"
            variant = "losers"
            endpoint = "/api/bottom"
            continuity = false
            "#,
        )
        .unwrap();

        assert_eq!(config.unit_hint, UnitHint::Fraction);
        let top = config.list("top").unwrap();
        assert_eq!(top.limit, 5);
        assert!(top.reads("t1m") && top.reads("top") && !top.reads("t3m"));

        let bottom = config.list("bottom").unwrap();
        assert_eq!(bottom.rank_options().variant, MoverVariant::Losers);
        assert!(!bottom.continuity);

        let endpoints = config.poll_endpoints();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].key, "bottom");
    }

    #[test]
    fn test_validation_errors() {
        let dup = r#"
            [[lists]]
            name = "a"
            [[lists]]
            name = "a"
        "#;
        assert!(matches!(AppConfig::from_toml_str(dup), Err(AppError::Config(_))));

        let zero = r#"
            [[lists]]
            name = "a"
            limit = 0
        "#;
        assert!(AppConfig::from_toml_str(zero).is_err());

        assert!(AppConfig::from_toml_str(r#"push_url = "ftp://x""#).is_err());
        // A bad URL does not matter once push is disabled.
        assert!(AppConfig::from_toml_str("push_url = \"ftp://x\"\npush_enabled = false").is_ok());
        assert!(matches!(
            AppConfig::from_toml_str("device = \"tablet\""),
            Err(AppError::Toml(_))
        ));
    }

    #[test]
    fn test_device_from_str() {
        assert_eq!("Mobile".parse::<DeviceProfile>().unwrap(), DeviceProfile::Mobile);
        assert!("tablet".parse::<DeviceProfile>().is_err());
    }

    #[test]
    fn test_load_file_with_env_override() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pulse.toml");
        std::fs::write(
            &path,
            "base_url = \"http://file:1\"\nmetrics_log_interval_secs = 5\n",
        )
        .unwrap();

        std::env::set_var("PULSE__METRICS_LOG_INTERVAL_SECS", "7");
        let config = AppConfig::load(path.to_str().unwrap());
        std::env::remove_var("PULSE__METRICS_LOG_INTERVAL_SECS");

        let config = config.unwrap();
        assert_eq!(config.base_url, "http://file:1");
        assert_eq!(config.metrics_log_interval_secs, 7);
        assert_eq!(config.lists.len(), 3);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = AppConfig::load("/nonexistent/pulse.toml").unwrap();
        assert_eq!(config.flat_stream_key, "t1m");
    }
}
