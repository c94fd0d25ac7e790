//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/geotrail/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/geotrail/` (~/.config/geotrail/)
//! - Data: `$XDG_DATA_HOME/geotrail/` (~/.local/share/geotrail/)
//! - State/Logs: `$XDG_STATE_HOME/geotrail/` (~/.local/state/geotrail/)

use crate::error::{Error, Result};
use crate::sampler::SampleOptions;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable consulted when `remote.api_key` is not set
pub const API_KEY_ENV: &str = "GEOTRAIL_API_KEY";

/// Lower bound for the background wake interval, mirroring OS schedulers
pub const MIN_WAKE_INTERVAL_SECS: u64 = 15 * 60;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Remote persistence API
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Position sampling policy and provider
    #[serde(default)]
    pub sampler: SamplerConfig,

    /// Foreground capture cadence
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Background agent wake-ups
    #[serde(default)]
    pub agent: AgentConfig,

    /// Connectivity probing
    #[serde(default)]
    pub connectivity: ConnectivityConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Remote location store configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RemoteConfig {
    /// REST root, e.g. `https://project.supabase.co/rest/v1`
    pub base_url: Option<String>,

    /// Static bearer credential (can also use `GEOTRAIL_API_KEY`)
    pub api_key: Option<String>,

    /// HTTP request timeout in seconds
    #[serde(default = "default_remote_timeout")]
    pub timeout_secs: u64,

    /// Max retry attempts for transient failures within one request
    #[serde(default = "default_remote_max_retries")]
    pub max_retries: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            timeout_secs: default_remote_timeout(),
            max_retries: default_remote_max_retries(),
        }
    }
}

impl RemoteConfig {
    /// Check if the remote store is configured well enough to be used
    pub fn is_ready(&self) -> bool {
        self.base_url.is_some() && self.api_key.is_some()
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        let Some(base_url) = &self.base_url else {
            return Err(Error::Config("remote.base_url is required".to_string()));
        };
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(Error::Config(
                "remote.base_url must include http:// or https://".to_string(),
            ));
        }
        if self.api_key.is_none() {
            return Err(Error::Config(format!(
                "remote.api_key is required (or set {API_KEY_ENV})"
            )));
        }
        if self.timeout_secs == 0 {
            return Err(Error::Config(
                "remote.timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Request timeout as a duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_remote_timeout() -> u64 {
    10
}

fn default_remote_max_retries() -> usize {
    2
}

/// Which position provider backs the sampler
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// No geolocation available on this device
    #[default]
    None,
    /// Fixed coordinates from this config
    Static,
    /// External command printing a JSON fix
    Command,
}

/// Sampler configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SamplerConfig {
    /// Provider selection
    #[serde(default)]
    pub provider: ProviderKind,

    /// Ask the provider for its most accurate fix
    #[serde(default = "default_high_accuracy")]
    pub high_accuracy: bool,

    /// Sampling timeout in milliseconds
    #[serde(default = "default_sample_timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum age of a cached fix that may be reused (0 = never)
    #[serde(default)]
    pub max_cache_age_ms: u64,

    /// Static provider latitude
    pub latitude: Option<f64>,

    /// Static provider longitude
    pub longitude: Option<f64>,

    /// Static provider elevation in meters
    pub elevation: Option<f64>,

    /// Command provider argv
    #[serde(default)]
    pub command: Vec<String>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::None,
            high_accuracy: default_high_accuracy(),
            timeout_ms: default_sample_timeout_ms(),
            max_cache_age_ms: 0,
            latitude: None,
            longitude: None,
            elevation: None,
            command: vec![],
        }
    }
}

impl SamplerConfig {
    /// Sampling options derived from this config
    pub fn options(&self) -> SampleOptions {
        SampleOptions {
            high_accuracy: self.high_accuracy,
            timeout: Duration::from_millis(self.timeout_ms),
            max_cache_age: Duration::from_millis(self.max_cache_age_ms),
        }
    }

    /// Validate provider-specific settings
    pub fn validate(&self) -> Result<()> {
        match self.provider {
            ProviderKind::None => {}
            ProviderKind::Static => {
                let (Some(lat), Some(lon)) = (self.latitude, self.longitude) else {
                    return Err(Error::Config(
                        "sampler.latitude and sampler.longitude are required for the static provider"
                            .to_string(),
                    ));
                };
                if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
                    return Err(Error::Config(
                        "sampler coordinates are out of range".to_string(),
                    ));
                }
            }
            ProviderKind::Command => {
                if self.command.is_empty() {
                    return Err(Error::Config(
                        "sampler.command is required for the command provider".to_string(),
                    ));
                }
            }
        }
        if self.timeout_ms == 0 {
            return Err(Error::Config(
                "sampler.timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_high_accuracy() -> bool {
    true
}

fn default_sample_timeout_ms() -> u64 {
    5000
}

/// Foreground capture cadence
#[derive(Debug, Deserialize, Clone)]
pub struct CaptureConfig {
    /// Seconds between foreground captures
    #[serde(default = "default_capture_period")]
    pub period_secs: u64,

    /// Delay the first capture to the next minute boundary
    #[serde(default = "default_align_to_minute")]
    pub align_to_minute: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            period_secs: default_capture_period(),
            align_to_minute: default_align_to_minute(),
        }
    }
}

impl CaptureConfig {
    /// Capture period as a duration (never zero)
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs.max(1))
    }
}

fn default_capture_period() -> u64 {
    60
}

fn default_align_to_minute() -> bool {
    true
}

/// Background agent configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    /// Seconds between periodic background wake-ups (min 900)
    #[serde(default = "default_wake_interval")]
    pub wake_interval_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            wake_interval_secs: default_wake_interval(),
        }
    }
}

impl AgentConfig {
    /// Wake interval, clamped to the minimum the OS would allow
    pub fn wake_interval(&self) -> Duration {
        if self.wake_interval_secs < MIN_WAKE_INTERVAL_SECS {
            tracing::warn!(
                configured = self.wake_interval_secs,
                minimum = MIN_WAKE_INTERVAL_SECS,
                "agent.wake_interval_secs below minimum, clamping"
            );
        }
        Duration::from_secs(self.wake_interval_secs.max(MIN_WAKE_INTERVAL_SECS))
    }
}

fn default_wake_interval() -> u64 {
    MIN_WAKE_INTERVAL_SECS
}

/// Connectivity probing configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ConnectivityConfig {
    /// Seconds between reachability probes
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: default_probe_interval(),
        }
    }
}

impl ConnectivityConfig {
    /// Probe interval as a duration (never zero)
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs.max(1))
    }
}

fn default_probe_interval() -> u64 {
    30
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        let mut config = if config_path.exists() {
            Self::load_from(&config_path)?
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            Config::default()
        };

        config.apply_env();
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Fill credentials from the environment when the file leaves them out
    fn apply_env(&mut self) {
        if self.remote.api_key.is_none() {
            if let Ok(key) = std::env::var(API_KEY_ENV) {
                let key = key.trim().to_string();
                if !key.is_empty() {
                    self.remote.api_key = Some(key);
                }
            }
        }
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/geotrail/config.toml` (~/.config/geotrail/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("geotrail").join("config.toml")
    }

    /// Returns the data directory path (queue and identity)
    ///
    /// `$XDG_DATA_HOME/geotrail/` (~/.local/share/geotrail/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("geotrail")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/geotrail/` (~/.local/state/geotrail/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("geotrail")
    }

    /// Returns the durable queue file path
    ///
    /// `$XDG_DATA_HOME/geotrail/queue.db`
    pub fn queue_path() -> PathBuf {
        Self::data_dir().join("queue.db")
    }

    /// Returns the identity store file path
    ///
    /// `$XDG_DATA_HOME/geotrail/identity.json`
    pub fn identity_path() -> PathBuf {
        Self::data_dir().join("identity.json")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/geotrail/geotrail.log` (~/.local/state/geotrail/geotrail.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("geotrail.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.remote.is_ready());
        assert_eq!(config.sampler.provider, ProviderKind::None);
        assert_eq!(config.sampler.timeout_ms, 5000);
        assert_eq!(config.sampler.max_cache_age_ms, 0);
        assert!(config.sampler.high_accuracy);
        assert_eq!(config.capture.period_secs, 60);
        assert!(config.capture.align_to_minute);
        assert_eq!(config.agent.wake_interval_secs, 900);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[remote]
base_url = "https://project.supabase.co/rest/v1"
api_key = "anon-key"
timeout_secs = 5

[sampler]
provider = "static"
latitude = 15.3736225
longitude = 119.948539
elevation = 12.5

[capture]
period_secs = 30

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert!(config.remote.is_ready());
        assert!(config.remote.validate().is_ok());
        assert_eq!(config.remote.timeout(), Duration::from_secs(5));
        assert_eq!(config.sampler.provider, ProviderKind::Static);
        assert_eq!(config.sampler.elevation, Some(12.5));
        assert!(config.sampler.validate().is_ok());
        assert_eq!(config.capture.period(), Duration::from_secs(30));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_remote_validation() {
        let config = RemoteConfig::default();
        assert!(config.validate().is_err());

        let config = RemoteConfig {
            base_url: Some("project.supabase.co".to_string()),
            api_key: Some("key".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RemoteConfig {
            base_url: Some("https://project.supabase.co/rest/v1".to_string()),
            api_key: None,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(!config.is_ready());
    }

    #[test]
    fn test_sampler_validation() {
        let config = SamplerConfig {
            provider: ProviderKind::Static,
            latitude: Some(95.0),
            longitude: Some(0.0),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SamplerConfig {
            provider: ProviderKind::Command,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        assert!(SamplerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_wake_interval_is_clamped() {
        let config = AgentConfig {
            wake_interval_secs: 60,
        };
        assert_eq!(config.wake_interval(), Duration::from_secs(900));

        let config = AgentConfig {
            wake_interval_secs: 3600,
        };
        assert_eq!(config.wake_interval(), Duration::from_secs(3600));
    }

    #[test]
    fn test_sampler_options() {
        let options = SamplerConfig::default().options();
        assert!(options.high_accuracy);
        assert_eq!(options.timeout, Duration::from_millis(5000));
        assert_eq!(options.max_cache_age, Duration::ZERO);
    }
}
