//! TOML Configuration File Support
//!
//! Client configuration loaded from `~/.config/flowchat/client.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [api]
//! base_url = "https://flows.example.com"
//! connect_timeout_ms = 5000
//!
//! [generation]
//! model = "gemini-2.5-flash"
//! temperature = 0.3
//! max_tokens = 4000
//!
//! [streaming]
//! throttle_interval_ms = 50
//! idle_timeout_secs = 120   # 0 disables the idle timeout
//! max_message_length = 32768
//!
//! [retry]
//! max_retries = 3
//! initial_backoff_ms = 100
//! max_backoff_ms = 10000
//! use_jitter = true
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::{RetryPolicy, DEFAULT_BASE_URL, DEFAULT_MAX_TOKENS, DEFAULT_MODEL, DEFAULT_TEMPERATURE};
use crate::streaming::{SessionOptions, DEFAULT_IDLE_TIMEOUT, DEFAULT_THROTTLE_INTERVAL};
use crate::supervisor::DEFAULT_MAX_MESSAGE_LENGTH;

/// Default connect timeout for the backend
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[api]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiToml {
    /// Backend base URL
    pub base_url: Option<String>,

    /// Connection timeout in milliseconds
    pub connect_timeout_ms: Option<u64>,
}

/// `[generation]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationToml {
    /// Model identifier
    pub model: Option<String>,

    /// Sampling temperature
    pub temperature: Option<f32>,

    /// Response token limit
    pub max_tokens: Option<u32>,
}

/// `[streaming]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingToml {
    /// Minimum time between UI updates of one field
    pub throttle_interval_ms: Option<u64>,

    /// Idle timeout in seconds (0 = none)
    pub idle_timeout_secs: Option<u64>,

    /// Maximum user message length in bytes
    pub max_message_length: Option<usize>,
}

/// `[retry]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryToml {
    /// Maximum number of retries
    pub max_retries: Option<u32>,

    /// Initial backoff delay
    pub initial_backoff_ms: Option<u64>,

    /// Maximum backoff delay
    pub max_backoff_ms: Option<u64>,

    /// Add jitter to backoff
    pub use_jitter: Option<bool>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientToml {
    /// `[api]`
    pub api: ApiToml,

    /// `[generation]`
    pub generation: GenerationToml,

    /// `[streaming]`
    pub streaming: StreamingToml,

    /// `[retry]`
    pub retry: RetryToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Bearer token that never shows up in logs
#[derive(Clone, PartialEq, Eq)]
pub struct ApiToken(String);

impl ApiToken {
    /// Wrap a token
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Raw token value
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for ApiToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiToken(<redacted>)")
    }
}

/// Resolved client configuration
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Backend base URL
    pub base_url: String,

    /// Bearer token (environment only)
    pub api_token: Option<ApiToken>,

    /// Connection timeout
    pub connect_timeout: Duration,

    /// Model identifier
    pub model: String,

    /// Sampling temperature
    pub temperature: f32,

    /// Response token limit
    pub max_tokens: u32,

    /// Minimum time between UI updates of one field
    pub throttle_interval: Duration,

    /// Give up on a silent stream after this long
    pub idle_timeout: Option<Duration>,

    /// Maximum user message length in bytes
    pub max_message_length: usize,

    /// Retry policy for opening streams
    pub retry: RetryPolicy,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_token: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            throttle_interval: DEFAULT_THROTTLE_INTERVAL,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
            retry: RetryPolicy::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl ClientConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Session tuning derived from this configuration
    #[must_use]
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            throttle_interval: self.throttle_interval,
            idle_timeout: self.idle_timeout,
        }
    }

    /// Check that the values are usable
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ConfigError::ValidationError(format!(
                "base_url must be an http(s) URL, got {:?}",
                self.base_url
            )));
        }
        if self.throttle_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "throttle_interval_ms must be greater than zero".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::ValidationError(format!(
                "temperature must be within 0.0-2.0, got {}",
                self.temperature
            )));
        }
        if self.max_message_length == 0 {
            return Err(ConfigError::ValidationError(
                "max_message_length must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/flowchat/client.toml` or
/// `~/.config/flowchat/client.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("flowchat").join("client.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<ClientConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path plus the process environment
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<ClientConfig, ConfigError> {
    load_config_with_env(path, |name| std::env::var(name).ok())
}

/// Load configuration, reading environment variables through `env`
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_with_env(
    path: Option<PathBuf>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<ClientConfig, ConfigError> {
    // Start with defaults
    let mut config = ClientConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: ClientToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    // Environment overrides file values
    apply_env_config(&mut config, env);

    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut ClientConfig, toml: &ClientToml) {
    // API settings
    if let Some(ref url) = toml.api.base_url {
        config.base_url = url.clone();
    }
    if let Some(timeout) = toml.api.connect_timeout_ms {
        config.connect_timeout = Duration::from_millis(timeout);
    }

    // Generation settings
    if let Some(ref model) = toml.generation.model {
        config.model = model.clone();
    }
    if let Some(temperature) = toml.generation.temperature {
        config.temperature = temperature;
    }
    if let Some(max_tokens) = toml.generation.max_tokens {
        config.max_tokens = max_tokens;
    }

    // Streaming settings
    if let Some(interval) = toml.streaming.throttle_interval_ms {
        config.throttle_interval = Duration::from_millis(interval);
    }
    if let Some(secs) = toml.streaming.idle_timeout_secs {
        config.idle_timeout = idle_timeout_from_secs(secs);
    }
    if let Some(length) = toml.streaming.max_message_length {
        config.max_message_length = length;
    }

    // Retry settings
    if let Some(retries) = toml.retry.max_retries {
        config.retry.max_retries = retries;
    }
    if let Some(ms) = toml.retry.initial_backoff_ms {
        config.retry.initial_backoff_ms = ms;
    }
    if let Some(ms) = toml.retry.max_backoff_ms {
        config.retry.max_backoff_ms = ms;
    }
    if let Some(jitter) = toml.retry.use_jitter {
        config.retry.use_jitter = jitter;
    }
}

/// Apply environment variable overrides to the config
fn apply_env_config(config: &mut ClientConfig, env: impl Fn(&str) -> Option<String>) {
    if let Some(url) = env("FLOWCHAT_API_URL") {
        config.base_url = url;
        config.source = ConfigSource::Env;
    }
    if let Some(token) = env("FLOWCHAT_API_TOKEN").filter(|t| !t.trim().is_empty()) {
        config.api_token = Some(ApiToken::new(token));
        config.source = ConfigSource::Env;
    }
    if let Some(model) = env("FLOWCHAT_MODEL") {
        config.model = model;
        config.source = ConfigSource::Env;
    }
    if let Some(temperature) = env("FLOWCHAT_TEMPERATURE") {
        if let Ok(t) = temperature.parse::<f32>() {
            config.temperature = t;
            config.source = ConfigSource::Env;
        }
    }
    if let Some(max_tokens) = env("FLOWCHAT_MAX_TOKENS") {
        if let Ok(n) = max_tokens.parse::<u32>() {
            config.max_tokens = n;
            config.source = ConfigSource::Env;
        }
    }
    if let Some(interval) = env("FLOWCHAT_THROTTLE_MS") {
        if let Ok(ms) = interval.parse::<u64>() {
            config.throttle_interval = Duration::from_millis(ms);
            config.source = ConfigSource::Env;
        }
    }
    if let Some(idle) = env("FLOWCHAT_IDLE_TIMEOUT_SECS") {
        if let Ok(secs) = idle.parse::<u64>() {
            config.idle_timeout = idle_timeout_from_secs(secs);
            config.source = ConfigSource::Env;
        }
    }
    if let Some(retries) = env("FLOWCHAT_MAX_RETRIES") {
        if let Ok(n) = retries.parse::<u32>() {
            config.retry.max_retries = n;
            config.source = ConfigSource::Env;
        }
    }
}

fn idle_timeout_from_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Base URL override
    pub base_url: Option<String>,

    /// Model override
    pub model: Option<String>,

    /// Temperature override
    pub temperature: Option<f32>,

    /// Idle timeout override (seconds, 0 = none)
    pub idle_timeout_secs: Option<u64>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set base URL override
    #[must_use]
    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = Some(url);
        self
    }

    /// Set model override
    #[must_use]
    pub fn with_model(mut self, model: String) -> Self {
        self.model = Some(model);
        self
    }

    /// Set temperature override
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set idle timeout override
    #[must_use]
    pub fn with_idle_timeout_secs(mut self, secs: u64) -> Self {
        self.idle_timeout_secs = Some(secs);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut ClientConfig) {
        if self.base_url.is_some()
            || self.model.is_some()
            || self.temperature.is_some()
            || self.idle_timeout_secs.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(ref url) = self.base_url {
            config.base_url = url.clone();
        }
        if let Some(ref model) = self.model {
            config.model = model.clone();
        }
        if let Some(temperature) = self.temperature {
            config.temperature = temperature;
        }
        if let Some(secs) = self.idle_timeout_secs {
            config.idle_timeout = idle_timeout_from_secs(secs);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    fn write_toml(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    // =========================================================================
    // Default Configuration Tests
    // =========================================================================

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();

        assert_eq!(config.base_url, "http://localhost:8000");
        assert_eq!(config.model, "gemini-2.5-flash");
        assert_eq!(config.temperature, 0.3);
        assert_eq!(config.max_tokens, 4000);
        assert_eq!(config.throttle_interval, Duration::from_millis(50));
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(120)));
        assert_eq!(config.max_message_length, 32768);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_path() {
        if let Some(p) = default_config_path() {
            assert!(p.ends_with("flowchat/client.toml"));
        }
    }

    // =========================================================================
    // TOML Parsing Tests
    // =========================================================================

    #[test]
    fn test_parse_valid_toml() {
        let file = write_toml(
            r#"
[api]
base_url = "https://flows.example.com"
connect_timeout_ms = 2500

[generation]
model = "custom-model"
temperature = 0.7
max_tokens = 1024

[streaming]
throttle_interval_ms = 16
idle_timeout_secs = 0
max_message_length = 100

[retry]
max_retries = 5
use_jitter = false
"#,
        );

        let config = load_config_with_env(Some(file.path().to_path_buf()), no_env).unwrap();

        assert_eq!(config.base_url, "https://flows.example.com");
        assert_eq!(config.connect_timeout, Duration::from_millis(2500));
        assert_eq!(config.model, "custom-model");
        assert_eq!(config.temperature, 0.7);
        assert_eq!(config.max_tokens, 1024);
        assert_eq!(config.throttle_interval, Duration::from_millis(16));
        assert_eq!(config.idle_timeout, None);
        assert_eq!(config.max_message_length, 100);
        assert_eq!(config.retry.max_retries, 5);
        assert!(!config.retry.use_jitter);
        assert_eq!(config.retry.initial_backoff_ms, 100);
        assert_eq!(config.source(), ConfigSource::File);
        assert_eq!(config.config_file_path, Some(file.path().to_path_buf()));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let file = write_toml("[generation]\nmodel = \"m\"\n");
        let config = load_config_with_env(Some(file.path().to_path_buf()), no_env).unwrap();

        assert_eq!(config.model, "m");
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.throttle_interval, DEFAULT_THROTTLE_INTERVAL);
    }

    #[test]
    fn test_invalid_toml() {
        let file = write_toml("[generation\nmodel = ");
        let result = load_config_with_env(Some(file.path().to_path_buf()), no_env);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            load_config_with_env(Some(dir.path().join("absent.toml")), no_env).unwrap();
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.config_file_path.is_none());
    }

    // =========================================================================
    // Environment Tests
    // =========================================================================

    #[test]
    fn test_env_overrides_file() {
        let file = write_toml("[generation]\nmodel = \"from-file\"\n");
        let env = env_from(&[
            ("FLOWCHAT_MODEL", "from-env"),
            ("FLOWCHAT_API_TOKEN", "secret"),
            ("FLOWCHAT_THROTTLE_MS", "25"),
            ("FLOWCHAT_IDLE_TIMEOUT_SECS", "0"),
            ("FLOWCHAT_MAX_RETRIES", "not-a-number"),
        ]);

        let config = load_config_with_env(Some(file.path().to_path_buf()), env).unwrap();

        assert_eq!(config.model, "from-env");
        assert_eq!(config.api_token.as_ref().map(ApiToken::expose), Some("secret"));
        assert_eq!(config.throttle_interval, Duration::from_millis(25));
        assert_eq!(config.idle_timeout, None);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.source(), ConfigSource::Env);
        assert!(!format!("{config:?}").contains("secret"));
    }

    // =========================================================================
    // Overrides and Validation
    // =========================================================================

    #[test]
    fn test_cli_overrides() {
        let mut config = ClientConfig::default();
        ConfigOverrides::new()
            .with_model("cli-model".to_string())
            .with_idle_timeout_secs(30)
            .apply(&mut config);

        assert_eq!(config.model, "cli-model");
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.source(), ConfigSource::Cli);

        let mut untouched = ClientConfig::default();
        ConfigOverrides::new().apply(&mut untouched);
        assert_eq!(untouched.source(), ConfigSource::Default);
    }

    #[test]
    fn test_validation() {
        let mut config = ClientConfig::default();
        config.base_url = "ftp://example.com".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));

        let mut config = ClientConfig::default();
        config.throttle_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.temperature = 2.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_session_options() {
        let mut config = ClientConfig::default();
        config.idle_timeout = None;
        let options = config.session_options();
        assert_eq!(options.throttle_interval, DEFAULT_THROTTLE_INTERVAL);
        assert_eq!(options.idle_timeout, None);
    }
}
