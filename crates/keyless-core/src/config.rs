//! Application configuration management.
//!
//! Handles loading and validating the keyless configuration including:
//! - Controller identity and cloud endpoint
//! - GATT identifiers and the advertisement vendor id
//! - Signal-strength threshold, poll and scan intervals
//! - Retry, backoff, and failsafe timings
//! - Local status API and lock actuator settings
//!
//! Configuration is layered with the `config` crate: built-in defaults, then
//! the TOML file, then `KEYLESS__SECTION__KEY` environment variables.
//! All durations are expressed in milliseconds.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable that overrides the configuration file location.
pub const CONFIG_PATH_ENV: &str = "KEYLESS_CONFIG";

/// Prefix of environment variables that override individual settings.
pub const ENV_PREFIX: &str = "KEYLESS";

static CONTROLLER_ID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("controller id pattern is a valid regex")
});

/// Result alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A source could not be read or deserialized.
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    /// The effective configuration could not be rendered as TOML.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A single field holds an invalid value.
    #[error("invalid value for '{field}': {message}")]
    ValidationError {
        /// Dotted path of the offending field.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields are invalid.
    #[error("{} configuration problems found", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),
}

impl ConfigError {
    fn invalid(field: &str, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Returns `true` if `id` is usable as a controller id in cloud URLs.
#[must_use]
pub fn is_valid_controller_id(id: &str) -> bool {
    CONTROLLER_ID_PATTERN.is_match(id)
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Controller identity.
    pub controller: ControllerConfig,
    /// Cloud service endpoint and timeouts.
    pub cloud: CloudConfig,
    /// Radio identifiers.
    pub radio: RadioConfig,
    /// Advertisement scanning.
    pub scan: ScanSettings,
    /// Challenge-response authentication.
    pub auth: AuthConfig,
    /// Proximity re-verification.
    pub proximity: ProximityConfig,
    /// Remote override channel.
    pub remote: RemoteConfig,
    /// Delays between session loop iterations.
    pub backoff: BackoffConfig,
    /// Session-level fault policy.
    pub session: SessionConfig,
    /// Local status HTTP API.
    pub status_api: StatusApiConfig,
    /// Lock output driver.
    pub actuator: ActuatorConfig,
}

/// Controller identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Id of this controller (RCU) as registered with the cloud service.
    pub rcu_id: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            rcu_id: "A116G61".to_string(),
        }
    }
}

/// Cloud service endpoint and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// Base URL, without the `/api` suffix.
    pub base_url: String,
    /// TCP/TLS connect timeout for every cloud call.
    pub connect_timeout_ms: u64,
    /// Total timeout for request/response calls (not push streams).
    pub request_timeout_ms: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            base_url: "http://10.42.0.1:8080".to_string(),
            connect_timeout_ms: 5_000,
            request_timeout_ms: 10_000,
        }
    }
}

impl CloudConfig {
    /// Connect timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Request timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Radio identifiers shared with the mobile app.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    /// Adapter name (e.g. `hci0`); the default adapter when unset.
    pub adapter: Option<String>,
    /// Manufacturer id carried in the advertisements of authorized devices.
    pub vendor_id: u16,
    /// Authentication GATT service.
    pub service_uuid: String,
    /// Characteristic the challenge is written to.
    pub challenge_char_uuid: String,
    /// Characteristic the response is read from or notified on.
    pub response_char_uuid: String,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            adapter: None,
            vendor_id: 0xFFFF,
            service_uuid: "0000aaa0-0000-1000-8000-aabbccddeeff".to_string(),
            challenge_char_uuid: "0000aaa2-0000-1000-8000-aabbccddeeff".to_string(),
            response_char_uuid: "0000aaa1-0000-1000-8001-aabbccddeeff".to_string(),
        }
    }
}

/// Advertisement scanning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    /// Length of one observation window.
    pub window_ms: u64,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self { window_ms: 10_000 }
    }
}

impl ScanSettings {
    /// Observation window.
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Challenge-response authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// How long the phone gets to answer a challenge.
    pub response_timeout_ms: u64,
    /// Attempts per session when the transport fails.
    pub max_attempts: u32,
    /// Pause between transport retries.
    pub retry_delay_ms: u64,
    /// Append the controller id to the nonce in the challenge payload.
    pub append_controller_id: bool,
    /// Hex token accepted as a response suffix from unprovisioned test
    /// devices. `None` disables the fallback.
    pub fallback_token: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 10_000,
            max_attempts: 3,
            retry_delay_ms: 1_000,
            append_controller_id: false,
            fallback_token: Some("deadbeef".to_string()),
        }
    }
}

impl AuthConfig {
    /// Response timeout.
    #[must_use]
    pub const fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Delay between transport retries.
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Decoded fallback token, if enabled and valid.
    #[must_use]
    pub fn fallback_token_bytes(&self) -> Option<Vec<u8>> {
        self.fallback_token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .and_then(|t| hex::decode(t.trim()).ok())
    }
}

/// Proximity re-verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProximityConfig {
    /// Samples strictly above this value (dBm) count as "near".
    pub rssi_threshold: i16,
    /// Pause between samples.
    pub poll_interval_ms: u64,
    /// Observation window of a single sample.
    pub sample_window_ms: u64,
    /// Consecutive weak or missing samples that mean the device left.
    pub miss_limit: u32,
    /// Consecutive sampling errors that mean the radio stack is faulty.
    pub fault_limit: u32,
    /// Wait for a strong sample (and the unlock acknowledgment) before the
    /// first unlock of a session.
    pub gate_before_unlock: bool,
}

impl Default for ProximityConfig {
    fn default() -> Self {
        Self {
            rssi_threshold: -80,
            poll_interval_ms: 3_000,
            sample_window_ms: 2_000,
            miss_limit: 5,
            fault_limit: 3,
            gate_before_unlock: false,
        }
    }
}

impl ProximityConfig {
    /// Poll interval.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Sample window.
    #[must_use]
    pub const fn sample_window(&self) -> Duration {
        Duration::from_millis(self.sample_window_ms)
    }
}

/// Remote override channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Pause before reconnecting a lost push stream.
    pub reconnect_delay_ms: u64,
    /// Channel outage after which the machine is force-locked.
    pub failsafe_timeout_ms: u64,
    /// A stream that delivers nothing for this long counts as lost.
    pub idle_timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 2_000,
            failsafe_timeout_ms: 30_000,
            idle_timeout_ms: 60_000,
        }
    }
}

impl RemoteConfig {
    /// Reconnect delay.
    #[must_use]
    pub const fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Failsafe timeout.
    #[must_use]
    pub const fn failsafe_timeout(&self) -> Duration {
        Duration::from_millis(self.failsafe_timeout_ms)
    }

    /// Idle read timeout.
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// Delays between session loop iterations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// After the registry was empty or unreachable.
    pub registry_retry_ms: u64,
    /// After a scan window without a match.
    pub no_match_ms: u64,
    /// After a failed authentication.
    pub auth_failure_ms: u64,
    /// After re-locking, before scanning again.
    pub after_relock_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            registry_retry_ms: 5_000,
            no_match_ms: 2_000,
            auth_failure_ms: 3_000,
            after_relock_ms: 1_000,
        }
    }
}

impl BackoffConfig {
    /// Registry retry delay.
    #[must_use]
    pub const fn registry_retry(&self) -> Duration {
        Duration::from_millis(self.registry_retry_ms)
    }

    /// No-match delay.
    #[must_use]
    pub const fn no_match(&self) -> Duration {
        Duration::from_millis(self.no_match_ms)
    }

    /// Authentication failure delay.
    #[must_use]
    pub const fn auth_failure(&self) -> Duration {
        Duration::from_millis(self.auth_failure_ms)
    }

    /// Post-relock delay.
    #[must_use]
    pub const fn after_relock(&self) -> Duration {
        Duration::from_millis(self.after_relock_ms)
    }
}

/// Session-level fault policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Consecutive sessions whose authentication got no answer at all
    /// before the radio stack is reset.
    pub radio_fault_limit: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            radio_fault_limit: 3,
        }
    }
}

/// Local status HTTP API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusApiConfig {
    /// Serve the API at all.
    pub enabled: bool,
    /// Listen address.
    pub bind: String,
}

impl Default for StatusApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1:8090".to_string(),
        }
    }
}

/// How the lock output is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActuatorKind {
    /// Run the gateway's I/O tool.
    Command,
    /// Log the requested state only.
    DryRun,
}

/// Lock output driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActuatorConfig {
    /// Driver kind.
    pub kind: ActuatorKind,
    /// I/O tool executable.
    pub program: String,
    /// Digital output number.
    pub output: u8,
    /// Output level meaning "locked".
    pub locked_level: u8,
    /// Output level meaning "unlocked".
    pub unlocked_level: u8,
    /// Time limit for one invocation of the tool.
    pub timeout_ms: u64,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            kind: ActuatorKind::Command,
            program: "Test_owa4x".to_string(),
            output: 6,
            locked_level: 1,
            unlocked_level: 0,
            timeout_ms: 5_000,
        }
    }
}

impl ActuatorConfig {
    /// Invocation timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Config {
    /// Load configuration from the default location, or from the file named
    /// by `KEYLESS_CONFIG`, with environment overrides applied.
    ///
    /// A missing file is not an error; defaults are used.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or validation fails.
    pub fn load() -> ConfigResult<Self> {
        let path = std::env::var_os(CONFIG_PATH_ENV)
            .map_or_else(Self::default_path, PathBuf::from);
        Self::load_from(&path)
    }

    /// Load configuration from `path` with environment overrides applied.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or validation fails.
    pub fn load_from(path: &Path) -> ConfigResult<Self> {
        let settings = ::config::Config::builder()
            .add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        // On the gateway: /etc/keyless/config.toml
        // For development: ~/.config/keyless/config.toml
        #[cfg(target_os = "linux")]
        {
            PathBuf::from("/etc/keyless/config.toml")
        }
        #[cfg(not(target_os = "linux"))]
        {
            directories::ProjectDirs::from("", "", "keyless").map_or_else(
                || PathBuf::from("keyless.toml"),
                |dirs| dirs.config_dir().join("config.toml"),
            )
        }
    }

    /// Render the configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check every field, collecting all problems.
    ///
    /// # Errors
    ///
    /// Returns the single problem found, or
    /// [`ConfigError::MultipleValidationErrors`] if there are several.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();

        if !is_valid_controller_id(&self.controller.rcu_id) {
            errors.push(ConfigError::invalid(
                "controller.rcu_id",
                "must be 1-64 characters of A-Z, a-z, 0-9, '_' or '-'",
            ));
        }

        match url::Url::parse(&self.cloud.base_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => errors.push(ConfigError::invalid(
                "cloud.base_url",
                format!("unsupported scheme '{}'", url.scheme()),
            )),
            Err(e) => errors.push(ConfigError::invalid("cloud.base_url", e.to_string())),
        }

        for (field, value) in [
            ("radio.service_uuid", &self.radio.service_uuid),
            ("radio.challenge_char_uuid", &self.radio.challenge_char_uuid),
            ("radio.response_char_uuid", &self.radio.response_char_uuid),
        ] {
            if let Err(e) = uuid::Uuid::parse_str(value) {
                errors.push(ConfigError::invalid(field, e.to_string()));
            }
        }

        for (field, value) in [
            ("cloud.connect_timeout_ms", self.cloud.connect_timeout_ms),
            ("cloud.request_timeout_ms", self.cloud.request_timeout_ms),
            ("scan.window_ms", self.scan.window_ms),
            ("auth.response_timeout_ms", self.auth.response_timeout_ms),
            ("proximity.poll_interval_ms", self.proximity.poll_interval_ms),
            ("proximity.sample_window_ms", self.proximity.sample_window_ms),
            ("remote.failsafe_timeout_ms", self.remote.failsafe_timeout_ms),
            ("remote.idle_timeout_ms", self.remote.idle_timeout_ms),
            ("actuator.timeout_ms", self.actuator.timeout_ms),
        ] {
            if value == 0 {
                errors.push(ConfigError::invalid(field, "must be greater than zero"));
            }
        }

        for (field, value) in [
            ("auth.max_attempts", self.auth.max_attempts),
            ("proximity.miss_limit", self.proximity.miss_limit),
            ("proximity.fault_limit", self.proximity.fault_limit),
            ("session.radio_fault_limit", self.session.radio_fault_limit),
        ] {
            if value == 0 {
                errors.push(ConfigError::invalid(field, "must be at least 1"));
            }
        }

        if !(-127..=0).contains(&self.proximity.rssi_threshold) {
            errors.push(ConfigError::invalid(
                "proximity.rssi_threshold",
                "must be between -127 and 0 dBm",
            ));
        }

        if let Some(token) = self.auth.fallback_token.as_deref() {
            let token = token.trim();
            if !token.is_empty() && hex::decode(token).is_err() {
                errors.push(ConfigError::invalid(
                    "auth.fallback_token",
                    "must be an even-length hex string",
                ));
            }
        }

        if self.status_api.enabled && self.status_api.bind.parse::<SocketAddr>().is_err() {
            errors.push(ConfigError::invalid(
                "status_api.bind",
                format!("'{}' is not a socket address", self.status_api.bind),
            ));
        }

        if self.actuator.kind == ActuatorKind::Command && self.actuator.program.trim().is_empty()
        {
            errors.push(ConfigError::invalid(
                "actuator.program",
                "must name an executable when kind = \"command\"",
            ));
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }
}
