use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub const ENV_POLL_INTERVAL_MS: &str = "CLOUD_AGENT_POLL_INTERVAL_MS";
pub const ENV_ERROR_POLL_INTERVAL_MS: &str = "CLOUD_AGENT_ERROR_POLL_INTERVAL_MS";
pub const ENV_MAX_POLL_DURATION_SECS: &str = "CLOUD_AGENT_MAX_POLL_DURATION_SECS";
pub const ENV_MAX_MESSAGES: &str = "CLOUD_AGENT_MAX_MESSAGES";
pub const ENV_PREFETCH_STAGGER_MS: &str = "CLOUD_AGENT_PREFETCH_STAGGER_MS";
pub const ENV_PREFETCH_WARM_LIMIT: &str = "CLOUD_AGENT_PREFETCH_WARM_LIMIT";
pub const ENV_PREFETCH_CAPACITY: &str = "CLOUD_AGENT_PREFETCH_CAPACITY";
pub const ENV_METADATA_BATCH_SIZE: &str = "CLOUD_AGENT_METADATA_BATCH_SIZE";
pub const ENV_METADATA_BATCH_DELAY_MS: &str = "CLOUD_AGENT_METADATA_BATCH_DELAY_MS";
pub const ENV_CREDENTIAL_PATH: &str = "CLOUD_AGENT_CREDENTIAL_PATH";

const CREDENTIAL_DIR: &str = "cloud-agent";
const CREDENTIAL_FILE: &str = "credential.json";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: &'static str, message: String },
    #[error("{key} must be greater than zero")]
    MustBePositive { key: &'static str },
    #[error("no configuration directory available; set CLOUD_AGENT_CREDENTIAL_PATH")]
    NoConfigDir,
}

/// Timing and sizing knobs for the synchronizer, prefetch cache and
/// registry enrichment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub poll_interval: Duration,
    /// Used for the next sleep after a refresh that produced an error.
    pub error_poll_interval: Duration,
    /// Wall-clock ceiling for one poll loop; polling pauses once reached.
    pub max_poll_duration: Duration,
    /// Held conversation size before the oldest messages are retired.
    pub max_messages: usize,
    pub prefetch_stagger: Duration,
    pub prefetch_warm_limit: usize,
    /// Conversations the prefetch cache holds before evicting.
    pub prefetch_capacity: usize,
    pub metadata_batch_size: usize,
    pub metadata_batch_delay: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1_500),
            error_poll_interval: Duration::from_millis(3_000),
            max_poll_duration: Duration::from_secs(2 * 60 * 60),
            max_messages: 5_000,
            prefetch_stagger: Duration::from_millis(300),
            prefetch_warm_limit: 5,
            prefetch_capacity: crate::prefetch::DEFAULT_CACHE_CAPACITY,
            metadata_batch_size: 5,
            metadata_batch_delay: Duration::from_millis(250),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            poll_interval: env_millis(ENV_POLL_INTERVAL_MS, defaults.poll_interval)?,
            error_poll_interval: env_millis(
                ENV_ERROR_POLL_INTERVAL_MS,
                defaults.error_poll_interval,
            )?,
            max_poll_duration: env_parse::<u64>(ENV_MAX_POLL_DURATION_SECS)?
                .map_or(defaults.max_poll_duration, Duration::from_secs),
            max_messages: env_positive(ENV_MAX_MESSAGES, defaults.max_messages)?,
            prefetch_stagger: env_millis(ENV_PREFETCH_STAGGER_MS, defaults.prefetch_stagger)?,
            prefetch_warm_limit: env_parse::<usize>(ENV_PREFETCH_WARM_LIMIT)?
                .unwrap_or(defaults.prefetch_warm_limit),
            prefetch_capacity: env_positive(ENV_PREFETCH_CAPACITY, defaults.prefetch_capacity)?,
            metadata_batch_size: env_positive(
                ENV_METADATA_BATCH_SIZE,
                defaults.metadata_batch_size,
            )?,
            metadata_batch_delay: env_millis(
                ENV_METADATA_BATCH_DELAY_MS,
                defaults.metadata_batch_delay,
            )?,
        })
    }
}

/// Where the credential file lives: the env override if set, otherwise
/// `<config dir>/cloud-agent/credential.json`.
pub fn resolve_credential_path() -> Result<PathBuf, ConfigError> {
    if let Some(path) = env_non_empty(ENV_CREDENTIAL_PATH) {
        return Ok(PathBuf::from(path));
    }
    dirs::config_dir()
        .map(|dir| dir.join(CREDENTIAL_DIR).join(CREDENTIAL_FILE))
        .ok_or(ConfigError::NoConfigDir)
}

fn env_millis(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(env_parse::<u64>(key)?.map_or(default, Duration::from_millis))
}

fn env_positive(key: &'static str, default: usize) -> Result<usize, ConfigError> {
    match env_parse::<usize>(key)? {
        Some(0) => Err(ConfigError::MustBePositive { key }),
        Some(value) => Ok(value),
        None => Ok(default),
    }
}

fn env_parse<T>(key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    env_non_empty(key)
        .map(|raw| {
            raw.parse::<T>().map_err(|error| ConfigError::InvalidValue {
                key,
                message: error.to_string(),
            })
        })
        .transpose()
}

fn env_non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
