//! Configuration management for the consolidation worker
//!
//! Loads settings from environment variables (.env file)

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Visibility polling policy for eventually consistent remote reads
#[derive(Debug, Clone)]
pub struct PollPolicy {
    /// Maximum number of probes before giving up
    pub attempts: u32,
    /// Fixed delay between probes
    pub delay: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_secs(5),
        }
    }
}

/// Application configuration
///
/// All credentials and knobs live here and are handed to components at
/// construction time; no module holds process-wide client state.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the media storage service API
    pub storage_base_url: String,
    /// Storage cloud (tenant) name
    pub storage_cloud: String,
    /// Storage API key
    pub storage_api_key: String,
    /// Storage API secret
    pub storage_api_secret: String,
    /// Path to the sessions database
    pub sessions_db_path: PathBuf,
    /// Local scratch directory for compositing downloads
    pub scratch_dir: PathBuf,
    /// Visibility polling policy
    pub poll: PollPolicy,
    /// Pause between guest concatenation and composition
    pub consistency_pause: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let storage_base_url = env::var("MEDIA_API_BASE")
            .unwrap_or_else(|_| "https://api.mediastore.io".to_string());

        let storage_cloud = require("MEDIA_CLOUD")?;
        let storage_api_key = require("MEDIA_API_KEY")?;
        let storage_api_secret = require("MEDIA_API_SECRET")?;

        let sessions_db_path = env::var("SESSIONS_DB")
            .unwrap_or_else(|_| "sessions.db".to_string())
            .into();

        let scratch_dir = env::var("SCRATCH_DIR")
            .unwrap_or_else(|_| "scratch".to_string())
            .into();

        let poll = PollPolicy {
            attempts: parse_or("VISIBILITY_ATTEMPTS", 10)?,
            delay: Duration::from_secs(parse_or("VISIBILITY_DELAY_SECS", 5)?),
        };

        let consistency_pause = Duration::from_secs(parse_or("CONSISTENCY_PAUSE_SECS", 5)?);

        Ok(Self {
            storage_base_url,
            storage_cloud,
            storage_api_key,
            storage_api_secret,
            sessions_db_path,
            scratch_dir,
            poll,
            consistency_pause,
        })
    }
}

fn require(name: &str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.to_string()))
}

fn parse_or<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(s) if !s.is_empty() => s
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue(name.to_string(), s)),
        _ => Ok(default),
    }
}
