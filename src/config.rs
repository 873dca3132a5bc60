//! Configuration management for loancli.
//!
//! This module handles loading configuration values from environment
//! variables and `.env` files. Unlike a set of global getters, it produces a
//! single [`Config`] value that is threaded explicitly through the client,
//! the fetcher and the pipeline, so tests can point every component at a
//! local mock service.
//!
//! The configuration system follows a hierarchical approach:
//! 1. Command-line flags (applied by the binary on top of the loaded value)
//! 2. Environment variables
//! 3. `.env` file in the local data directory
//! 4. Application defaults

use std::{env, path::PathBuf, time::Duration};

use crate::{Error, Res};

pub const DEFAULT_LIBBY_API_URL: &str = "https://sentry-read.svc.overdrive.com";
pub const DEFAULT_THUNDER_API_URL: &str = "https://thunder.api.overdrive.com/v2";
pub const DEFAULT_USER_AGENT: &str = concat!(
    "Mozilla/5.0 (compatible; ",
    env!("CARGO_PKG_NAME"),
    "/",
    env!("CARGO_PKG_VERSION"),
    ")"
);
pub const SETTINGS_FILE_NAME: &str = "libby.json";

/// Runtime configuration shared by every component.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the Libby service (chip, sync, fulfillment endpoints).
    pub libby_api_url: String,
    /// Base URL of the media metadata service.
    pub thunder_api_url: String,
    /// Directory holding the session store file.
    pub settings_dir: PathBuf,
    /// Number of concurrent asset downloads.
    pub workers: usize,
    /// Attempts per asset before it is reported as failed.
    pub max_attempts: u32,
    /// Base delay of the exponential backoff between attempts.
    pub backoff_base: Duration,
    /// Upper bound for a single backoff delay.
    pub backoff_cap: Duration,
    pub request_timeout: Duration,
    /// How many times the user is asked for a linking code.
    pub code_attempts: u32,
    pub user_agent: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            libby_api_url: DEFAULT_LIBBY_API_URL.to_string(),
            thunder_api_url: DEFAULT_THUNDER_API_URL.to_string(),
            settings_dir: default_settings_dir(),
            workers: 4,
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
            code_attempts: 3,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl Config {
    /// Builds the configuration from environment variables on top of the
    /// defaults. Unparseable numeric values are ignored with a warning.
    ///
    /// # Recognized Variables
    ///
    /// - `LIBBY_API_URL`, `THUNDER_API_URL`
    /// - `LOANCLI_SETTINGS_DIR`
    /// - `LOANCLI_WORKERS`, `LOANCLI_MAX_ATTEMPTS`, `LOANCLI_TIMEOUT_SECS`,
    ///   `LOANCLI_CODE_ATTEMPTS`
    /// - `LOANCLI_USER_AGENT`
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = env::var("LIBBY_API_URL") {
            config.libby_api_url = url;
        }
        if let Ok(url) = env::var("THUNDER_API_URL") {
            config.thunder_api_url = url;
        }
        if let Ok(dir) = env::var("LOANCLI_SETTINGS_DIR") {
            config.settings_dir = PathBuf::from(dir);
        }
        if let Some(workers) = env_number::<usize>("LOANCLI_WORKERS") {
            config.workers = workers.max(1);
        }
        if let Some(attempts) = env_number::<u32>("LOANCLI_MAX_ATTEMPTS") {
            config.max_attempts = attempts.max(1);
        }
        if let Some(secs) = env_number::<u64>("LOANCLI_TIMEOUT_SECS") {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(attempts) = env_number::<u32>("LOANCLI_CODE_ATTEMPTS") {
            config.code_attempts = attempts.max(1);
        }
        if let Ok(agent) = env::var("LOANCLI_USER_AGENT") {
            config.user_agent = agent;
        }
        config
    }

    pub fn with_settings_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.settings_dir = dir.into();
        self
    }

    /// Path of the session store file inside the settings directory.
    pub fn settings_file(&self) -> PathBuf {
        self.settings_dir.join(SETTINGS_FILE_NAME)
    }
}

/// Loads environment variables from a `.env` file in the local data directory.
///
/// Creates the directory structure if it doesn't exist and loads variables
/// from `loancli/.env` under the platform-specific local data directory. A
/// missing file is not an error; the defaults and the process environment
/// still apply.
///
/// # Directory Structure
///
/// - Linux: `~/.local/share/loancli/.env`
/// - macOS: `~/Library/Application Support/loancli/.env`
/// - Windows: `%LOCALAPPDATA%/loancli/.env`
///
/// # Errors
///
/// Returns an error if the parent directory cannot be created or the file
/// exists but cannot be parsed.
pub async fn load_env() -> Res<()> {
    let mut path = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("loancli/.env");
    if let Some(parent) = path.parent() {
        async_fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::io(parent, e))?;
    }

    if !path.exists() {
        return Ok(());
    }

    dotenv::from_path(&path)
        .map_err(|e| Error::InvalidInput(format!("cannot load {}: {}", path.display(), e)))
}

fn default_settings_dir() -> PathBuf {
    let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("loancli");
    path
}

fn env_number<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable configuration value");
            None
        }
    }
}
