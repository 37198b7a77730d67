//! Typed configuration from environment variables and an optional tuning file.
//!
//! Loads once at startup and fails fast on malformed values.
//! Sensitive values wrapped in secrecy::SecretString to prevent log leaks.

pub mod secrets;

use crate::error::{Error, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug)]
pub struct Config {
    pub db_path: PathBuf,
    /// Remote endpoint for submissions. Without one the device works offline only.
    pub endpoint: Option<String>,
    pub api_token: Option<SecretString>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub tuning: Tuning,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let tuning = match optional_var("SCANQ_TUNING") {
            Some(path) => Tuning::load(Path::new(&path))?,
            None => Tuning::default(),
        };

        Ok(Self {
            db_path: optional_var("SCANQ_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("scanq.db")),
            endpoint: optional_var("SCANQ_ENDPOINT"),
            api_token: optional_var("SCANQ_API_TOKEN").map(SecretString::from),
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
            log_level: optional_var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            tuning,
        })
    }
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

// ---------------------------------------------------------------------------
// Tuning
// ---------------------------------------------------------------------------

/// Timing and retry constants of the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuning {
    /// How long a lease may stay in `Processing` before the watchdog takes it back.
    pub watchdog_timeout: Duration,
    /// Delay before retry round n is `backoff[min(n, len) - 1]`; one round per step.
    ///
    /// The first pass is a submission too, so with `max_retries = 3` an item
    /// that keeps failing is `Failed` after round 2. Later steps only matter
    /// for items that were queued while the rounds were already running.
    pub backoff: Vec<Duration>,
    /// Retry charges after which an item fails for good.
    pub max_retries: u32,
    /// Deadline the worker puts on each submission.
    pub submit_timeout: Duration,
    /// Minimum spacing between two calls of the same action.
    pub debounce: Duration,
    /// Window in which a repeated scan of the same code is ignored.
    pub duplicate_window: Duration,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            watchdog_timeout: Duration::from_secs(20),
            backoff: vec![
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(15),
            ],
            max_retries: 3,
            submit_timeout: Duration::from_secs(15),
            debounce: Duration::from_millis(300),
            duplicate_window: Duration::from_secs(5),
        }
    }
}

/// TOML shape of [`Tuning`]. Every field is optional; durations in milliseconds.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TuningFile {
    watchdog_timeout_ms: Option<u64>,
    backoff_ms: Option<Vec<u64>>,
    max_retries: Option<u32>,
    submit_timeout_ms: Option<u64>,
    debounce_ms: Option<u64>,
    duplicate_window_ms: Option<u64>,
}

impl Tuning {
    /// Read a TOML tuning file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read tuning file {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("bad tuning file {}: {e}", path.display())))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let file: TuningFile =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        let defaults = Self::default();
        let ms = Duration::from_millis;

        let tuning = Self {
            watchdog_timeout: file
                .watchdog_timeout_ms
                .map_or(defaults.watchdog_timeout, ms),
            backoff: file
                .backoff_ms
                .map_or(defaults.backoff, |v| v.into_iter().map(ms).collect()),
            max_retries: file.max_retries.unwrap_or(defaults.max_retries),
            submit_timeout: file.submit_timeout_ms.map_or(defaults.submit_timeout, ms),
            debounce: file.debounce_ms.map_or(defaults.debounce, ms),
            duplicate_window: file
                .duplicate_window_ms
                .map_or(defaults.duplicate_window, ms),
        };
        tuning.validate()?;
        Ok(tuning)
    }

    /// Reject combinations the queue cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.backoff.is_empty() {
            return Err(Error::Config("backoff schedule must not be empty".to_string()));
        }
        if self.max_retries == 0 {
            return Err(Error::Config("max_retries must be at least 1".to_string()));
        }
        if self.submit_timeout >= self.watchdog_timeout {
            return Err(Error::Config(format!(
                "submit timeout ({:?}) must be shorter than the watchdog timeout ({:?})",
                self.submit_timeout, self.watchdog_timeout
            )));
        }
        Ok(())
    }

    /// Delay before retry round `round` (1-based).
    pub fn backoff_for(&self, round: u32) -> Duration {
        let idx = (round.max(1) as usize - 1).min(self.backoff.len().saturating_sub(1));
        self.backoff.get(idx).copied().unwrap_or_default()
    }

    /// Number of automatic retry rounds after the first pass.
    pub fn retry_rounds(&self) -> u32 {
        u32::try_from(self.backoff.len()).unwrap_or(u32::MAX)
    }
}
