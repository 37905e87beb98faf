//! Configuration module for the TimeFlow agent.
//!
//! This module handles parsing configuration from environment variables.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `TIMEFLOW_SUPABASE_URL` | For `run`/`sync` | - | Remote store base URL (e.g., `https://xyz.supabase.co`) |
//! | `TIMEFLOW_SUPABASE_KEY` | With URL | - | API key sent as `apikey` and bearer token |
//! | `TIMEFLOW_DATA_DIR` | No | platform data dir + `timeflow-agent` | Session, queue and capture files |
//! | `TIMEFLOW_SCREENSHOT_INTERVAL_SECS` | No | 60 | Seconds between screenshots |
//! | `TIMEFLOW_SCREENSHOT_JITTER_SECS` | No | 0 | Random spread applied to each screenshot delay |
//! | `TIMEFLOW_APP_INTERVAL_SECS` | No | 10 | Seconds between foreground app checks |
//! | `TIMEFLOW_IDLE_POLL_SECS` | No | 5 | Seconds between cursor samples |
//! | `TIMEFLOW_IDLE_TIMEOUT_SECS` | No | 300 | Seconds without movement before the user is idle |
//! | `TIMEFLOW_FLUSH_INTERVAL_SECS` | No | 30 | Seconds between queue flushes |
//! | `TIMEFLOW_QUEUE_WARN_THRESHOLD` | No | 1000 | Backlog size that triggers a warning |
//! | `TIMEFLOW_SCREENSHOT_CMD` | No | - | Command printing a PNG frame on stdout |
//! | `TIMEFLOW_WINDOW_CMD` | No | - | Command printing the app name and window title |
//! | `TIMEFLOW_CURSOR_CMD` | No | - | Command printing the cursor position |
//!
//! # Example
//!
//! ```no_run
//! use timeflow_agent::config::Config;
//!
//! let config = Config::from_env().expect("Failed to load configuration");
//! println!("Data dir: {}", config.data_dir.display());
//! ```

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use directories::BaseDirs;
use thiserror::Error;

/// Default data directory name under the platform data dir.
const DEFAULT_DATA_DIR: &str = "timeflow-agent";

const DEFAULT_SCREENSHOT_INTERVAL_SECS: u64 = 60;
const DEFAULT_SCREENSHOT_JITTER_SECS: u64 = 0;
const DEFAULT_APP_INTERVAL_SECS: u64 = 10;
const DEFAULT_IDLE_POLL_SECS: u64 = 5;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;
const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 30;
const DEFAULT_QUEUE_WARN_THRESHOLD: usize = 1000;

/// Errors that can occur during configuration parsing.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has an invalid value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Failed to determine home directory.
    #[error("failed to determine home directory")]
    NoHomeDirectory,
}

/// Connection settings for the remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    /// Project base URL (e.g., `https://xyz.supabase.co`).
    pub url: String,

    /// API key for the REST and storage endpoints.
    pub api_key: String,
}

/// Configuration for the TimeFlow agent.
#[derive(Debug, Clone)]
pub struct Config {
    /// Remote store settings. `None` when `TIMEFLOW_SUPABASE_URL` is unset.
    pub remote: Option<RemoteConfig>,

    /// Directory holding `session.json`, the queue files and `captures/`.
    pub data_dir: PathBuf,

    /// Base delay between screenshots.
    pub screenshot_interval: Duration,

    /// Maximum random deviation from `screenshot_interval`.
    pub screenshot_jitter: Duration,

    /// Delay between foreground app checks.
    pub app_interval: Duration,

    /// Delay between cursor samples.
    pub idle_poll_interval: Duration,

    /// Inactivity needed before the user counts as idle.
    pub idle_timeout: Duration,

    /// Delay between queue flushes while tracking.
    pub flush_interval: Duration,

    /// Queue length above which every enqueue logs a warning.
    pub queue_warn_threshold: usize,

    /// Shell-style command producing a PNG screenshot on stdout.
    pub screenshot_command: Option<String>,

    /// Command describing the active window.
    pub window_command: Option<String>,

    /// Command printing the cursor position.
    pub cursor_command: Option<String>,
}

impl Config {
    /// Creates a new `Config` by parsing environment variables.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if:
    /// - `TIMEFLOW_SUPABASE_URL` is set without `TIMEFLOW_SUPABASE_KEY`
    /// - a numeric variable is not a positive integer
    /// - the app interval is not shorter than the screenshot interval
    /// - the jitter is not shorter than the screenshot interval
    /// - the idle poll is not shorter than the idle timeout
    /// - the home directory cannot be determined (needed for the default data dir)
    pub fn from_env() -> Result<Self, ConfigError> {
        let remote = match non_empty_var("TIMEFLOW_SUPABASE_URL") {
            Some(url) => {
                let api_key = non_empty_var("TIMEFLOW_SUPABASE_KEY").ok_or_else(|| {
                    ConfigError::MissingEnvVar("TIMEFLOW_SUPABASE_KEY".to_string())
                })?;
                Some(RemoteConfig { url, api_key })
            }
            None => None,
        };

        let data_dir = match non_empty_var("TIMEFLOW_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => {
                let base_dirs = BaseDirs::new().ok_or(ConfigError::NoHomeDirectory)?;
                base_dirs.data_dir().join(DEFAULT_DATA_DIR)
            }
        };

        let screenshot_interval = secs_var(
            "TIMEFLOW_SCREENSHOT_INTERVAL_SECS",
            DEFAULT_SCREENSHOT_INTERVAL_SECS,
        )?;
        let app_interval = secs_var("TIMEFLOW_APP_INTERVAL_SECS", DEFAULT_APP_INTERVAL_SECS)?;
        let idle_poll_interval = secs_var("TIMEFLOW_IDLE_POLL_SECS", DEFAULT_IDLE_POLL_SECS)?;
        let idle_timeout = secs_var("TIMEFLOW_IDLE_TIMEOUT_SECS", DEFAULT_IDLE_TIMEOUT_SECS)?;
        let flush_interval = secs_var("TIMEFLOW_FLUSH_INTERVAL_SECS", DEFAULT_FLUSH_INTERVAL_SECS)?;

        // Jitter may be zero, so it skips the positive check.
        let screenshot_jitter = match env::var("TIMEFLOW_SCREENSHOT_JITTER_SECS") {
            Ok(val) => Duration::from_secs(val.parse::<u64>().map_err(|_| {
                ConfigError::InvalidValue {
                    key: "TIMEFLOW_SCREENSHOT_JITTER_SECS".to_string(),
                    message: format!("expected non-negative integer, got '{val}'"),
                }
            })?),
            Err(_) => Duration::from_secs(DEFAULT_SCREENSHOT_JITTER_SECS),
        };

        let queue_warn_threshold = match env::var("TIMEFLOW_QUEUE_WARN_THRESHOLD") {
            Ok(val) => {
                let threshold = val.parse::<usize>().map_err(|_| ConfigError::InvalidValue {
                    key: "TIMEFLOW_QUEUE_WARN_THRESHOLD".to_string(),
                    message: format!("expected positive integer, got '{val}'"),
                })?;
                if threshold == 0 {
                    return Err(ConfigError::InvalidValue {
                        key: "TIMEFLOW_QUEUE_WARN_THRESHOLD".to_string(),
                        message: "threshold must be greater than 0".to_string(),
                    });
                }
                threshold
            }
            Err(_) => DEFAULT_QUEUE_WARN_THRESHOLD,
        };

        if app_interval >= screenshot_interval {
            return Err(ConfigError::InvalidValue {
                key: "TIMEFLOW_APP_INTERVAL_SECS".to_string(),
                message: format!(
                    "app interval ({}s) must be shorter than the screenshot interval ({}s)",
                    app_interval.as_secs(),
                    screenshot_interval.as_secs()
                ),
            });
        }

        if screenshot_jitter >= screenshot_interval {
            return Err(ConfigError::InvalidValue {
                key: "TIMEFLOW_SCREENSHOT_JITTER_SECS".to_string(),
                message: "jitter must be shorter than the screenshot interval".to_string(),
            });
        }

        if idle_poll_interval >= idle_timeout {
            return Err(ConfigError::InvalidValue {
                key: "TIMEFLOW_IDLE_POLL_SECS".to_string(),
                message: "idle poll must be shorter than the idle timeout".to_string(),
            });
        }

        Ok(Self {
            remote,
            data_dir,
            screenshot_interval,
            screenshot_jitter,
            app_interval,
            idle_poll_interval,
            idle_timeout,
            flush_interval,
            queue_warn_threshold,
            screenshot_command: non_empty_var("TIMEFLOW_SCREENSHOT_CMD"),
            window_command: non_empty_var("TIMEFLOW_WINDOW_CMD"),
            cursor_command: non_empty_var("TIMEFLOW_CURSOR_CMD"),
        })
    }

    /// Directory screenshots are written to while they wait for upload.
    #[must_use]
    pub fn capture_dir(&self) -> PathBuf {
        self.data_dir.join("captures")
    }
}

/// Reads a variable, treating an empty or whitespace-only value as unset.
fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parses a positive number of seconds, falling back to `default` when unset.
fn secs_var(key: &str, default: u64) -> Result<Duration, ConfigError> {
    let secs = match env::var(key) {
        Ok(val) => {
            let secs = val.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected positive integer, got '{val}'"),
            })?;
            if secs == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "value must be at least 1 second".to_string(),
                });
            }
            secs
        }
        Err(_) => default,
    };
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    /// Helper to run tests with isolated environment variables.
    /// Clears all TIMEFLOW_* vars before the test and restores them after.
    fn with_clean_env<F, R>(f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let saved_vars: Vec<(String, String)> = env::vars()
            .filter(|(k, _)| k.starts_with("TIMEFLOW_"))
            .collect();

        for (key, _) in &saved_vars {
            env::remove_var(key);
        }

        let result = f();

        for (key, _) in env::vars().filter(|(k, _)| k.starts_with("TIMEFLOW_")) {
            env::remove_var(key);
        }
        for (key, value) in saved_vars {
            env::set_var(key, value);
        }

        result
    }

    #[test]
    #[serial]
    fn test_defaults_without_remote() {
        with_clean_env(|| {
            env::set_var("TIMEFLOW_DATA_DIR", "/var/lib/timeflow");

            let config = Config::from_env().expect("should parse default config");

            assert!(config.remote.is_none());
            assert_eq!(config.data_dir, PathBuf::from("/var/lib/timeflow"));
            assert_eq!(config.screenshot_interval, Duration::from_secs(60));
            assert_eq!(config.screenshot_jitter, Duration::ZERO);
            assert_eq!(config.app_interval, Duration::from_secs(10));
            assert_eq!(config.idle_poll_interval, Duration::from_secs(5));
            assert_eq!(config.idle_timeout, Duration::from_secs(300));
            assert_eq!(config.flush_interval, Duration::from_secs(30));
            assert_eq!(config.queue_warn_threshold, DEFAULT_QUEUE_WARN_THRESHOLD);
            assert!(config.screenshot_command.is_none());
            assert_eq!(
                config.capture_dir(),
                PathBuf::from("/var/lib/timeflow/captures")
            );
        });
    }

    #[test]
    #[serial]
    fn test_default_data_dir_ends_with_agent_name() {
        with_clean_env(|| {
            let config = Config::from_env().expect("should parse default config");
            assert!(config.data_dir.ends_with(DEFAULT_DATA_DIR));
        });
    }

    #[test]
    #[serial]
    fn test_full_config() {
        with_clean_env(|| {
            env::set_var("TIMEFLOW_SUPABASE_URL", "https://xyz.supabase.co");
            env::set_var("TIMEFLOW_SUPABASE_KEY", "anon-key");
            env::set_var("TIMEFLOW_DATA_DIR", "/tmp/timeflow");
            env::set_var("TIMEFLOW_SCREENSHOT_INTERVAL_SECS", "540");
            env::set_var("TIMEFLOW_SCREENSHOT_JITTER_SECS", "360");
            env::set_var("TIMEFLOW_APP_INTERVAL_SECS", "15");
            env::set_var("TIMEFLOW_IDLE_POLL_SECS", "2");
            env::set_var("TIMEFLOW_IDLE_TIMEOUT_SECS", "120");
            env::set_var("TIMEFLOW_FLUSH_INTERVAL_SECS", "45");
            env::set_var("TIMEFLOW_QUEUE_WARN_THRESHOLD", "250");
            env::set_var("TIMEFLOW_CURSOR_CMD", "xdotool getmouselocation");

            let config = Config::from_env().expect("should parse full config");

            assert_eq!(
                config.remote,
                Some(RemoteConfig {
                    url: "https://xyz.supabase.co".to_string(),
                    api_key: "anon-key".to_string(),
                })
            );
            assert_eq!(config.screenshot_interval, Duration::from_secs(540));
            assert_eq!(config.screenshot_jitter, Duration::from_secs(360));
            assert_eq!(config.app_interval, Duration::from_secs(15));
            assert_eq!(config.idle_poll_interval, Duration::from_secs(2));
            assert_eq!(config.idle_timeout, Duration::from_secs(120));
            assert_eq!(config.flush_interval, Duration::from_secs(45));
            assert_eq!(config.queue_warn_threshold, 250);
            assert_eq!(
                config.cursor_command.as_deref(),
                Some("xdotool getmouselocation")
            );
        });
    }

    #[test]
    #[serial]
    fn test_url_without_key_is_rejected() {
        with_clean_env(|| {
            env::set_var("TIMEFLOW_SUPABASE_URL", "https://xyz.supabase.co");

            let err = Config::from_env().unwrap_err();
            assert!(matches!(err, ConfigError::MissingEnvVar(ref s) if s == "TIMEFLOW_SUPABASE_KEY"));
        });
    }

    #[test]
    #[serial]
    fn test_invalid_interval() {
        with_clean_env(|| {
            env::set_var("TIMEFLOW_DATA_DIR", "/tmp/timeflow");
            env::set_var("TIMEFLOW_SCREENSHOT_INTERVAL_SECS", "soon");

            let err = Config::from_env().unwrap_err();
            assert!(matches!(
                err,
                ConfigError::InvalidValue { ref key, .. } if key == "TIMEFLOW_SCREENSHOT_INTERVAL_SECS"
            ));
        });
    }

    #[test]
    #[serial]
    fn test_zero_interval_rejected() {
        with_clean_env(|| {
            env::set_var("TIMEFLOW_DATA_DIR", "/tmp/timeflow");
            env::set_var("TIMEFLOW_FLUSH_INTERVAL_SECS", "0");

            let err = Config::from_env().unwrap_err();
            assert!(matches!(
                err,
                ConfigError::InvalidValue { ref key, ref message }
                    if key == "TIMEFLOW_FLUSH_INTERVAL_SECS" && message.contains("at least 1")
            ));
        });
    }

    #[test]
    #[serial]
    fn test_app_interval_must_be_shorter_than_screenshots() {
        with_clean_env(|| {
            env::set_var("TIMEFLOW_DATA_DIR", "/tmp/timeflow");
            env::set_var("TIMEFLOW_SCREENSHOT_INTERVAL_SECS", "30");
            env::set_var("TIMEFLOW_APP_INTERVAL_SECS", "30");

            let err = Config::from_env().unwrap_err();
            assert!(matches!(
                err,
                ConfigError::InvalidValue { ref key, .. } if key == "TIMEFLOW_APP_INTERVAL_SECS"
            ));
        });
    }

    #[test]
    #[serial]
    fn test_jitter_must_be_shorter_than_interval() {
        with_clean_env(|| {
            env::set_var("TIMEFLOW_DATA_DIR", "/tmp/timeflow");
            env::set_var("TIMEFLOW_SCREENSHOT_JITTER_SECS", "60");

            let err = Config::from_env().unwrap_err();
            assert!(matches!(
                err,
                ConfigError::InvalidValue { ref key, .. } if key == "TIMEFLOW_SCREENSHOT_JITTER_SECS"
            ));
        });
    }

    #[test]
    #[serial]
    fn test_idle_poll_must_be_shorter_than_timeout() {
        with_clean_env(|| {
            env::set_var("TIMEFLOW_DATA_DIR", "/tmp/timeflow");
            env::set_var("TIMEFLOW_IDLE_POLL_SECS", "10");
            env::set_var("TIMEFLOW_IDLE_TIMEOUT_SECS", "10");

            let err = Config::from_env().unwrap_err();
            assert!(matches!(
                err,
                ConfigError::InvalidValue { ref key, .. } if key == "TIMEFLOW_IDLE_POLL_SECS"
            ));
        });
    }

    #[test]
    #[serial]
    fn test_zero_warn_threshold_rejected() {
        with_clean_env(|| {
            env::set_var("TIMEFLOW_DATA_DIR", "/tmp/timeflow");
            env::set_var("TIMEFLOW_QUEUE_WARN_THRESHOLD", "0");

            let err = Config::from_env().unwrap_err();
            assert!(matches!(
                err,
                ConfigError::InvalidValue { ref key, ref message }
                    if key == "TIMEFLOW_QUEUE_WARN_THRESHOLD" && message.contains("greater than 0")
            ));
        });
    }

    #[test]
    #[serial]
    fn test_blank_command_is_treated_as_unset() {
        with_clean_env(|| {
            env::set_var("TIMEFLOW_DATA_DIR", "/tmp/timeflow");
            env::set_var("TIMEFLOW_WINDOW_CMD", "   ");

            let config = Config::from_env().expect("should parse config");
            assert!(config.window_command.is_none());
        });
    }
}
