//! Process configuration read from the environment.
//!
//! | Variable                   | Default                                   |
//! |----------------------------|-------------------------------------------|
//! | `POS_API_BASE_URL`         | none (required to reach the ticket API)   |
//! | `POS_DATA_DIR`             | `<local data dir>/com.thesmall.pos.outbox`|
//! | `POS_LOG_DIR`              | `<data dir>/logs`                         |
//! | `POS_FLUSH_INTERVAL_MS`    | `3000`                                    |
//! | `POS_REQUEST_TIMEOUT_SECS` | `30`                                      |
//!
//! The device context (tenant, store, device, business date) is not read
//! here; it lives in `local_settings`, see [`crate::device`].

use std::path::PathBuf;
use std::time::Duration;

use crate::api;
use crate::error::{OutboxError, Result};
use crate::flusher::DEFAULT_FLUSH_INTERVAL;

pub const ENV_API_BASE_URL: &str = "POS_API_BASE_URL";
pub const ENV_DATA_DIR: &str = "POS_DATA_DIR";
pub const ENV_LOG_DIR: &str = "POS_LOG_DIR";
pub const ENV_FLUSH_INTERVAL_MS: &str = "POS_FLUSH_INTERVAL_MS";
pub const ENV_REQUEST_TIMEOUT_SECS: &str = "POS_REQUEST_TIMEOUT_SECS";

const APP_DIR_NAME: &str = "com.thesmall.pos.outbox";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    /// Normalised ticket API origin, `None` when not configured.
    pub api_base_url: Option<String>,
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub flush_interval: Duration,
    pub request_timeout: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let api_base_url = env_non_empty(ENV_API_BASE_URL)
            .map(|url| api::normalize_base_url(&url))
            .filter(|url| !url.is_empty());

        let data_dir = env_non_empty(ENV_DATA_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);
        let log_dir = env_non_empty(ENV_LOG_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("logs"));

        let flush_interval = match parse_u64(ENV_FLUSH_INTERVAL_MS)? {
            Some(ms) => Duration::from_millis(ms),
            None => DEFAULT_FLUSH_INTERVAL,
        };
        let request_timeout = match parse_u64(ENV_REQUEST_TIMEOUT_SECS)? {
            Some(secs) => Duration::from_secs(secs),
            None => DEFAULT_REQUEST_TIMEOUT,
        };

        Ok(Self {
            api_base_url,
            data_dir,
            log_dir,
            flush_interval,
            request_timeout,
        })
    }
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Positive integer from the environment. Zero is rejected.
fn parse_u64(name: &'static str) -> Result<Option<u64>> {
    let Some(raw) = env_non_empty(name) else {
        return Ok(None);
    };
    match raw.parse::<u64>() {
        Ok(value) if value > 0 => Ok(Some(value)),
        _ => Err(OutboxError::InvalidConfig { name, value: raw }),
    }
}

/// Per-user local data directory for this app.
pub fn default_data_dir() -> PathBuf {
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join(APP_DIR_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const ALL: &[&str] = &[
        ENV_API_BASE_URL,
        ENV_DATA_DIR,
        ENV_LOG_DIR,
        ENV_FLUSH_INTERVAL_MS,
        ENV_REQUEST_TIMEOUT_SECS,
    ];

    fn clear_env() {
        for name in ALL {
            std::env::remove_var(name);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        let cfg = AppConfig::from_env().unwrap();

        assert_eq!(cfg.api_base_url, None);
        assert!(cfg.data_dir.ends_with(APP_DIR_NAME));
        assert_eq!(cfg.log_dir, cfg.data_dir.join("logs"));
        assert_eq!(cfg.flush_interval, Duration::from_millis(3000));
        assert_eq!(cfg.request_timeout, Duration::from_secs(30));
    }

    #[test]
    #[serial]
    fn test_overrides_and_url_normalisation() {
        clear_env();
        std::env::set_var(ENV_API_BASE_URL, "  pos.example.test/api/ ");
        std::env::set_var(ENV_DATA_DIR, "/tmp/pos-data");
        std::env::set_var(ENV_FLUSH_INTERVAL_MS, "750");
        std::env::set_var(ENV_REQUEST_TIMEOUT_SECS, "5");

        let cfg = AppConfig::from_env().unwrap();
        clear_env();

        assert_eq!(cfg.api_base_url.as_deref(), Some("https://pos.example.test"));
        assert_eq!(cfg.data_dir, PathBuf::from("/tmp/pos-data"));
        assert_eq!(cfg.log_dir, PathBuf::from("/tmp/pos-data/logs"));
        assert_eq!(cfg.flush_interval, Duration::from_millis(750));
        assert_eq!(cfg.request_timeout, Duration::from_secs(5));
    }

    #[test]
    #[serial]
    fn test_rejects_bad_interval() {
        clear_env();
        std::env::set_var(ENV_FLUSH_INTERVAL_MS, "0");
        assert!(AppConfig::from_env().is_err());

        std::env::set_var(ENV_FLUSH_INTERVAL_MS, "soon");
        assert!(matches!(
            AppConfig::from_env(),
            Err(OutboxError::InvalidConfig { name: ENV_FLUSH_INTERVAL_MS, .. })
        ));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_blank_values_fall_back_to_defaults() {
        clear_env();
        std::env::set_var(ENV_API_BASE_URL, "   ");
        std::env::set_var(ENV_LOG_DIR, "");

        let cfg = AppConfig::from_env().unwrap();
        clear_env();

        assert_eq!(cfg.api_base_url, None);
        assert_eq!(cfg.log_dir, cfg.data_dir.join("logs"));
    }
}
