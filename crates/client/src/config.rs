//! Agent configuration from `FIELDSYNC_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use fieldsync_core::WorkerId;

use crate::engine::EngineOptions;
use crate::retry::RetryPolicy;
use crate::store::{db_path_in, default_data_dir};
use crate::worker::DEFAULT_PROBE_INTERVAL;

pub const DEFAULT_API_URL: &str = "http://localhost:8080";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
    #[error("no data directory available; set FIELDSYNC_DATA_DIR")]
    NoDataDir,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_url: String,
    pub auth_token: Option<String>,
    pub worker_id: Option<WorkerId>,
    pub data_dir: PathBuf,
    pub probe_interval: Duration,
    pub request_timeout: Duration,
    pub snapshot_ttl: chrono::Duration,
    pub max_attempts: Option<u32>,
    pub backoff_base: Option<Duration>,
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let api_url = get("FIELDSYNC_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let auth_token = get("FIELDSYNC_AUTH_TOKEN");

        let worker_id = get("FIELDSYNC_WORKER_ID")
            .map(WorkerId::new)
            .transpose()
            .map_err(|e| ConfigError::Invalid {
                key: "FIELDSYNC_WORKER_ID",
                message: e.to_string(),
            })?;

        let data_dir = match get("FIELDSYNC_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => default_data_dir().ok_or(ConfigError::NoDataDir)?,
        };

        let probe_secs: u64 = parse(&get, "FIELDSYNC_PROBE_INTERVAL_SECS")?.unwrap_or(DEFAULT_PROBE_INTERVAL.as_secs());
        let timeout_secs: u64 = parse(&get, "FIELDSYNC_REQUEST_TIMEOUT_SECS")?.unwrap_or(15);
        let ttl_minutes: i64 = parse(&get, "FIELDSYNC_CACHE_TTL_MINUTES")?.unwrap_or(240);
        let max_attempts: Option<u32> = parse(&get, "FIELDSYNC_MAX_ATTEMPTS")?;
        let backoff_ms: Option<u64> = parse(&get, "FIELDSYNC_BACKOFF_BASE_MS")?;

        if probe_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "FIELDSYNC_PROBE_INTERVAL_SECS",
                message: "must be greater than zero".into(),
            });
        }
        if ttl_minutes <= 0 {
            return Err(ConfigError::Invalid {
                key: "FIELDSYNC_CACHE_TTL_MINUTES",
                message: "must be greater than zero".into(),
            });
        }
        if max_attempts == Some(0) {
            return Err(ConfigError::Invalid {
                key: "FIELDSYNC_MAX_ATTEMPTS",
                message: "must be greater than zero".into(),
            });
        }

        Ok(Self {
            api_url,
            auth_token,
            worker_id,
            data_dir,
            probe_interval: Duration::from_secs(probe_secs),
            request_timeout: Duration::from_secs(timeout_secs),
            snapshot_ttl: chrono::Duration::minutes(ttl_minutes),
            max_attempts,
            backoff_base: backoff_ms.map(Duration::from_millis),
        })
    }

    pub fn db_path(&self) -> PathBuf {
        db_path_in(&self.data_dir)
    }

    /// Exponential backoff capped at one hour when a base delay is set,
    /// otherwise immediate retries.
    pub fn retry_policy(&self) -> RetryPolicy {
        let policy = match self.backoff_base {
            Some(base) => RetryPolicy::exponential(None, base, Duration::from_secs(3600)),
            None => RetryPolicy::unbounded(),
        };
        match self.max_attempts {
            Some(max) => policy.with_max_attempts(max),
            None => policy,
        }
    }

    pub fn engine_options(&self) -> EngineOptions {
        let options = EngineOptions::default()
            .with_snapshot_ttl(self.snapshot_ttl)
            .with_retry(self.retry_policy());
        match &self.worker_id {
            Some(worker) => options.with_worker(worker.clone()),
            None => options,
        }
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get(key)
        .map(|raw| {
            raw.parse::<T>().map_err(|e| ConfigError::Invalid {
                key,
                message: format!("`{raw}`: {e}"),
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<ClientConfig, ConfigError> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        ClientConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = config(&[("FIELDSYNC_DATA_DIR", "/tmp/fs")]).unwrap();
        assert_eq!(cfg.api_url, DEFAULT_API_URL);
        assert_eq!(cfg.auth_token, None);
        assert_eq!(cfg.worker_id, None);
        assert_eq!(cfg.probe_interval, Duration::from_secs(30));
        assert_eq!(cfg.request_timeout, Duration::from_secs(15));
        assert_eq!(cfg.snapshot_ttl, chrono::Duration::hours(4));
        assert_eq!(cfg.db_path(), PathBuf::from("/tmp/fs/offline.db"));
        assert_eq!(cfg.retry_policy(), RetryPolicy::unbounded());
    }

    #[test]
    fn data_dir_defaults_to_shared_location() {
        match default_data_dir() {
            Some(dir) => {
                let cfg = config(&[]).unwrap();
                assert_eq!(cfg.data_dir, dir);
                assert!(cfg.data_dir.ends_with("fieldsync"));
                assert_eq!(cfg.db_path(), dir.join("offline.db"));
            }
            None => assert!(matches!(config(&[]), Err(ConfigError::NoDataDir))),
        }
    }

    #[test]
    fn values_are_read_and_trimmed() {
        let cfg = config(&[
            ("FIELDSYNC_API_URL", "https://api.example.com"),
            ("FIELDSYNC_AUTH_TOKEN", " secret "),
            ("FIELDSYNC_WORKER_ID", "w-42"),
            ("FIELDSYNC_DATA_DIR", "/var/lib/fieldsync"),
            ("FIELDSYNC_CACHE_TTL_MINUTES", "60"),
            ("FIELDSYNC_MAX_ATTEMPTS", "5"),
            ("FIELDSYNC_BACKOFF_BASE_MS", "500"),
        ])
        .unwrap();

        assert_eq!(cfg.api_url, "https://api.example.com");
        assert_eq!(cfg.auth_token.as_deref(), Some("secret"));
        assert_eq!(cfg.worker_id.as_ref().map(|w| w.as_str()), Some("w-42"));
        assert_eq!(cfg.snapshot_ttl, chrono::Duration::minutes(60));

        let policy = cfg.retry_policy();
        assert_eq!(policy.max_attempts, Some(5));
        assert_eq!(policy.base_delay, Duration::from_millis(500));
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let err = config(&[("FIELDSYNC_DATA_DIR", "/tmp"), ("FIELDSYNC_PROBE_INTERVAL_SECS", "soon")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "FIELDSYNC_PROBE_INTERVAL_SECS",
                ..
            }
        ));

        let err = config(&[("FIELDSYNC_DATA_DIR", "/tmp"), ("FIELDSYNC_MAX_ATTEMPTS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "FIELDSYNC_MAX_ATTEMPTS", .. }));
    }
}
