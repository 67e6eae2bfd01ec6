//! Runtime configuration for the sync engine and the binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{SyncError, SyncResult};

const DEFAULT_DATA_DIR: &str = "./data";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(15);
const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Consecutive failures after which a queue entry is dropped.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

pub const ENV_DATA_DIR: &str = "POS_SYNC_DATA_DIR";
pub const ENV_REMOTE_URL: &str = "POS_SYNC_REMOTE_URL";
pub const ENV_API_KEY: &str = "POS_SYNC_API_KEY";
pub const ENV_POLL_INTERVAL: &str = "POS_SYNC_POLL_INTERVAL_SECS";
pub const ENV_SNAPSHOT_INTERVAL: &str = "POS_SYNC_SNAPSHOT_INTERVAL_SECS";
pub const ENV_PROBE_INTERVAL: &str = "POS_SYNC_PROBE_INTERVAL_SECS";
pub const ENV_MAX_RETRIES: &str = "POS_SYNC_MAX_RETRIES";
pub const ENV_REQUEST_TIMEOUT: &str = "POS_SYNC_REQUEST_TIMEOUT_SECS";
pub const ENV_LOG_DIR: &str = "POS_SYNC_LOG_DIR";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Directory holding `orders.db`.
    pub data_dir: PathBuf,
    /// Base URL of the remote order store.
    pub remote_url: Option<String>,
    pub api_key: Option<String>,
    /// Interval between background drain passes while online.
    pub poll_interval: Duration,
    /// Interval between remote snapshot fetches.
    pub snapshot_interval: Duration,
    /// Interval between connectivity probes.
    pub probe_interval: Duration,
    pub max_retries: u32,
    pub request_timeout: Duration,
    /// Log directory; `{data_dir}/logs` when unset.
    pub log_dir: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            remote_url: None,
            api_key: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
            probe_interval: DEFAULT_PROBE_INTERVAL,
            max_retries: DEFAULT_MAX_RETRIES,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            log_dir: None,
        }
    }
}

impl SyncConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_remote_url(mut self, url: impl Into<String>) -> Self {
        self.remote_url = Some(url.into());
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = interval;
        self
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    /// Sets the retry ceiling. Values below 1 are raised to 1.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("logs"))
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Build a configuration from `POS_SYNC_*` environment variables.
    pub fn from_env() -> SyncResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup. Blank values are
    /// treated as unset.
    pub fn from_lookup<F>(lookup: F) -> SyncResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(dir) = get(ENV_DATA_DIR) {
            config.data_dir = PathBuf::from(dir);
        }
        config.remote_url = get(ENV_REMOTE_URL);
        config.api_key = get(ENV_API_KEY);
        if let Some(raw) = get(ENV_POLL_INTERVAL) {
            config.poll_interval = parse_secs(ENV_POLL_INTERVAL, &raw)?;
        }
        if let Some(raw) = get(ENV_SNAPSHOT_INTERVAL) {
            config.snapshot_interval = parse_secs(ENV_SNAPSHOT_INTERVAL, &raw)?;
        }
        if let Some(raw) = get(ENV_PROBE_INTERVAL) {
            config.probe_interval = parse_secs(ENV_PROBE_INTERVAL, &raw)?;
        }
        if let Some(raw) = get(ENV_REQUEST_TIMEOUT) {
            config.request_timeout = parse_secs(ENV_REQUEST_TIMEOUT, &raw)?;
        }
        if let Some(raw) = get(ENV_MAX_RETRIES) {
            let value: u32 = raw.parse().map_err(|_| {
                SyncError::Config(format!("{ENV_MAX_RETRIES} must be a number, got {raw:?}"))
            })?;
            if value == 0 {
                return Err(SyncError::Config(format!(
                    "{ENV_MAX_RETRIES} must be at least 1"
                )));
            }
            config.max_retries = value;
        }
        config.log_dir = get(ENV_LOG_DIR).map(PathBuf::from);

        Ok(config)
    }
}

/// Parse a whole number of seconds; zero is rejected since every interval
/// drives a timer.
fn parse_secs(key: &str, raw: &str) -> SyncResult<Duration> {
    match raw.parse::<u64>() {
        Ok(0) => Err(SyncError::Config(format!("{key} must be greater than zero"))),
        Ok(secs) => Ok(Duration::from_secs(secs)),
        Err(_) => Err(SyncError::Config(format!(
            "{key} must be a whole number of seconds, got {raw:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.snapshot_interval, Duration::from_secs(15));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.log_dir(), PathBuf::from("./data").join("logs"));
        assert!(config.remote_url.is_none());
    }

    #[test]
    fn test_builder() {
        let config = SyncConfig::new("/tmp/pos")
            .with_remote_url("https://orders.example.com")
            .with_api_key("secret")
            .with_poll_interval(Duration::from_millis(50))
            .with_max_retries(0)
            .with_log_dir("/var/log/pos");
        assert_eq!(config.data_dir(), Path::new("/tmp/pos"));
        assert_eq!(config.remote_url.as_deref(), Some("https://orders.example.com"));
        assert_eq!(config.api_key.as_deref(), Some("secret"));
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.log_dir(), PathBuf::from("/var/log/pos"));
    }

    #[test]
    fn test_from_lookup_reads_values() {
        let config = SyncConfig::from_lookup(lookup(&[
            (ENV_DATA_DIR, "/srv/pos"),
            (ENV_REMOTE_URL, "orders.example.com"),
            (ENV_API_KEY, "  "),
            (ENV_POLL_INTERVAL, "2"),
            (ENV_MAX_RETRIES, "3"),
        ]))
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/srv/pos"));
        assert_eq!(config.remote_url.as_deref(), Some("orders.example.com"));
        assert!(config.api_key.is_none(), "blank values count as unset");
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.log_dir(), PathBuf::from("/srv/pos").join("logs"));
    }

    #[test]
    fn test_from_lookup_rejects_bad_numbers() {
        let err = SyncConfig::from_lookup(lookup(&[(ENV_POLL_INTERVAL, "soon")])).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
        assert!(err.to_string().contains(ENV_POLL_INTERVAL));

        assert!(SyncConfig::from_lookup(lookup(&[(ENV_SNAPSHOT_INTERVAL, "0")])).is_err());
        assert!(SyncConfig::from_lookup(lookup(&[(ENV_MAX_RETRIES, "0")])).is_err());
    }

    #[test]
    #[serial]
    fn test_from_env() {
        std::env::set_var(ENV_REMOTE_URL, "http://localhost:8080");
        std::env::set_var(ENV_REQUEST_TIMEOUT, "7");
        let config = SyncConfig::from_env();
        std::env::remove_var(ENV_REMOTE_URL);
        std::env::remove_var(ENV_REQUEST_TIMEOUT);

        let config = config.unwrap();
        assert_eq!(config.remote_url.as_deref(), Some("http://localhost:8080"));
        assert_eq!(config.request_timeout, Duration::from_secs(7));
    }

    #[test]
    #[serial]
    fn test_from_env_without_variables_uses_defaults() {
        std::env::remove_var(ENV_REMOTE_URL);
        std::env::remove_var(ENV_MAX_RETRIES);
        let config = SyncConfig::from_env().unwrap();
        assert!(config.remote_url.is_none());
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
    }
}
