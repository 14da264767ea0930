use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable overriding the data root.
pub const DATA_DIR_ENV: &str = "BROWSERFAIRY_DATA_DIR";

/// Tunables for one engine run. All fields have production defaults; the
/// thin daemon overrides a handful from flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Root under which session directories are created.
    pub data_dir: PathBuf,
    /// Hard cap on concurrently attached page sessions.
    pub max_sessions: usize,
    /// Process-wide permits for in-flight memory samples.
    pub sampling_permits: usize,
    /// Memory sampling cadence.
    pub memory_interval: Duration,
    /// Storage quota poll cadence.
    pub storage_quota_interval: Duration,
    /// Heap-allocation profile pull cadence.
    pub heap_profile_interval: Duration,
    /// Heap sampler allocation sampling interval, bytes.
    pub heap_sampling_interval: u64,
    /// Console token-bucket rate, events per second.
    pub console_events_per_sec: f64,
    /// Network token-bucket rate, events per second.
    pub network_events_per_sec: f64,
    /// Per-(host, stream) writer queue depth.
    pub writer_queue_depth: usize,
    /// Rotate a stream file past this many bytes.
    pub rotate_max_bytes: u64,
    /// Rotate a stream file past this age.
    pub rotate_max_age: Duration,
    /// Coalesce flushes on a timer instead of per record.
    pub batched_flush: bool,
    /// DOM-storage values are truncated to this many characters.
    pub domstorage_value_limit: usize,
    /// Default protocol call timeout.
    pub call_timeout: Duration,
    /// Orderly-shutdown grace period.
    pub shutdown_grace: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            max_sessions: 50,
            sampling_permits: 8,
            memory_interval: Duration::from_secs(5),
            storage_quota_interval: Duration::from_secs(30),
            heap_profile_interval: Duration::from_secs(60),
            heap_sampling_interval: 65536,
            console_events_per_sec: 10.0,
            network_events_per_sec: 50.0,
            writer_queue_depth: 1024,
            rotate_max_bytes: 50 * 1024 * 1024,
            rotate_max_age: Duration::from_secs(24 * 60 * 60),
            batched_flush: false,
            domstorage_value_limit: 2048,
            call_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl MonitorConfig {
    /// Resolve the data root: explicit path, else env override, else
    /// `~/BrowserFairyData`.
    pub fn with_data_dir(mut self, dir: Option<PathBuf>) -> Self {
        if let Some(dir) = dir {
            self.data_dir = dir;
        }
        self
    }
}

/// `BROWSERFAIRY_DATA_DIR` when set, else `~/BrowserFairyData`.
pub fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("BrowserFairyData")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_contract() {
        let config = MonitorConfig::default();
        assert_eq!(config.max_sessions, 50);
        assert_eq!(config.sampling_permits, 8);
        assert_eq!(config.memory_interval, Duration::from_secs(5));
        assert_eq!(config.writer_queue_depth, 1024);
        assert_eq!(config.rotate_max_bytes, 50 * 1024 * 1024);
        assert_eq!(config.domstorage_value_limit, 2048);
        assert!(!config.batched_flush);
    }

    #[test]
    fn default_data_dir_ends_with_browserfairy_data() {
        // Only assert shape; the env override is exercised operationally.
        if std::env::var(DATA_DIR_ENV).is_err() {
            let dir = default_data_dir();
            assert!(dir.ends_with("BrowserFairyData"));
        }
    }
}
