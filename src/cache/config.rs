//! Tree cache configuration.
//!
//! Controls the disk snapshot, staleness checks, and I/O timeouts via `verdant.toml`:
//!
//! ```toml
//! [cache]
//! snapshot_path = "data/published.json"
//! check_disk_changes = true
//! staleness_check_interval_ms = 1000
//! ```

use std::path::PathBuf;
use std::time::Duration;

pub(crate) const DEFAULT_SNAPSHOT_PATH: &str = "data/published.json";
pub(crate) const DEFAULT_STALENESS_CHECK_INTERVAL_MS: u64 = 1000;
pub(crate) const DEFAULT_SOURCE_TIMEOUT_MS: u64 = 30_000;
pub(crate) const DEFAULT_DISK_TIMEOUT_MS: u64 = 10_000;
pub(crate) const DEFAULT_FLUSH_INTERVAL_MS: u64 = 5000;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Location of the serialized snapshot.
    pub snapshot_path: PathBuf,
    /// Use the snapshot file at all (read on cold start, write on change).
    pub disk_cache_enabled: bool,
    /// Write the snapshot file after mutations.
    pub persist_changes: bool,
    /// Reload when another process rewrites the snapshot file.
    pub check_disk_changes: bool,
    /// Minimum spacing between two snapshot file stat calls.
    pub staleness_check_interval: Duration,
    /// Upper bound for a full or single-row source query.
    pub source_timeout: Duration,
    /// Upper bound for a snapshot file read or write.
    pub disk_timeout: Duration,
    /// Period of the timer-driven flush when no request boundary is available.
    pub flush_interval: Duration,
    /// Rebuild the whole tree when a publish brings a content type the tree has never held.
    pub refresh_on_unknown_content_type: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            snapshot_path: PathBuf::from(DEFAULT_SNAPSHOT_PATH),
            disk_cache_enabled: true,
            persist_changes: true,
            check_disk_changes: true,
            staleness_check_interval: Duration::from_millis(DEFAULT_STALENESS_CHECK_INTERVAL_MS),
            source_timeout: Duration::from_millis(DEFAULT_SOURCE_TIMEOUT_MS),
            disk_timeout: Duration::from_millis(DEFAULT_DISK_TIMEOUT_MS),
            flush_interval: Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS),
            refresh_on_unknown_content_type: true,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            snapshot_path: settings.snapshot_path.clone(),
            disk_cache_enabled: settings.disk_cache_enabled,
            persist_changes: settings.persist_changes,
            check_disk_changes: settings.check_disk_changes,
            staleness_check_interval: settings.staleness_check_interval,
            source_timeout: settings.source_timeout,
            disk_timeout: settings.disk_timeout,
            flush_interval: settings.flush_interval,
            refresh_on_unknown_content_type: settings.refresh_on_unknown_content_type,
        }
    }
}

impl CacheConfig {
    /// Snapshot config rooted at `path`, otherwise defaults.
    pub fn with_snapshot_path(path: impl Into<PathBuf>) -> Self {
        Self {
            snapshot_path: path.into(),
            ..Default::default()
        }
    }

    /// Whether the snapshot file should be read on cold start.
    pub fn reads_disk(&self) -> bool {
        self.disk_cache_enabled
    }

    /// Whether mutations should eventually reach the snapshot file.
    pub fn writes_disk(&self) -> bool {
        self.disk_cache_enabled && self.persist_changes
    }

    /// Whether reads should watch the snapshot file for foreign writes.
    pub fn watches_disk(&self) -> bool {
        self.disk_cache_enabled && self.check_disk_changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert!(config.disk_cache_enabled);
        assert_eq!(config.staleness_check_interval, Duration::from_secs(1));
        assert_eq!(config.snapshot_path, PathBuf::from("data/published.json"));
        assert!(config.refresh_on_unknown_content_type);
    }

    #[test]
    fn disabling_disk_cache_disables_everything_on_disk() {
        let config = CacheConfig {
            disk_cache_enabled: false,
            ..Default::default()
        };
        assert!(!config.reads_disk());
        assert!(!config.writes_disk());
        assert!(!config.watches_disk());
    }

    #[test]
    fn persist_flag_only_gates_writes() {
        let config = CacheConfig {
            persist_changes: false,
            ..Default::default()
        };
        assert!(config.reads_disk());
        assert!(!config.writes_disk());
        assert!(config.watches_disk());
    }
}
