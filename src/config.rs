//! Engine configuration.
//!
//! All knobs have conservative defaults; the embedding front-end is
//! responsible for loading them from files or the environment.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How per-file and global confidence thresholds gate auto-apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceMode {
    /// Every file must clear the per-file threshold.
    PerFile,
    /// The batch aggregate must clear the global threshold.
    Global,
    /// Both gates must pass.
    #[default]
    Both,
}

/// Safety limits and write behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Maximum number of files a single batch may touch. 0 = unlimited.
    pub max_files: usize,
    /// Maximum size of a single file in bytes. 0 = unlimited.
    pub max_file_size: u64,
    /// Maximum total bytes across a batch. 0 = unlimited.
    pub max_total_size: u64,
    pub confidence_mode: ConfidenceMode,
    pub per_file_threshold: f64,
    pub global_threshold: f64,
    /// Verify content digests before committing a stage.
    pub validate_file_hashes: bool,
    /// Write through a sibling temp file and rename into place.
    pub atomic_writes: bool,
    /// Fsync the temp file before renaming.
    pub use_fsync: bool,
    pub create_backups: bool,
    pub backup_suffix: String,
    /// Keep a sidecar transaction log under `.morfx/transactions`.
    pub transaction_log: bool,
    pub file_locking: bool,
    pub lock_timeout_ms: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_files: 1000,
            max_file_size: 5 * 1024 * 1024,
            max_total_size: 0,
            confidence_mode: ConfidenceMode::default(),
            per_file_threshold: 0.6,
            global_threshold: 0.7,
            validate_file_hashes: true,
            atomic_writes: true,
            use_fsync: false,
            create_backups: true,
            backup_suffix: "bak".to_string(),
            transaction_log: true,
            file_locking: true,
            lock_timeout_ms: 30_000,
        }
    }
}

impl SafetyConfig {
    /// Returns the lock acquisition timeout.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub auto_apply_enabled: bool,
    /// Score required before a batch commits without an explicit apply.
    pub auto_apply_threshold: f64,
    /// Seconds a pending stage stays committable.
    pub staging_ttl_secs: u64,
    pub max_stages_per_session: usize,
    pub max_applies_per_session: usize,
    /// Worker thread count. 0 = number of hardware threads.
    pub workers: usize,
    pub safety: SafetyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auto_apply_enabled: false,
            auto_apply_threshold: 0.85,
            staging_ttl_secs: 15 * 60,
            max_stages_per_session: 500,
            max_applies_per_session: 500,
            workers: 0,
            safety: SafetyConfig::default(),
        }
    }
}

impl Config {
    /// Returns the stage TTL as a duration.
    pub fn staging_ttl(&self) -> Duration {
        Duration::from_secs(self.staging_ttl_secs)
    }

    /// Resolves the worker count, treating 0 as "auto".
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        }
    }

    /// Clamps a caller-supplied threshold into the valid range.
    pub fn clamp_threshold(value: f64) -> f64 {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(!config.auto_apply_enabled);
        assert_eq!(config.staging_ttl(), Duration::from_secs(900));
        assert!(config.worker_count() >= 1);
        assert_eq!(config.safety.max_file_size, 5 * 1024 * 1024);
        assert!(config.safety.atomic_writes);
    }

    #[test]
    fn test_threshold_clamping() {
        assert_eq!(Config::clamp_threshold(1.7), 1.0);
        assert_eq!(Config::clamp_threshold(-0.2), 0.0);
        assert_eq!(Config::clamp_threshold(0.42), 0.42);
    }

    #[test]
    fn test_partial_deserialization_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"auto_apply_enabled": true, "workers": 2}"#).unwrap();
        assert!(config.auto_apply_enabled);
        assert_eq!(config.workers, 2);
        assert_eq!(config.max_stages_per_session, 500);
        assert_eq!(config.safety.lock_timeout_ms, 30_000);
    }
}
