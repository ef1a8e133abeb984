//! Process-wide configuration (ambient stack — spec §10). Defaults match the
//! spec's stated values; anything marked "empirical" in spec §9 is exposed
//! here so a caller can override it instead of patching constants.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

pub const MAX_WORKERS: u32 = 30;

/// Thresholds for the Adaptive Controller (spec §4.4, §9 open question 1).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// A worker is a "straggler" below this fraction of the median worker's
    /// throughput, for two consecutive ticks.
    pub straggler_fraction: f64,
    /// Scale up once median throughput exceeds this fraction of the
    /// server-hinted per-connection rate.
    pub hint_fraction: f64,
    /// Scale up on a throughput plateau within this fraction of the
    /// previous tick.
    pub plateau_fraction: f64,
    /// Never subdivide a segment below this many remaining bytes.
    pub min_segment_bytes: u64,
    /// Controller tick interval.
    #[serde(with = "duration_secs")]
    pub tick_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            straggler_fraction: 0.25,
            hint_fraction: 0.9,
            plateau_fraction: 0.05,
            min_segment_bytes: 1 << 20,
            tick_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum number of jobs the Orchestrator runs concurrently (spec §4.5 K).
    pub max_concurrent_jobs: usize,
    /// Hard ceiling on a single job's requested worker count.
    pub max_workers_per_job: u32,
    /// Host suffixes a URL's host must match for `add()` to accept it.
    pub allowed_host_suffixes: Vec<String>,
    /// Default age after which terminal jobs are eligible for cleanup.
    #[serde(with = "duration_secs")]
    pub cleanup_age: Duration,
    /// Terminal jobs beyond this count are eligible for cleanup even if
    /// younger than `cleanup_age` (newest retained).
    pub max_completed: usize,
    pub controller: ControllerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 3,
            max_workers_per_job: MAX_WORKERS,
            allowed_host_suffixes: Vec::new(),
            cleanup_age: Duration::from_secs(24 * 3600),
            max_completed: 100,
            controller: ControllerConfig::default(),
        }
    }
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Self, CoreError> {
        toml::from_str(text).map_err(|e| CoreError::Validation(format!("invalid config: {e}")))
    }

    pub async fn from_path(path: &Path) -> Result<Self, CoreError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(CoreError::from)?;
        Self::from_toml_str(&text)
    }

    /// Host allowlist check used by `Orchestrator::add` (spec §6 URL
    /// validation). An empty allowlist matches any host — it is the
    /// caller's responsibility to configure a real allowlist in production.
    pub fn host_allowed(&self, host: &str) -> bool {
        if self.allowed_host_suffixes.is_empty() {
            return true;
        }
        self.allowed_host_suffixes
            .iter()
            .any(|suffix| host == suffix || host.ends_with(&format!(".{suffix}")))
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_values() {
        let cfg = Config::default();
        assert_eq!(cfg.max_concurrent_jobs, 3);
        assert_eq!(cfg.max_workers_per_job, 30);
        assert_eq!(cfg.max_completed, 100);
        assert_eq!(cfg.cleanup_age, Duration::from_secs(24 * 3600));
        assert_eq!(cfg.controller.straggler_fraction, 0.25);
        assert_eq!(cfg.controller.hint_fraction, 0.9);
        assert_eq!(cfg.controller.min_segment_bytes, 1 << 20);
    }

    #[test]
    fn empty_allowlist_allows_any_host() {
        let cfg = Config::default();
        assert!(cfg.host_allowed("example.com"));
    }

    #[test]
    fn allowlist_matches_suffix_and_exact_host() {
        let mut cfg = Config::default();
        cfg.allowed_host_suffixes = vec!["example.com".to_string()];
        assert!(cfg.host_allowed("example.com"));
        assert!(cfg.host_allowed("cdn.example.com"));
        assert!(!cfg.host_allowed("example.com.evil.net"));
        assert!(!cfg.host_allowed("other.org"));
    }

    #[test]
    fn parses_toml_overrides() {
        let text = r#"
            max_concurrent_jobs = 5
            allowed_host_suffixes = ["example.com"]

            [controller]
            straggler_fraction = 0.5
        "#;
        let cfg = Config::from_toml_str(text).expect("parse");
        assert_eq!(cfg.max_concurrent_jobs, 5);
        assert_eq!(cfg.allowed_host_suffixes, vec!["example.com".to_string()]);
        assert_eq!(cfg.controller.straggler_fraction, 0.5);
        // Unspecified fields keep their defaults.
        assert_eq!(cfg.controller.hint_fraction, 0.9);
    }
}
