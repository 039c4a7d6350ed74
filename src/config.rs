//! Configuration module for PathWatch.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file (default: "pathwatch.db")
    pub db_path: String,
    /// Probe strategy: "auto", "raw", "system", or "ping"
    pub trace_mode: String,
    /// Pause between TTL probes in the per-hop ping strategy, milliseconds
    pub inter_probe_delay_ms: u64,
    /// End a per-hop trace after this many consecutive unanswered probes
    pub max_consecutive_timeouts: u32,
    /// Focus window: recent samples per hop used for rolling statistics
    pub focus_samples: u32,
    /// Reverse-DNS cache capacity
    pub dns_cache_capacity: usize,
    /// Consecutive resolution failures before a target is deactivated
    pub dns_failure_threshold: u32,
    /// Global cap on concurrently running probe cycles
    pub worker_cap: usize,
    /// Seconds between DNS enrichment sweeps
    pub enrich_interval_secs: u64,
    /// Queued IPs resolved per enrichment sweep
    pub enrich_batch: usize,
    /// Max sample rows backfilled per IP per sweep
    pub enrich_update_limit: u32,
    /// Seconds between maintenance sweeps
    pub maintenance_interval_secs: u64,
    /// Raw samples older than this are rolled up into hourly buckets
    pub rollup_horizon_secs: i64,
    /// Raw samples older than this are deleted
    pub raw_retention_secs: i64,
    /// Hourly rollups older than this are deleted
    pub rollup_retention_secs: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: "pathwatch.db".to_string(),
            trace_mode: "auto".to_string(),
            inter_probe_delay_ms: 25,
            max_consecutive_timeouts: 4,
            focus_samples: 10,
            dns_cache_capacity: 512,
            dns_failure_threshold: 3,
            worker_cap: 8,
            enrich_interval_secs: 30,
            enrich_batch: 16,
            enrich_update_limit: 500,
            maintenance_interval_secs: 60,
            rollup_horizon_secs: 86_400,       // 1 day
            raw_retention_secs: 604_800,       // 7 days
            rollup_retention_secs: 31_536_000, // 1 year
        }
    }
}

fn env_parse<T: FromStr>(key: &str, field: &mut T) {
    if let Ok(raw) = env::var(key) {
        if let Ok(value) = raw.parse() {
            *field = value;
        }
    }
}

impl Config {
    /// Load configuration from `PATHWATCH_*` environment variables.
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(path) = env::var("PATHWATCH_DB_PATH") {
            cfg.db_path = path;
        }
        if let Ok(mode) = env::var("PATHWATCH_TRACE_MODE") {
            cfg.trace_mode = mode;
        }
        env_parse("PATHWATCH_INTER_PROBE_DELAY_MS", &mut cfg.inter_probe_delay_ms);
        env_parse("PATHWATCH_MAX_CONSECUTIVE_TIMEOUTS", &mut cfg.max_consecutive_timeouts);
        env_parse("PATHWATCH_FOCUS_SAMPLES", &mut cfg.focus_samples);
        env_parse("PATHWATCH_DNS_CACHE_CAPACITY", &mut cfg.dns_cache_capacity);
        env_parse("PATHWATCH_DNS_FAILURE_THRESHOLD", &mut cfg.dns_failure_threshold);
        env_parse("PATHWATCH_WORKER_CAP", &mut cfg.worker_cap);
        env_parse("PATHWATCH_ENRICH_INTERVAL_SECS", &mut cfg.enrich_interval_secs);
        env_parse("PATHWATCH_ENRICH_BATCH", &mut cfg.enrich_batch);
        env_parse("PATHWATCH_ENRICH_UPDATE_LIMIT", &mut cfg.enrich_update_limit);
        env_parse("PATHWATCH_MAINTENANCE_INTERVAL_SECS", &mut cfg.maintenance_interval_secs);
        env_parse("PATHWATCH_ROLLUP_HORIZON_SECS", &mut cfg.rollup_horizon_secs);
        env_parse("PATHWATCH_RAW_RETENTION_SECS", &mut cfg.raw_retention_secs);
        env_parse("PATHWATCH_ROLLUP_RETENTION_SECS", &mut cfg.rollup_retention_secs);

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.db_path, "pathwatch.db");
        assert_eq!(cfg.trace_mode, "auto");
        assert_eq!(cfg.focus_samples, 10);
        assert_eq!(cfg.dns_failure_threshold, 3);
        assert_eq!(cfg.rollup_horizon_secs, 86_400);
    }
}
