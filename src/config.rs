//! Configuration module for checkwarden.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Path to the SQLite database file (default: "checkwarden.db")
    pub db_path: String,
    /// Number of check workers (default: host CPU count)
    pub test_workers: usize,
    /// Results kept per check and target (default: 100)
    pub max_results_per_check: i64,
    /// Age in days after which results are dropped (default: 90)
    pub result_retention_days: i64,
    /// Replace the scheduler with a no-op one (default: false)
    pub disable_scheduler: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: "checkwarden.db".to_string(),
            test_workers: default_workers(),
            max_results_per_check: 100,
            result_retention_days: 90,
            disable_scheduler: false,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `CHECKWARDEN_DB_PATH`
    /// - `CHECKWARDEN_TEST_WORKERS`
    /// - `CHECKWARDEN_MAX_RESULTS_PER_CHECK`
    /// - `CHECKWARDEN_RESULT_RETENTION_DAYS`
    /// - `CHECKWARDEN_DISABLE_SCHEDULER` (`true`/`1` to disable)
    ///
    /// Values that fail to parse keep their default.
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(db_path) = lookup("CHECKWARDEN_DB_PATH") {
            cfg.db_path = db_path;
        }

        let workers: Option<usize> = parse_var(&lookup, "CHECKWARDEN_TEST_WORKERS");
        if let Some(workers) = workers.filter(|&n| n > 0) {
            cfg.test_workers = workers;
        }

        if let Some(max) = parse_var(&lookup, "CHECKWARDEN_MAX_RESULTS_PER_CHECK") {
            cfg.max_results_per_check = max;
        }

        if let Some(days) = parse_var(&lookup, "CHECKWARDEN_RESULT_RETENTION_DAYS") {
            cfg.result_retention_days = days;
        }

        if let Some(flag) = lookup("CHECKWARDEN_DISABLE_SCHEDULER") {
            cfg.disable_scheduler = matches!(flag.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }

        cfg
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring invalid value {:?} for {}", raw, key);
            None
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load_from(vars: &[(&str, &str)]) -> ServerConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.db_path, "checkwarden.db");
        assert!(cfg.test_workers >= 1);
        assert_eq!(cfg.max_results_per_check, 100);
        assert_eq!(cfg.result_retention_days, 90);
        assert!(!cfg.disable_scheduler);
    }

    #[test]
    fn test_overrides() {
        let cfg = load_from(&[
            ("CHECKWARDEN_DB_PATH", "/tmp/cw.db"),
            ("CHECKWARDEN_TEST_WORKERS", "3"),
            ("CHECKWARDEN_MAX_RESULTS_PER_CHECK", "10"),
            ("CHECKWARDEN_RESULT_RETENTION_DAYS", "30"),
            ("CHECKWARDEN_DISABLE_SCHEDULER", "true"),
        ]);
        assert_eq!(cfg.db_path, "/tmp/cw.db");
        assert_eq!(cfg.test_workers, 3);
        assert_eq!(cfg.max_results_per_check, 10);
        assert_eq!(cfg.result_retention_days, 30);
        assert!(cfg.disable_scheduler);
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let cfg = load_from(&[
            ("CHECKWARDEN_TEST_WORKERS", "0"),
            ("CHECKWARDEN_MAX_RESULTS_PER_CHECK", "lots"),
            ("CHECKWARDEN_DISABLE_SCHEDULER", "nope"),
        ]);
        let defaults = ServerConfig::default();
        assert_eq!(cfg.test_workers, defaults.test_workers);
        assert_eq!(cfg.max_results_per_check, 100);
        assert!(!cfg.disable_scheduler);
    }
}
