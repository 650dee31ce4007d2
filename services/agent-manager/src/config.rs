//! Configuration for the agent manager process.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// Agent manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name stamped on every launched agent and instance.
    pub manager_name: String,

    /// Path of the fleet configuration document.
    pub config_path: PathBuf,

    /// World snapshot backing the in-memory collaborators.
    pub snapshot_path: Option<PathBuf>,

    /// Plan without executing.
    pub dry_run: bool,

    /// Keep reconciling instead of exiting after one pass.
    pub continuous: bool,

    /// Interval between passes in continuous mode, in seconds.
    pub reconcile_interval_secs: u64,

    /// Upper bound on the gather phase, in seconds.
    pub gather_timeout_secs: u64,

    /// Window over which zone scores are counted, in minutes.
    pub metrics_window_mins: u64,

    /// Delete instances orphaned from the CI service.
    pub delete_orphaned_instances: bool,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            manager_name: "agent-manager".to_string(),
            config_path: PathBuf::from("fleet.json"),
            snapshot_path: None,
            dry_run: false,
            continuous: false,
            reconcile_interval_secs: 30,
            gather_timeout_secs: 60,
            metrics_window_mins: fleet_reconcile::DEFAULT_SCORE_WINDOW_MINS,
            delete_orphaned_instances: false,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let manager_name = lookup("FLEET_MANAGER_NAME").unwrap_or(defaults.manager_name);
        if manager_name.is_empty() {
            anyhow::bail!("FLEET_MANAGER_NAME must not be empty");
        }

        Ok(Self {
            manager_name,
            config_path: lookup("FLEET_CONFIG_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.config_path),
            snapshot_path: lookup("FLEET_SNAPSHOT_PATH").map(PathBuf::from),
            dry_run: parse_flag(&lookup, "FLEET_DRY_RUN")?.unwrap_or(defaults.dry_run),
            continuous: parse_flag(&lookup, "FLEET_CONTINUOUS")?.unwrap_or(defaults.continuous),
            reconcile_interval_secs: parse_num(&lookup, "FLEET_RECONCILE_INTERVAL_SECS")?
                .unwrap_or(defaults.reconcile_interval_secs),
            gather_timeout_secs: parse_num(&lookup, "FLEET_GATHER_TIMEOUT_SECS")?
                .unwrap_or(defaults.gather_timeout_secs),
            metrics_window_mins: parse_num(&lookup, "FLEET_METRICS_WINDOW_MINS")?
                .unwrap_or(defaults.metrics_window_mins),
            delete_orphaned_instances: parse_flag(&lookup, "FLEET_DELETE_ORPHANED_INSTANCES")?
                .unwrap_or(defaults.delete_orphaned_instances),
            log_level: lookup("FLEET_LOG_LEVEL").unwrap_or(defaults.log_level),
        })
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn gather_timeout(&self) -> Duration {
        Duration::from_secs(self.gather_timeout_secs)
    }

    pub fn metrics_window(&self) -> Duration {
        Duration::from_secs(self.metrics_window_mins * 60)
    }
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<bool>> {
    lookup(key)
        .map(|value| match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" | "" => Ok(false),
            other => anyhow::bail!("{key} must be a boolean, got '{other}'"),
        })
        .transpose()
}

fn parse_num(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<u64>> {
    lookup(key)
        .map(|value| {
            value
                .parse::<u64>()
                .with_context(|| format!("{key} must be a number, got '{value}'"))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();

        assert_eq!(config.manager_name, "agent-manager");
        assert_eq!(config.config_path, PathBuf::from("fleet.json"));
        assert!(config.snapshot_path.is_none());
        assert!(!config.dry_run);
        assert!(!config.continuous);
        assert_eq!(config.reconcile_interval(), Duration::from_secs(30));
        assert_eq!(config.gather_timeout(), Duration::from_secs(60));
        assert_eq!(config.metrics_window(), Duration::from_secs(3600));
        assert!(!config.delete_orphaned_instances);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("FLEET_MANAGER_NAME", "ci-fleet"),
            ("FLEET_DRY_RUN", "true"),
            ("FLEET_CONTINUOUS", "1"),
            ("FLEET_GATHER_TIMEOUT_SECS", "5"),
            ("FLEET_METRICS_WINDOW_MINS", "30"),
            ("FLEET_DELETE_ORPHANED_INSTANCES", "yes"),
            ("FLEET_SNAPSHOT_PATH", "/tmp/world.json"),
        ])
        .unwrap();

        assert_eq!(config.manager_name, "ci-fleet");
        assert!(config.dry_run);
        assert!(config.continuous);
        assert_eq!(config.gather_timeout(), Duration::from_secs(5));
        assert_eq!(config.metrics_window_mins, 30);
        assert!(config.delete_orphaned_instances);
        assert_eq!(config.snapshot_path, Some(PathBuf::from("/tmp/world.json")));
    }

    #[rstest]
    #[case("1", true)]
    #[case("true", true)]
    #[case("TRUE", true)]
    #[case("yes", true)]
    #[case("0", false)]
    #[case("false", false)]
    #[case("No", false)]
    #[case("", false)]
    fn test_flag_values(#[case] value: &str, #[case] expected: bool) {
        let config = load(&[("FLEET_DRY_RUN", value)]).unwrap();
        assert_eq!(config.dry_run, expected);
    }

    #[rstest]
    #[case::flag("FLEET_DRY_RUN", "maybe")]
    #[case::negative_number("FLEET_RECONCILE_INTERVAL_SECS", "-5")]
    #[case::word_number("FLEET_GATHER_TIMEOUT_SECS", "soon")]
    #[case::empty_name("FLEET_MANAGER_NAME", "")]
    fn test_invalid_values_rejected(#[case] key: &str, #[case] value: &str) {
        assert!(load(&[(key, value)]).is_err());
    }
}
