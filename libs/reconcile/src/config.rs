//! Agent configuration: one scaling policy and VM template per CI queue.
//!
//! Configs are rebuilt from the fleet configuration document on every
//! reconciliation pass. Construction normalizes legacy singular fields
//! (`zone`, `serviceAccount`) into lists and validates the required set
//! before anything is planned against the config.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::ConfigError;
use crate::hash::ConfigHash;

/// Maximum length of a cloud instance name.
pub const INSTANCE_NAME_MAX_LEN: usize = 63;

/// Random bytes appended (hex encoded) to every instance name.
pub const INSTANCE_SUFFIX_BYTES: usize = 8;

/// Longest agent name that still fits an instance name once the
/// `-<suffix>` is appended.
pub const MAX_AGENT_NAME_LEN: usize = INSTANCE_NAME_MAX_LEN - INSTANCE_SUFFIX_BYTES * 2 - 1;

/// Subnetwork used when a config does not name one.
pub const DEFAULT_SUBNETWORK: &str = "default";

/// Persistent disk flavours accepted for the boot disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiskType {
    PdSsd,
    PdBalanced,
    PdStandard,
}

impl DiskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskType::PdSsd => "pd-ssd",
            DiskType::PdBalanced => "pd-balanced",
            DiskType::PdStandard => "pd-standard",
        }
    }
}

impl std::fmt::Display for DiskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw, partially specified agent config as it appears in the fleet
/// configuration document (after top-level defaults are merged in).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfigInput {
    pub name: Option<String>,
    pub queue: Option<String>,
    pub project: Option<String>,
    /// Deprecated, use `zones`.
    pub zone: Option<String>,
    pub zones: Option<Vec<String>>,
    pub image: Option<String>,
    pub image_family: Option<String>,
    pub machine_type: Option<String>,
    pub subnetwork: Option<String>,
    pub disable_external_ip: Option<bool>,
    pub nested_virtualization: Option<bool>,
    pub service_account: Option<String>,
    pub service_accounts: Option<Vec<String>>,
    pub disk_type: Option<DiskType>,
    pub disk_size_gb: Option<u32>,
    pub local_ssds: Option<u32>,
    pub startup_script: Option<String>,
    pub tags: Option<Vec<String>>,
    pub metadata: Option<BTreeMap<String, String>>,
    pub labels: Option<BTreeMap<String, String>>,
    pub build_path: Option<String>,
    pub overprovision: Option<f64>,
    pub minimum_agents: Option<u32>,
    pub maximum_agents: Option<u32>,
    pub idle_timeout_mins: Option<u32>,
    pub idle_timeout_secs: Option<u32>,
    pub exit_after_one_job: Option<bool>,
    pub graceful_stop_after_mins: Option<u32>,
    pub hard_stop_after_mins: Option<u32>,
    pub spot: Option<bool>,
}

/// Round-robin position over a config's zones.
///
/// This is the only mutable state on an [`AgentConfig`]. It advances through
/// a shared reference so concurrent launches for one config still rotate
/// zones. The position is not part of the config's identity: clones start
/// from the current position and equality ignores it.
#[derive(Debug, Default)]
struct ZoneCursor(AtomicUsize);

impl ZoneCursor {
    /// Returns the current position and advances it modulo `len`.
    fn advance(&self, len: usize) -> usize {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some((current + 1) % len)
            })
            .unwrap_or_else(|current| current)
    }
}

impl Clone for ZoneCursor {
    fn clone(&self) -> Self {
        Self(AtomicUsize::new(self.0.load(Ordering::SeqCst)))
    }
}

impl PartialEq for ZoneCursor {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

/// A validated, normalized agent configuration for a single CI queue.
///
/// Immutable once built, with two exceptions: `image` may be late-bound from
/// `image_family` via [`AgentConfig::resolve_image`] before planning, and the
/// zone round-robin cursor advances on every [`AgentConfig::next_zone`] call.
///
/// Numeric policy knobs equal to zero are stored as `None` ("unset").
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub name: String,
    pub queue: String,
    pub project: String,
    /// Non-empty, in rotation order.
    pub zones: Vec<String>,
    pub image: Option<String>,
    pub image_family: Option<String>,
    pub machine_type: String,
    pub subnetwork: String,
    pub disable_external_ip: bool,
    pub nested_virtualization: bool,
    pub service_account: Option<String>,
    pub service_accounts: Vec<String>,
    pub disk_type: Option<DiskType>,
    pub disk_size_gb: Option<u32>,
    pub local_ssds: Option<u32>,
    pub startup_script: Option<String>,
    pub tags: Vec<String>,
    pub metadata: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub build_path: Option<String>,
    /// Below 1 a fraction of demand, at or above 1 a flat number of agents.
    pub overprovision: Option<f64>,
    pub minimum_agents: Option<u32>,
    pub maximum_agents: Option<u32>,
    pub idle_timeout_mins: Option<u32>,
    pub idle_timeout_secs: Option<u32>,
    pub exit_after_one_job: bool,
    pub graceful_stop_after_mins: Option<u32>,
    pub hard_stop_after_mins: Option<u32>,
    pub spot: bool,
    zone_cursor: ZoneCursor,
}

impl AgentConfig {
    /// Normalize and validate a raw config.
    pub fn new(input: AgentConfigInput) -> Result<Self, ConfigError> {
        let name = required(input.name, "name")?;
        let queue = required(input.queue, "queue")?;
        let project = required(input.project, "project")?;
        let machine_type = required(input.machine_type, "machineType")?;

        let image = non_empty(input.image);
        let image_family = non_empty(input.image_family);
        if image.is_none() && image_family.is_none() {
            return Err(ConfigError::MissingImage);
        }

        let mut zones: Vec<String> = Vec::new();
        for zone in input.zones.unwrap_or_default() {
            if !zone.is_empty() && !zones.contains(&zone) {
                zones.push(zone);
            }
        }
        if zones.is_empty() {
            if let Some(zone) = non_empty(input.zone) {
                zones.push(zone);
            }
        }
        if zones.is_empty() {
            return Err(ConfigError::MissingZone);
        }

        if name.chars().count() > MAX_AGENT_NAME_LEN {
            return Err(ConfigError::NameTooLong {
                name,
                max: MAX_AGENT_NAME_LEN,
            });
        }

        let service_account = non_empty(input.service_account);
        let service_accounts = match input.service_accounts {
            Some(accounts) => accounts,
            None => service_account.iter().cloned().collect(),
        };

        Ok(Self {
            name,
            queue,
            project,
            zones,
            image,
            image_family,
            machine_type,
            subnetwork: non_empty(input.subnetwork)
                .unwrap_or_else(|| DEFAULT_SUBNETWORK.to_string()),
            disable_external_ip: input.disable_external_ip.unwrap_or(false),
            nested_virtualization: input.nested_virtualization.unwrap_or(false),
            service_account,
            service_accounts,
            disk_type: input.disk_type,
            disk_size_gb: positive(input.disk_size_gb),
            local_ssds: positive(input.local_ssds),
            startup_script: non_empty(input.startup_script),
            tags: input.tags.unwrap_or_default(),
            metadata: input.metadata.unwrap_or_default(),
            labels: input.labels.unwrap_or_default(),
            build_path: non_empty(input.build_path),
            overprovision: input.overprovision.filter(|v| *v > 0.0),
            minimum_agents: positive(input.minimum_agents),
            maximum_agents: positive(input.maximum_agents),
            idle_timeout_mins: positive(input.idle_timeout_mins),
            idle_timeout_secs: positive(input.idle_timeout_secs),
            exit_after_one_job: input.exit_after_one_job.unwrap_or(false),
            graceful_stop_after_mins: positive(input.graceful_stop_after_mins),
            hard_stop_after_mins: positive(input.hard_stop_after_mins),
            spot: input.spot.unwrap_or(false),
            zone_cursor: ZoneCursor::default(),
        })
    }

    /// Decode and validate a single agent config from JSON.
    pub fn from_json(value: serde_json::Value) -> Result<Self, ConfigError> {
        let input: AgentConfigInput = serde_json::from_value(value)?;
        Self::new(input)
    }

    /// Returns the next zone in round-robin order.
    pub fn next_zone(&self) -> &str {
        let index = self.zone_cursor.advance(self.zones.len());
        &self.zones[index % self.zones.len()]
    }

    /// Bind the image resolved from `image_family`. An explicit `image`
    /// always wins.
    pub fn resolve_image(&mut self, image: impl Into<String>) {
        if self.image.is_none() {
            self.image = Some(image.into());
        }
    }

    /// Idle timeout in seconds, preferring the legacy seconds field.
    pub fn idle_timeout(&self) -> Option<u64> {
        self.idle_timeout_secs
            .map(u64::from)
            .or_else(|| self.idle_timeout_mins.map(|m| u64::from(m) * 60))
    }

    /// Hash of every field that changes the identity of a launched VM.
    ///
    /// Scaling and lifecycle knobs are deliberately excluded: changing them
    /// must not drain running agents.
    pub fn hash(&self) -> ConfigHash {
        ConfigHash::from_json(&serde_json::json!({
            "project": self.project,
            "zones": self.zones,
            "image": self.image,
            "imageFamily": self.image_family,
            "subnetwork": self.subnetwork,
            "disableExternalIp": self.disable_external_ip,
            "machineType": self.machine_type,
            "serviceAccount": self.service_account,
            "diskType": self.disk_type,
            "diskSizeGb": self.disk_size_gb,
            "localSsds": self.local_ssds,
            "startupScript": self.startup_script,
            "tags": self.tags,
            "metadata": self.metadata,
            "idleTimeoutSecs": self.idle_timeout_secs,
            "idleTimeoutMins": self.idle_timeout_mins,
            "exitAfterOneJob": self.exit_after_one_job,
            "nestedVirtualization": self.nested_virtualization,
        }))
    }
}

impl TryFrom<AgentConfigInput> for AgentConfig {
    type Error = ConfigError;

    fn try_from(input: AgentConfigInput) -> Result<Self, Self::Error> {
        Self::new(input)
    }
}

fn required(value: Option<String>, field: &'static str) -> Result<String, ConfigError> {
    non_empty(value).ok_or(ConfigError::MissingField(field))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn positive(value: Option<u32>) -> Option<u32> {
    value.filter(|v| *v > 0)
}

/// The fleet configuration document.
///
/// `gcp` holds fleet-wide defaults plus an `agents` array; every key other
/// than `agents` is merged under each agent entry, with the agent's own keys
/// taking precedence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopLevelConfig {
    pub gcp: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub pause_all_agents: bool,
}

/// An agent entry that failed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedConfig {
    /// Position in the `agents` array.
    pub index: usize,
    pub name: Option<String>,
    pub error: ConfigError,
}

/// All valid agent configs for one pass, plus fleet-wide switches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FleetConfig {
    pub project: String,
    pub agents: Vec<AgentConfig>,
    pub pause_all_agents: bool,
    pub rejected: Vec<RejectedConfig>,
}

impl FleetConfig {
    /// Build every agent config, logging and skipping the invalid ones.
    ///
    /// Names are unique across the result: a later entry reusing a name is
    /// rejected and the first one is kept.
    pub fn from_top_level(config: &TopLevelConfig) -> Self {
        let mut defaults = config.gcp.clone();
        let agents = match defaults.remove("agents") {
            Some(serde_json::Value::Array(agents)) => agents,
            _ => Vec::new(),
        };

        let project = defaults
            .get("project")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let mut fleet = FleetConfig {
            project,
            agents: Vec::with_capacity(agents.len()),
            pause_all_agents: config.pause_all_agents,
            rejected: Vec::new(),
        };

        for (index, agent) in agents.into_iter().enumerate() {
            let name = agent
                .get("name")
                .and_then(|v| v.as_str())
                .map(str::to_string);

            let result = match agent {
                serde_json::Value::Object(overrides) => {
                    let mut merged = defaults.clone();
                    merged.extend(overrides);
                    AgentConfig::from_json(serde_json::Value::Object(merged))
                }
                other => Err(ConfigError::Malformed(format!(
                    "expected an object, got {other}"
                ))),
            };
            let result = result.and_then(|agent| {
                if fleet.agents.iter().any(|kept| kept.name == agent.name) {
                    Err(ConfigError::DuplicateName(agent.name.clone()))
                } else {
                    Ok(agent)
                }
            });

            match result {
                Ok(agent) => fleet.agents.push(agent),
                Err(e) => {
                    error!(index, name = ?name, error = %e, "Skipping invalid agent config");
                    fleet.rejected.push(RejectedConfig {
                        index,
                        name,
                        error: e,
                    });
                }
            }
        }

        fleet
    }

    /// Decode the fleet document from JSON and build it.
    pub fn from_json(value: serde_json::Value) -> Result<Self, ConfigError> {
        let top: TopLevelConfig = serde_json::from_value(value)?;
        Ok(Self::from_top_level(&top))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> AgentConfigInput {
        AgentConfigInput {
            name: Some("test-name".to_string()),
            queue: Some("queue".to_string()),
            project: Some("test-project".to_string()),
            image_family: Some("test-image-family".to_string()),
            machine_type: Some("test-machine-type".to_string()),
            zone: Some("test-zone".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_minimal_config_is_normalized() {
        let config = AgentConfig::new(input()).unwrap();

        assert_eq!(config.zones, vec!["test-zone"]);
        assert_eq!(config.subnetwork, "default");
        assert!(!config.spot);
        assert!(config.service_accounts.is_empty());
        assert_eq!(config.image, None);
    }

    fn assert_missing(field: &'static str, clear: impl FnOnce(&mut AgentConfigInput)) {
        let mut raw = input();
        clear(&mut raw);
        assert_eq!(
            AgentConfig::new(raw).unwrap_err(),
            ConfigError::MissingField(field)
        );
    }

    #[test]
    fn test_missing_required_fields() {
        assert_missing("name", |i| i.name = None);
        assert_missing("queue", |i| i.queue = None);
        assert_missing("project", |i| i.project = Some(String::new()));
        assert_missing("machineType", |i| i.machine_type = None);
    }

    #[test]
    fn test_image_or_family_required() {
        let mut raw = input();
        raw.image_family = None;
        assert_eq!(AgentConfig::new(raw.clone()).unwrap_err(), ConfigError::MissingImage);

        raw.image = Some("img-1".to_string());
        assert!(AgentConfig::new(raw).is_ok());
    }

    #[test]
    fn test_zone_or_zones_required() {
        let mut raw = input();
        raw.zone = None;
        assert_eq!(AgentConfig::new(raw.clone()).unwrap_err(), ConfigError::MissingZone);

        raw.zones = Some(vec![]);
        assert_eq!(AgentConfig::new(raw).unwrap_err(), ConfigError::MissingZone);
    }

    #[test]
    fn test_repeated_zones_collapse() {
        let mut raw = input();
        raw.zones = Some(vec!["a".to_string(), "b".to_string(), "a".to_string()]);

        let config = AgentConfig::new(raw).unwrap();
        assert_eq!(config.zones, vec!["a", "b"]);
        assert_eq!(config.next_zone(), "a");
        assert_eq!(config.next_zone(), "b");
        assert_eq!(config.next_zone(), "a");
    }

    #[test]
    fn test_zones_win_over_legacy_zone() {
        let mut raw = input();
        raw.zones = Some(vec!["a".to_string(), "b".to_string()]);

        let config = AgentConfig::new(raw).unwrap();
        assert_eq!(config.zones, vec!["a", "b"]);
    }

    #[test]
    fn test_name_length_bound() {
        assert_eq!(MAX_AGENT_NAME_LEN, 46);

        let mut raw = input();
        raw.name = Some("a".repeat(46));
        assert!(AgentConfig::new(raw.clone()).is_ok());

        raw.name = Some("a".repeat(47));
        assert!(matches!(
            AgentConfig::new(raw).unwrap_err(),
            ConfigError::NameTooLong { max: 46, .. }
        ));
    }

    #[test]
    fn test_service_account_normalized_into_list() {
        let mut raw = input();
        raw.service_account = Some("sa@example.iam".to_string());
        let config = AgentConfig::new(raw.clone()).unwrap();
        assert_eq!(config.service_accounts, vec!["sa@example.iam"]);

        raw.service_accounts = Some(vec!["other@example.iam".to_string()]);
        let config = AgentConfig::new(raw).unwrap();
        assert_eq!(config.service_accounts, vec!["other@example.iam"]);
    }

    #[test]
    fn test_zero_knobs_are_unset() {
        let mut raw = input();
        raw.minimum_agents = Some(0);
        raw.maximum_agents = Some(0);
        raw.overprovision = Some(0.0);
        raw.hard_stop_after_mins = Some(0);

        let config = AgentConfig::new(raw).unwrap();
        assert_eq!(config.minimum_agents, None);
        assert_eq!(config.maximum_agents, None);
        assert_eq!(config.overprovision, None);
        assert_eq!(config.hard_stop_after_mins, None);
    }

    #[test]
    fn test_next_zone_round_robin() {
        let mut raw = input();
        raw.zones = Some(vec!["a".to_string(), "b".to_string(), "c".to_string()]);
        let config = AgentConfig::new(raw).unwrap();

        let picked: Vec<&str> = (0..7).map(|_| config.next_zone()).collect();
        assert_eq!(picked, vec!["a", "b", "c", "a", "b", "c", "a"]);
    }

    #[test]
    fn test_next_zone_cursor_is_per_instance() {
        let mut raw = input();
        raw.zones = Some(vec!["a".to_string(), "b".to_string()]);
        let first = AgentConfig::new(raw.clone()).unwrap();
        let second = AgentConfig::new(raw).unwrap();

        assert_eq!(first.next_zone(), "a");
        assert_eq!(first.next_zone(), "b");
        assert_eq!(second.next_zone(), "a");
        assert_eq!(first, second);
    }

    #[test]
    fn test_hash_ignores_unhashed_fields() {
        let base = AgentConfig::new(input()).unwrap();

        let mut raw = input();
        raw.name = Some("other-name".to_string());
        raw.queue = Some("other-queue".to_string());
        raw.minimum_agents = Some(5);
        raw.maximum_agents = Some(50);
        raw.overprovision = Some(0.5);
        raw.graceful_stop_after_mins = Some(30);
        raw.hard_stop_after_mins = Some(60);
        raw.spot = Some(true);
        raw.labels = Some(BTreeMap::from([("team".to_string(), "ci".to_string())]));
        raw.build_path = Some("/builds".to_string());
        let other = AgentConfig::new(raw).unwrap();

        assert_eq!(base.hash(), other.hash());
    }

    fn assert_hash_changes(change: impl FnOnce(&mut AgentConfigInput)) {
        let base = AgentConfig::new(input()).unwrap().hash();
        let mut raw = input();
        change(&mut raw);
        assert_ne!(base, AgentConfig::new(raw).unwrap().hash());
    }

    #[test]
    fn test_hash_changes_with_hashed_fields() {
        assert_hash_changes(|i| i.project = Some("p2".to_string()));
        assert_hash_changes(|i| i.zones = Some(vec!["test-zone".to_string(), "z2".to_string()]));
        assert_hash_changes(|i| i.image = Some("img".to_string()));
        assert_hash_changes(|i| i.image_family = Some("fam2".to_string()));
        assert_hash_changes(|i| i.subnetwork = Some("ci".to_string()));
        assert_hash_changes(|i| i.disable_external_ip = Some(true));
        assert_hash_changes(|i| i.machine_type = Some("n2-standard-4".to_string()));
        assert_hash_changes(|i| i.service_account = Some("sa".to_string()));
        assert_hash_changes(|i| i.disk_type = Some(DiskType::PdBalanced));
        assert_hash_changes(|i| i.disk_size_gb = Some(200));
        assert_hash_changes(|i| i.local_ssds = Some(2));
        assert_hash_changes(|i| i.startup_script = Some("echo".to_string()));
        assert_hash_changes(|i| i.tags = Some(vec!["t".to_string()]));
        assert_hash_changes(|i| {
            i.metadata = Some(BTreeMap::from([("k".to_string(), "v".to_string())]))
        });
        assert_hash_changes(|i| i.idle_timeout_secs = Some(60));
        assert_hash_changes(|i| i.idle_timeout_mins = Some(10));
        assert_hash_changes(|i| i.exit_after_one_job = Some(true));
        assert_hash_changes(|i| i.nested_virtualization = Some(true));
    }

    #[test]
    fn test_resolved_image_changes_hash_but_explicit_image_wins() {
        let mut config = AgentConfig::new(input()).unwrap();
        let before = config.hash();

        config.resolve_image("family-image-123");
        assert_eq!(config.image.as_deref(), Some("family-image-123"));
        assert_ne!(before, config.hash());

        config.resolve_image("family-image-456");
        assert_eq!(config.image.as_deref(), Some("family-image-123"));
    }

    #[test]
    fn test_idle_timeout_prefers_seconds() {
        let mut raw = input();
        raw.idle_timeout_mins = Some(5);
        assert_eq!(AgentConfig::new(raw.clone()).unwrap().idle_timeout(), Some(300));

        raw.idle_timeout_secs = Some(90);
        assert_eq!(AgentConfig::new(raw).unwrap().idle_timeout(), Some(90));
    }

    #[test]
    fn test_fleet_config_merges_defaults_and_skips_invalid() {
        let fleet = FleetConfig::from_json(serde_json::json!({
            "gcp": {
                "project": "ci-project",
                "zone": "us-central1-b",
                "imageFamily": "ci-agents",
                "agents": [
                    { "name": "linux", "queue": "default", "machineType": "n2-standard-2" },
                    { "name": "broken", "queue": "broken" },
                    { "name": "spot", "queue": "spot", "machineType": "n2-standard-8",
                      "zones": ["us-central1-a", "us-central1-f"], "spot": true,
                      "project": "spot-project" },
                    "not-an-object"
                ]
            },
            "pauseAllAgents": true
        }))
        .unwrap();

        assert_eq!(fleet.project, "ci-project");
        assert!(fleet.pause_all_agents);
        assert_eq!(fleet.agents.len(), 2);

        assert_eq!(fleet.agents[0].project, "ci-project");
        assert_eq!(fleet.agents[0].zones, vec!["us-central1-b"]);
        assert_eq!(fleet.agents[0].image_family.as_deref(), Some("ci-agents"));

        assert_eq!(fleet.agents[1].project, "spot-project");
        assert_eq!(fleet.agents[1].zones, vec!["us-central1-a", "us-central1-f"]);
        assert!(fleet.agents[1].spot);

        assert_eq!(fleet.rejected.len(), 2);
        assert_eq!(fleet.rejected[0].name.as_deref(), Some("broken"));
        assert_eq!(fleet.rejected[0].error, ConfigError::MissingField("machineType"));
        assert!(matches!(fleet.rejected[1].error, ConfigError::Malformed(_)));
    }

    #[test]
    fn test_fleet_config_keeps_first_of_duplicate_names() {
        let fleet = FleetConfig::from_json(serde_json::json!({
            "gcp": {
                "project": "ci-project",
                "zone": "us-central1-b",
                "image": "ci-agents-v1",
                "machineType": "n2-standard-2",
                "agents": [
                    { "name": "linux", "queue": "a" },
                    { "name": "linux", "queue": "b" },
                    { "name": "mac", "queue": "c" }
                ]
            }
        }))
        .unwrap();

        let names: Vec<(&str, &str)> = fleet
            .agents
            .iter()
            .map(|c| (c.name.as_str(), c.queue.as_str()))
            .collect();
        assert_eq!(names, vec![("linux", "a"), ("mac", "c")]);

        assert_eq!(fleet.rejected.len(), 1);
        assert_eq!(fleet.rejected[0].index, 1);
        assert_eq!(
            fleet.rejected[0].error,
            ConfigError::DuplicateName("linux".to_string())
        );
    }

    #[test]
    fn test_fleet_config_pause_defaults_off() {
        let fleet = FleetConfig::from_json(serde_json::json!({
            "gcp": { "project": "p", "agents": [] }
        }))
        .unwrap();

        assert!(!fleet.pause_all_agents);
        assert!(fleet.agents.is_empty());
    }

    #[test]
    fn test_disk_type_wire_names() {
        let config = AgentConfig::from_json(serde_json::json!({
            "name": "n", "queue": "q", "project": "p", "image": "i",
            "machineType": "m", "zone": "z", "diskType": "pd-balanced"
        }))
        .unwrap();
        assert_eq!(config.disk_type, Some(DiskType::PdBalanced));

        let err = AgentConfig::from_json(serde_json::json!({
            "name": "n", "queue": "q", "project": "p", "image": "i",
            "machineType": "m", "zone": "z", "diskType": "floppy"
        }))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Malformed(_)));
    }
}
