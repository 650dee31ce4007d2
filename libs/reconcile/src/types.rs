//! World-state types observed from the CI service and the cloud provider.
//!
//! Both systems hand back loosely typed key/value bags (agent tags such as
//! `queue=default`, instance metadata items). They are wrapped here so the
//! planner works with named keys instead of ad hoc string matching.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Agent tag holding the queue an agent serves.
pub const QUEUE_TAG: &str = "queue";

/// Agent tag holding the drift hash of the config the agent was launched from.
pub const HASH_TAG: &str = "hash";

/// Agent tag naming the manager that owns the agent.
pub const MANAGER_TAG: &str = "agent-manager";

/// Instance metadata item tying an instance to its agent config.
pub const AGENT_NAME_KEY: &str = "buildkite-agent-name";

/// Instance metadata item recording the CI agent an instance is paired with.
/// Its presence is the "connected" marker.
pub const AGENT_ID_KEY: &str = "buildkite-agent-id";

// ── CI agents ──────────────────────────────────────────────────────

/// Connection state reported by the CI service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connected,
    Disconnected,
    #[serde(other)]
    Other,
}

/// Tags attached to a CI agent, kept in their `key=value` wire order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentTags(Vec<String>);

impl AgentTags {
    pub fn new(tags: Vec<String>) -> Self {
        Self(tags)
    }

    /// Build tags from key/value pairs.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self(pairs.into_iter().map(|(k, v)| format!("{k}={v}")).collect())
    }

    /// Returns true if any tag is exactly `key=value`.
    pub fn contains(&self, key: &str, value: &str) -> bool {
        self.pairs().any(|(k, v)| k == key && v == value)
    }

    /// Returns the value of the first tag with the given key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    pub fn push(&mut self, key: &str, value: &str) {
        self.0.push(format!("{key}={value}"));
    }

    /// Iterate tags as `(key, value)`. Tags without `=` have an empty value.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .map(|tag| tag.split_once('=').unwrap_or((tag.as_str(), "")))
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

/// An agent registered with the CI service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CiAgent {
    /// Stable identity used for de-duplication.
    pub id: String,
    /// Identity used by the stop API.
    #[serde(default)]
    pub uuid: String,
    /// Matches the name of the instance the agent runs on.
    pub name: String,
    pub connection_state: ConnectionState,
    pub created_at: DateTime<Utc>,
    #[serde(default, rename = "metaData")]
    pub tags: AgentTags,
    /// Set once a graceful stop has been requested.
    #[serde(default)]
    pub stop_requested_at: Option<DateTime<Utc>>,
}

impl CiAgent {
    pub fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
    }

    pub fn is_stopping(&self) -> bool {
        self.stop_requested_at.is_some()
    }

    /// Returns true if the agent is tagged for the given queue.
    pub fn serves_queue(&self, queue: &str) -> bool {
        self.tags.contains(QUEUE_TAG, queue)
    }

    /// How long the agent has been registered as of `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }
}

// ── Cloud instances ────────────────────────────────────────────────

/// Lifecycle status of a cloud instance.
///
/// `Provisioning → Staging → Running → {Terminated | Suspending → Suspended}`,
/// with `Repairing` as a side state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Provisioning,
    Staging,
    Running,
    Stopping,
    Terminated,
    Repairing,
    Suspending,
    Suspended,
}

impl InstanceStatus {
    /// Returns true for states that count as fleet capacity.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Provisioning | InstanceStatus::Staging | InstanceStatus::Running
        )
    }

    /// Returns true for states the planner may delete from. Mid-transition
    /// states are left alone until they settle.
    pub fn is_deletable(&self) -> bool {
        self.is_live() || *self == InstanceStatus::Terminated
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceStatus::Provisioning => "PROVISIONING",
            InstanceStatus::Staging => "STAGING",
            InstanceStatus::Running => "RUNNING",
            InstanceStatus::Stopping => "STOPPING",
            InstanceStatus::Terminated => "TERMINATED",
            InstanceStatus::Repairing => "REPAIRING",
            InstanceStatus::Suspending => "SUSPENDING",
            InstanceStatus::Suspended => "SUSPENDED",
        };
        f.write_str(s)
    }
}

/// A single instance metadata entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataItem {
    pub key: String,
    pub value: String,
}

impl MetadataItem {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Ordered instance metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceMetadata {
    #[serde(default)]
    pub items: Vec<MetadataItem>,
}

impl InstanceMetadata {
    pub fn new(items: Vec<MetadataItem>) -> Self {
        Self { items }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|item| item.key == key)
            .map(|item| item.value.as_str())
    }

    /// Insert or replace an item.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.items.iter_mut().find(|item| item.key == key) {
            Some(item) => item.value = value,
            None => self.items.push(MetadataItem::new(key, value)),
        }
    }
}

/// A virtual machine observed at the cloud provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudInstance {
    /// Stable identity used for de-duplication.
    pub id: String,
    pub name: String,
    pub status: InstanceStatus,
    pub creation_timestamp: DateTime<Utc>,
    pub zone: String,
    #[serde(default)]
    pub metadata: InstanceMetadata,
}

impl CloudInstance {
    /// Name of the agent config that launched this instance.
    pub fn agent_name(&self) -> Option<&str> {
        self.metadata.get(AGENT_NAME_KEY)
    }

    pub fn belongs_to(&self, config_name: &str) -> bool {
        self.agent_name() == Some(config_name)
    }

    /// Returns true once the instance has been paired with a CI agent.
    pub fn is_marked_connected(&self) -> bool {
        self.metadata.get(AGENT_ID_KEY).is_some()
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.creation_timestamp
    }
}

// ── Queue metrics ──────────────────────────────────────────────────

/// Agent counts for a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCounts {
    pub idle: u32,
    pub busy: u32,
    pub total: u32,
}

/// Job counts for a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub running: u32,
    pub scheduled: u32,
    pub waiting: u32,
    pub total: u32,
}

/// Per-queue metrics reported by the CI service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub agents: AgentCounts,
    pub jobs: JobCounts,
}

impl QueueMetrics {
    /// Jobs that need an agent: running plus scheduled.
    pub fn demand(&self) -> u32 {
        self.jobs.running.saturating_add(self.jobs.scheduled)
    }
}
