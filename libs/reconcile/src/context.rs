//! The world-state snapshot a reconciliation pass plans against.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::AgentConfig;
use crate::types::{CiAgent, CloudInstance, QueueMetrics};
use crate::zones::{merge_scores, total_score, ZoneScores};

/// A read-only snapshot of the fleet, assembled once per pass.
///
/// Configs are shared behind `Arc` so the executor can hand them to launch
/// tasks without cloning; their zone cursors keep rotating across those
/// tasks.
#[derive(Debug, Clone)]
pub struct ReconciliationContext {
    pub configs: Vec<Arc<AgentConfig>>,
    pub agents: Vec<CiAgent>,
    pub instances: Vec<CloudInstance>,
    /// Metrics keyed by queue name.
    pub queues: BTreeMap<String, QueueMetrics>,
    pub preemptions: ZoneScores,
    pub resource_exhaustions: ZoneScores,
    pub pause_all_agents: bool,
    /// When the snapshot was taken. All age checks are relative to this.
    pub observed_at: DateTime<Utc>,
}

impl ReconciliationContext {
    /// Build an empty snapshot over `configs`.
    ///
    /// Config names are expected to be unique, as produced by
    /// [`FleetConfig::from_top_level`](crate::FleetConfig::from_top_level).
    pub fn new(configs: Vec<Arc<AgentConfig>>, observed_at: DateTime<Utc>) -> Self {
        Self {
            configs,
            agents: Vec::new(),
            instances: Vec::new(),
            queues: BTreeMap::new(),
            preemptions: ZoneScores::new(),
            resource_exhaustions: ZoneScores::new(),
            pause_all_agents: false,
            observed_at,
        }
    }

    pub fn with_agents(mut self, agents: Vec<CiAgent>) -> Self {
        self.agents = agents;
        self
    }

    pub fn with_instances(mut self, instances: Vec<CloudInstance>) -> Self {
        self.instances = instances;
        self
    }

    pub fn with_queues(mut self, queues: BTreeMap<String, QueueMetrics>) -> Self {
        self.queues = queues;
        self
    }

    pub fn with_scores(mut self, preemptions: ZoneScores, resource_exhaustions: ZoneScores) -> Self {
        self.preemptions = preemptions;
        self.resource_exhaustions = resource_exhaustions;
        self
    }

    pub fn with_pause_all_agents(mut self, pause: bool) -> Self {
        self.pause_all_agents = pause;
        self
    }

    /// Metrics for a queue. A queue with no entry has zero jobs and agents.
    pub fn queue_metrics(&self, queue: &str) -> QueueMetrics {
        self.queues.get(queue).copied().unwrap_or_default()
    }

    /// Preemptions and resource exhaustions summed per zone.
    pub fn zone_scores(&self) -> ZoneScores {
        merge_scores(&self.preemptions, &self.resource_exhaustions)
    }

    /// Total preemptions observed across every zone.
    pub fn total_preemptions(&self) -> u32 {
        total_score(&self.preemptions)
    }

    /// Returns true if some CI agent carries the given name.
    pub fn has_agent_named(&self, name: &str) -> bool {
        self.agents.iter().any(|agent| agent.name == name)
    }
}
