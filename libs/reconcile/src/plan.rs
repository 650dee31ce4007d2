//! The reconciliation planner.
//!
//! Given a [`ReconciliationContext`], decide which instances to delete, how
//! many agents to launch per config, which instances to mark as connected
//! and which agents to gracefully stop. Planning is a pure function of the
//! snapshot; logging is the only side effect.
//!
//! # Invariants
//!
//! - Every action list is de-duplicated by stable identity (instance id,
//!   agent id) and keeps first-seen order.
//! - Planning the same snapshot twice yields the same plan.
//! - Instances in mid-transition states are never deleted.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::context::ReconciliationContext;
use crate::types::{CiAgent, CloudInstance, InstanceStatus, HASH_TAG};
use crate::zones::compute_weighting;

/// Instances without a matching CI agent are orphaned after this long.
pub const ORPHAN_AFTER_SECS: i64 = 10 * 60;

/// Live instances still unpaired after this long are reported as slow.
pub const SLOW_START_AFTER_SECS: i64 = 90;

/// Planner switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlannerOptions {
    /// Delete instances that have been orphaned from the CI service.
    pub delete_orphaned_instances: bool,
}

/// A launch request for one config.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateRequest {
    pub config: Arc<AgentConfig>,
    pub number_to_create: u32,
    /// Running plus scheduled jobs on the queue.
    pub jobs: u32,
    pub desired: u32,
    pub current_agents: u32,
}

/// A live instance and the CI agent running on it.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionPairing {
    pub instance: CloudInstance,
    pub agent: CiAgent,
}

/// The actions for one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionPlan {
    pub instances_to_delete: Vec<CloudInstance>,
    pub configs_to_create: Vec<CreateRequest>,
    pub instances_to_mark_connected: Vec<ConnectionPairing>,
    pub agents_to_stop: Vec<CiAgent>,
}

impl ExecutionPlan {
    pub fn is_empty(&self) -> bool {
        self.instances_to_delete.is_empty()
            && self.configs_to_create.is_empty()
            && self.instances_to_mark_connected.is_empty()
            && self.agents_to_stop.is_empty()
    }

    /// Total instances the plan will launch.
    pub fn instances_to_create(&self) -> u32 {
        self.configs_to_create.iter().map(|c| c.number_to_create).sum()
    }

    /// A serializable view of the plan for dry runs and logs.
    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            to_delete: self
                .instances_to_delete
                .iter()
                .map(|i| DeleteSummary {
                    name: i.name.clone(),
                    status: i.status,
                    created: i.creation_timestamp,
                })
                .collect(),
            to_create: self
                .configs_to_create
                .iter()
                .map(|c| CreateSummary {
                    name: c.config.name.clone(),
                    queue: c.config.queue.clone(),
                    number_to_create: c.number_to_create,
                    total_desired: c.desired,
                    jobs: c.jobs,
                    current_agents: c.current_agents,
                })
                .collect(),
            to_stop: self
                .agents_to_stop
                .iter()
                .map(|a| StopSummary {
                    name: a.name.clone(),
                    id: a.id.clone(),
                    metadata: a.tags.as_slice().to_vec(),
                })
                .collect(),
            to_mark_connected: self
                .instances_to_mark_connected
                .iter()
                .map(|p| PairingSummary {
                    instance: p.instance.name.clone(),
                    agent_id: p.agent.id.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSummary {
    pub to_delete: Vec<DeleteSummary>,
    pub to_create: Vec<CreateSummary>,
    pub to_stop: Vec<StopSummary>,
    pub to_mark_connected: Vec<PairingSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteSummary {
    pub name: String,
    pub status: InstanceStatus,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSummary {
    pub name: String,
    pub queue: String,
    pub number_to_create: u32,
    pub total_desired: u32,
    pub jobs: u32,
    pub current_agents: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopSummary {
    pub name: String,
    pub id: String,
    pub metadata: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingSummary {
    pub instance: String,
    pub agent_id: String,
}

/// Keeps the first occurrence of each identity, in order.
struct UniqueById<'a, T> {
    seen: HashSet<&'a str>,
    items: Vec<&'a T>,
}

impl<'a, T> UniqueById<'a, T> {
    fn new() -> Self {
        Self {
            seen: HashSet::new(),
            items: Vec::new(),
        }
    }

    fn insert(&mut self, id: &'a str, item: &'a T) {
        if self.seen.insert(id) {
            self.items.push(item);
        }
    }

    fn into_vec(self) -> Vec<&'a T> {
        self.items
    }
}

/// The reconciliation planner.
#[derive(Debug, Clone, Default)]
pub struct Planner {
    options: PlannerOptions,
}

impl Planner {
    pub fn new(options: PlannerOptions) -> Self {
        Self { options }
    }

    /// Compute the plan for a snapshot.
    pub fn plan(&self, ctx: &ReconciliationContext) -> ExecutionPlan {
        self.report_slow_starts(ctx);

        let configs_to_create = if ctx.pause_all_agents {
            info!("All agents paused, suppressing creation");
            Vec::new()
        } else {
            self.configs_to_create(ctx)
        };

        let agents_to_stop = if ctx.pause_all_agents {
            paused_agents(ctx)
        } else {
            stale_agents(ctx)
        };

        ExecutionPlan {
            instances_to_delete: self
                .instances_to_delete(ctx)
                .into_iter()
                .cloned()
                .collect(),
            configs_to_create,
            instances_to_mark_connected: connection_pairings(ctx),
            agents_to_stop: agents_to_stop.into_iter().cloned().collect(),
        }
    }

    /// Terminated instances, instances past their hard stop and, when
    /// enabled, orphaned instances.
    pub fn instances_to_delete<'a>(&self, ctx: &'a ReconciliationContext) -> Vec<&'a CloudInstance> {
        let mut instances = UniqueById::new();

        for instance in &ctx.instances {
            if instance.status == InstanceStatus::Terminated {
                instances.insert(instance.id.as_str(), instance);
            }
        }

        for instance in instances_online_too_long(ctx) {
            instances.insert(instance.id.as_str(), instance);
        }

        if self.options.delete_orphaned_instances {
            for instance in ctx.instances.iter().filter(|i| is_orphaned(ctx, i)) {
                instances.insert(instance.id.as_str(), instance);
            }
        }

        instances
            .into_vec()
            .into_iter()
            .filter(|i| i.status.is_deletable())
            .collect()
    }

    fn configs_to_create(&self, ctx: &ReconciliationContext) -> Vec<CreateRequest> {
        let mut requests = Vec::new();

        for config in &ctx.configs {
            let metrics = ctx.queue_metrics(&config.queue);
            let jobs = metrics.demand();

            let live = ctx
                .instances
                .iter()
                .filter(|i| i.status.is_live() && i.belongs_to(&config.name) && !is_orphaned(ctx, i))
                .count();
            let live = u32::try_from(live).unwrap_or(u32::MAX);
            let current_agents = live.max(metrics.agents.total);

            let desired = desired_agents(config, jobs);
            let number_to_create = desired.saturating_sub(current_agents);

            debug!(
                agent = %config.name,
                queue = %config.queue,
                jobs,
                desired,
                current_agents,
                number_to_create,
                "Sized agent config"
            );

            if number_to_create == 0 {
                continue;
            }

            if config.spot {
                let weighting = compute_weighting(&config.zones, &ctx.zone_scores());
                info!(agent = %config.name, weighting = %weighting, "Spot zone weighting");
            }

            requests.push(CreateRequest {
                config: Arc::clone(config),
                number_to_create,
                jobs,
                desired,
                current_agents,
            });
        }

        requests
    }

    fn report_slow_starts(&self, ctx: &ReconciliationContext) {
        for instance in slow_starting_instances(ctx) {
            warn!(
                instance = %instance.name,
                zone = %instance.zone,
                age_secs = instance.age(ctx.observed_at).num_seconds(),
                "Instance has not connected to the CI service"
            );
        }
    }
}

/// Plan a snapshot with default options.
pub fn create_plan(ctx: &ReconciliationContext) -> ExecutionPlan {
    Planner::default().plan(ctx)
}

/// Agents required for `jobs` under a config's scaling knobs.
pub fn desired_agents(config: &AgentConfig, jobs: u32) -> u32 {
    let mut desired = jobs;

    if let Some(minimum) = config.minimum_agents {
        desired = desired.max(minimum);
    }

    if let Some(overprovision) = config.overprovision {
        // Below 1 is a fraction of demand, otherwise a flat number of agents.
        let extra = if overprovision < 1.0 {
            (f64::from(desired) * overprovision).ceil() as u32
        } else {
            overprovision as u32
        };
        desired = desired.saturating_add(extra);
    }

    if let Some(maximum) = config.maximum_agents {
        desired = desired.min(maximum);
    }

    desired
}

/// Returns true if the instance is past the orphan grace period and no CI
/// agent carries its name.
pub fn is_orphaned(ctx: &ReconciliationContext, instance: &CloudInstance) -> bool {
    instance.age(ctx.observed_at) >= Duration::seconds(ORPHAN_AFTER_SECS)
        && !ctx.has_agent_named(&instance.name)
}

fn instances_online_too_long(ctx: &ReconciliationContext) -> Vec<&CloudInstance> {
    let mut instances = Vec::new();

    for config in &ctx.configs {
        let Some(limit) = config.hard_stop_after_mins else {
            continue;
        };
        let limit = Duration::minutes(i64::from(limit));

        instances.extend(ctx.instances.iter().filter(|i| {
            i.belongs_to(&config.name) && i.status.is_live() && i.age(ctx.observed_at) >= limit
        }));
    }

    instances
}

/// Connected agents whose config hash has drifted or that have been online
/// past their graceful stop limit.
pub fn stale_agents(ctx: &ReconciliationContext) -> Vec<&CiAgent> {
    let mut agents = UniqueById::new();

    for config in &ctx.configs {
        let hash = config.hash();
        let candidates = ctx
            .agents
            .iter()
            .filter(|a| a.is_connected() && a.serves_queue(&config.queue));

        for agent in candidates.clone() {
            if !agent.tags.contains(HASH_TAG, hash.as_str()) {
                agents.insert(agent.id.as_str(), agent);
            }
        }

        if let Some(limit) = config.graceful_stop_after_mins {
            let limit = Duration::minutes(i64::from(limit));
            for agent in candidates.filter(|a| a.age(ctx.observed_at) >= limit) {
                agents.insert(agent.id.as_str(), agent);
            }
        }
    }

    agents.into_vec()
}

/// Every connected multi-job agent that is not already stopping.
fn paused_agents(ctx: &ReconciliationContext) -> Vec<&CiAgent> {
    let mut agents = UniqueById::new();

    for config in ctx.configs.iter().filter(|c| !c.exit_after_one_job) {
        for agent in ctx.agents.iter().filter(|a| {
            a.is_connected() && a.serves_queue(&config.queue) && !a.is_stopping()
        }) {
            agents.insert(agent.id.as_str(), agent);
        }
    }

    let agents = agents.into_vec();
    if !agents.is_empty() {
        info!(count = agents.len(), "All agents paused, draining");
    }
    agents
}

/// Live, unmarked instances paired with the CI agent of the same name.
pub fn connection_pairings(ctx: &ReconciliationContext) -> Vec<ConnectionPairing> {
    ctx.instances
        .iter()
        .filter(|i| i.status.is_live() && !i.is_marked_connected())
        .filter_map(|instance| {
            ctx.agents
                .iter()
                .find(|a| a.name == instance.name)
                .map(|agent| ConnectionPairing {
                    instance: instance.clone(),
                    agent: agent.clone(),
                })
        })
        .collect()
}

/// Live instances past the slow-start threshold with neither a connected
/// marker nor a matching CI agent.
pub fn slow_starting_instances(ctx: &ReconciliationContext) -> Vec<&CloudInstance> {
    ctx.instances
        .iter()
        .filter(|i| {
            i.status.is_live()
                && i.age(ctx.observed_at) > Duration::seconds(SLOW_START_AFTER_SECS)
                && !i.is_marked_connected()
                && !ctx.has_agent_named(&i.name)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfigInput;
    use crate::types::{
        AgentCounts, AgentTags, ConnectionState, InstanceMetadata, JobCounts, MetadataItem,
        QueueMetrics, AGENT_ID_KEY, AGENT_NAME_KEY,
    };
    use rstest::rstest;
    use std::collections::BTreeMap;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn input() -> AgentConfigInput {
        AgentConfigInput {
            name: Some("test-name".to_string()),
            queue: Some("default".to_string()),
            project: Some("test-project".to_string()),
            image: Some("test-image".to_string()),
            machine_type: Some("n2-standard-2".to_string()),
            zones: Some(vec!["us-central1-a".to_string()]),
            ..Default::default()
        }
    }

    fn config(change: impl FnOnce(&mut AgentConfigInput)) -> Arc<AgentConfig> {
        let mut raw = input();
        change(&mut raw);
        Arc::new(AgentConfig::new(raw).unwrap())
    }

    fn instance(id: &str, status: InstanceStatus, age_mins: i64) -> CloudInstance {
        CloudInstance {
            id: id.to_string(),
            name: format!("test-name-{id}"),
            status,
            creation_timestamp: now() - Duration::minutes(age_mins),
            zone: "us-central1-a".to_string(),
            metadata: InstanceMetadata::new(vec![MetadataItem::new(AGENT_NAME_KEY, "test-name")]),
        }
    }

    fn agent(id: &str, tags: &[&str], age_mins: i64) -> CiAgent {
        CiAgent {
            id: id.to_string(),
            uuid: format!("uuid-{id}"),
            name: format!("test-name-{id}"),
            connection_state: ConnectionState::Connected,
            created_at: now() - Duration::minutes(age_mins),
            tags: AgentTags::new(tags.iter().map(|t| t.to_string()).collect()),
            stop_requested_at: None,
        }
    }

    fn current_agent(config: &AgentConfig, id: &str, age_mins: i64) -> CiAgent {
        let hash_tag = format!("hash={}", config.hash());
        agent(id, &["queue=default", hash_tag.as_str()], age_mins)
    }

    fn ctx(configs: Vec<Arc<AgentConfig>>) -> ReconciliationContext {
        ReconciliationContext::new(configs, now())
    }

    fn queue(running: u32, scheduled: u32, agents_total: u32) -> BTreeMap<String, QueueMetrics> {
        BTreeMap::from([(
            "default".to_string(),
            QueueMetrics {
                agents: AgentCounts {
                    total: agents_total,
                    ..Default::default()
                },
                jobs: JobCounts {
                    running,
                    scheduled,
                    ..Default::default()
                },
            },
        )])
    }

    fn ids<'a>(items: impl IntoIterator<Item = &'a str>) -> Vec<&'a str> {
        items.into_iter().collect()
    }

    // ── Creation sizing ────────────────────────────────────────────

    #[test]
    fn test_minimum_agents_with_empty_queue() {
        let config = config(|i| i.minimum_agents = Some(10));
        let plan = create_plan(&ctx(vec![config]));

        assert_eq!(plan.configs_to_create.len(), 1);
        let request = &plan.configs_to_create[0];
        assert_eq!(request.number_to_create, 10);
        assert_eq!(request.jobs, 0);
        assert_eq!(request.desired, 10);
        assert_eq!(request.current_agents, 0);
    }

    #[rstest]
    #[case::uncapped(None, 100)]
    #[case::capped(Some(10), 10)]
    fn test_jobs_drive_creation(#[case] maximum: Option<u32>, #[case] expected: u32) {
        // 100 waiting jobs do not count, 100 scheduled do.
        let config = config(|i| i.maximum_agents = maximum);
        let mut queues = queue(0, 100, 0);
        queues.get_mut("default").unwrap().jobs.waiting = 100;
        queues.get_mut("default").unwrap().jobs.total = 200;

        let plan = create_plan(&ctx(vec![config]).with_queues(queues));
        assert_eq!(plan.configs_to_create[0].number_to_create, expected);
    }

    #[rstest]
    #[case::fraction_rounds_up(Some(0.25), 10, 13)]
    #[case::flat(Some(2.0), 10, 12)]
    #[case::flat_truncates(Some(2.9), 10, 12)]
    #[case::none(None, 10, 10)]
    fn test_overprovision(#[case] overprovision: Option<f64>, #[case] jobs: u32, #[case] expected: u32) {
        let config = config(|i| i.overprovision = overprovision);
        assert_eq!(desired_agents(&config, jobs), expected);
    }

    #[test]
    fn test_sizing_applies_minimum_then_overprovision_then_maximum() {
        let config = config(|i| {
            i.minimum_agents = Some(4);
            i.overprovision = Some(0.5);
            i.maximum_agents = Some(5);
        });
        assert_eq!(desired_agents(&config, 0), 5);
        assert_eq!(desired_agents(&config, 1), 5);
    }

    #[test]
    fn test_live_instances_reduce_creation() {
        let config = config(|i| i.minimum_agents = Some(10));
        let snapshot = ctx(vec![config]).with_instances(vec![
            instance("1", InstanceStatus::Provisioning, 1),
            instance("2", InstanceStatus::Running, 1),
            instance("3", InstanceStatus::Terminated, 1),
        ]);

        let plan = create_plan(&snapshot);
        assert_eq!(plan.configs_to_create[0].current_agents, 2);
        assert_eq!(plan.configs_to_create[0].number_to_create, 8);
    }

    #[test]
    fn test_current_agents_takes_larger_of_cloud_and_ci_views() {
        let config = config(|i| i.minimum_agents = Some(10));
        let snapshot = ctx(vec![config])
            .with_instances(vec![instance("1", InstanceStatus::Running, 1)])
            .with_queues(queue(0, 0, 7));

        let plan = create_plan(&snapshot);
        assert_eq!(plan.configs_to_create[0].current_agents, 7);
        assert_eq!(plan.configs_to_create[0].number_to_create, 3);
    }

    #[test]
    fn test_orphaned_instances_do_not_count_as_capacity() {
        let config = config(|i| i.minimum_agents = Some(2));
        let mut paired = instance("2", InstanceStatus::Running, 30);
        paired.name = "agent-2".to_string();
        let mut connected = agent("a2", &[], 30);
        connected.name = "agent-2".to_string();

        let snapshot = ctx(vec![config])
            .with_instances(vec![instance("1", InstanceStatus::Running, 30), paired])
            .with_agents(vec![connected]);

        let plan = create_plan(&snapshot);
        assert_eq!(plan.configs_to_create[0].current_agents, 1);
        assert_eq!(plan.configs_to_create[0].number_to_create, 1);
    }

    #[test]
    fn test_no_request_when_at_capacity() {
        let config = config(|i| i.minimum_agents = Some(1));
        let snapshot = ctx(vec![config]).with_instances(vec![instance("1", InstanceStatus::Running, 1)]);

        assert!(create_plan(&snapshot).configs_to_create.is_empty());
    }

    #[test]
    fn test_instances_of_other_configs_are_ignored() {
        let config = config(|i| i.minimum_agents = Some(1));
        let mut other = instance("1", InstanceStatus::Running, 1);
        other.metadata = InstanceMetadata::new(vec![MetadataItem::new(AGENT_NAME_KEY, "other")]);

        let plan = create_plan(&ctx(vec![config]).with_instances(vec![other]));
        assert_eq!(plan.configs_to_create[0].number_to_create, 1);
    }

    // ── Deletion ───────────────────────────────────────────────────

    #[test]
    fn test_terminated_instances_always_deleted() {
        let snapshot = ctx(vec![config(|_| {})]).with_instances(vec![
            instance("1", InstanceStatus::Terminated, 0),
            instance("2", InstanceStatus::Running, 0),
        ]);

        let plan = create_plan(&snapshot);
        assert_eq!(ids(plan.instances_to_delete.iter().map(|i| i.id.as_str())), vec!["1"]);
    }

    #[test]
    fn test_hard_stop_deletes_only_old_live_instances() {
        let config = config(|i| i.hard_stop_after_mins = Some(60));
        let snapshot = ctx(vec![config]).with_instances(vec![
            instance("young", InstanceStatus::Running, 59),
            instance("exact", InstanceStatus::Running, 60),
            instance("old", InstanceStatus::Staging, 120),
            instance("repairing", InstanceStatus::Repairing, 120),
        ]);

        let plan = create_plan(&snapshot);
        assert_eq!(
            ids(plan.instances_to_delete.iter().map(|i| i.id.as_str())),
            vec!["exact", "old"]
        );
    }

    #[test]
    fn test_terminated_and_hard_stopped_instance_listed_once() {
        let config = config(|i| i.hard_stop_after_mins = Some(1));
        let snapshot = ctx(vec![config]).with_instances(vec![
            instance("1", InstanceStatus::Terminated, 30),
            instance("2", InstanceStatus::Running, 30),
        ]);

        let plan = create_plan(&snapshot);
        assert_eq!(ids(plan.instances_to_delete.iter().map(|i| i.id.as_str())), vec!["1", "2"]);
    }

    #[rstest]
    #[case::disabled(false, vec![])]
    #[case::enabled(true, vec!["old"])]
    fn test_orphan_deletion_is_opt_in(#[case] enabled: bool, #[case] expected: Vec<&str>) {
        let snapshot = ctx(vec![config(|_| {})]).with_instances(vec![
            instance("old", InstanceStatus::Running, 11),
            instance("young", InstanceStatus::Running, 9),
            instance("stopping", InstanceStatus::Stopping, 30),
        ]);

        let planner = Planner::new(PlannerOptions {
            delete_orphaned_instances: enabled,
        });
        let plan = planner.plan(&snapshot);
        assert_eq!(ids(plan.instances_to_delete.iter().map(|i| i.id.as_str())), expected);
    }

    // ── Staleness ──────────────────────────────────────────────────

    #[test]
    fn test_agent_with_outdated_hash_is_stale() {
        let config = config(|_| {});
        let snapshot = ctx(vec![config.clone()]).with_agents(vec![
            agent("old", &["queue=default", "hash=outdated"], 1),
            current_agent(&config, "current", 1),
        ]);

        let plan = create_plan(&snapshot);
        assert_eq!(ids(plan.agents_to_stop.iter().map(|a| a.id.as_str())), vec!["old"]);
    }

    #[test]
    fn test_agent_past_graceful_stop_is_stale() {
        let config = config(|i| i.graceful_stop_after_mins = Some(30));
        let snapshot = ctx(vec![config.clone()]).with_agents(vec![
            current_agent(&config, "old", 45),
            current_agent(&config, "young", 10),
        ]);

        let plan = create_plan(&snapshot);
        assert_eq!(ids(plan.agents_to_stop.iter().map(|a| a.id.as_str())), vec!["old"]);
    }

    #[test]
    fn test_agent_matching_both_criteria_listed_once() {
        let config = config(|i| i.graceful_stop_after_mins = Some(30));
        let snapshot = ctx(vec![config])
            .with_agents(vec![agent("both", &["queue=default", "hash=outdated"], 45)]);

        let plan = create_plan(&snapshot);
        assert_eq!(ids(plan.agents_to_stop.iter().map(|a| a.id.as_str())), vec!["both"]);
    }

    #[test]
    fn test_disconnected_and_other_queue_agents_are_not_stale() {
        let config = config(|_| {});
        let mut disconnected = agent("disconnected", &["queue=default"], 1);
        disconnected.connection_state = ConnectionState::Disconnected;

        let snapshot = ctx(vec![config])
            .with_agents(vec![disconnected, agent("other", &["queue=other"], 1)]);

        assert!(create_plan(&snapshot).agents_to_stop.is_empty());
    }

    // ── Mark connected ─────────────────────────────────────────────

    #[test]
    fn test_live_unmarked_instances_paired_by_name() {
        let mut marked = instance("2", InstanceStatus::Running, 5);
        marked.metadata.set(AGENT_ID_KEY, "a2");
        let snapshot = ctx(vec![config(|_| {})])
            .with_instances(vec![
                instance("1", InstanceStatus::Running, 5),
                marked,
                instance("3", InstanceStatus::Running, 5),
                instance("4", InstanceStatus::Terminated, 5),
            ])
            .with_agents(vec![
                agent("1", &[], 5),
                agent("2", &[], 5),
                agent("4", &[], 5),
            ]);

        let plan = create_plan(&snapshot);
        assert_eq!(plan.instances_to_mark_connected.len(), 1);
        let pairing = &plan.instances_to_mark_connected[0];
        assert_eq!(pairing.instance.id, "1");
        assert_eq!(pairing.agent.id, "1");
    }

    // ── Pause ──────────────────────────────────────────────────────

    #[test]
    fn test_pause_suppresses_creation_and_drains_multi_job_agents() {
        let multi = config(|i| i.minimum_agents = Some(5));
        let single = config(|i| {
            i.name = Some("single".to_string());
            i.queue = Some("single".to_string());
            i.exit_after_one_job = Some(true);
            i.minimum_agents = Some(5);
        });

        let mut stopping = current_agent(&multi, "stopping", 1);
        stopping.stop_requested_at = Some(now());

        let snapshot = ctx(vec![multi.clone(), single])
            .with_pause_all_agents(true)
            .with_instances(vec![instance("t", InstanceStatus::Terminated, 1)])
            .with_agents(vec![
                current_agent(&multi, "current", 1),
                stopping,
                agent("single-job", &["queue=single"], 1),
            ]);

        let plan = create_plan(&snapshot);
        assert!(plan.configs_to_create.is_empty());
        assert_eq!(ids(plan.agents_to_stop.iter().map(|a| a.id.as_str())), vec!["current"]);
        assert_eq!(ids(plan.instances_to_delete.iter().map(|i| i.id.as_str())), vec!["t"]);
    }

    // ── Diagnostics and summary ────────────────────────────────────

    #[test]
    fn test_slow_starting_instances() {
        let mut young = instance("young", InstanceStatus::Running, 0);
        young.creation_timestamp = now() - Duration::seconds(60);
        let mut marked = instance("marked", InstanceStatus::Running, 5);
        marked.metadata.set(AGENT_ID_KEY, "x");

        let snapshot = ctx(vec![]).with_instances(vec![
            instance("slow", InstanceStatus::Running, 5),
            young,
            marked,
        ]);

        let slow = slow_starting_instances(&snapshot);
        assert_eq!(ids(slow.iter().map(|i| i.id.as_str())), vec!["slow"]);
    }

    #[test]
    fn test_plan_is_idempotent() {
        let config = config(|i| {
            i.minimum_agents = Some(3);
            i.hard_stop_after_mins = Some(10);
            i.graceful_stop_after_mins = Some(10);
            i.spot = Some(true);
        });
        let snapshot = ctx(vec![config.clone()])
            .with_instances(vec![
                instance("1", InstanceStatus::Running, 20),
                instance("2", InstanceStatus::Terminated, 1),
                instance("3", InstanceStatus::Running, 1),
            ])
            .with_agents(vec![current_agent(&config, "1", 20), agent("x", &["queue=default"], 1)])
            .with_queues(queue(2, 1, 1));

        assert_eq!(create_plan(&snapshot), create_plan(&snapshot));
    }

    #[test]
    fn test_summary_serializes_camel_case() {
        let snapshot = ctx(vec![config(|i| i.minimum_agents = Some(2))])
            .with_instances(vec![instance("1", InstanceStatus::Terminated, 1)]);

        let summary = serde_json::to_value(create_plan(&snapshot).summary()).unwrap();
        assert_eq!(summary["toCreate"][0]["queue"], "default");
        assert_eq!(summary["toCreate"][0]["numberToCreate"], 2);
        assert_eq!(summary["toDelete"][0]["status"], "TERMINATED");
        assert!(summary["toStop"].as_array().unwrap().is_empty());
    }
}
