//! Plan execution.
//!
//! The four action groups run concurrently and are joined independently.
//! Each group is a bounded pool: once one of its actions fails, actions not
//! yet started are skipped while in-flight ones finish. A failing group
//! never cancels its siblings.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fleet_reconcile::{
    choose_zone, instance_name, AgentConfig, ExecutionPlan, InstanceRequest, MetadataItem,
    ReconciliationContext, AGENT_ID_KEY,
};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::collaborators::Collaborators;
use crate::error::{ManagerError, ManagerResult};

/// Per-group concurrency caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyLimits {
    pub create: usize,
    pub delete: usize,
    pub stop: usize,
    pub mark_connected: usize,
}

impl Default for ConcurrencyLimits {
    fn default() -> Self {
        Self {
            create: 25,
            delete: 10,
            stop: 5,
            mark_connected: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionGroup {
    Create,
    Delete,
    Stop,
    MarkConnected,
}

impl std::fmt::Display for ActionGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActionGroup::Create => "create",
            ActionGroup::Delete => "delete",
            ActionGroup::Stop => "stop",
            ActionGroup::MarkConnected => "mark-connected",
        };
        f.write_str(s)
    }
}

/// Outcome of one action group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupReport {
    pub group: ActionGroup,
    /// Actions started, including failed ones.
    pub attempted: usize,
    pub completed: usize,
    /// Actions never started because an earlier one failed.
    pub skipped: usize,
    /// First failure observed.
    pub error: Option<String>,
}

impl GroupReport {
    fn empty(group: ActionGroup) -> Self {
        Self {
            group,
            attempted: 0,
            completed: 0,
            skipped: 0,
            error: None,
        }
    }

    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Outcome of executing a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionReport {
    pub create: GroupReport,
    pub delete: GroupReport,
    pub stop: GroupReport,
    pub mark_connected: GroupReport,
}

impl ExecutionReport {
    pub fn groups(&self) -> [&GroupReport; 4] {
        [&self.create, &self.delete, &self.stop, &self.mark_connected]
    }

    pub fn failed_groups(&self) -> Vec<ActionGroup> {
        self.groups()
            .into_iter()
            .filter(|g| g.failed())
            .map(|g| g.group)
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.groups().iter().all(|g| !g.failed())
    }

    /// Fail if any group failed.
    pub fn into_result(self) -> ManagerResult<Self> {
        let failed = self.failed_groups();
        if failed.is_empty() {
            Ok(self)
        } else {
            Err(ManagerError::Execution {
                failed_groups: failed.iter().map(ToString::to_string).collect(),
            })
        }
    }
}

enum Outcome {
    Completed,
    Skipped,
    Failed(anyhow::Error),
}

/// Run `action` over `items` with at most `limit` in flight, stopping new
/// work after the first failure.
async fn run_pool<T, F, Fut>(group: ActionGroup, items: Vec<T>, limit: usize, action: F) -> GroupReport
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    if items.is_empty() {
        return GroupReport::empty(group);
    }

    let halted = AtomicBool::new(false);
    let halted = &halted;
    let action = &action;

    let outcomes: Vec<Outcome> = stream::iter(items)
        .map(|item| async move {
            if halted.load(Ordering::SeqCst) {
                return Outcome::Skipped;
            }
            match action(item).await {
                Ok(()) => Outcome::Completed,
                Err(e) => {
                    halted.store(true, Ordering::SeqCst);
                    warn!(group = %group, error = %e, "Action failed, halting group");
                    Outcome::Failed(e)
                }
            }
        })
        .buffer_unordered(limit.max(1))
        .collect()
        .await;

    let mut report = GroupReport::empty(group);
    for outcome in outcomes {
        match outcome {
            Outcome::Completed => {
                report.attempted += 1;
                report.completed += 1;
            }
            Outcome::Skipped => report.skipped += 1,
            Outcome::Failed(e) => {
                report.attempted += 1;
                if report.error.is_none() {
                    report.error = Some(format!("{e:#}"));
                }
            }
        }
    }
    report
}

/// Build the insert request for one launch.
fn prepare_launch(
    ctx: &ReconciliationContext,
    config: &AgentConfig,
    manager_name: &str,
) -> anyhow::Result<InstanceRequest> {
    let mut rng = rand::rng();
    let choice = choose_zone(config, &ctx.preemptions, &ctx.resource_exhaustions, &mut rng);
    let name = instance_name(config, &mut rng);

    if let Some(weighting) = &choice.weighting {
        debug!(instance = %name, zone = %choice.zone, weighting = %weighting, "Picked spot zone");
    }

    InstanceRequest::build(config, &choice.zone, name, manager_name, choice.spot)
        .map_err(anyhow::Error::from)
}

/// Apply a plan through the collaborators.
#[instrument(skip_all, fields(
    create = plan.instances_to_create(),
    delete = plan.instances_to_delete.len(),
    stop = plan.agents_to_stop.len(),
    mark_connected = plan.instances_to_mark_connected.len(),
))]
pub async fn execute_plan(
    ctx: &ReconciliationContext,
    plan: &ExecutionPlan,
    collaborators: &Collaborators,
    limits: &ConcurrencyLimits,
    manager_name: &str,
) -> ExecutionReport {
    let launches: Vec<Arc<AgentConfig>> = plan
        .configs_to_create
        .iter()
        .flat_map(|request| {
            std::iter::repeat(Arc::clone(&request.config)).take(request.number_to_create as usize)
        })
        .collect();

    let create = run_pool(ActionGroup::Create, launches, limits.create, |config| async move {
        let request = prepare_launch(ctx, &config, manager_name)?;
        info!(agent = %config.name, instance = %request.name, zone = %request.zone, "Creating instance");
        collaborators.cloud.create_instance(&request).await
    });

    let delete = run_pool(
        ActionGroup::Delete,
        plan.instances_to_delete.iter().collect(),
        limits.delete,
        |instance| async move {
            info!(instance = %instance.name, status = %instance.status, "Deleting instance");
            collaborators.cloud.delete_instance(instance).await
        },
    );

    let stop = run_pool(
        ActionGroup::Stop,
        plan.agents_to_stop.iter().collect(),
        limits.stop,
        |agent| async move {
            info!(agent = %agent.name, id = %agent.id, "Stopping agent");
            collaborators.ci.stop_agent(agent).await
        },
    );

    let mark_connected = run_pool(
        ActionGroup::MarkConnected,
        plan.instances_to_mark_connected.iter().collect(),
        limits.mark_connected,
        |pairing| async move {
            debug!(instance = %pairing.instance.name, agent = %pairing.agent.id, "Marking instance connected");
            collaborators
                .cloud
                .set_metadata(
                    &pairing.instance,
                    &[MetadataItem::new(AGENT_ID_KEY, pairing.agent.id.as_str())],
                )
                .await
        },
    );

    let (create, delete, stop, mark_connected) = tokio::join!(create, delete, stop, mark_connected);

    let report = ExecutionReport {
        create,
        delete,
        stop,
        mark_connected,
    };

    for group in report.groups() {
        if group.attempted + group.skipped > 0 {
            info!(
                group = %group.group,
                attempted = group.attempted,
                completed = group.completed,
                skipped = group.skipped,
                failed = group.failed(),
                "Action group finished"
            );
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_empty_pool() {
        let report = run_pool(ActionGroup::Stop, Vec::<u32>::new(), 5, |_| async { Ok(()) }).await;
        assert_eq!(report, GroupReport::empty(ActionGroup::Stop));
    }

    #[tokio::test]
    async fn test_pool_respects_limit() {
        let current = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        let report = run_pool(ActionGroup::Delete, (0..30).collect(), 4, |_: u32| {
            let current = &current;
            let peak = &peak;
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        assert_eq!(report.completed, 30);
        assert!(peak.load(Ordering::SeqCst) <= 4);
        assert!(peak.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn test_pool_halts_after_failure() {
        let report = run_pool(ActionGroup::Create, (0..20).collect(), 1, |i: u32| async move {
            if i == 3 {
                anyhow::bail!("boom at {i}");
            }
            Ok(())
        })
        .await;

        assert_eq!(report.completed, 3);
        assert_eq!(report.attempted, 4);
        assert_eq!(report.skipped, 16);
        assert_eq!(report.error.as_deref(), Some("boom at 3"));
    }

    #[test]
    fn test_into_result_names_failed_groups() {
        let mut report = ExecutionReport {
            create: GroupReport::empty(ActionGroup::Create),
            delete: GroupReport::empty(ActionGroup::Delete),
            stop: GroupReport::empty(ActionGroup::Stop),
            mark_connected: GroupReport::empty(ActionGroup::MarkConnected),
        };
        assert!(report.clone().into_result().is_ok());

        report.mark_connected.error = Some("denied".to_string());
        match report.into_result() {
            Err(ManagerError::Execution { failed_groups }) => {
                assert_eq!(failed_groups, vec!["mark-connected"]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
