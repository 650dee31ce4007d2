//! Reconciliation passes and the polling loop.
//!
//! One pass fetches the fleet config, gathers the world, plans, then either
//! returns the plan (dry run) or executes it. Passes never overlap: the loop
//! awaits each pass before waiting for the next tick.

use std::sync::Arc;
use std::time::Duration;

use fleet_reconcile::{FleetConfig, PlanSummary, Planner, PlannerOptions};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument};

use crate::cache::ScoreCache;
use crate::collaborators::Collaborators;
use crate::config::Config;
use crate::error::{ManagerError, ManagerResult};
use crate::executor::{execute_plan, ConcurrencyLimits, ExecutionReport};
use crate::gather::{gather, GatherSettings};
use crate::source::ConfigSource;

/// Settings for the pass and the loop.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub manager_name: String,
    pub dry_run: bool,
    pub reconcile_interval: Duration,
    pub gather: GatherSettings,
    pub limits: ConcurrencyLimits,
    pub planner: PlannerOptions,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for ManagerSettings {
    fn from(config: &Config) -> Self {
        Self {
            manager_name: config.manager_name.clone(),
            dry_run: config.dry_run,
            reconcile_interval: config.reconcile_interval(),
            gather: GatherSettings {
                timeout: config.gather_timeout(),
                metrics_window: config.metrics_window(),
            },
            limits: ConcurrencyLimits::default(),
            planner: PlannerOptions {
                delete_orphaned_instances: config.delete_orphaned_instances,
            },
        }
    }
}

/// What a successful pass did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum PassOutcome {
    /// The plan was computed but not applied.
    DryRun { plan: PlanSummary },
    Executed {
        plan: PlanSummary,
        report: ExecutionReport,
    },
}

impl PassOutcome {
    pub fn plan(&self) -> &PlanSummary {
        match self {
            PassOutcome::DryRun { plan } | PassOutcome::Executed { plan, .. } => plan,
        }
    }
}

/// Drives reconciliation passes against one set of collaborators.
pub struct Manager {
    settings: ManagerSettings,
    source: Arc<dyn ConfigSource>,
    collaborators: Collaborators,
    cache: Arc<dyn ScoreCache>,
    planner: Planner,
}

impl Manager {
    pub fn new(
        settings: ManagerSettings,
        source: Arc<dyn ConfigSource>,
        collaborators: Collaborators,
        cache: Arc<dyn ScoreCache>,
    ) -> Self {
        let planner = Planner::new(settings.planner);
        Self {
            settings,
            source,
            collaborators,
            cache,
            planner,
        }
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    /// Perform a single reconciliation pass.
    #[instrument(skip(self), fields(manager = %self.settings.manager_name, dry_run = self.settings.dry_run))]
    pub async fn run_once(&self) -> ManagerResult<PassOutcome> {
        let document = self.source.fetch().await.map_err(ManagerError::Config)?;
        let fleet = FleetConfig::from_top_level(&document);
        debug!(
            configs = fleet.agents.len(),
            rejected = fleet.rejected.len(),
            paused = fleet.pause_all_agents,
            "Loaded fleet config"
        );

        let ctx = gather(
            fleet,
            &self.collaborators,
            self.cache.as_ref(),
            &self.settings.gather,
        )
        .await?;

        let plan = self.planner.plan(&ctx);
        let summary = plan.summary();
        info!(
            to_create = plan.instances_to_create(),
            to_delete = plan.instances_to_delete.len(),
            to_stop = plan.agents_to_stop.len(),
            to_mark_connected = plan.instances_to_mark_connected.len(),
            "Planned pass"
        );

        if self.settings.dry_run {
            return Ok(PassOutcome::DryRun { plan: summary });
        }

        if plan.is_empty() {
            debug!("Nothing to do");
        }

        let report = execute_plan(
            &ctx,
            &plan,
            &self.collaborators,
            &self.settings.limits,
            &self.settings.manager_name,
        )
        .await
        .into_result()?;

        Ok(PassOutcome::Executed {
            plan: summary,
            report,
        })
    }

    /// Run passes until shutdown. Failed passes are logged and retried on
    /// the next tick.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            reconcile_interval_secs = self.settings.reconcile_interval.as_secs(),
            dry_run = self.settings.dry_run,
            "Starting reconciliation loop"
        );

        let mut interval = tokio::time::interval(self.settings.reconcile_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.run_once().await {
                        Ok(outcome) => debug!(
                            to_create = outcome.plan().to_create.len(),
                            to_delete = outcome.plan().to_delete.len(),
                            "Pass complete"
                        ),
                        Err(e) => error!(error = %e, pre_plan = e.is_pre_plan(), "Reconciliation pass failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconciliation loop shutting down");
                        break;
                    }
                }
            }
        }
    }
}
