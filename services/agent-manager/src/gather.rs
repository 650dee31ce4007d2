//! Gather phase: assemble the reconciliation snapshot.
//!
//! Every collaborator call runs concurrently and the whole phase is bounded
//! by a timeout. A timeout or collaborator failure fails the pass; no
//! partial snapshot ever reaches the planner. Zone score failures are the
//! exception: they degrade to cached or empty scores.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use fleet_reconcile::{FleetConfig, ReconciliationContext, DEFAULT_SCORE_WINDOW_MINS};
use futures_util::future::try_join_all;
use tracing::{debug, info, instrument};

use crate::cache::{
    fetch_scores_with_cache, preemptions_key, resource_exhaustions_key, ScoreCache,
};
use crate::collaborators::Collaborators;
use crate::error::{ManagerError, ManagerResult};

/// Gather phase settings.
#[derive(Debug, Clone)]
pub struct GatherSettings {
    /// Upper bound on the whole gather phase.
    pub timeout: Duration,
    /// Window over which zone scores are counted.
    pub metrics_window: Duration,
}

impl Default for GatherSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            metrics_window: Duration::from_secs(DEFAULT_SCORE_WINDOW_MINS * 60),
        }
    }
}

/// Build the snapshot for one pass.
///
/// Images are resolved from families, once per project and family, and bound
/// onto the configs before the configs are frozen into the snapshot.
#[instrument(skip_all, fields(configs = fleet.agents.len()))]
pub async fn gather(
    fleet: FleetConfig,
    collaborators: &Collaborators,
    cache: &dyn ScoreCache,
    settings: &GatherSettings,
) -> ManagerResult<ReconciliationContext> {
    match tokio::time::timeout(settings.timeout, gather_inner(fleet, collaborators, cache, settings))
        .await
    {
        Ok(result) => result,
        Err(_) => Err(ManagerError::GatherTimeout(settings.timeout)),
    }
}

async fn gather_inner(
    mut fleet: FleetConfig,
    collaborators: &Collaborators,
    cache: &dyn ScoreCache,
    settings: &GatherSettings,
) -> ManagerResult<ReconciliationContext> {
    let ci = &collaborators.ci;
    let cloud = &collaborators.cloud;
    let metrics = &collaborators.metrics;

    let queues: BTreeSet<String> = fleet.agents.iter().map(|c| c.queue.clone()).collect();
    let families: BTreeSet<(String, String)> = fleet
        .agents
        .iter()
        .filter(|c| c.image.is_none())
        .filter_map(|c| c.image_family.clone().map(|family| (c.project.clone(), family)))
        .collect();

    let project = metrics_project(&fleet);
    let window = settings.metrics_window;
    let preemptions_cache_key = preemptions_key(&project, window);
    let exhaustions_cache_key = resource_exhaustions_key(&project, window);

    let world = async {
        tokio::try_join!(
            async { ci.list_agents().await.context("listing CI agents") },
            async { cloud.list_instances().await.context("listing cloud instances") },
            try_join_all(queues.iter().map(|queue| async move {
                let counts = ci
                    .queue_metrics(queue)
                    .await
                    .with_context(|| format!("fetching metrics for queue {queue}"))?;
                Ok::<_, anyhow::Error>((queue.clone(), counts))
            })),
            try_join_all(families.iter().map(|key| async move {
                let (project, family) = key;
                let image = cloud
                    .image_for_family(project, family)
                    .await
                    .with_context(|| format!("resolving image family {family}"))?;
                Ok::<_, anyhow::Error>((key.clone(), image))
            })),
        )
    };

    let (world, preemptions, resource_exhaustions) = tokio::join!(
        world,
        fetch_scores_with_cache(
            &preemptions_cache_key,
            cache,
            metrics.preemptions(&project, window)
        ),
        fetch_scores_with_cache(
            &exhaustions_cache_key,
            cache,
            metrics.resource_exhaustions(&project, window)
        ),
    );
    let (agents, instances, queue_metrics, images) = world.map_err(ManagerError::Gather)?;

    let images: BTreeMap<(String, String), String> = images.into_iter().collect();
    for config in fleet.agents.iter_mut().filter(|c| c.image.is_none()) {
        let Some(family) = config.image_family.clone() else {
            continue;
        };
        if let Some(image) = images.get(&(config.project.clone(), family)) {
            debug!(agent = %config.name, image = %image, "Resolved image family");
            config.resolve_image(image.clone());
        }
    }

    let configs = fleet.agents.into_iter().map(Arc::new).collect();
    let ctx = ReconciliationContext::new(configs, Utc::now())
        .with_agents(agents)
        .with_instances(instances)
        .with_queues(queue_metrics.into_iter().collect::<BTreeMap<_, _>>())
        .with_scores(preemptions, resource_exhaustions)
        .with_pause_all_agents(fleet.pause_all_agents);

    info!(
        agents = ctx.agents.len(),
        instances = ctx.instances.len(),
        queues = ctx.queues.len(),
        zones_with_preemptions = ctx.preemptions.len(),
        "Gathered fleet state"
    );

    Ok(ctx)
}

/// Project whose zone metrics feed spot placement: the fleet default, else
/// the first config's project.
fn metrics_project(fleet: &FleetConfig) -> String {
    if !fleet.project.is_empty() {
        return fleet.project.clone();
    }
    fleet
        .agents
        .first()
        .map(|c| c.project.clone())
        .unwrap_or_default()
}
