//! In-memory collaborators.
//!
//! Seeded from a [`WorldSnapshot`] and mutated by the executor, so several
//! passes against the same world converge the way a real fleet would. Every
//! mutation is recorded; latency and failures can be injected for testing.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use fleet_reconcile::{
    CiAgent, CloudInstance, InstanceMetadata, InstanceRequest, InstanceStatus, MetadataItem,
    QueueMetrics, ZoneScores,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::collaborators::{CiService, CloudProvider, Collaborators, ZoneMetricsSource};

/// A serialized view of the fleet the in-memory collaborators start from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorldSnapshot {
    pub agents: Vec<CiAgent>,
    pub instances: Vec<CloudInstance>,
    pub queues: BTreeMap<String, QueueMetrics>,
    /// Newest image per image family.
    pub images: BTreeMap<String, String>,
    pub preemptions: ZoneScores,
    pub resource_exhaustions: ZoneScores,
}

impl WorldSnapshot {
    /// Load a snapshot from a JSON file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading world snapshot {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("decoding world snapshot {}", path.display()))
    }

    /// Split the snapshot into in-memory collaborators.
    pub fn into_world(self) -> MockWorld {
        MockWorld {
            ci: Arc::new(MockCi::new(self.agents, self.queues)),
            cloud: Arc::new(MockCloud::new(self.instances, self.images)),
            metrics: Arc::new(StaticZoneMetrics::new(
                self.preemptions,
                self.resource_exhaustions,
            )),
        }
    }
}

/// Handles to the in-memory collaborators of one world.
#[derive(Clone)]
pub struct MockWorld {
    pub ci: Arc<MockCi>,
    pub cloud: Arc<MockCloud>,
    pub metrics: Arc<StaticZoneMetrics>,
}

impl MockWorld {
    pub fn collaborators(&self) -> Collaborators {
        Collaborators::new(self.ci.clone(), self.cloud.clone(), self.metrics.clone())
    }
}

/// Tracks how many calls of one kind run at once.
#[derive(Debug, Default)]
pub struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlight {
    fn enter(&self) -> InFlightGuard<'_> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlightGuard(self)
    }

    /// Highest number of concurrent calls observed.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct InFlightGuard<'a>(&'a InFlight);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn simulate_latency(latency: Duration) {
    if !latency.is_zero() {
        tokio::time::sleep(latency).await;
    }
}

/// In-memory CI service.
pub struct MockCi {
    agents: RwLock<Vec<CiAgent>>,
    queues: BTreeMap<String, QueueMetrics>,
    stopped: RwLock<Vec<String>>,
    latency: Duration,
    fail_list: bool,
    fail_stops: bool,
    stops_in_flight: InFlight,
}

impl MockCi {
    pub fn new(agents: Vec<CiAgent>, queues: BTreeMap<String, QueueMetrics>) -> Self {
        Self {
            agents: RwLock::new(agents),
            queues,
            stopped: RwLock::new(Vec::new()),
            latency: Duration::ZERO,
            fail_list: false,
            fail_stops: false,
            stops_in_flight: InFlight::default(),
        }
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make `list_agents` fail.
    pub fn failing_list(mut self) -> Self {
        self.fail_list = true;
        self
    }

    /// Make every `stop_agent` fail.
    pub fn failing_stops(mut self) -> Self {
        self.fail_stops = true;
        self
    }

    /// Ids of agents asked to stop, in call order.
    pub async fn stopped(&self) -> Vec<String> {
        self.stopped.read().await.clone()
    }

    pub fn stops_in_flight(&self) -> &InFlight {
        &self.stops_in_flight
    }
}

#[async_trait]
impl CiService for MockCi {
    async fn list_agents(&self) -> Result<Vec<CiAgent>> {
        simulate_latency(self.latency).await;
        if self.fail_list {
            anyhow::bail!("Mock CI service configured to fail listing agents");
        }
        Ok(self.agents.read().await.clone())
    }

    async fn queue_metrics(&self, queue: &str) -> Result<QueueMetrics> {
        simulate_latency(self.latency).await;
        Ok(self.queues.get(queue).copied().unwrap_or_default())
    }

    async fn stop_agent(&self, agent: &CiAgent) -> Result<()> {
        let _guard = self.stops_in_flight.enter();
        simulate_latency(self.latency).await;
        if self.fail_stops {
            anyhow::bail!("Mock CI service configured to fail stopping {}", agent.name);
        }

        info!(agent = %agent.name, uuid = %agent.uuid, "[MOCK] Stopping agent");
        if let Some(existing) = self.agents.write().await.iter_mut().find(|a| a.id == agent.id) {
            existing.stop_requested_at = Some(Utc::now());
        }
        self.stopped.write().await.push(agent.id.clone());
        Ok(())
    }
}

/// In-memory cloud provider.
pub struct MockCloud {
    instances: RwLock<Vec<CloudInstance>>,
    images: BTreeMap<String, String>,
    created: RwLock<Vec<InstanceRequest>>,
    deleted: RwLock<Vec<String>>,
    latency: Duration,
    /// Creates succeed this many times, then fail.
    creates_before_failure: Option<usize>,
    create_attempts: AtomicUsize,
    image_lookups: AtomicUsize,
    fail_deletes: bool,
    fail_list: AtomicBool,
    next_id: AtomicUsize,
    creates_in_flight: InFlight,
    deletes_in_flight: InFlight,
    metadata_in_flight: InFlight,
}

impl MockCloud {
    pub fn new(instances: Vec<CloudInstance>, images: BTreeMap<String, String>) -> Self {
        Self {
            next_id: AtomicUsize::new(instances.len()),
            instances: RwLock::new(instances),
            images,
            created: RwLock::new(Vec::new()),
            deleted: RwLock::new(Vec::new()),
            latency: Duration::ZERO,
            creates_before_failure: None,
            create_attempts: AtomicUsize::new(0),
            image_lookups: AtomicUsize::new(0),
            fail_deletes: false,
            fail_list: AtomicBool::new(false),
            creates_in_flight: InFlight::default(),
            deletes_in_flight: InFlight::default(),
            metadata_in_flight: InFlight::default(),
        }
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Let `successes` creates through, then fail every later one.
    pub fn failing_creates_after(mut self, successes: usize) -> Self {
        self.creates_before_failure = Some(successes);
        self
    }

    pub fn failing_deletes(mut self) -> Self {
        self.fail_deletes = true;
        self
    }

    /// Toggle failures of `list_instances`.
    pub fn set_fail_list(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    /// Instance requests accepted so far.
    pub async fn created(&self) -> Vec<InstanceRequest> {
        self.created.read().await.clone()
    }

    /// Ids of deleted instances, in call order.
    pub async fn deleted(&self) -> Vec<String> {
        self.deleted.read().await.clone()
    }

    /// Current instances, including ones created by the manager.
    pub async fn instances(&self) -> Vec<CloudInstance> {
        self.instances.read().await.clone()
    }

    /// Number of `create_instance` calls, successful or not.
    pub fn create_attempts(&self) -> usize {
        self.create_attempts.load(Ordering::SeqCst)
    }

    pub fn image_lookups(&self) -> usize {
        self.image_lookups.load(Ordering::SeqCst)
    }

    pub fn creates_in_flight(&self) -> &InFlight {
        &self.creates_in_flight
    }

    pub fn deletes_in_flight(&self) -> &InFlight {
        &self.deletes_in_flight
    }

    pub fn metadata_in_flight(&self) -> &InFlight {
        &self.metadata_in_flight
    }
}

#[async_trait]
impl CloudProvider for MockCloud {
    async fn list_instances(&self) -> Result<Vec<CloudInstance>> {
        simulate_latency(self.latency).await;
        if self.fail_list.load(Ordering::SeqCst) {
            anyhow::bail!("Mock cloud configured to fail listing instances");
        }
        Ok(self.instances.read().await.clone())
    }

    async fn image_for_family(&self, project: &str, family: &str) -> Result<String> {
        self.image_lookups.fetch_add(1, Ordering::SeqCst);
        simulate_latency(self.latency).await;
        self.images
            .get(family)
            .cloned()
            .with_context(|| format!("no image in family {family} for project {project}"))
    }

    async fn create_instance(&self, request: &InstanceRequest) -> Result<()> {
        let _guard = self.creates_in_flight.enter();
        let attempt = self.create_attempts.fetch_add(1, Ordering::SeqCst);
        simulate_latency(self.latency).await;

        if let Some(successes) = self.creates_before_failure {
            if attempt >= successes {
                anyhow::bail!("Mock cloud configured to fail creating {}", request.name);
            }
        }

        info!(name = %request.name, zone = %request.zone, spot = request.is_spot(), "[MOCK] Creating instance");

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let instance = CloudInstance {
            id: format!("mock-{id}"),
            name: request.name.clone(),
            status: InstanceStatus::Provisioning,
            creation_timestamp: Utc::now(),
            zone: request.zone.clone(),
            metadata: InstanceMetadata::new(request.metadata.items.clone()),
        };
        self.instances.write().await.push(instance);
        self.created.write().await.push(request.clone());
        Ok(())
    }

    async fn delete_instance(&self, instance: &CloudInstance) -> Result<()> {
        let _guard = self.deletes_in_flight.enter();
        simulate_latency(self.latency).await;
        if self.fail_deletes {
            anyhow::bail!("Mock cloud configured to fail deleting {}", instance.name);
        }

        info!(name = %instance.name, status = %instance.status, "[MOCK] Deleting instance");
        self.instances.write().await.retain(|i| i.id != instance.id);
        self.deleted.write().await.push(instance.id.clone());
        Ok(())
    }

    async fn set_metadata(&self, instance: &CloudInstance, items: &[MetadataItem]) -> Result<()> {
        let _guard = self.metadata_in_flight.enter();
        simulate_latency(self.latency).await;

        let mut instances = self.instances.write().await;
        let target = instances
            .iter_mut()
            .find(|i| i.id == instance.id)
            .with_context(|| format!("instance {} not found", instance.name))?;
        for item in items {
            target.metadata.set(&item.key, item.value.clone());
        }
        debug!(name = %instance.name, count = items.len(), "[MOCK] Set metadata");
        Ok(())
    }
}

/// Zone metrics served from fixed maps.
pub struct StaticZoneMetrics {
    preemptions: ZoneScores,
    resource_exhaustions: ZoneScores,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl StaticZoneMetrics {
    pub fn new(preemptions: ZoneScores, resource_exhaustions: ZoneScores) -> Self {
        Self {
            preemptions,
            resource_exhaustions,
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    /// Toggle failures of every metrics call.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of metrics calls made.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn serve(&self, scores: &ZoneScores) -> Result<ZoneScores> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("Mock metrics backend unavailable");
        }
        Ok(scores.clone())
    }
}

#[async_trait]
impl ZoneMetricsSource for StaticZoneMetrics {
    async fn preemptions(&self, _project: &str, _window: Duration) -> Result<ZoneScores> {
        self.serve(&self.preemptions)
    }

    async fn resource_exhaustions(&self, _project: &str, _window: Duration) -> Result<ZoneScores> {
        self.serve(&self.resource_exhaustions)
    }
}
