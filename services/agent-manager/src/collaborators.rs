//! Interfaces to the systems the manager observes and acts on.
//!
//! - **CI service**: registered agents, queue metrics, graceful stops
//! - **Cloud provider**: instances, images, instance lifecycle
//! - **Zone metrics**: preemption and resource-exhaustion history
//!
//! In-memory implementations live in [`crate::mock`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use fleet_reconcile::{
    CiAgent, CloudInstance, InstanceRequest, MetadataItem, QueueMetrics, ZoneScores,
};

/// CI service interface.
#[async_trait]
pub trait CiService: Send + Sync {
    /// List every agent registered with the CI service.
    async fn list_agents(&self) -> Result<Vec<CiAgent>>;

    /// Fetch agent and job counts for a queue.
    async fn queue_metrics(&self, queue: &str) -> Result<QueueMetrics>;

    /// Ask an agent to finish its current job and disconnect.
    async fn stop_agent(&self, agent: &CiAgent) -> Result<()>;
}

/// Cloud provider interface.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// List every instance owned by this manager.
    async fn list_instances(&self) -> Result<Vec<CloudInstance>>;

    /// Resolve the newest image in a family.
    async fn image_for_family(&self, project: &str, family: &str) -> Result<String>;

    async fn create_instance(&self, request: &InstanceRequest) -> Result<()>;

    async fn delete_instance(&self, instance: &CloudInstance) -> Result<()>;

    /// Insert or replace metadata items on an instance.
    async fn set_metadata(&self, instance: &CloudInstance, items: &[MetadataItem]) -> Result<()>;
}

/// Source of per-zone adverse-event counts.
#[async_trait]
pub trait ZoneMetricsSource: Send + Sync {
    async fn preemptions(&self, project: &str, window: Duration) -> Result<ZoneScores>;

    async fn resource_exhaustions(&self, project: &str, window: Duration) -> Result<ZoneScores>;
}

/// The collaborators one pass talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub ci: Arc<dyn CiService>,
    pub cloud: Arc<dyn CloudProvider>,
    pub metrics: Arc<dyn ZoneMetricsSource>,
}

impl Collaborators {
    pub fn new(
        ci: Arc<dyn CiService>,
        cloud: Arc<dyn CloudProvider>,
        metrics: Arc<dyn ZoneMetricsSource>,
    ) -> Self {
        Self { ci, cloud, metrics }
    }
}
