//! Fleet reconciliation primitives.
//!
//! This library holds the decision logic of the agent manager: it turns a
//! snapshot of CI agents, cloud instances and queue metrics into a plan of
//! creations, deletions, graceful stops and connection marks. Key concepts:
//!
//! - **Agent config**: scaling policy and VM template for one CI queue.
//! - **Drift hash**: digest over the config fields that define a VM; agents
//!   launched from an older hash are drained.
//! - **Zone weighting**: spot placement steered away from zones with recent
//!   preemptions or resource exhaustions.
//!
//! # Invariants
//!
//! - Planning is deterministic given the same snapshot
//! - Nothing here performs I/O; collaborators live in the service crate
//! - The only mutable state is each config's zone round-robin cursor

mod config;
mod context;
mod error;
mod hash;
mod launch;
mod plan;
mod types;
mod zones;

pub use config::{
    AgentConfig, AgentConfigInput, DiskType, FleetConfig, RejectedConfig, TopLevelConfig,
    DEFAULT_SUBNETWORK, INSTANCE_NAME_MAX_LEN, INSTANCE_SUFFIX_BYTES, MAX_AGENT_NAME_LEN,
};
pub use context::ReconciliationContext;
pub use error::{ConfigError, ReconcileError};
pub use hash::ConfigHash;
pub use launch::{
    choose_zone, instance_name, render_agent_config, AccessConfig, AdvancedMachineFeatures,
    AttachedDisk, AttachedDiskKind, InitializeParams, InstanceRequest, NetworkInterface,
    RequestMetadata, Scheduling, ServiceAccount, ZoneChoice, CLOUD_PLATFORM_SCOPE,
    DEFAULT_BUILD_PATH, DEFAULT_DISK_SIZE_GB, DEFAULT_STARTUP_SCRIPT, NETWORK_TAG,
    SPOT_PREEMPTION_CUTOFF,
};
pub use plan::{
    connection_pairings, create_plan, desired_agents, is_orphaned, slow_starting_instances,
    stale_agents, ConnectionPairing, CreateRequest, CreateSummary, DeleteSummary, ExecutionPlan,
    PairingSummary, PlanSummary, Planner, PlannerOptions, StopSummary, ORPHAN_AFTER_SECS,
    SLOW_START_AFTER_SECS,
};
pub use types::{
    AgentCounts, AgentTags, CiAgent, CloudInstance, ConnectionState, InstanceMetadata,
    InstanceStatus, JobCounts, MetadataItem, QueueMetrics, AGENT_ID_KEY, AGENT_NAME_KEY, HASH_TAG,
    MANAGER_TAG, QUEUE_TAG,
};
pub use zones::{
    compute_weighting, merge_scores, pick_zone, pick_zone_from, pick_zone_with, region_of,
    total_score, ZoneScores, ZoneWeighting, DEFAULT_REGION_SCORE, DEFAULT_SCORE_WINDOW_MINS,
    FAILSAFE_ZONE_COUNT, MAX_PREEMPTIONS_PER_WINDOW, REGION_SCORES,
};
