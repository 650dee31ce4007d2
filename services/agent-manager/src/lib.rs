//! Fleet agent manager.
//!
//! Scales a fleet of CI build-agent VMs to match queue demand. Each pass
//! gathers the world from its collaborators, asks the planner in
//! `fleet-reconcile` what to change, and applies the plan with bounded
//! concurrency.
//!
//! ## Architecture
//!
//! - **Config source**: fleet document, with last-good fallback
//! - **Gather**: concurrent, time-bounded snapshot of agents, instances,
//!   queue metrics, images and zone scores
//! - **Executor**: create, delete, stop and mark-connected pools
//! - **Manager**: one-shot pass or polling loop

pub mod cache;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod executor;
pub mod gather;
pub mod manager;
pub mod mock;
pub mod source;

pub use cache::{ScoreCache, TtlCache};
pub use collaborators::{CiService, CloudProvider, Collaborators, ZoneMetricsSource};
pub use config::Config;
pub use error::{ManagerError, ManagerResult};
pub use executor::{execute_plan, ActionGroup, ConcurrencyLimits, ExecutionReport, GroupReport};
pub use gather::{gather, GatherSettings};
pub use manager::{Manager, ManagerSettings, PassOutcome};
pub use mock::{MockCi, MockCloud, MockWorld, StaticZoneMetrics, WorldSnapshot};
pub use source::{ConfigSource, FileConfigSource, LastGoodConfigSource, StaticConfigSource};
