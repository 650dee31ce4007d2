//! Instance launch requests.
//!
//! Builds everything the cloud collaborator needs to create one agent VM:
//! its name, its zone and the full instance body, including the CI agent
//! config file passed through instance metadata.

use std::collections::BTreeMap;

use rand::Rng;
use serde::Serialize;
use tracing::warn;

use crate::config::{AgentConfig, DiskType, INSTANCE_SUFFIX_BYTES};
use crate::error::ReconcileError;
use crate::types::{MetadataItem, AGENT_NAME_KEY, HASH_TAG, MANAGER_TAG, QUEUE_TAG};
use crate::zones::{
    compute_weighting, merge_scores, pick_zone_from, region_of, total_score, ZoneScores,
    ZoneWeighting,
};

/// Spot is disabled for a launch once this many preemptions were seen
/// across the fleet in the scoring window.
pub const SPOT_PREEMPTION_CUTOFF: u32 = 50;

pub const DEFAULT_BUILD_PATH: &str = "/var/lib/buildkite-agent/builds";
pub const DEFAULT_STARTUP_SCRIPT: &str = "/opt/bk-startup.sh";
pub const DEFAULT_DISK_SIZE_GB: u32 = 100;
pub const NETWORK_TAG: &str = "buildkite-agent";
pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Generate `<name>-<16 hex chars>`.
pub fn instance_name<R: Rng + ?Sized>(config: &AgentConfig, rng: &mut R) -> String {
    let mut suffix = [0u8; INSTANCE_SUFFIX_BYTES];
    rng.fill(&mut suffix[..]);
    format!("{}-{}", config.name, hex::encode(suffix))
}

/// Where and how a single instance will be launched.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneChoice {
    pub zone: String,
    pub spot: bool,
    /// The distribution a spot zone was drawn from.
    pub weighting: Option<ZoneWeighting>,
}

/// Choose a zone for one launch.
///
/// Spot launches are weighted away from troubled zones. If the fleet has
/// seen too many preemptions the launch falls back to a standard instance
/// in the next round-robin zone.
pub fn choose_zone<R: Rng + ?Sized>(
    config: &AgentConfig,
    preemptions: &ZoneScores,
    resource_exhaustions: &ZoneScores,
    rng: &mut R,
) -> ZoneChoice {
    let total_preemptions = total_score(preemptions);
    let spot = config.spot && total_preemptions < SPOT_PREEMPTION_CUTOFF;

    if config.spot && !spot {
        warn!(
            agent = %config.name,
            total_preemptions,
            "Too many preemptions, launching standard instance"
        );
    }

    if spot {
        let weighting =
            compute_weighting(&config.zones, &merge_scores(preemptions, resource_exhaustions));
        if let Some(zone) = pick_zone_from(&weighting, rng).map(str::to_string) {
            return ZoneChoice {
                zone,
                spot,
                weighting: Some(weighting),
            };
        }
    }

    ZoneChoice {
        zone: config.next_zone().to_string(),
        spot,
        weighting: None,
    }
}

/// Render the CI agent config file, one `key="value"` per line.
pub fn render_agent_config(config: &AgentConfig, manager_name: &str, spot: bool) -> String {
    let mut lines = vec![
        ("name", "%hostname".to_string()),
        (
            "build-path",
            config
                .build_path
                .clone()
                .unwrap_or_else(|| DEFAULT_BUILD_PATH.to_string()),
        ),
    ];

    if let Some(timeout) = config.idle_timeout() {
        lines.push(("disconnect-after-idle-timeout", timeout.to_string()));
    }

    if config.exit_after_one_job {
        lines.push(("disconnect-after-job", "true".to_string()));
    }

    let mut tags = vec![
        format!("{QUEUE_TAG}={}", config.queue),
        format!("{HASH_TAG}={}", config.hash()),
        format!("{MANAGER_TAG}={manager_name}"),
    ];
    if spot {
        tags.push("spot=true".to_string());
    }
    lines.push(("tags", tags.join(",")));

    lines
        .into_iter()
        .map(|(key, value)| format!("{key}=\"{value}\""))
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_image: Option<String>,
    pub disk_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_size_gb: Option<u32>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttachedDiskKind {
    Persistent,
    Scratch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedDisk {
    #[serde(rename = "type")]
    pub kind: AttachedDiskKind,
    pub boot: bool,
    pub auto_delete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    pub initialize_params: InitializeParams,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub network_tier: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    pub subnetwork: String,
    pub access_configs: Vec<AccessConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceAccount {
    pub email: String,
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Scheduling {
    pub automatic_restart: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provisioning_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_termination_action: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvancedMachineFeatures {
    pub enable_nested_virtualization: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestMetadata {
    pub items: Vec<MetadataItem>,
}

/// Body of a cloud instance insert call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRequest {
    pub name: String,
    pub zone: String,
    pub machine_type: String,
    pub disks: Vec<AttachedDisk>,
    pub network_interfaces: Vec<NetworkInterface>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub service_accounts: Vec<ServiceAccount>,
    pub tags: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub metadata: RequestMetadata,
    pub scheduling: Scheduling,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_cpu_platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advanced_machine_features: Option<AdvancedMachineFeatures>,
}

impl InstanceRequest {
    /// Build the insert body for one instance.
    ///
    /// Fails if the config's image has not been resolved from its family.
    pub fn build(
        config: &AgentConfig,
        zone: &str,
        name: impl Into<String>,
        manager_name: &str,
        spot: bool,
    ) -> Result<Self, ReconcileError> {
        let image = config
            .image
            .as_deref()
            .ok_or_else(|| ReconcileError::UnresolvedImage(config.name.clone()))?;
        let project = &config.project;
        let region = region_of(zone);

        let mut disks = vec![AttachedDisk {
            kind: AttachedDiskKind::Persistent,
            boot: true,
            auto_delete: true,
            interface: None,
            initialize_params: InitializeParams {
                source_image: Some(format!("projects/{project}/global/images/{image}")),
                disk_type: format!(
                    "projects/{project}/zones/{zone}/diskTypes/{}",
                    config.disk_type.unwrap_or(DiskType::PdSsd)
                ),
                disk_size_gb: Some(config.disk_size_gb.unwrap_or(DEFAULT_DISK_SIZE_GB)),
                labels: config.labels.clone(),
            },
        }];

        for _ in 0..config.local_ssds.unwrap_or(0) {
            disks.push(AttachedDisk {
                kind: AttachedDiskKind::Scratch,
                boot: false,
                auto_delete: true,
                interface: Some("NVME".to_string()),
                initialize_params: InitializeParams {
                    source_image: None,
                    disk_type: format!("zones/{zone}/diskTypes/local-ssd"),
                    disk_size_gb: None,
                    labels: BTreeMap::new(),
                },
            });
        }

        let access_configs = if config.disable_external_ip {
            Vec::new()
        } else {
            vec![AccessConfig {
                kind: "ONE_TO_ONE_NAT".to_string(),
                network_tier: "PREMIUM".to_string(),
            }]
        };

        let mut labels = BTreeMap::from([
            ("buildkite-agent".to_string(), "true".to_string()),
            (AGENT_NAME_KEY.to_string(), config.name.clone()),
            (MANAGER_TAG.to_string(), manager_name.to_string()),
        ]);
        labels.extend(config.labels.clone());

        let mut tags = vec![NETWORK_TAG.to_string()];
        tags.extend(config.tags.iter().cloned());

        let hash = config.hash();
        let mut items = vec![
            MetadataItem::new("buildkite-agent", "true"),
            MetadataItem::new(MANAGER_TAG, manager_name),
            MetadataItem::new(AGENT_NAME_KEY, config.name.as_str()),
            MetadataItem::new("buildkite-agent-queue", config.queue.as_str()),
            MetadataItem::new("buildkite-agent-hash", hash.as_str()),
            MetadataItem::new(
                "buildkite-agent-config",
                render_agent_config(config, manager_name, spot),
            ),
            MetadataItem::new(
                "startup-script",
                config
                    .startup_script
                    .as_deref()
                    .unwrap_or(DEFAULT_STARTUP_SCRIPT),
            ),
        ];
        for (key, value) in &config.metadata {
            if !items.iter().any(|item| &item.key == key) {
                items.push(MetadataItem::new(key.as_str(), value.as_str()));
            }
        }

        let (min_cpu_platform, advanced_machine_features) = if config.nested_virtualization {
            // n1 machines only support nested virtualization from Haswell on.
            let platform = config
                .machine_type
                .starts_with("n1-")
                .then(|| "Intel Haswell".to_string());
            (
                platform,
                Some(AdvancedMachineFeatures {
                    enable_nested_virtualization: true,
                }),
            )
        } else {
            (None, None)
        };

        Ok(Self {
            name: name.into(),
            zone: zone.to_string(),
            machine_type: config.machine_type.clone(),
            disks,
            network_interfaces: vec![NetworkInterface {
                subnetwork: format!(
                    "projects/{project}/regions/{region}/subnetworks/{}",
                    config.subnetwork
                ),
                access_configs,
            }],
            service_accounts: config
                .service_accounts
                .iter()
                .map(|email| ServiceAccount {
                    email: email.clone(),
                    scopes: vec![CLOUD_PLATFORM_SCOPE.to_string()],
                })
                .collect(),
            tags,
            labels,
            metadata: RequestMetadata { items },
            scheduling: Scheduling {
                automatic_restart: false,
                provisioning_model: spot.then(|| "SPOT".to_string()),
                instance_termination_action: spot.then(|| "DELETE".to_string()),
            },
            min_cpu_platform,
            advanced_machine_features,
        })
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .items
            .iter()
            .find(|item| item.key == key)
            .map(|item| item.value.as_str())
    }

    pub fn is_spot(&self) -> bool {
        self.scheduling.provisioning_model.as_deref() == Some("SPOT")
    }
}
