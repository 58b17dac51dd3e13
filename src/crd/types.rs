//! Shared types for the DocumentDB CRDs

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Storage configuration for each member's database instances
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    /// Size of each instance's PVC (e.g. "10Gi")
    #[serde(default = "default_pvc_size")]
    pub pvc_size: String,

    /// Storage class used when a member does not override it
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub storage_class: String,
}

fn default_pvc_size() -> String {
    "10Gi".to_string()
}

/// Resource configuration for the database instances
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConfig {
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Cross-cloud networking strategy used to make peer endpoints resolvable
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum CrossCloudNetworkingStrategy {
    /// All members share one cluster network; no cross-cluster objects are created
    #[default]
    None,
    /// Multi-cluster services through an Azure Fleet hub (ServiceExport / MultiClusterService)
    AzureFleet,
    /// Istio multi-cluster mesh routed through the east-west gateway
    Istio,
}

impl std::fmt::Display for CrossCloudNetworkingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CrossCloudNetworkingStrategy::None => write!(f, "None"),
            CrossCloudNetworkingStrategy::AzureFleet => write!(f, "AzureFleet"),
            CrossCloudNetworkingStrategy::Istio => write!(f, "Istio"),
        }
    }
}

/// A member cluster participating in the replication topology
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemberCluster {
    /// Logical member name (fleet member identity)
    pub name: String,

    /// Storage class override for this member
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    /// Cloud environment override for this member
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
}

/// Cross-cluster replication configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterReplication {
    /// Member name of the current primary
    pub primary: String,

    /// All members of the topology, primary included
    #[serde(default)]
    pub cluster_list: Vec<MemberCluster>,

    /// Run a local standby and synchronous quorum on the primary
    #[serde(default)]
    pub high_availability: bool,

    #[serde(default)]
    pub cross_cloud_networking_strategy: CrossCloudNetworkingStrategy,
}

/// Restore source for a new engine cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryConfig {
    /// Name of the CNPG Backup object to restore from
    pub backup_name: String,
}

/// Bootstrap configuration for a new engine cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<RecoveryConfig>,
}

/// Status condition following Kubernetes API conventions
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., "Ready", "Progressing", "Degraded")
    #[serde(rename = "type")]
    pub type_: String,
    /// Status of the condition: "True", "False", or "Unknown"
    pub status: String,
    /// Last time the condition transitioned
    pub last_transition_time: String,
    /// Machine-readable reason for the condition
    pub reason: String,
    /// Human-readable message
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
