//! CloudNativePG `Cluster` types
//!
//! Only the subset of the CNPG API this operator reads or writes is modelled.
//! Unknown fields written by the CNPG controller are ignored on read.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "postgresql.cnpg.io",
    version = "v1",
    kind = "Cluster",
    namespaced,
    status = "ClusterStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    pub instances: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_name: Option<String>,

    #[serde(default)]
    pub storage: StorageConfiguration,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postgresql: Option<PostgresConfiguration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication_slots: Option<ReplicationSlotsConfiguration>,

    #[serde(rename = "replica", default, skip_serializing_if = "Option::is_none")]
    pub replica_cluster: Option<ReplicaClusterConfiguration>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub external_clusters: Vec<ExternalCluster>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed: Option<ManagedConfiguration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap: Option<BootstrapConfiguration>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plugins: Vec<PluginConfiguration>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfiguration {
    pub size: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostgresConfiguration {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synchronous: Option<SynchronousReplicaConfiguration>,
}

/// Quorum-based synchronous replication settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SynchronousReplicaConfiguration {
    /// "any" (quorum) or "first" (priority)
    pub method: String,
    pub number: i32,
    /// Standby names appended after the local instances
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub standby_names_post: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationSlotsConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high_availability: Option<ReplicationSlotsHAConfiguration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_interval: Option<i32>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationSlotsHAConfiguration {
    pub enabled: bool,
}

/// Distributed topology membership of one engine cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaClusterConfiguration {
    /// Name of this cluster inside the distributed topology; immutable
    #[serde(rename = "self")]
    pub self_name: String,
    /// Name of the cluster that should be primary
    pub primary: String,
    /// External cluster to replicate from
    pub source: String,
    /// Demotion token of the old primary, required to finish a promotion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promotion_token: Option<String>,
}

impl ReplicaClusterConfiguration {
    pub fn is_primary(&self) -> bool {
        self.self_name == self.primary
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExternalCluster {
    pub name: String,
    #[serde(default)]
    pub connection_parameters: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<ManagedServices>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedServices {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional: Vec<ManagedService>,
}

/// Extra service generated by CNPG next to the default rw/ro/r services
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedService {
    /// "rw", "ro" or "r"
    pub selector_type: String,
    pub service_template: ServiceTemplate,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTemplate {
    pub metadata: ServiceTemplateMeta,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTemplateMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initdb: Option<InitDbConfiguration>,

    #[serde(
        rename = "pg_basebackup",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub pg_basebackup: Option<PgBaseBackupConfiguration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<RecoveryConfiguration>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InitDbConfiguration {
    pub database: String,
    pub owner: String,
    #[serde(rename = "postInitSQL", default, skip_serializing_if = "Vec::is_empty")]
    pub post_init_sql: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PgBaseBackupConfiguration {
    /// External cluster to take the base backup from
    pub source: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryConfiguration {
    pub backup: BackupReference,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupReference {
    pub name: String,
}

/// CNPG-I plugin enabled on the cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PluginConfiguration {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_primary: Option<String>,

    /// Pod names grouped by instance state ("healthy", "failed", ...)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub instances_status: BTreeMap<String, Vec<String>>,

    /// Set by CNPG once a demoted primary has stopped accepting writes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub demotion_token: Option<String>,

    /// Timeline the cluster is currently on
    #[serde(rename = "timelineID", default, skip_serializing_if = "Option::is_none")]
    pub timeline_id: Option<i64>,
}

impl ClusterStatus {
    pub fn healthy_instances(&self) -> i32 {
        self.instances_status
            .get("healthy")
            .map(|pods| pods.len() as i32)
            .unwrap_or(0)
    }
}
