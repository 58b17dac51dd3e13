//! DocumentDB Custom Resource Definition
//!
//! A DocumentDB describes one logical database that may be spread over several
//! independently administered Kubernetes clusters. Each member cluster runs its
//! own CNPG `Cluster`; this resource decides which one is primary.

use std::collections::HashSet;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{BootstrapConfig, ClusterReplication, Condition, ResourceConfig};

/// Structured validation error for `DocumentDBSpec`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpecValidationError {
    pub field: String,
    pub message: String,
}

impl SpecValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SpecValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "documentdb.io",
    version = "preview",
    kind = "DocumentDB",
    namespaced,
    status = "DocumentDBStatus",
    shortname = "ddb",
    printcolumn = r#"{"name":"Role","type":"string","jsonPath":".status.role"}"#,
    printcolumn = r#"{"name":"Primary","type":"string","jsonPath":".status.primaryMember"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DocumentDBSpec {
    #[serde(default = "default_one")]
    pub node_count: i32,

    /// Local instances per member when this member is not an HA primary
    #[serde(default = "default_one")]
    pub instances_per_node: i32,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub postgres_image: String,

    /// Image of the gateway sidecar injected by the CNPG-I plugin
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub gateway_image: String,

    #[serde(default)]
    pub resource: ResourceConfig,

    /// Cloud environment hint (aks, eks, gke, ...)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub environment: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap: Option<BootstrapConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_replication: Option<ClusterReplication>,
}

fn default_one() -> i32 {
    1
}

impl DocumentDBSpec {
    /// Validate the spec
    ///
    /// Collects every problem instead of stopping at the first one so the
    /// status message tells the user everything that needs fixing.
    pub fn validate(&self) -> Result<(), Vec<SpecValidationError>> {
        let mut errors = Vec::new();

        if self.node_count < 1 {
            errors.push(SpecValidationError::new(
                "spec.nodeCount",
                "nodeCount must be at least 1",
            ));
        }

        if !(1..=3).contains(&self.instances_per_node) {
            errors.push(SpecValidationError::new(
                "spec.instancesPerNode",
                "instancesPerNode must be between 1 and 3",
            ));
        }

        if let Some(replication) = &self.cluster_replication {
            let mut seen = HashSet::new();
            for (i, member) in replication.cluster_list.iter().enumerate() {
                if member.name.is_empty() {
                    errors.push(SpecValidationError::new(
                        format!("spec.clusterReplication.clusterList[{i}].name"),
                        "member name must not be empty",
                    ));
                } else if !seen.insert(member.name.as_str()) {
                    errors.push(SpecValidationError::new(
                        format!("spec.clusterReplication.clusterList[{i}].name"),
                        format!("duplicate member name {}", member.name),
                    ));
                }
            }

            if !replication
                .cluster_list
                .iter()
                .any(|m| m.name == replication.primary)
            {
                errors.push(SpecValidationError::new(
                    "spec.clusterReplication.primary",
                    format!(
                        "primary {} is not listed in clusterList",
                        replication.primary
                    ),
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Status subresource of a DocumentDB
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentDBStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub phase: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Replication role of this member (NoReplication, Primary, Replica, NotPresent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_member: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_member: Option<String>,

    /// Name of the CNPG Cluster backing this member
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_cluster_name: Option<String>,

    #[serde(default)]
    pub ready_instances: i32,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}
