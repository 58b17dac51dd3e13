//! Replication topology resolution
//!
//! Works out which role this cluster plays for a DocumentDB: standalone,
//! primary, replica, or not a member at all. Pure over the resource spec and
//! the local member identity resolved once at operator startup.

use kube::ResourceExt;

use crate::crd::{CrossCloudNetworkingStrategy, DocumentDB};
use crate::error::{Error, Result};

use super::naming::engine_cluster_name;

/// Role of the local member in the replication topology
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicationRole {
    NoReplication,
    Primary,
    Replica,
    /// The local cluster is not in the member list; nothing to do here
    NotPresent,
}

impl std::fmt::Display for ReplicationRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicationRole::NoReplication => write!(f, "NoReplication"),
            ReplicationRole::Primary => write!(f, "Primary"),
            ReplicationRole::Replica => write!(f, "Replica"),
            ReplicationRole::NotPresent => write!(f, "NotPresent"),
        }
    }
}

/// Resolved view of one DocumentDB from the point of view of the local member
#[derive(Clone, Debug, PartialEq)]
pub struct Topology {
    pub resource_name: String,
    pub namespace: String,
    pub self_member: String,
    pub role: ReplicationRole,
    pub primary: String,
    /// Peers in declaration order, never containing `self_member`
    pub others: Vec<String>,
    pub strategy: CrossCloudNetworkingStrategy,
    pub environment: String,
    pub storage_class: String,
    pub high_availability: bool,
    /// False when `clusterReplication` is absent from the spec
    pub replication_configured: bool,
}

impl Topology {
    /// Resolve the topology for `doc` as seen by `local_identity`.
    ///
    /// An injected identity always wins. Without one, the resource name stands
    /// in for the member name, which is only acceptable when no cross-cloud
    /// networking strategy is configured.
    pub fn resolve(doc: &DocumentDB, local_identity: Option<&str>) -> Result<Self> {
        let resource_name = doc.name_any();
        let namespace = doc.namespace().unwrap_or_else(|| "default".to_string());
        let spec = &doc.spec;

        let Some(replication) = spec.cluster_replication.as_ref() else {
            return Ok(Self {
                self_member: resource_name.clone(),
                primary: resource_name.clone(),
                resource_name,
                namespace,
                role: ReplicationRole::NoReplication,
                others: Vec::new(),
                strategy: CrossCloudNetworkingStrategy::None,
                environment: spec.environment.clone(),
                storage_class: spec.resource.storage.storage_class.clone(),
                high_availability: false,
                replication_configured: false,
            });
        };

        let strategy = replication.cross_cloud_networking_strategy;
        let self_member = match local_identity {
            Some(identity) => identity.to_string(),
            None if strategy == CrossCloudNetworkingStrategy::None => resource_name.clone(),
            None => {
                return Err(Error::MissingIdentity(format!(
                    "crossCloudNetworkingStrategy {} requires the local fleet member name",
                    strategy
                )))
            }
        };

        let mut environment = spec.environment.clone();
        let mut storage_class = spec.resource.storage.storage_class.clone();
        let mut found = false;
        let mut others = Vec::with_capacity(replication.cluster_list.len());

        for member in &replication.cluster_list {
            if member.name == self_member {
                found = true;
                if let Some(env) = member.environment.as_ref().filter(|e| !e.is_empty()) {
                    environment = env.clone();
                }
                if let Some(sc) = member.storage_class.as_ref().filter(|s| !s.is_empty()) {
                    storage_class = sc.clone();
                }
            } else if !others.contains(&member.name) {
                others.push(member.name.clone());
            }
        }

        let role = if !found {
            ReplicationRole::NotPresent
        } else if others.is_empty() {
            ReplicationRole::NoReplication
        } else if self_member == replication.primary {
            ReplicationRole::Primary
        } else {
            ReplicationRole::Replica
        };

        Ok(Self {
            resource_name,
            namespace,
            self_member,
            role,
            primary: replication.primary.clone(),
            others: if found { others } else { Vec::new() },
            strategy,
            environment,
            storage_class,
            high_availability: replication.high_availability,
            replication_configured: true,
        })
    }

    pub fn is_replicating(&self) -> bool {
        matches!(self.role, ReplicationRole::Primary | ReplicationRole::Replica)
    }

    /// Name of the CNPG cluster of any member of this topology
    pub fn engine_name_of(&self, member: &str) -> String {
        if self.replication_configured {
            engine_cluster_name(&self.resource_name, member)
        } else {
            // standalone clusters keep the resource's own name
            self.resource_name
                .chars()
                .take(super::naming::MAX_ENGINE_CLUSTER_NAME)
                .collect()
        }
    }

    /// Name of the local CNPG cluster
    pub fn engine_cluster_name(&self) -> String {
        self.engine_name_of(&self.self_member)
    }

    pub fn primary_engine_name(&self) -> String {
        self.engine_name_of(&self.primary)
    }

    /// Engine names of all peers, in declaration order
    pub fn peer_engine_names(&self) -> Vec<String> {
        self.others.iter().map(|m| self.engine_name_of(m)).collect()
    }

    /// True when this member should run the HA layout (3 instances + sync quorum)
    pub fn ha_primary(&self) -> bool {
        self.high_availability && self.role == ReplicationRole::Primary
    }
}
