//! Cross-cluster networking strategies
//!
//! Each strategy makes a remote member's read-write endpoint resolvable from
//! the local cluster, and moves the promotion token between members:
//!
//! - [`NoNetworking`]: every member shares one cluster network
//! - [`FleetNetworking`]: Azure Fleet multi-cluster services
//! - [`IstioNetworking`]: Istio east-west gateway with placeholder services

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use kube::Client;

use crate::crd::{Cluster, CrossCloudNetworkingStrategy, DocumentDB, ManagedService};
use crate::error::Result;

use super::topology::Topology;

mod fleet;
mod istio;
mod none;

pub use fleet::{
    exported_service_names, imported_service_names, is_misattributed_import, FleetNetworking,
    FLEET_SYSTEM_NAMESPACE,
};
pub use istio::{build_peer_service, IstioNetworking};
pub use none::NoNetworking;

/// Capability surface shared by all networking strategies
#[async_trait]
pub trait PeerNetworking: Send + Sync {
    fn strategy(&self) -> CrossCloudNetworkingStrategy;

    /// Characters prepended to service names by the import machinery
    fn reserved_prefix(&self, _namespace: &str) -> usize {
        0
    }

    /// Host the local engine cluster uses to connect to `peer`
    fn peer_host(&self, topology: &Topology, peer: &str) -> String;

    /// Extra CNPG-managed services the local engine cluster must expose
    fn managed_services(&self, _topology: &Topology) -> Vec<ManagedService> {
        Vec::new()
    }

    /// Converge the cross-cluster objects onto the topology's peer set
    async fn ensure_peers_visible(
        &self,
        client: &Client,
        doc: &DocumentDB,
        topology: &Topology,
    ) -> Result<()>;

    /// Delete every cross-cluster object created for `doc`
    async fn remove_peer_objects(&self, client: &Client, doc: &DocumentDB) -> Result<()>;

    /// Expose the demotion token of `cluster` to the other members
    async fn publish_token(&self, client: &Client, cluster: &Cluster, token: &str) -> Result<()>;

    /// Read the token published by the demoted cluster `source_engine`
    async fn read_token(
        &self,
        client: &Client,
        http: &reqwest::Client,
        local: &Cluster,
        source_engine: &str,
    ) -> Result<String>;
}

/// Pick the implementation for a configured strategy
pub fn for_strategy(strategy: CrossCloudNetworkingStrategy) -> Arc<dyn PeerNetworking> {
    match strategy {
        CrossCloudNetworkingStrategy::None => Arc::new(NoNetworking),
        CrossCloudNetworkingStrategy::AzureFleet => Arc::new(FleetNetworking),
        CrossCloudNetworkingStrategy::Istio => Arc::new(IstioNetworking),
    }
}

/// Names to create and names to delete so `existing` converges on `desired`.
///
/// Names present on both sides are left untouched.
pub fn converge_names(desired: &[String], existing: &[String]) -> (Vec<String>, Vec<String>) {
    let desired_set: BTreeSet<&String> = desired.iter().collect();
    let existing_set: BTreeSet<&String> = existing.iter().collect();
    let create = desired_set
        .difference(&existing_set)
        .map(|s| s.to_string())
        .collect();
    let delete = existing_set
        .difference(&desired_set)
        .map(|s| s.to_string())
        .collect();
    (create, delete)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_converge_creates_missing_and_deletes_extra() {
        let (create, delete) = converge_names(&names(&["b", "c"]), &names(&["a", "b"]));
        assert_eq!(create, names(&["c"]));
        assert_eq!(delete, names(&["a"]));
    }

    #[test]
    fn test_converge_is_noop_when_equal() {
        let (create, delete) = converge_names(&names(&["a", "b"]), &names(&["b", "a"]));
        assert!(create.is_empty());
        assert!(delete.is_empty());
    }

    #[test]
    fn test_for_strategy_returns_matching_variant() {
        for strategy in [
            CrossCloudNetworkingStrategy::None,
            CrossCloudNetworkingStrategy::AzureFleet,
            CrossCloudNetworkingStrategy::Istio,
        ] {
            assert_eq!(for_strategy(strategy).strategy(), strategy);
        }
    }
}
