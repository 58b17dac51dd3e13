//! Single-network strategy: peers are reachable by their in-cluster DNS names

use async_trait::async_trait;
use kube::{Client, ResourceExt};

use crate::crd::{Cluster, CrossCloudNetworkingStrategy, DocumentDB};
use crate::controller::naming::token_service_name;
use crate::controller::resources::rw_service_host;
use crate::controller::token::{read_token_config_map, write_token_config_map};
use crate::controller::topology::Topology;
use crate::error::Result;

use super::PeerNetworking;

pub struct NoNetworking;

#[async_trait]
impl PeerNetworking for NoNetworking {
    fn strategy(&self) -> CrossCloudNetworkingStrategy {
        CrossCloudNetworkingStrategy::None
    }

    fn peer_host(&self, topology: &Topology, peer: &str) -> String {
        rw_service_host(&topology.engine_name_of(peer), &topology.namespace)
    }

    async fn ensure_peers_visible(
        &self,
        _client: &Client,
        _doc: &DocumentDB,
        _topology: &Topology,
    ) -> Result<()> {
        Ok(())
    }

    async fn remove_peer_objects(&self, _client: &Client, _doc: &DocumentDB) -> Result<()> {
        Ok(())
    }

    async fn publish_token(&self, client: &Client, cluster: &Cluster, token: &str) -> Result<()> {
        let name = token_service_name(&cluster.name_any(), 0);
        write_token_config_map(client, cluster, &name, token).await
    }

    async fn read_token(
        &self,
        client: &Client,
        _http: &reqwest::Client,
        local: &Cluster,
        source_engine: &str,
    ) -> Result<String> {
        let namespace = local.namespace().unwrap_or_else(|| "default".to_string());
        read_token_config_map(client, &namespace, &token_service_name(source_engine, 0)).await
    }
}
