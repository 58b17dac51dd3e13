//! Istio multi-cluster mesh strategy
//!
//! Istio only routes to a remote service when a service with the same name
//! exists locally. For every peer we create a selector-only placeholder named
//! like the peer's CNPG read-write service; the east-west gateway forwards
//! connections to the member that actually runs those pods.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use tracing::{info, instrument};

use crate::crd::{Cluster, CrossCloudNetworkingStrategy, DocumentDB};
use crate::controller::naming::token_service_name;
use crate::controller::resources::{
    cluster_owner_reference, component_labels, component_selector, create_if_absent,
    delete_if_present, owner_reference, rw_service_host, POSTGRES_PORT,
};
use crate::controller::token::{
    ensure_token_server, fetch_token, write_token_config_map, TOKEN_FILE, TOKEN_SERVER_LABEL,
};
use crate::controller::topology::Topology;
use crate::error::Result;

use super::{converge_names, PeerNetworking};

const PEER_COMPONENT: &str = "peer-service";
const TOKEN_PEER_COMPONENT: &str = "promotion-token-peer";
const CNPG_CLUSTER_LABEL: &str = "cnpg.io/cluster";
const CNPG_ROLE_LABEL: &str = "role";

fn placeholder_service(
    name: &str,
    namespace: &str,
    labels: BTreeMap<String, String>,
    selector: BTreeMap<String, String>,
    port_name: &str,
    port: i32,
) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                name: Some(port_name.to_string()),
                port,
                target_port: Some(IntOrString::Int(port)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        status: None,
    }
}

/// Local stand-in for the read-write service of `peer_engine`.
///
/// The selector targets the peer's pods, which never run in this cluster.
pub fn build_peer_service(doc: &DocumentDB, namespace: &str, peer_engine: &str) -> Service {
    let mut labels = component_labels(doc, PEER_COMPONENT);
    labels.insert(CNPG_CLUSTER_LABEL.to_string(), peer_engine.to_string());

    let mut selector = BTreeMap::new();
    selector.insert(CNPG_CLUSTER_LABEL.to_string(), peer_engine.to_string());
    selector.insert(CNPG_ROLE_LABEL.to_string(), "primary".to_string());

    let mut service = placeholder_service(
        &format!("{}-rw", peer_engine),
        namespace,
        labels,
        selector,
        "postgres",
        POSTGRES_PORT,
    );
    service.metadata.owner_references = Some(vec![owner_reference(doc)]);
    service
}

pub struct IstioNetworking;

#[async_trait]
impl PeerNetworking for IstioNetworking {
    fn strategy(&self) -> CrossCloudNetworkingStrategy {
        CrossCloudNetworkingStrategy::Istio
    }

    fn peer_host(&self, topology: &Topology, peer: &str) -> String {
        rw_service_host(&topology.engine_name_of(peer), &topology.namespace)
    }

    #[instrument(skip(self, client, doc, topology), fields(name = %doc.name_any()))]
    async fn ensure_peers_visible(
        &self,
        client: &Client,
        doc: &DocumentDB,
        topology: &Topology,
    ) -> Result<()> {
        let namespace = topology.namespace.as_str();
        let api: Api<Service> = Api::namespaced(client.clone(), namespace);

        let existing: Vec<String> = api
            .list(&ListParams::default().labels(&component_selector(doc, PEER_COMPONENT)))
            .await?
            .items
            .iter()
            .map(|s| s.name_any())
            .collect();

        let peers = topology.peer_engine_names();
        let desired: Vec<String> = peers.iter().map(|e| format!("{}-rw", e)).collect();
        let (create, delete) = converge_names(&desired, &existing);

        for name in delete {
            delete_if_present(&api, &name).await?;
        }
        for engine in peers {
            if create.contains(&format!("{}-rw", engine)) {
                create_if_absent(&api, &build_peer_service(doc, namespace, &engine)).await?;
            }
        }

        info!(
            "Istio placeholder services converged for {}/{} ({} peers)",
            namespace,
            doc.name_any(),
            topology.others.len()
        );
        Ok(())
    }

    async fn remove_peer_objects(&self, client: &Client, doc: &DocumentDB) -> Result<()> {
        let namespace = doc.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<Service> = Api::namespaced(client.clone(), &namespace);
        let services = api
            .list(&ListParams::default().labels(&component_selector(doc, PEER_COMPONENT)))
            .await?;
        for service in services.items {
            delete_if_present(&api, &service.name_any()).await?;
        }
        Ok(())
    }

    async fn publish_token(&self, client: &Client, cluster: &Cluster, token: &str) -> Result<()> {
        let name = token_service_name(&cluster.name_any(), 0);
        write_token_config_map(client, cluster, &name, token).await?;
        ensure_token_server(client, cluster, &name).await
    }

    async fn read_token(
        &self,
        client: &Client,
        http: &reqwest::Client,
        local: &Cluster,
        source_engine: &str,
    ) -> Result<String> {
        let namespace = local.namespace().unwrap_or_else(|| "default".to_string());
        let name = token_service_name(source_engine, 0);

        let mut labels = BTreeMap::new();
        labels.insert(
            crate::controller::resources::COMPONENT_LABEL.to_string(),
            TOKEN_PEER_COMPONENT.to_string(),
        );
        let mut selector = BTreeMap::new();
        selector.insert(TOKEN_SERVER_LABEL.to_string(), name.clone());

        let mut service = placeholder_service(&name, &namespace, labels, selector, "http", 80);
        service.metadata.owner_references = Some(vec![cluster_owner_reference(local)]);

        let api: Api<Service> = Api::namespaced(client.clone(), &namespace);
        create_if_absent(&api, &service).await?;

        let url = format!("http://{}.{}.svc/{}", name, namespace, TOKEN_FILE);
        fetch_token(http, &url).await
    }
}
