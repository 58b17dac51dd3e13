//! Azure Fleet multi-cluster service strategy
//!
//! For every peer the local member exports one service (its own read-write
//! endpoint, exposed through a CNPG managed service) and imports one service
//! (the peer's export). Fleet materializes imports in `fleet-system` as
//! `<namespace>-<name>`, which is why names reserve room for that prefix.

use async_trait::async_trait;
use chrono::Utc;
use kube::api::{Api, DynamicObject, ListParams, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::{Client, ResourceExt};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{info, instrument, warn};

use crate::crd::{
    Cluster, CrossCloudNetworkingStrategy, DocumentDB, ManagedService, ServiceTemplate,
    ServiceTemplateMeta,
};
use crate::controller::naming::{cross_cluster_service_name, token_service_name};
use crate::controller::resources::{
    cluster_owner_reference, component_labels, component_selector, create_if_absent,
    delete_if_present, owner_reference, FIELD_MANAGER,
};
use crate::controller::token::{ensure_token_server, fetch_token, write_token_config_map, TOKEN_FILE};
use crate::controller::topology::Topology;
use crate::error::Result;

use super::{converge_names, PeerNetworking};

/// Namespace where Fleet creates the services derived from imports
pub const FLEET_SYSTEM_NAMESPACE: &str = "fleet-system";

const FLEET_GROUP: &str = "networking.fleet.azure.com";
const FLEET_VERSION: &str = "v1alpha1";

const EXPORT_COMPONENT: &str = "service-export";
const IMPORT_COMPONENT: &str = "multi-cluster-service";
const TOKEN_COMPONENT: &str = "promotion-token";

/// Annotation Fleet sets on a ServiceImport claimed by a member
const SERVICE_IN_USE_BY_ANNOTATION: &str = "networking.fleet.azure.com/service-in-use-by";

/// Annotation touched to force Fleet to re-reconcile an InternalServiceExport
const RECONCILE_ANNOTATION: &str = "documentdb.io/reconcile-at";

fn fleet_resource(kind: &str, plural: &str) -> ApiResource {
    ApiResource {
        group: FLEET_GROUP.to_string(),
        version: FLEET_VERSION.to_string(),
        api_version: format!("{}/{}", FLEET_GROUP, FLEET_VERSION),
        kind: kind.to_string(),
        plural: plural.to_string(),
    }
}

fn service_export_resource() -> ApiResource {
    fleet_resource("ServiceExport", "serviceexports")
}

fn multi_cluster_service_resource() -> ApiResource {
    fleet_resource("MultiClusterService", "multiclusterservices")
}

fn service_import_resource() -> ApiResource {
    fleet_resource("ServiceImport", "serviceimports")
}

fn internal_service_export_resource() -> ApiResource {
    fleet_resource("InternalServiceExport", "internalserviceexports")
}

fn reserved_for(namespace: &str) -> usize {
    namespace.len() + 1
}

/// Names of the services this member exports, one per peer
pub fn exported_service_names(topology: &Topology) -> Vec<String> {
    let reserved = reserved_for(&topology.namespace);
    topology
        .others
        .iter()
        .map(|peer| {
            cross_cluster_service_name(
                &topology.resource_name,
                &topology.self_member,
                peer,
                reserved,
            )
        })
        .collect()
}

/// Name under which `peer`'s export is imported locally
pub fn imported_service_name(topology: &Topology, peer: &str) -> String {
    cross_cluster_service_name(
        &topology.resource_name,
        peer,
        &topology.self_member,
        reserved_for(&topology.namespace),
    )
}

pub fn imported_service_names(topology: &Topology) -> Vec<String> {
    topology
        .others
        .iter()
        .map(|peer| imported_service_name(topology, peer))
        .collect()
}

fn build_export(name: &str, namespace: &str, labels: BTreeMap<String, String>) -> DynamicObject {
    let mut obj = DynamicObject::new(name, &service_export_resource()).within(namespace);
    obj.metadata.labels = Some(labels);
    obj
}

fn build_import(name: &str, namespace: &str, labels: BTreeMap<String, String>) -> DynamicObject {
    let mut obj = DynamicObject::new(name, &multi_cluster_service_resource())
        .within(namespace)
        .data(json!({
            "spec": {
                "serviceImport": { "name": name }
            }
        }));
    obj.metadata.labels = Some(labels);
    obj
}

/// ServiceExport advertising one of this member's managed services
pub fn build_service_export(doc: &DocumentDB, namespace: &str, name: &str) -> DynamicObject {
    let mut obj = build_export(name, namespace, component_labels(doc, EXPORT_COMPONENT));
    obj.metadata.owner_references = Some(vec![owner_reference(doc)]);
    obj
}

/// MultiClusterService importing a peer's export
pub fn build_multi_cluster_service(doc: &DocumentDB, namespace: &str, name: &str) -> DynamicObject {
    let mut obj = build_import(name, namespace, component_labels(doc, IMPORT_COMPONENT));
    obj.metadata.owner_references = Some(vec![owner_reference(doc)]);
    obj
}

/// Whether the `service-in-use-by` annotation names `member`.
///
/// The value is a JSON object keyed by member, either flat or nested under
/// `MemberClusters`, mapping to the member's hub namespace. Keys and values
/// are compared exactly; an unparsable value claims nothing.
fn claimed_by(annotation: &str, member: &str) -> bool {
    let Ok(Value::Object(root)) = serde_json::from_str::<Value>(annotation) else {
        return false;
    };
    let members = match root.get("MemberClusters") {
        Some(Value::Object(inner)) => inner,
        _ => &root,
    };
    let hub_namespace = format!("fleet-member-{}", member);
    members.iter().any(|(key, value)| {
        key == member
            || *key == hub_namespace
            || value.as_str() == Some(member)
            || value.as_str() == Some(hub_namespace.as_str())
    })
}

/// An unowned ServiceImport claimed by `member` was misattributed by Fleet
/// when the hub is also a member.
pub fn is_misattributed_import(obj: &DynamicObject, member: &str) -> bool {
    let unowned = obj
        .metadata
        .owner_references
        .as_ref()
        .map(|refs| refs.is_empty())
        .unwrap_or(true);
    let claimed = obj
        .annotations()
        .get(SERVICE_IN_USE_BY_ANNOTATION)
        .map(|v| claimed_by(v, member))
        .unwrap_or(false);
    unowned && claimed
}

async fn converge_objects<F>(
    api: &Api<DynamicObject>,
    selector: &str,
    desired: &[String],
    build: F,
) -> Result<()>
where
    F: Fn(&str) -> DynamicObject,
{
    let existing: Vec<String> = api
        .list(&ListParams::default().labels(selector))
        .await?
        .items
        .iter()
        .map(|o| o.name_any())
        .collect();

    let (create, delete) = converge_names(desired, &existing);
    for name in delete {
        delete_if_present(api, &name).await?;
    }
    for name in create {
        create_if_absent(api, &build(&name)).await?;
    }
    Ok(())
}

/// Delete misattributed ServiceImports and nudge their InternalServiceExports.
///
/// Failures are logged only.
#[instrument(skip(client))]
async fn remediate_service_imports(client: &Client, namespace: &str, member: &str) {
    let imports: Api<DynamicObject> =
        Api::namespaced_with(client.clone(), namespace, &service_import_resource());
    let list = match imports.list(&ListParams::default()).await {
        Ok(list) => list,
        Err(e) => {
            warn!("Could not list ServiceImports in {}: {:?}", namespace, e);
            return;
        }
    };

    let hub_namespace = format!("fleet-member-{}", member);
    let internal_exports: Api<DynamicObject> = Api::namespaced_with(
        client.clone(),
        &hub_namespace,
        &internal_service_export_resource(),
    );

    for import in list.items.iter().filter(|o| is_misattributed_import(o, member)) {
        let name = import.name_any();
        warn!("Removing misattributed ServiceImport {}/{}", namespace, name);
        if let Err(e) = delete_if_present(&imports, &name).await {
            warn!("Failed to delete ServiceImport {}/{}: {:?}", namespace, name, e);
            continue;
        }

        let export_name = format!("{}-{}", namespace, name);
        let patch = json!({
            "metadata": {
                "annotations": { RECONCILE_ANNOTATION: Utc::now().to_rfc3339() }
            }
        });
        if let Err(e) = internal_exports
            .patch(&export_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            warn!(
                "Failed to touch InternalServiceExport {}/{}: {:?}",
                hub_namespace, export_name, e
            );
        }
    }
}

pub struct FleetNetworking;

#[async_trait]
impl PeerNetworking for FleetNetworking {
    fn strategy(&self) -> CrossCloudNetworkingStrategy {
        CrossCloudNetworkingStrategy::AzureFleet
    }

    fn reserved_prefix(&self, namespace: &str) -> usize {
        reserved_for(namespace)
    }

    fn peer_host(&self, topology: &Topology, peer: &str) -> String {
        format!(
            "{}-{}.{}.svc",
            topology.namespace,
            imported_service_name(topology, peer),
            FLEET_SYSTEM_NAMESPACE
        )
    }

    fn managed_services(&self, topology: &Topology) -> Vec<ManagedService> {
        exported_service_names(topology)
            .into_iter()
            .map(|name| ManagedService {
                selector_type: "rw".to_string(),
                service_template: ServiceTemplate {
                    metadata: ServiceTemplateMeta {
                        name,
                        labels: BTreeMap::new(),
                    },
                },
            })
            .collect()
    }

    #[instrument(skip(self, client, doc, topology), fields(name = %doc.name_any()))]
    async fn ensure_peers_visible(
        &self,
        client: &Client,
        doc: &DocumentDB,
        topology: &Topology,
    ) -> Result<()> {
        let namespace = topology.namespace.as_str();

        let exports: Api<DynamicObject> =
            Api::namespaced_with(client.clone(), namespace, &service_export_resource());
        converge_objects(
            &exports,
            &component_selector(doc, EXPORT_COMPONENT),
            &exported_service_names(topology),
            |name| build_service_export(doc, namespace, name),
        )
        .await?;

        let imports: Api<DynamicObject> =
            Api::namespaced_with(client.clone(), namespace, &multi_cluster_service_resource());
        converge_objects(
            &imports,
            &component_selector(doc, IMPORT_COMPONENT),
            &imported_service_names(topology),
            |name| build_multi_cluster_service(doc, namespace, name),
        )
        .await?;

        remediate_service_imports(client, namespace, &topology.self_member).await;

        info!(
            "Fleet services converged for {}/{} ({} peers)",
            namespace,
            doc.name_any(),
            topology.others.len()
        );
        Ok(())
    }

    async fn remove_peer_objects(&self, client: &Client, doc: &DocumentDB) -> Result<()> {
        let namespace = doc.namespace().unwrap_or_else(|| "default".to_string());
        for (resource, component) in [
            (service_export_resource(), EXPORT_COMPONENT),
            (multi_cluster_service_resource(), IMPORT_COMPONENT),
        ] {
            let api: Api<DynamicObject> =
                Api::namespaced_with(client.clone(), &namespace, &resource);
            converge_objects(&api, &component_selector(doc, component), &[], |name| {
                build_export(name, &namespace, BTreeMap::new())
            })
            .await?;
        }
        Ok(())
    }

    async fn publish_token(&self, client: &Client, cluster: &Cluster, token: &str) -> Result<()> {
        let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
        let name = token_service_name(&cluster.name_any(), reserved_for(&namespace));

        write_token_config_map(client, cluster, &name, token).await?;
        ensure_token_server(client, cluster, &name).await?;

        let api: Api<DynamicObject> =
            Api::namespaced_with(client.clone(), &namespace, &service_export_resource());
        let mut labels = BTreeMap::new();
        labels.insert(
            "app.kubernetes.io/component".to_string(),
            TOKEN_COMPONENT.to_string(),
        );
        labels.insert(
            "app.kubernetes.io/managed-by".to_string(),
            FIELD_MANAGER.to_string(),
        );
        let mut export = build_export(&name, &namespace, labels);
        export.metadata.owner_references = Some(vec![cluster_owner_reference(cluster)]);
        create_if_absent(&api, &export).await?;
        Ok(())
    }

    async fn read_token(
        &self,
        client: &Client,
        http: &reqwest::Client,
        local: &Cluster,
        source_engine: &str,
    ) -> Result<String> {
        let namespace = local.namespace().unwrap_or_else(|| "default".to_string());
        let name = token_service_name(source_engine, reserved_for(&namespace));

        let api: Api<DynamicObject> =
            Api::namespaced_with(client.clone(), &namespace, &multi_cluster_service_resource());
        let mut labels = BTreeMap::new();
        labels.insert(
            "app.kubernetes.io/component".to_string(),
            TOKEN_COMPONENT.to_string(),
        );
        let mut import = build_import(&name, &namespace, labels);
        import.metadata.owner_references = Some(vec![cluster_owner_reference(local)]);
        create_if_absent(&api, &import).await?;

        let url = format!(
            "http://{}-{}.{}.svc/{}",
            namespace, name, FLEET_SYSTEM_NAMESPACE, TOKEN_FILE
        );
        fetch_token(http, &url).await
    }
}
