//! Desired CNPG `Cluster` for the local member
//!
//! [`build_desired_cluster`] is pure; [`synthesize`] first makes the peers
//! reachable through the networking strategy and only then builds the spec.

use std::collections::BTreeMap;

use kube::api::ObjectMeta;
use kube::{Client, ResourceExt};
use tracing::{debug, instrument};

use crate::crd::{
    BootstrapConfiguration, BackupReference, Cluster, ClusterSpec, DocumentDB, ExternalCluster,
    InitDbConfiguration, ManagedConfiguration, ManagedServices, PgBaseBackupConfiguration,
    PluginConfiguration, PostgresConfiguration, RecoveryConfiguration,
    ReplicaClusterConfiguration, ReplicationSlotsConfiguration, ReplicationSlotsHAConfiguration,
    StorageConfiguration, SynchronousReplicaConfiguration,
};
use crate::error::Result;

use super::networking::PeerNetworking;
use super::resources::{owner_reference, rw_service_host, standard_labels, POSTGRES_PORT};
use super::topology::{ReplicationRole, Topology};

/// Label carrying the replication role of an engine cluster
pub const ROLE_LABEL: &str = "documentdb.io/replication-role";

/// CNPG-I plugin injecting the DocumentDB gateway sidecar
pub const SIDECAR_PLUGIN: &str = "cnpg-i-sidecar-injector.documentdb.io";

/// CNPG-I plugin running the WAL-only replica on HA primaries
pub const WAL_REPLICA_PLUGIN: &str = "cnpg-i-wal-replica.documentdb.io";

/// Primary, local standby and a slot for the WAL replica
pub const HA_INSTANCES: i32 = 3;

pub const WAL_REPLICA_SLOT: &str = "wal_replica";

const DEFAULT_DATABASE: &str = "postgres";
const REPLICATION_USER: &str = "streaming_replica";
const SLOT_UPDATE_INTERVAL: i32 = 30;
const EXTENSION_SQL: &str = "CREATE EXTENSION IF NOT EXISTS documentdb CASCADE";

fn wal_replica_slot_sql() -> String {
    format!(
        "SELECT pg_create_physical_replication_slot('{}', true)",
        WAL_REPLICA_SLOT
    )
}

/// Connection entry for an engine cluster reachable at `host`
pub fn external_cluster(engine_name: &str, host: &str) -> ExternalCluster {
    let mut params = BTreeMap::new();
    params.insert("host".to_string(), host.to_string());
    params.insert("port".to_string(), POSTGRES_PORT.to_string());
    params.insert("user".to_string(), REPLICATION_USER.to_string());
    params.insert("dbname".to_string(), DEFAULT_DATABASE.to_string());
    ExternalCluster {
        name: engine_name.to_string(),
        connection_parameters: params,
    }
}

/// Self entry first, then one entry per peer in declaration order
pub fn desired_external_clusters(
    topology: &Topology,
    networking: &dyn PeerNetworking,
) -> Vec<ExternalCluster> {
    if !topology.is_replicating() {
        return Vec::new();
    }
    let self_engine = topology.engine_cluster_name();
    let mut clusters = vec![external_cluster(
        &self_engine,
        &rw_service_host(&self_engine, &topology.namespace),
    )];
    for peer in &topology.others {
        clusters.push(external_cluster(
            &topology.engine_name_of(peer),
            &networking.peer_host(topology, peer),
        ));
    }
    clusters
}

/// `replica` stanza; absent when the member is not replicating
pub fn desired_replica_cluster(topology: &Topology) -> Option<ReplicaClusterConfiguration> {
    if !topology.is_replicating() {
        return None;
    }
    let primary = topology.primary_engine_name();
    Some(ReplicaClusterConfiguration {
        self_name: topology.engine_cluster_name(),
        primary: primary.clone(),
        source: primary,
        promotion_token: None,
    })
}

/// Quorum commit on any one standby, local or remote
pub fn desired_synchronous(topology: &Topology) -> Option<SynchronousReplicaConfiguration> {
    if !topology.ha_primary() {
        return None;
    }
    Some(SynchronousReplicaConfiguration {
        method: "any".to_string(),
        number: 1,
        standby_names_post: topology.peer_engine_names(),
    })
}

pub fn desired_instances(doc: &DocumentDB, topology: &Topology) -> i32 {
    if topology.ha_primary() {
        HA_INSTANCES
    } else {
        doc.spec.instances_per_node
    }
}

pub fn desired_plugins(doc: &DocumentDB, topology: &Topology) -> Vec<PluginConfiguration> {
    let mut parameters = BTreeMap::new();
    if !doc.spec.gateway_image.is_empty() {
        parameters.insert("gatewayImage".to_string(), doc.spec.gateway_image.clone());
    }
    let mut plugins = vec![PluginConfiguration {
        name: SIDECAR_PLUGIN.to_string(),
        enabled: true,
        parameters,
    }];
    if topology.ha_primary() {
        plugins.push(PluginConfiguration {
            name: WAL_REPLICA_PLUGIN.to_string(),
            enabled: true,
            parameters: BTreeMap::new(),
        });
    }
    plugins
}

pub fn desired_replication_slots(topology: &Topology) -> Option<ReplicationSlotsConfiguration> {
    topology.ha_primary().then(|| ReplicationSlotsConfiguration {
        high_availability: Some(ReplicationSlotsHAConfiguration { enabled: true }),
        update_interval: Some(SLOT_UPDATE_INTERVAL),
    })
}

fn desired_bootstrap(
    doc: &DocumentDB,
    topology: &Topology,
    existing: Option<&Cluster>,
) -> Option<BootstrapConfiguration> {
    // bootstrap only matters at creation time
    if let Some(existing) = existing {
        return existing.spec.bootstrap.clone();
    }

    if topology.role == ReplicationRole::Replica {
        return Some(BootstrapConfiguration {
            pg_basebackup: Some(PgBaseBackupConfiguration {
                source: topology.primary_engine_name(),
            }),
            ..Default::default()
        });
    }

    if let Some(recovery) = doc.spec.bootstrap.as_ref().and_then(|b| b.recovery.as_ref()) {
        return Some(BootstrapConfiguration {
            recovery: Some(RecoveryConfiguration {
                backup: BackupReference {
                    name: recovery.backup_name.clone(),
                },
            }),
            ..Default::default()
        });
    }

    let mut post_init_sql = vec![EXTENSION_SQL.to_string()];
    if topology.ha_primary() {
        post_init_sql.push(wal_replica_slot_sql());
    }
    Some(BootstrapConfiguration {
        initdb: Some(InitDbConfiguration {
            database: DEFAULT_DATABASE.to_string(),
            owner: DEFAULT_DATABASE.to_string(),
            post_init_sql,
        }),
        ..Default::default()
    })
}

fn role_labels(doc: &DocumentDB, topology: &Topology) -> BTreeMap<String, String> {
    let mut labels = standard_labels(doc);
    match topology.role {
        ReplicationRole::Primary => {
            labels.insert(ROLE_LABEL.to_string(), "primary".to_string());
        }
        ReplicationRole::Replica => {
            labels.insert(ROLE_LABEL.to_string(), "replica".to_string());
        }
        ReplicationRole::NoReplication | ReplicationRole::NotPresent => {}
    }
    labels
}

/// Build the complete engine cluster for the local member.
///
/// `existing` is the current engine cluster, if any; its bootstrap section is
/// carried over untouched.
pub fn build_desired_cluster(
    doc: &DocumentDB,
    topology: &Topology,
    networking: &dyn PeerNetworking,
    existing: Option<&Cluster>,
) -> Cluster {
    let storage_class = Some(topology.storage_class.clone()).filter(|s| !s.is_empty());
    let image_name = Some(doc.spec.postgres_image.clone()).filter(|s| !s.is_empty());

    let managed_services = networking.managed_services(topology);
    let managed = (!managed_services.is_empty()).then(|| ManagedConfiguration {
        services: Some(ManagedServices {
            additional: managed_services,
        }),
    });

    let postgresql = desired_synchronous(topology).map(|synchronous| PostgresConfiguration {
        parameters: BTreeMap::new(),
        synchronous: Some(synchronous),
    });

    let spec = ClusterSpec {
        instances: desired_instances(doc, topology),
        image_name,
        storage: StorageConfiguration {
            size: doc.spec.resource.storage.pvc_size.clone(),
            storage_class,
        },
        postgresql,
        replication_slots: desired_replication_slots(topology),
        replica_cluster: desired_replica_cluster(topology),
        external_clusters: desired_external_clusters(topology, networking),
        managed,
        bootstrap: desired_bootstrap(doc, topology, existing),
        plugins: desired_plugins(doc, topology),
    };

    Cluster {
        metadata: ObjectMeta {
            name: Some(topology.engine_cluster_name()),
            namespace: Some(topology.namespace.clone()),
            labels: Some(role_labels(doc, topology)),
            owner_references: Some(vec![owner_reference(doc)]),
            ..Default::default()
        },
        spec,
        status: None,
    }
}

/// Make peers reachable, then build the desired engine cluster.
///
/// Fails without producing a spec when the cross-cluster objects cannot be
/// converged.
#[instrument(skip(client, doc, topology, networking, existing), fields(name = %doc.name_any(), role = %topology.role))]
pub async fn synthesize(
    client: &Client,
    doc: &DocumentDB,
    topology: &Topology,
    networking: &dyn PeerNetworking,
    existing: Option<&Cluster>,
) -> Result<Cluster> {
    if topology.replication_configured {
        networking.ensure_peers_visible(client, doc, topology).await?;
    }
    let desired = build_desired_cluster(doc, topology, networking, existing);
    debug!(
        "Desired engine cluster {} with {} instances and {} external clusters",
        desired.name_any(),
        desired.spec.instances,
        desired.spec.external_clusters.len()
    );
    Ok(desired)
}
