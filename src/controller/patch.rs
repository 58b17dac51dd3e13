//! Incremental patching of an existing engine cluster
//!
//! [`diff`] compares the current and desired CNPG clusters and returns a
//! tagged list of field-level changes. [`apply`] turns that list into a single
//! JSON merge patch and drives the token handshake around role transitions.

use std::sync::Arc;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::{json, Map, Value};
use tracing::{info, instrument, warn};

use crate::crd::{
    Cluster, ExternalCluster, ManagedService, PluginConfiguration, PostgresConfiguration,
    ReplicaClusterConfiguration, ReplicationSlotsConfiguration, SynchronousReplicaConfiguration,
};
use crate::error::{Error, Result};

use super::naming::token_service_name;
use super::networking::PeerNetworking;
use super::token::{
    current_demotion_token, retract_token, run_publisher, verify_token, TokenPublisherRegistry,
};
use super::topology::Topology;

/// Role change implied by current and desired `replica` stanzas
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    None,
    /// Primary to replica
    Demotion,
    /// Replica to primary
    Promotion,
    /// Replica stays replica but its stanza changed
    ReplicaUpdate,
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transition::None => write!(f, "None"),
            Transition::Demotion => write!(f, "Demotion"),
            Transition::Promotion => write!(f, "Promotion"),
            Transition::ReplicaUpdate => write!(f, "ReplicaUpdate"),
        }
    }
}

/// One field-level change to the engine cluster spec
#[derive(Clone, Debug, PartialEq)]
pub enum SpecChange {
    ReplicaCluster(ReplicaClusterConfiguration),
    /// Drop the `replica` stanza when the member ends up alone
    RemoveReplicaCluster,
    Instances(i32),
    /// Drop `postgresql.synchronous`; only emitted when it is present
    RemoveSynchronous,
    Synchronous(SynchronousReplicaConfiguration),
    Postgresql(PostgresConfiguration),
    Plugins(Vec<PluginConfiguration>),
    ReplicationSlots(Option<ReplicationSlotsConfiguration>),
    ExternalClusters(Vec<ExternalCluster>),
    ManagedServices(Vec<ManagedService>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReplicationDiff {
    pub transition: Transition,
    pub peers_changed: bool,
    pub changes: Vec<SpecChange>,
}

impl ReplicationDiff {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Embed the demoted primary's token into the `replica` change
    pub fn set_promotion_token(&mut self, token: &str) {
        for change in &mut self.changes {
            if let SpecChange::ReplicaCluster(replica) = change {
                replica.promotion_token = Some(token.to_string());
            }
        }
    }
}

fn is_primary(replica: Option<&ReplicaClusterConfiguration>) -> bool {
    // no replica stanza means a standalone primary
    replica.map(|r| r.is_primary()).unwrap_or(true)
}

fn same_membership(
    current: Option<&ReplicaClusterConfiguration>,
    desired: Option<&ReplicaClusterConfiguration>,
) -> bool {
    match (current, desired) {
        (Some(c), Some(d)) => {
            c.self_name == d.self_name && c.primary == d.primary && c.source == d.source
        }
        (None, None) => true,
        _ => false,
    }
}

fn synchronous_of(cluster: &Cluster) -> Option<&SynchronousReplicaConfiguration> {
    cluster
        .spec
        .postgresql
        .as_ref()
        .and_then(|p| p.synchronous.as_ref())
}

fn managed_services_of(cluster: &Cluster) -> &[ManagedService] {
    cluster
        .spec
        .managed
        .as_ref()
        .and_then(|m| m.services.as_ref())
        .map(|s| s.additional.as_slice())
        .unwrap_or(&[])
}

/// Compute the changes needed to move `current` towards `desired`.
///
/// Returns an empty diff when neither the role nor the peer list changed.
/// Fails with [`Error::ImmutableField`] when the `replica.self` name differs.
pub fn diff(current: &Cluster, desired: &Cluster) -> Result<ReplicationDiff> {
    let cur_replica = current.spec.replica_cluster.as_ref();
    let des_replica = desired.spec.replica_cluster.as_ref();

    if let (Some(c), Some(d)) = (cur_replica, des_replica) {
        if c.self_name != d.self_name {
            return Err(Error::ImmutableField {
                field: "spec.replica.self".to_string(),
                current: c.self_name.clone(),
                desired: d.self_name.clone(),
            });
        }
    }

    let was_primary = is_primary(cur_replica);
    let will_be_primary = is_primary(des_replica);
    let transition = match (was_primary, will_be_primary) {
        (true, false) => Transition::Demotion,
        (false, true) => Transition::Promotion,
        (false, false) if !same_membership(cur_replica, des_replica) => Transition::ReplicaUpdate,
        _ => Transition::None,
    };
    let peers_changed = current.spec.external_clusters != desired.spec.external_clusters;

    let mut changes = Vec::new();
    let replica_change = || {
        des_replica
            .cloned()
            .map(SpecChange::ReplicaCluster)
            .unwrap_or(SpecChange::RemoveReplicaCluster)
    };

    match transition {
        Transition::Demotion => {
            changes.push(replica_change());
            if synchronous_of(current).is_some() {
                changes.push(SpecChange::RemoveSynchronous);
            }
            if current.spec.instances != desired.spec.instances {
                changes.push(SpecChange::Instances(desired.spec.instances));
            }
            if current.spec.plugins != desired.spec.plugins {
                changes.push(SpecChange::Plugins(desired.spec.plugins.clone()));
            }
        }
        Transition::Promotion => {
            changes.push(replica_change());
            let ha_postgresql = desired
                .spec
                .postgresql
                .as_ref()
                .filter(|p| p.synchronous.is_some());
            if let Some(postgresql) = ha_postgresql {
                changes.push(SpecChange::Postgresql(postgresql.clone()));
                changes.push(SpecChange::Instances(desired.spec.instances));
                changes.push(SpecChange::Plugins(desired.spec.plugins.clone()));
                changes.push(SpecChange::ReplicationSlots(
                    desired.spec.replication_slots.clone(),
                ));
            }
        }
        Transition::ReplicaUpdate => {
            changes.push(replica_change());
        }
        Transition::None => {}
    }

    if peers_changed {
        changes.push(SpecChange::ExternalClusters(
            desired.spec.external_clusters.clone(),
        ));
        let managed = managed_services_of(desired);
        if managed != managed_services_of(current) {
            changes.push(SpecChange::ManagedServices(managed.to_vec()));
        }
        let promotion_sets_sync = transition == Transition::Promotion
            && changes.iter().any(|c| matches!(c, SpecChange::Postgresql(_)));
        if will_be_primary && !promotion_sets_sync {
            if let Some(sync) = synchronous_of(desired) {
                if synchronous_of(current) != Some(sync) {
                    changes.push(SpecChange::Synchronous(sync.clone()));
                }
            }
        }
    }

    Ok(ReplicationDiff {
        transition,
        peers_changed,
        changes,
    })
}

/// Render the changes as one JSON merge patch
pub fn to_merge_patch(changes: &[SpecChange]) -> Result<Value> {
    let mut spec = Map::new();
    let mut postgresql = Map::new();

    for change in changes {
        match change {
            SpecChange::ReplicaCluster(replica) => {
                let mut value = serde_json::to_value(replica)?;
                if replica.promotion_token.is_none() {
                    // merge patches keep absent keys; clear a stale token explicitly
                    if let Value::Object(map) = &mut value {
                        map.insert("promotionToken".to_string(), Value::Null);
                    }
                }
                spec.insert("replica".to_string(), value);
            }
            SpecChange::RemoveReplicaCluster => {
                spec.insert("replica".to_string(), Value::Null);
            }
            SpecChange::Instances(n) => {
                spec.insert("instances".to_string(), json!(n));
            }
            SpecChange::RemoveSynchronous => {
                postgresql.insert("synchronous".to_string(), Value::Null);
            }
            SpecChange::Synchronous(sync) => {
                postgresql.insert("synchronous".to_string(), serde_json::to_value(sync)?);
            }
            SpecChange::Postgresql(config) => {
                if let Value::Object(fields) = serde_json::to_value(config)? {
                    postgresql.extend(fields);
                }
            }
            SpecChange::Plugins(plugins) => {
                spec.insert("plugins".to_string(), serde_json::to_value(plugins)?);
            }
            SpecChange::ReplicationSlots(slots) => {
                spec.insert("replicationSlots".to_string(), serde_json::to_value(slots)?);
            }
            SpecChange::ExternalClusters(clusters) => {
                spec.insert(
                    "externalClusters".to_string(),
                    serde_json::to_value(clusters)?,
                );
            }
            SpecChange::ManagedServices(services) => {
                spec.insert(
                    "managed".to_string(),
                    json!({ "services": { "additional": serde_json::to_value(services)? } }),
                );
            }
        }
    }

    if !postgresql.is_empty() {
        spec.insert("postgresql".to_string(), Value::Object(postgresql));
    }

    Ok(json!({ "spec": spec }))
}

/// What [`apply`] did to the engine cluster
#[derive(Clone, Debug, PartialEq)]
pub enum PatchOutcome {
    Unchanged,
    Applied(Transition),
    /// Dry run: the diff was computed and logged only
    Planned(ReplicationDiff),
}

/// Collaborators needed to apply a diff
pub struct PatchContext<'a> {
    pub client: &'a Client,
    pub http: &'a reqwest::Client,
    pub networking: Arc<dyn PeerNetworking>,
    pub publishers: &'a TokenPublisherRegistry,
    pub dry_run: bool,
}

/// Registry key of the publisher for an engine cluster
pub fn publisher_key(namespace: &str, engine_name: &str) -> String {
    format!("{}/{}", namespace, engine_name)
}

/// Diff `current` against `desired` and patch the engine cluster.
///
/// A promotion whose outgoing primary is still a peer blocks on reading that
/// primary's demotion token and fails with [`Error::TokenUnavailable`] until
/// it is published. A token cut on a timeline older than the local cluster's
/// is treated as not yet published. A demotion withdraws the member's previous
/// token, then starts the background token publisher.
#[instrument(skip(ctx, current, desired, topology), fields(cluster = %current.name_any()))]
pub async fn apply(
    ctx: &PatchContext<'_>,
    current: &Cluster,
    desired: &Cluster,
    topology: &Topology,
) -> Result<PatchOutcome> {
    let mut plan = diff(current, desired)?;
    if plan.is_empty() {
        return Ok(PatchOutcome::Unchanged);
    }

    let name = current.name_any();
    let namespace = current
        .namespace()
        .unwrap_or_else(|| topology.namespace.clone());

    if ctx.dry_run {
        info!(
            "Dry run: {} change(s) for {}/{} ({}): {:?}",
            plan.changes.len(),
            namespace,
            name,
            plan.transition,
            plan.changes
        );
        return Ok(PatchOutcome::Planned(plan));
    }

    if plan.transition == Transition::Promotion {
        let outgoing = current
            .spec
            .replica_cluster
            .as_ref()
            .map(|r| r.primary.clone())
            .unwrap_or_default();
        if topology.peer_engine_names().contains(&outgoing) {
            let token = ctx
                .networking
                .read_token(ctx.client, ctx.http, current, &outgoing)
                .await?;
            verify_token(&token, &outgoing, current)?;
            info!("Read promotion token published by {}", outgoing);
            plan.set_promotion_token(&token);
        } else {
            warn!(
                "Outgoing primary {} is no longer a peer; promoting {} without a token",
                outgoing, name
            );
        }
    }

    if plan.transition == Transition::Demotion {
        let token_name = token_service_name(&name, ctx.networking.reserved_prefix(&namespace));
        retract_token(ctx.client, &namespace, &token_name).await?;
    }

    let patch = to_merge_patch(&plan.changes)?;
    let api: Api<Cluster> = Api::namespaced(ctx.client.clone(), &namespace);
    api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    info!(
        "Patched engine cluster {}/{} ({}, {} change(s))",
        namespace,
        name,
        plan.transition,
        plan.changes.len()
    );

    if plan.transition == Transition::Demotion {
        start_publisher(ctx, &namespace, &name);
    }

    Ok(PatchOutcome::Applied(plan.transition))
}

fn start_publisher(ctx: &PatchContext<'_>, namespace: &str, name: &str) -> bool {
    let spawned = ctx.publishers.spawn_if_idle(
        &publisher_key(namespace, name),
        run_publisher(
            ctx.client.clone(),
            ctx.networking.clone(),
            namespace.to_string(),
            name.to_string(),
        ),
    );
    if spawned {
        info!("Started demotion token publisher for {}/{}", namespace, name);
    }
    spawned
}

/// Restart the token publisher for a demoted replica whose token was never
/// published, e.g. because the operator restarted mid-handshake.
///
/// Returns true when a publisher was started.
#[instrument(skip(ctx, current), fields(cluster = %current.name_any()))]
pub async fn resume_publisher(ctx: &PatchContext<'_>, current: &Cluster) -> Result<bool> {
    if ctx.dry_run {
        return Ok(false);
    }
    let is_replica = current
        .spec
        .replica_cluster
        .as_ref()
        .map(|r| !r.is_primary())
        .unwrap_or(false);
    if !is_replica || current_demotion_token(current).is_none() {
        return Ok(false);
    }

    let namespace = current.namespace().unwrap_or_else(|| "default".to_string());
    let name = current.name_any();
    if ctx.publishers.is_running(&publisher_key(&namespace, &name)) {
        return Ok(false);
    }

    let token_name = token_service_name(&name, ctx.networking.reserved_prefix(&namespace));
    let config_maps: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &namespace);
    if config_maps.get_opt(&token_name).await?.is_some() {
        return Ok(false);
    }

    Ok(start_publisher(ctx, &namespace, &name))
}
