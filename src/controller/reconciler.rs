//! Main reconciler for DocumentDB resources
//!
//! Implements the controller pattern using kube-rs runtime.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Event, Service};
use kube::{
    api::{Api, Patch, PatchParams, PostParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        finalizer::{finalizer, Event as FinalizerEvent},
        watcher::Config,
    },
    Resource, ResourceExt,
};
use tracing::{debug, error, info, instrument, warn};

use crate::crd::{Cluster, DocumentDB, DocumentDBStatus};
use crate::error::{Error, Result};

use super::cluster_spec::{build_desired_cluster, synthesize};
use super::conditions::{
    mark_converging, mark_misconfigured, REASON_ENGINE_PENDING, REASON_ENGINE_READY,
    REASON_NOT_A_MEMBER, REASON_PROMOTION_PENDING,
};
use super::finalizers::{is_being_deleted, DOCUMENTDB_FINALIZER};
use super::networking::{for_strategy, PeerNetworking};
use super::patch::{
    apply, publisher_key, resume_publisher, PatchContext, PatchOutcome, Transition,
};
use super::resources::FIELD_MANAGER;
use super::token::TokenPublisherRegistry;
use super::topology::{ReplicationRole, Topology};

/// Periodic resync once the engine cluster has converged
const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Requeue while the engine cluster is still coming up
const CONVERGING_INTERVAL: Duration = Duration::from_secs(30);

pub const PHASE_READY: &str = "Ready";
pub const PHASE_CREATING: &str = "Creating";
pub const PHASE_PROMOTION_PENDING: &str = "PromotionPending";
pub const PHASE_NOT_PRESENT: &str = "NotPresent";
pub const PHASE_FAILED: &str = "Failed";

/// Shared state for the controller
pub struct ControllerState {
    pub client: Client,
    /// Used for reading promotion tokens from peers
    pub http: reqwest::Client,
    /// Watch only this namespace when set
    pub watch_namespace: Option<String>,
    /// Fleet member name of this cluster, resolved at startup
    pub local_identity: Option<String>,
    pub publishers: TokenPublisherRegistry,
    /// Compute and log changes without writing engine clusters
    pub dry_run: bool,
}

impl ControllerState {
    pub fn new(client: Client, local_identity: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(super::token::READ_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            http,
            watch_namespace: None,
            local_identity,
            publishers: TokenPublisherRegistry::new(),
            dry_run: false,
        })
    }
}

/// Main entry point to start the controller
pub async fn run_controller(state: Arc<ControllerState>) -> Result<()> {
    let client = state.client.clone();
    let (documents, clusters, services): (Api<DocumentDB>, Api<Cluster>, Api<Service>) =
        match &state.watch_namespace {
            Some(ns) => (
                Api::namespaced(client.clone(), ns),
                Api::namespaced(client.clone(), ns),
                Api::namespaced(client.clone(), ns),
            ),
            None => (
                Api::all(client.clone()),
                Api::all(client.clone()),
                Api::all(client.clone()),
            ),
        };

    info!(
        "Starting DocumentDB controller (member: {}, dry run: {})",
        state.local_identity.as_deref().unwrap_or("<unset>"),
        state.dry_run
    );

    // Verify CRDs exist
    if let Err(e) = documents.list(&Default::default()).await {
        error!("DocumentDB CRD not found. Please install the CRD first: {:?}", e);
        return Err(Error::ConfigError("DocumentDB CRD not installed".to_string()));
    }
    if let Err(e) = clusters.list(&Default::default()).await {
        error!("CloudNativePG Cluster CRD not found: {:?}", e);
        return Err(Error::ConfigError(
            "CloudNativePG is not installed".to_string(),
        ));
    }

    Controller::new(documents, Config::default())
        .owns::<Cluster>(clusters, Config::default())
        .owns::<Service>(services, Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled: {:?}", obj),
                Err(e) => error!("Reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

/// Emit a Kubernetes Event; failures are only logged
async fn emit_event(
    client: &Client,
    doc: &DocumentDB,
    event_type: &str,
    reason: &str,
    message: &str,
) {
    let namespace = doc.namespace().unwrap_or_else(|| "default".to_string());
    let events: Api<Event> = Api::namespaced(client.clone(), &namespace);

    let time = chrono::Utc::now();
    let event = Event {
        metadata: kube::api::ObjectMeta {
            generate_name: Some(format!("{}-", doc.name_any())),
            ..Default::default()
        },
        type_: Some(event_type.to_string()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        involved_object: doc.object_ref(&()),
        first_timestamp: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(time)),
        last_timestamp: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(time)),
        count: Some(1),
        reporting_component: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    };

    if let Err(e) = events.create(&PostParams::default(), &event).await {
        warn!("Failed to emit {} event for {}: {:?}", reason, doc.name_any(), e);
    }
}

/// The main reconciliation function
#[instrument(skip(ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<DocumentDB>, ctx: Arc<ControllerState>) -> Result<Action> {
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<DocumentDB> = Api::namespaced(ctx.client.clone(), &namespace);

    info!(
        "Reconciling DocumentDB {}/{}{}",
        namespace,
        obj.name_any(),
        if is_being_deleted(&obj) { " (deleting)" } else { "" }
    );

    finalizer(&api, DOCUMENTDB_FINALIZER, obj, |event| async {
        match event {
            FinalizerEvent::Apply(doc) => apply_documentdb(&ctx, &doc).await,
            FinalizerEvent::Cleanup(doc) => cleanup_documentdb(&ctx, &doc).await,
        }
    })
    .await
    .map_err(Error::from)
}

/// Record a configuration error on the resource, then hand it back
async fn fail_with_config_error(ctx: &ControllerState, doc: &DocumentDB, err: Error) -> Error {
    warn!("Configuration error for {}: {}", doc.name_any(), err);
    let message = err.to_string();
    emit_event(&ctx.client, doc, "Warning", "ReplicationMisconfigured", &message).await;

    let mut status = base_status(doc);
    status.phase = PHASE_FAILED.to_string();
    status.message = Some(message.clone());
    mark_misconfigured(&mut status.conditions, &message, doc.metadata.generation);
    if let Err(e) = patch_status(&ctx.client, doc, &status).await {
        warn!("Failed to record configuration error status: {:?}", e);
    }
    err
}

/// Apply path: resolve the topology and converge the local engine cluster
#[instrument(skip(ctx, doc), fields(name = %doc.name_any(), namespace = doc.namespace()))]
async fn apply_documentdb(ctx: &ControllerState, doc: &DocumentDB) -> Result<Action> {
    let namespace = doc.namespace().unwrap_or_else(|| "default".to_string());
    let name = doc.name_any();

    if let Err(errors) = doc.spec.validate() {
        let message = errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        return Err(fail_with_config_error(ctx, doc, Error::ValidationError(message)).await);
    }

    let topology = match Topology::resolve(doc, ctx.local_identity.as_deref()) {
        Ok(t) => t,
        Err(e) => return Err(fail_with_config_error(ctx, doc, e).await),
    };
    let networking = for_strategy(topology.strategy);

    info!(
        "DocumentDB {}/{}: member {} is {} (primary {}, {} peers)",
        namespace,
        name,
        topology.self_member,
        topology.role,
        topology.primary,
        topology.others.len()
    );

    if topology.role == ReplicationRole::NotPresent {
        return retire_member(ctx, doc, &topology, networking.as_ref()).await;
    }

    let clusters: Api<Cluster> = Api::namespaced(ctx.client.clone(), &namespace);
    let engine_name = topology.engine_cluster_name();
    let existing = clusters.get_opt(&engine_name).await?;

    let desired = if ctx.dry_run {
        build_desired_cluster(doc, &topology, networking.as_ref(), existing.as_ref())
    } else {
        synthesize(
            &ctx.client,
            doc,
            &topology,
            networking.as_ref(),
            existing.as_ref(),
        )
        .await?
    };

    let Some(current) = existing else {
        if ctx.dry_run {
            info!("Dry run: would create engine cluster {}/{}", namespace, engine_name);
        } else {
            clusters.create(&PostParams::default(), &desired).await?;
            info!("Created engine cluster {}/{}", namespace, engine_name);
        }
        report_status(ctx, doc, &topology, None).await?;
        return Ok(Action::requeue(CONVERGING_INTERVAL));
    };

    let patch_ctx = PatchContext {
        client: &ctx.client,
        http: &ctx.http,
        networking: networking.clone(),
        publishers: &ctx.publishers,
        dry_run: ctx.dry_run,
    };

    match apply(&patch_ctx, &current, &desired, &topology).await {
        Ok(PatchOutcome::Applied(Transition::Demotion)) => {
            emit_event(
                &ctx.client,
                doc,
                "Normal",
                "Demoting",
                &format!(
                    "Engine cluster {} is now a replica of {}",
                    engine_name,
                    topology.primary_engine_name()
                ),
            )
            .await;
        }
        Ok(PatchOutcome::Applied(Transition::Promotion)) => {
            emit_event(
                &ctx.client,
                doc,
                "Normal",
                "Promoting",
                &format!("Engine cluster {} is being promoted to primary", engine_name),
            )
            .await;
        }
        Ok(outcome) => {
            debug!("Patch outcome for {}: {:?}", engine_name, outcome);
            if resume_publisher(&patch_ctx, &current).await? {
                warn!("Resumed unpublished demotion token for {}", engine_name);
            }
        }
        Err(e @ Error::TokenUnavailable { .. }) => {
            warn!("Deferring promotion of {}: {}", engine_name, e);
            emit_event(&ctx.client, doc, "Warning", "PromotionDeferred", &e.to_string()).await;
            let mut status = topology_status(doc, &topology, &current);
            status.phase = PHASE_PROMOTION_PENDING.to_string();
            status.message = Some(e.to_string());
            mark_converging(
                &mut status.conditions,
                false,
                REASON_PROMOTION_PENDING,
                &e.to_string(),
                doc.metadata.generation,
            );
            patch_status(&ctx.client, doc, &status).await?;
            return Err(e);
        }
        Err(e) if e.is_config_error() => return Err(fail_with_config_error(ctx, doc, e).await),
        Err(e) => return Err(e),
    }

    let ready = report_status(ctx, doc, &topology, Some(&current)).await?;
    Ok(Action::requeue(if ready {
        RESYNC_INTERVAL
    } else {
        CONVERGING_INTERVAL
    }))
}

/// The local cluster left the member list: drop what it owned for `doc`
async fn retire_member(
    ctx: &ControllerState,
    doc: &DocumentDB,
    topology: &Topology,
    networking: &dyn PeerNetworking,
) -> Result<Action> {
    let namespace = topology.namespace.as_str();
    let clusters: Api<Cluster> = Api::namespaced(ctx.client.clone(), namespace);
    let engine_name = topology.engine_cluster_name();

    if let Some(cluster) = clusters.get_opt(&engine_name).await? {
        let owned = cluster
            .owner_references()
            .iter()
            .any(|o| Some(&o.uid) == doc.metadata.uid.as_ref());
        if owned && !ctx.dry_run {
            info!("Member {} left {}; deleting {}", topology.self_member, doc.name_any(), engine_name);
            super::resources::delete_if_present(&clusters, &engine_name).await?;
        }
    }
    if !ctx.dry_run {
        networking.remove_peer_objects(&ctx.client, doc).await?;
    }

    let mut status = base_status(doc);
    status.phase = PHASE_NOT_PRESENT.to_string();
    status.role = Some(topology.role.to_string());
    status.local_member = Some(topology.self_member.clone());
    status.primary_member = Some(topology.primary.clone());
    status.message = Some(format!(
        "Member {} is not listed in clusterList",
        topology.self_member
    ));
    mark_converging(
        &mut status.conditions,
        true,
        REASON_NOT_A_MEMBER,
        "This cluster hosts no instances of this DocumentDB",
        doc.metadata.generation,
    );
    patch_status(&ctx.client, doc, &status).await?;
    Ok(Action::await_change())
}

/// Cleanup path: remove the cross-cluster objects the owner references miss
#[instrument(skip(ctx, doc), fields(name = %doc.name_any(), namespace = doc.namespace()))]
async fn cleanup_documentdb(ctx: &ControllerState, doc: &DocumentDB) -> Result<Action> {
    let namespace = doc.namespace().unwrap_or_else(|| "default".to_string());
    info!("Cleaning up DocumentDB {}/{}", namespace, doc.name_any());

    let strategy = doc
        .spec
        .cluster_replication
        .as_ref()
        .map(|r| r.cross_cloud_networking_strategy)
        .unwrap_or_default();
    if let Err(e) = for_strategy(strategy).remove_peer_objects(&ctx.client, doc).await {
        warn!("Failed to remove cross-cluster objects: {:?}", e);
    }

    if let Ok(topology) = Topology::resolve(doc, ctx.local_identity.as_deref()) {
        ctx.publishers
            .cancel(&publisher_key(&namespace, &topology.engine_cluster_name()));
    }

    Ok(Action::await_change())
}

fn base_status(doc: &DocumentDB) -> DocumentDBStatus {
    DocumentDBStatus {
        observed_generation: doc.metadata.generation,
        conditions: doc
            .status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default(),
        ..Default::default()
    }
}

fn topology_status(doc: &DocumentDB, topology: &Topology, engine: &Cluster) -> DocumentDBStatus {
    let mut status = base_status(doc);
    status.role = Some(topology.role.to_string());
    status.local_member = Some(topology.self_member.clone());
    status.primary_member = Some(topology.primary.clone());
    status.engine_cluster_name = Some(engine.name_any());
    status.ready_instances = engine
        .status
        .as_ref()
        .map(|s| s.healthy_instances())
        .unwrap_or(0);
    status
}

/// Build the status for a pass that got past configuration checks
pub fn converged_status(
    doc: &DocumentDB,
    topology: &Topology,
    engine: Option<&Cluster>,
    expected_instances: i32,
) -> DocumentDBStatus {
    let mut status = match engine {
        Some(engine) => topology_status(doc, topology, engine),
        None => {
            let mut s = base_status(doc);
            s.role = Some(topology.role.to_string());
            s.local_member = Some(topology.self_member.clone());
            s.primary_member = Some(topology.primary.clone());
            s.engine_cluster_name = Some(topology.engine_cluster_name());
            s
        }
    };

    let ready = engine.is_some() && status.ready_instances >= expected_instances;
    let (reason, message) = if ready {
        (
            REASON_ENGINE_READY,
            format!("{} instance(s) healthy", status.ready_instances),
        )
    } else {
        (
            REASON_ENGINE_PENDING,
            format!(
                "{}/{} instance(s) healthy",
                status.ready_instances, expected_instances
            ),
        )
    };
    status.phase = if ready { PHASE_READY } else { PHASE_CREATING }.to_string();
    status.message = Some(message.clone());
    mark_converging(
        &mut status.conditions,
        ready,
        reason,
        &message,
        doc.metadata.generation,
    );
    status
}

async fn report_status(
    ctx: &ControllerState,
    doc: &DocumentDB,
    topology: &Topology,
    engine: Option<&Cluster>,
) -> Result<bool> {
    let expected = super::cluster_spec::desired_instances(doc, topology);
    let status = converged_status(doc, topology, engine, expected);
    let ready = status.phase == PHASE_READY;
    patch_status(&ctx.client, doc, &status).await?;
    Ok(ready)
}

async fn patch_status(client: &Client, doc: &DocumentDB, status: &DocumentDBStatus) -> Result<()> {
    let namespace = doc.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<DocumentDB> = Api::namespaced(client.clone(), &namespace);
    let patch = serde_json::json!({ "status": status });
    api.patch_status(
        &doc.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await
    .map_err(Error::KubeError)?;
    Ok(())
}

/// Error policy determines how to handle reconciliation errors
fn error_policy(doc: Arc<DocumentDB>, error: &Error, _ctx: Arc<ControllerState>) -> Action {
    if error.is_config_error() {
        warn!("Reconciliation of {} blocked on configuration: {}", doc.name_any(), error);
    } else {
        error!("Reconciliation error for {}: {:?}", doc.name_any(), error);
    }
    Action::requeue(error.requeue_after())
}
