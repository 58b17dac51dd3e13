//! Promotion/demotion token handshake
//!
//! When a primary is demoted, CNPG eventually records a demotion token in the
//! cluster status. A background publisher waits for that token and exposes it
//! through the networking strategy. The member being promoted reads it back
//! before it is allowed to flip its `replica.primary`.
//!
//! The publisher outlives the reconciliation that started it. It stops when
//! the token is published or after [`PUBLISH_TIMEOUT`].
//!
//! Token artifacts outlive a failover, so a reader only accepts a token taken
//! on the local cluster's current timeline or a later one. A member also
//! withdraws its own artifacts before it is demoted again.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, Pod, PodSpec, Service,
    ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::crd::Cluster;
use crate::error::{Error, Result};

use super::networking::PeerNetworking;
use super::resources::{cluster_owner_reference, create_if_absent, delete_if_present, FIELD_MANAGER};

/// How often the publisher re-reads the cluster status
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// The publisher gives up after this long without a demotion token
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(600);

/// Per-attempt timeout for reading a peer's token over HTTP
pub const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// ConfigMap key served as the static page
pub const TOKEN_FILE: &str = "index.html";

const TOKEN_SERVER_IMAGE: &str = "nginx:1.27-alpine";
pub const TOKEN_SERVER_LABEL: &str = "documentdb.io/token-server";
const TOKEN_PORT: i32 = 80;

fn token_labels(name: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(TOKEN_SERVER_LABEL.to_string(), name.to_string());
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        FIELD_MANAGER.to_string(),
    );
    labels
}

fn token_metadata(cluster: &Cluster, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: cluster.namespace(),
        labels: Some(token_labels(name)),
        owner_references: Some(vec![cluster_owner_reference(cluster)]),
        ..Default::default()
    }
}

/// ConfigMap carrying the raw token as `index.html`
pub fn build_token_config_map(cluster: &Cluster, name: &str, token: &str) -> ConfigMap {
    let mut data = BTreeMap::new();
    data.insert(TOKEN_FILE.to_string(), token.to_string());
    ConfigMap {
        metadata: token_metadata(cluster, name),
        data: Some(data),
        ..Default::default()
    }
}

/// Static file server exposing the token ConfigMap over HTTP
pub fn build_token_pod(cluster: &Cluster, name: &str) -> Pod {
    Pod {
        metadata: token_metadata(cluster, name),
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "token-server".to_string(),
                image: Some(TOKEN_SERVER_IMAGE.to_string()),
                ports: Some(vec![ContainerPort {
                    container_port: TOKEN_PORT,
                    name: Some("http".to_string()),
                    ..Default::default()
                }]),
                volume_mounts: Some(vec![VolumeMount {
                    name: "token".to_string(),
                    mount_path: "/usr/share/nginx/html".to_string(),
                    read_only: Some(true),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            volumes: Some(vec![Volume {
                name: "token".to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: Some(name.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

/// ClusterIP service in front of the token pod
pub fn build_token_service(cluster: &Cluster, name: &str) -> Service {
    Service {
        metadata: token_metadata(cluster, name),
        spec: Some(ServiceSpec {
            selector: Some(token_labels(name)),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: TOKEN_PORT,
                target_port: Some(IntOrString::Int(TOKEN_PORT)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        status: None,
    }
}

/// Write the token ConfigMap. The ConfigMap is applied so a later failover
/// overwrites a stale token.
#[instrument(skip(client, cluster, token), fields(cluster = %cluster.name_any()))]
pub async fn write_token_config_map(
    client: &Client,
    cluster: &Cluster,
    name: &str,
    token: &str,
) -> Result<()> {
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), &namespace);
    let mut config_map = build_token_config_map(cluster, name, token);
    config_map.metadata.managed_fields = None;
    api.patch(
        name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(&config_map),
    )
    .await?;
    info!("Token ConfigMap {}/{} written", namespace, name);
    Ok(())
}

/// Create the token pod and service when absent
#[instrument(skip(client, cluster), fields(cluster = %cluster.name_any()))]
pub async fn ensure_token_server(client: &Client, cluster: &Cluster, name: &str) -> Result<()> {
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);
    create_if_absent(&pods, &build_token_pod(cluster, name)).await?;
    let services: Api<Service> = Api::namespaced(client.clone(), &namespace);
    create_if_absent(&services, &build_token_service(cluster, name)).await?;
    Ok(())
}

/// Read the token from a local ConfigMap
pub async fn read_token_config_map(client: &Client, namespace: &str, name: &str) -> Result<String> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    let config_map = api.get_opt(name).await?.ok_or_else(|| Error::TokenUnavailable {
        source_name: name.to_string(),
        reason: "token ConfigMap not published yet".to_string(),
    })?;
    let token = config_map
        .data
        .and_then(|mut d| d.remove(TOKEN_FILE))
        .map(|t| t.trim().to_string())
        .unwrap_or_default();
    if token.is_empty() {
        return Err(Error::TokenUnavailable {
            source_name: name.to_string(),
            reason: "token ConfigMap is empty".to_string(),
        });
    }
    Ok(token)
}

/// Remove a previously published token so no reader can pick it up again.
///
/// The pod goes too: it keeps serving its mounted copy after the ConfigMap is
/// deleted. The service stays, the next publish reuses it.
#[instrument(skip(client))]
pub async fn retract_token(client: &Client, namespace: &str, name: &str) -> Result<()> {
    let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    delete_if_present(&config_maps, name).await?;
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    delete_if_present(&pods, name).await?;
    Ok(())
}

/// The parts of a CNPG demotion token this operator looks at
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct DemotionToken {
    #[serde(rename = "latestCheckpointTimelineID")]
    pub timeline: String,
    #[serde(rename = "latestCheckpointREDOLocation", default)]
    pub redo_location: String,
}

impl DemotionToken {
    /// Decode the base64 JSON token CNPG writes to `status.demotionToken`
    pub fn decode(raw: &str) -> Option<Self> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(raw.trim())
            .ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub fn timeline_id(&self) -> Option<i64> {
        self.timeline.trim().parse().ok()
    }
}

/// Accept `raw` for promoting `local` only if it was taken on `local`'s
/// current timeline or later.
///
/// A token from an older timeline was left over from an earlier failover.
pub fn verify_token(raw: &str, source_name: &str, local: &Cluster) -> Result<()> {
    let rejected = |reason: String| Error::TokenUnavailable {
        source_name: source_name.to_string(),
        reason,
    };

    let timeline = DemotionToken::decode(raw)
        .and_then(|t| t.timeline_id())
        .ok_or_else(|| rejected("published token is not a CNPG demotion token".to_string()))?;

    let local_timeline = local.status.as_ref().and_then(|s| s.timeline_id);
    match local_timeline {
        Some(current) if timeline < current => Err(rejected(format!(
            "published token is from timeline {}, local cluster is on timeline {}",
            timeline, current
        ))),
        Some(_) => Ok(()),
        None => {
            debug!(
                "{} reports no timeline; accepting token from timeline {}",
                local.name_any(),
                timeline
            );
            Ok(())
        }
    }
}

/// GET the token from a peer's token server
pub async fn fetch_token(http: &reqwest::Client, url: &str) -> Result<String> {
    let unavailable = |reason: String| Error::TokenUnavailable {
        source_name: url.to_string(),
        reason,
    };

    let response = http
        .get(url)
        .timeout(READ_TIMEOUT)
        .send()
        .await
        .map_err(|e| unavailable(e.to_string()))?;

    if !response.status().is_success() {
        return Err(unavailable(format!("HTTP {}", response.status())));
    }

    let body = response.text().await.map_err(|e| unavailable(e.to_string()))?;
    let token = body.trim();
    if token.is_empty() {
        return Err(unavailable("empty response body".to_string()));
    }
    Ok(token.to_string())
}

/// Poll `check` every `interval` until it yields a token or `deadline` passes.
///
/// Errors from `check` are logged and polling continues.
pub async fn wait_for_token<F, Fut>(interval: Duration, deadline: Duration, mut check: F) -> Option<String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<String>>>,
{
    let poll = async {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match check().await {
                Ok(Some(token)) if !token.is_empty() => return token,
                Ok(_) => debug!("Demotion token not set yet"),
                Err(e) => warn!("Failed to read demotion token: {:?}", e),
            }
        }
    };
    tokio::time::timeout(deadline, poll).await.ok()
}

/// The demotion token CNPG reports for `cluster`, unless it predates the
/// cluster's current timeline.
///
/// A demoted primary keeps its old `status.demotionToken` until CNPG records
/// the new one.
pub fn current_demotion_token(cluster: &Cluster) -> Option<String> {
    let token = cluster.status.as_ref()?.demotion_token.clone()?;
    match verify_token(&token, &cluster.name_any(), cluster) {
        Ok(()) => Some(token),
        Err(e) => {
            debug!("Ignoring demotion token on {}: {}", cluster.name_any(), e);
            None
        }
    }
}

async fn read_demotion_token(api: &Api<Cluster>, name: &str) -> Result<Option<String>> {
    let cluster = api.get(name).await?;
    Ok(current_demotion_token(&cluster))
}

/// Wait for CNPG to report a demotion token on `engine_name`, then publish it
pub async fn run_publisher(
    client: Client,
    networking: Arc<dyn PeerNetworking>,
    namespace: String,
    engine_name: String,
) {
    let api: Api<Cluster> = Api::namespaced(client.clone(), &namespace);
    let token = wait_for_token(POLL_INTERVAL, PUBLISH_TIMEOUT, || {
        read_demotion_token(&api, &engine_name)
    })
    .await;

    let Some(token) = token else {
        warn!(
            "No demotion token appeared on {}/{} within {:?}; giving up",
            namespace, engine_name, PUBLISH_TIMEOUT
        );
        return;
    };

    let cluster = match api.get(&engine_name).await {
        Ok(c) => c,
        Err(e) => {
            warn!("Cluster {}/{} vanished before publishing token: {:?}", namespace, engine_name, e);
            return;
        }
    };

    match networking.publish_token(&client, &cluster, &token).await {
        Ok(()) => info!("Published demotion token for {}/{}", namespace, engine_name),
        Err(e) => warn!(
            "Failed to publish demotion token for {}/{}: {:?}",
            namespace, engine_name, e
        ),
    }
}

/// Tracks running token publishers by engine cluster name
#[derive(Default)]
pub struct TokenPublisherRegistry {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TokenPublisherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `task` for `key` unless a publisher for `key` is still running.
    ///
    /// Returns true when a new task was spawned.
    pub fn spawn_if_idle<F>(&self, key: &str, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        tasks.retain(|_, handle| !handle.is_finished());
        if tasks.contains_key(key) {
            debug!("Token publisher for {} already running", key);
            return false;
        }
        tasks.insert(key.to_string(), tokio::spawn(task));
        true
    }

    pub fn is_running(&self, key: &str) -> bool {
        let tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        tasks.get(key).map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// Abort the publisher for `key`, if any
    pub fn cancel(&self, key: &str) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(handle) = tasks.remove(key) {
            handle.abort();
        }
    }
}
