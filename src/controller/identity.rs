//! Local member identity
//!
//! Fleet membership tooling writes this cluster's member name into a
//! well-known ConfigMap. It is read once at startup and handed to the
//! controller; reconciliations never look it up themselves.

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::Api;
use kube::Client;
use tracing::{info, instrument, warn};

use crate::error::Result;

pub const DEFAULT_IDENTITY_NAMESPACE: &str = "kube-system";
pub const DEFAULT_IDENTITY_CONFIG_MAP: &str = "cluster-name";

/// Key holding the member name
pub const IDENTITY_KEY: &str = "name";

/// Member name stored in an identity ConfigMap, if any
pub fn identity_from_config_map(config_map: &ConfigMap) -> Option<String> {
    config_map
        .data
        .as_ref()
        .and_then(|d| d.get(IDENTITY_KEY))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Resolve the local member identity.
///
/// An explicit override wins. Otherwise the identity ConfigMap is read; a
/// missing ConfigMap is not an error because single-cluster deployments do
/// not need one.
#[instrument(skip(client))]
pub async fn resolve_local_identity(
    client: &Client,
    explicit: Option<&str>,
    namespace: &str,
    config_map: &str,
) -> Result<Option<String>> {
    if let Some(name) = explicit.map(str::trim).filter(|n| !n.is_empty()) {
        info!("Using member identity {} from configuration", name);
        return Ok(Some(name.to_string()));
    }

    let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    match api.get_opt(config_map).await? {
        Some(cm) => {
            let identity = identity_from_config_map(&cm);
            match &identity {
                Some(name) => info!("Resolved member identity {} from {}/{}", name, namespace, config_map),
                None => warn!("{}/{} has no '{}' key", namespace, config_map, IDENTITY_KEY),
            }
            Ok(identity)
        }
        None => {
            info!(
                "No identity ConfigMap {}/{}; cross-cloud replication is unavailable",
                namespace, config_map
            );
            Ok(None)
        }
    }
}
