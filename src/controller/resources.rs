//! Shared helpers for objects created on behalf of a DocumentDB
//!
//! Labels, owner references and the create-if-absent primitive used by the
//! networking strategies and the token exchange.

use std::collections::BTreeMap;
use std::fmt::Debug;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, PostParams};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::crd::{Cluster, DocumentDB};
use crate::error::{Error, Result};

/// Field manager used for every write this operator makes
pub const FIELD_MANAGER: &str = "documentdb-operator";

/// Label tying an object to the DocumentDB that caused it to exist
pub const DOCUMENTDB_LABEL: &str = "documentdb.io/name";

/// Label recording the purpose of a cross-cluster object
pub const COMPONENT_LABEL: &str = "app.kubernetes.io/component";

/// PostgreSQL port exposed by every CNPG read-write service
pub const POSTGRES_PORT: i32 = 5432;

/// Get the standard labels for objects owned by a DocumentDB
pub fn standard_labels(doc: &DocumentDB) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(
        "app.kubernetes.io/name".to_string(),
        "documentdb".to_string(),
    );
    labels.insert("app.kubernetes.io/instance".to_string(), doc.name_any());
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        FIELD_MANAGER.to_string(),
    );
    labels.insert(DOCUMENTDB_LABEL.to_string(), doc.name_any());
    labels
}

/// Labels for a cross-cluster object of the given component
pub fn component_labels(doc: &DocumentDB, component: &str) -> BTreeMap<String, String> {
    let mut labels = standard_labels(doc);
    labels.insert(COMPONENT_LABEL.to_string(), component.to_string());
    labels
}

/// Label selector matching objects of `component` for this DocumentDB
pub fn component_selector(doc: &DocumentDB, component: &str) -> String {
    format!(
        "{}={},{}={}",
        DOCUMENTDB_LABEL,
        doc.name_any(),
        COMPONENT_LABEL,
        component
    )
}

/// Create an OwnerReference for garbage collection
pub fn owner_reference(doc: &DocumentDB) -> OwnerReference {
    OwnerReference {
        api_version: DocumentDB::api_version(&()).to_string(),
        kind: DocumentDB::kind(&()).to_string(),
        name: doc.name_any(),
        uid: doc.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Owner reference to a CNPG cluster, used for the transient token artifacts
pub fn cluster_owner_reference(cluster: &Cluster) -> OwnerReference {
    OwnerReference {
        api_version: Cluster::api_version(&()).to_string(),
        kind: Cluster::kind(&()).to_string(),
        name: cluster.name_any(),
        uid: cluster.metadata.uid.clone().unwrap_or_default(),
        controller: Some(false),
        block_owner_deletion: Some(false),
    }
}

/// In-cluster short DNS name of a CNPG cluster's read-write service
pub fn rw_service_host(engine_name: &str, namespace: &str) -> String {
    format!("{}-rw.{}.svc", engine_name, namespace)
}

/// Create `obj` unless an object with the same name already exists.
///
/// Returns true when the object was created. Existing objects are never
/// updated.
pub async fn create_if_absent<K>(api: &Api<K>, obj: &K) -> Result<bool>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    let name = obj.name_any();
    match api.create(&PostParams::default(), obj).await {
        Ok(_) => {
            info!("Created {}", name);
            Ok(true)
        }
        Err(kube::Error::Api(e)) if e.code == 409 => {
            debug!("{} already exists", name);
            Ok(false)
        }
        Err(e) => Err(Error::KubeError(e)),
    }
}

/// Delete an object, treating "not found" as success
pub async fn delete_if_present<K>(api: &Api<K>, name: &str) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => {
            info!("Deleted {}", name);
            Ok(())
        }
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(Error::KubeError(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    fn doc() -> DocumentDB {
        DocumentDB {
            metadata: ObjectMeta {
                name: Some("orders".to_string()),
                namespace: Some("prod".to_string()),
                uid: Some("uid-1".to_string()),
                ..Default::default()
            },
            spec: Default::default(),
            status: None,
        }
    }

    #[test]
    fn test_component_selector_matches_labels() {
        let labels = component_labels(&doc(), "service-export");
        let selector = component_selector(&doc(), "service-export");
        for clause in selector.split(',') {
            let (k, v) = clause.split_once('=').unwrap();
            assert_eq!(labels.get(k).map(String::as_str), Some(v));
        }
    }

    #[test]
    fn test_owner_reference_points_at_documentdb() {
        let owner = owner_reference(&doc());
        assert_eq!(owner.kind, "DocumentDB");
        assert_eq!(owner.api_version, "documentdb.io/preview");
        assert_eq!(owner.uid, "uid-1");
    }

    #[test]
    fn test_rw_service_host() {
        assert_eq!(rw_service_host("orders-abc", "prod"), "orders-abc-rw.prod.svc");
    }
}
