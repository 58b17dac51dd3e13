//! Finalizer handling for DocumentDB cleanup
//!
//! The finalizer keeps a DocumentDB around until the cross-cluster objects
//! created for it are removed. The engine cluster and the token artifacts go
//! away through owner references.

use crate::crd::DocumentDB;
use kube::ResourceExt;

/// Finalizer name used to protect DocumentDB resources
pub const DOCUMENTDB_FINALIZER: &str = "documentdb.io/finalizer";

/// Check if the resource has our finalizer
pub fn has_finalizer(doc: &DocumentDB) -> bool {
    doc.finalizers().iter().any(|f| f == DOCUMENTDB_FINALIZER)
}

/// A deletion timestamp means the user asked for deletion
pub fn is_being_deleted(doc: &DocumentDB) -> bool {
    doc.metadata.deletion_timestamp.is_some()
}
