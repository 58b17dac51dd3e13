//! Controller module for DocumentDB reconciliation
//!
//! Topology resolution, engine cluster synthesis, incremental patching and
//! the promotion token handshake, wired into a kube-rs controller.

pub mod cluster_spec;
#[cfg(test)]
mod cluster_spec_test;
pub mod conditions;
mod finalizers;
pub mod identity;
pub mod naming;
pub mod networking;
pub mod patch;
#[cfg(test)]
mod patch_test;
mod reconciler;
pub mod resources;
pub mod token;
pub mod topology;

pub use cluster_spec::{build_desired_cluster, synthesize};
pub use finalizers::DOCUMENTDB_FINALIZER;
pub use identity::resolve_local_identity;
pub use networking::{for_strategy, PeerNetworking};
pub use patch::{diff, to_merge_patch, PatchOutcome, ReplicationDiff, SpecChange, Transition};
pub use reconciler::{converged_status, run_controller, ControllerState};
pub use token::TokenPublisherRegistry;
pub use topology::{ReplicationRole, Topology};
