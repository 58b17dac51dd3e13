//! DocumentDB operator: cross-cluster replication for DocumentDB on CloudNativePG
//!
//! This crate resolves each member's role in a multi-cluster DocumentDB
//! topology, keeps the member's CloudNativePG `Cluster` in line with it, and
//! runs the token handshake that makes a primary switch safe.

pub mod controller;
pub mod crd;
pub mod error;

pub use crate::error::{Error, Result};
