//! Custom Resource Definitions for the DocumentDB operator
//!
//! `DocumentDB` is the user-facing resource. `Cluster` is the CloudNativePG
//! resource this operator synthesizes and patches for each member.

mod cnpg;
mod documentdb;
pub mod types;


pub use cnpg::*;
pub use documentdb::{DocumentDB, DocumentDBSpec, DocumentDBStatus, SpecValidationError};
pub use types::*;
