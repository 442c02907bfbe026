//! Kubemark Provider CRD Definitions
//!
//! Kubernetes Custom Resource Definitions owned by the kubemark provider,
//! plus the subset of Cluster API types the machine controller reads.

pub mod cluster_api;
pub mod kubemark_machine;

pub use cluster_api::*;
pub use kubemark_machine::*;
