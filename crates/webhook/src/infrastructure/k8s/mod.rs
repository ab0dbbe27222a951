//! Kubernetes integration module.
//!
//! The cluster is only touched through two narrow seams:
//! - [`CredentialProvisioner`](crate::infrastructure::credentials::CredentialProvisioner):
//!   copies the runtime credential into a workload namespace
//! - [`CapacitySource`](crate::infrastructure::capacity::CapacitySource):
//!   reports which resource names nodes advertise

pub mod types;

pub use types::KubernetesError;
