//! Admission mutation engine.
//!
//! A pod that requests fractional GPU resources through the `bitfusion.io`
//! resource names is rewritten at admission time: the sidecar runtime is
//! merged in, its launch command is wrapped with the GPU-sharing client, and
//! the three ways of expressing GPU demand are folded into a single share
//! quantity.
//!
//! The main components are:
//! - [`InjectionPolicy`]: decides whether (and how) a pod must be mutated
//! - [`ClientDistributionMatrix`]: resolves the client binary for a guest OS
//! - [`ResourceNegotiator`]: turns GPU demand into a share and a command
//! - [`patch`]: JSON patch builders
//! - [`MutationOrchestrator`]: composes the above for one admission request
//! - [`CapacityValidator`]: cross-checks mutated pods against node capacity

use core::error::Error;

pub mod client;
pub mod negotiator;
pub mod orchestrator;
pub mod patch;
pub mod policy;
pub mod quantity;
pub mod sidecar;
pub mod validator;

pub use client::ClientDistributionMatrix;
pub use client::ClientResolution;
pub use negotiator::ResourceNegotiator;
pub use orchestrator::MutationOrchestrator;
pub use policy::InjectionDecision;
pub use policy::InjectionPolicy;
pub use sidecar::SidecarTemplate;
pub use validator::CapacityValidator;

/// Annotation selecting the injection mode.
pub const INJECT_ANNOTATION: &str = "auto-management/bitfusion";
/// Annotation stamped on every mutated pod.
pub const STATUS_ANNOTATION: &str = "auto-management/status";
/// Value of [`STATUS_ANNOTATION`] once a pod has been mutated.
pub const STATUS_INJECTED: &str = "injected";
/// Annotation naming the guest OS of the workload image.
pub const GUEST_OS_ANNOTATION: &str = "bitfusion-client/os";
/// Annotation naming the requested client version.
pub const CLIENT_VERSION_ANNOTATION: &str = "bitfusion-client/version";
/// Optional device filter forwarded to the client.
pub const FILTER_ANNOTATION: &str = "bitfusion-client/filter";

/// Whole GPU count requested by a container.
pub const GPU_COUNT_RESOURCE: &str = "bitfusion.io/gpu-num";
/// Percentage of one GPU requested by a container.
pub const GPU_PERCENT_RESOURCE: &str = "bitfusion.io/gpu-percent";
/// GPU memory in bytes requested by a container.
pub const GPU_MEMORY_RESOURCE: &str = "bitfusion.io/gpu-memory";
/// Share quantity exposed to the scheduler after negotiation.
pub const GPU_SHARE_RESOURCE: &str = "bitfusion.io/gpu";

/// Environment variable carrying the client library search path.
pub const LIBRARY_PATH_ENV: &str = "LD_LIBRARY_PATH";
/// Name every client binary starts with; used to detect manual invocations.
pub const RUNTIME_COMMAND_NAME: &str = "bitfusion";

/// Admission errors
#[derive(Debug, derive_more::Display)]
pub enum AdmissionError {
    #[display("Malformed admission request: {message}")]
    MalformedRequest { message: String },
    #[display("Could not decode reviewed object: {message}")]
    ObjectDecode { message: String },
    #[display("Could not find Bitfusion client info, OS={guest_os} version={client_version}")]
    ConfigurationGap {
        guest_os: String,
        client_version: String,
    },
    #[display("Invalid {resource} request: {reason}")]
    InvalidDemand { resource: String, reason: String },
    #[display("Total GPU memory is not configured, cannot honour {resource}")]
    MissingTotalMemory { resource: String },
    #[display("Failed to provision runtime credential in namespace {namespace}")]
    CredentialProvisioningFailure { namespace: String },
    #[display("Failed to read cluster capacity")]
    CapacityLookupFailure,
    #[display("Failed to encode patch: {message}")]
    PatchEncoding { message: String },
}

impl Error for AdmissionError {}

impl AdmissionError {
    pub(crate) fn invalid_demand(resource: &str, reason: impl Into<String>) -> Self {
        Self::InvalidDemand {
            resource: resource.to_string(),
            reason: reason.into(),
        }
    }
}
