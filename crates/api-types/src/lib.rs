//! Shared API type definitions
//!
//! This crate contains the wire types exchanged by the vgpu admission webhook:
//! the admission review envelope sent by the cluster control plane, the JSON
//! patch operations returned to it, and the client distribution document that
//! describes where the GPU-sharing client lives for every guest OS.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// API version used when the incoming review does not carry one.
pub const DEFAULT_ADMISSION_API_VERSION: &str = "admission.k8s.io/v1";

/// Patch type marker attached to every mutating response.
pub const JSON_PATCH_TYPE: &str = "JSONPatch";

/// Admission review envelope, used for both directions of the exchange.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReview {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<AdmissionRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<AdmissionResponse>,
}

impl AdmissionReview {
    /// Wrap a response into a review answering `request_review`.
    ///
    /// The api version of the request is echoed and the response uid is
    /// copied from the request so the control plane can correlate them.
    pub fn answer(request_review: &AdmissionReview, mut response: AdmissionResponse) -> Self {
        if let Some(request) = &request_review.request {
            response.uid = request.uid.clone();
        }
        Self {
            api_version: Some(
                request_review
                    .api_version
                    .clone()
                    .unwrap_or_else(|| DEFAULT_ADMISSION_API_VERSION.to_string()),
            ),
            kind: Some("AdmissionReview".to_string()),
            request: None,
            response: Some(response),
        }
    }
}

/// Group/version/kind triple naming the reviewed object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupVersionKind {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub kind: String,
}

/// The reviewed operation, as sent by the control plane.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub kind: GroupVersionKind,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub operation: String,
    #[serde(default)]
    pub user_info: Value,
    /// Raw reviewed object; decoded by the handler that needs it.
    #[serde(default)]
    pub object: Option<Value>,
    #[serde(default)]
    pub dry_run: Option<bool>,
}

/// Result status attached to a rejected review.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionStatus {
    #[serde(default)]
    pub message: String,
}

/// Admission decision returned to the control plane.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResponse {
    #[serde(default)]
    pub uid: String,
    pub allowed: bool,
    /// Base64 encoded JSON array of [`PatchOperation`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_type: Option<String>,
    #[serde(default, rename = "status", skip_serializing_if = "Option::is_none")]
    pub result: Option<AdmissionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<String>>,
}

impl AdmissionResponse {
    /// An allowing response without a patch.
    pub fn allow() -> Self {
        Self {
            allowed: true,
            ..Default::default()
        }
    }

    /// A rejecting response carrying `message`.
    pub fn deny(message: impl Into<String>) -> Self {
        Self {
            allowed: false,
            result: Some(AdmissionStatus {
                message: message.into(),
            }),
            ..Default::default()
        }
    }

    /// Message of a rejected review, if any.
    pub fn message(&self) -> Option<&str> {
        self.result.as_ref().map(|status| status.message.as_str())
    }
}

/// A single JSON patch operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOperation {
    Add { path: String, value: Value },
    Replace { path: String, value: Value },
    Remove { path: String },
}

impl PatchOperation {
    pub fn add(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Add {
            path: path.into(),
            value: value.into(),
        }
    }

    pub fn replace(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Replace {
            path: path.into(),
            value: value.into(),
        }
    }

    /// JSON pointer this operation targets.
    pub fn path(&self) -> &str {
        match self {
            Self::Add { path, .. } | Self::Replace { path, .. } | Self::Remove { path } => path,
        }
    }

    /// Operation name as it appears on the wire.
    pub fn op(&self) -> &'static str {
        match self {
            Self::Add { .. } => "add",
            Self::Replace { .. } => "replace",
            Self::Remove { .. } => "remove",
        }
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Add { value, .. } | Self::Replace { value, .. } => Some(value),
            Self::Remove { .. } => None,
        }
    }
}

/// Where the GPU-sharing client binary and its libraries live inside the
/// sidecar filesystem for one (guest OS, client version) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientBinaryConfig {
    pub binary_path: String,
    pub library_path_env: String,
}

/// One entry of the client distribution document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDistributionEntry {
    #[serde(rename = "BitfusionVersion")]
    pub client_version: String,
    #[serde(rename = "OSVersion")]
    pub guest_os: String,
    #[serde(rename = "BinaryPath")]
    pub binary_path: String,
    #[serde(rename = "EnvVariable")]
    pub library_path_env: String,
}

/// The client distribution document loaded from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDistribution {
    #[serde(rename = "BitfusionClients", default)]
    pub clients: Vec<ClientDistributionEntry>,
}
