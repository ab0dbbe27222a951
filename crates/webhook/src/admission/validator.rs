use std::collections::BTreeSet;
use std::sync::Arc;

use api_types::AdmissionRequest;
use api_types::AdmissionResponse;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Pod;
use tracing::info;
use tracing::warn;

use super::AdmissionError;
use super::STATUS_ANNOTATION;
use super::STATUS_INJECTED;
use crate::infrastructure::capacity::CapacitySource;
use crate::infrastructure::logging::AUDIT_TARGET;

/// Denies mutated pods asking for resources no node advertises.
pub struct CapacityValidator {
    capacity: Arc<dyn CapacitySource>,
}

impl CapacityValidator {
    pub fn new(capacity: Arc<dyn CapacitySource>) -> Self {
        Self { capacity }
    }

    pub async fn review(&self, request: &AdmissionRequest) -> AdmissionResponse {
        match self.validate(request).await {
            Ok(Ok(())) => {
                info!(target: AUDIT_TARGET, uid = %request.uid, "validated");
                AdmissionResponse::allow()
            }
            Ok(Err(missing)) => {
                let message = format!(
                    "Resource validation failed: no node advertises {}",
                    missing.into_iter().collect::<Vec<_>>().join(", ")
                );
                warn!(
                    target: AUDIT_TARGET,
                    uid = %request.uid,
                    %message,
                    "validation denied"
                );
                AdmissionResponse {
                    warnings: Some(vec![message.clone()]),
                    ..AdmissionResponse::deny(message)
                }
            }
            Err(report) => {
                warn!(
                    target: AUDIT_TARGET,
                    uid = %request.uid,
                    error = ?report,
                    "validation denied"
                );
                AdmissionResponse::deny(report.current_context().to_string())
            }
        }
    }

    /// `Ok(Err(names))` lists requested resource names missing from the cluster.
    ///
    /// # Errors
    ///
    /// - [`AdmissionError::ObjectDecode`] if the object is not a pod
    /// - [`AdmissionError::CapacityLookupFailure`] if nodes cannot be listed
    pub async fn validate(
        &self,
        request: &AdmissionRequest,
    ) -> Result<Result<(), BTreeSet<String>>, Report<AdmissionError>> {
        let pod: Pod = request
            .object
            .clone()
            .map(serde_json::from_value::<Pod>)
            .transpose()
            .map_err(|e| {
                Report::new(AdmissionError::ObjectDecode {
                    message: e.to_string(),
                })
            })?
            .unwrap_or_default();

        let injected = pod
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(STATUS_ANNOTATION))
            .is_some_and(|status| status.to_lowercase() == STATUS_INJECTED);
        if !injected {
            return Ok(Ok(()));
        }

        let requested: BTreeSet<String> = pod
            .spec
            .iter()
            .flat_map(|spec| spec.containers.iter())
            .filter_map(|container| container.resources.as_ref()?.requests.as_ref())
            .flat_map(|requests| requests.keys().cloned())
            .collect();
        if requested.is_empty() {
            return Ok(Ok(()));
        }

        let advertised = self
            .capacity
            .allocatable_resource_names()
            .await
            .change_context(AdmissionError::CapacityLookupFailure)?;
        let missing: BTreeSet<String> = requested.difference(&advertised).cloned().collect();
        if missing.is_empty() {
            Ok(Ok(()))
        } else {
            Ok(Err(missing))
        }
    }
}
