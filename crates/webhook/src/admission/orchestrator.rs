use std::collections::BTreeMap;
use std::sync::Arc;

use api_types::AdmissionRequest;
use api_types::AdmissionResponse;
use api_types::ClientBinaryConfig;
use api_types::PatchOperation;
use api_types::JSON_PATCH_TYPE;
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::Pod;
use tracing::info;
use tracing::warn;

use super::negotiator::LaunchContext;
use super::negotiator::Negotiation;
use super::patch;
use super::quantity::ParsedQuantity;
use super::AdmissionError;
use super::ClientDistributionMatrix;
use super::ClientResolution;
use super::InjectionDecision;
use super::InjectionPolicy;
use super::ResourceNegotiator;
use super::SidecarTemplate;
use super::CLIENT_VERSION_ANNOTATION;
use super::FILTER_ANNOTATION;
use super::GPU_COUNT_RESOURCE;
use super::GUEST_OS_ANNOTATION;
use super::STATUS_ANNOTATION;
use super::STATUS_INJECTED;
use crate::infrastructure::credentials::CredentialProvisioner;
use crate::infrastructure::logging::AUDIT_TARGET;

/// What happened to one pod.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Left alone; the reason is logged.
    Unchanged { reason: String },
    Patched(Vec<PatchOperation>),
}

/// Runs the mutation pipeline for one admission request at a time.
///
/// Everything it holds is read-only after construction, so a single instance
/// serves all concurrent requests.
pub struct MutationOrchestrator {
    policy: InjectionPolicy,
    clients: ClientDistributionMatrix,
    sidecar: SidecarTemplate,
    negotiator: ResourceNegotiator,
    credentials: Arc<dyn CredentialProvisioner>,
}

impl MutationOrchestrator {
    pub fn new(
        policy: InjectionPolicy,
        clients: ClientDistributionMatrix,
        sidecar: SidecarTemplate,
        negotiator: ResourceNegotiator,
        credentials: Arc<dyn CredentialProvisioner>,
    ) -> Self {
        Self {
            policy,
            clients,
            sidecar,
            negotiator,
            credentials,
        }
    }

    /// Answer one admission request; failures become denials.
    pub async fn review(&self, request: &AdmissionRequest) -> AdmissionResponse {
        match self.mutate(request).await {
            Ok(Mutation::Unchanged { reason }) => {
                info!(
                    target: AUDIT_TARGET,
                    uid = %request.uid,
                    namespace = %request.namespace,
                    name = %request.name,
                    reason = %reason,
                    "allowed without mutation"
                );
                AdmissionResponse::allow()
            }
            Ok(Mutation::Patched(ops)) => match serde_json::to_vec(&ops) {
                Ok(encoded) => {
                    info!(
                        target: AUDIT_TARGET,
                        uid = %request.uid,
                        namespace = %request.namespace,
                        name = %request.name,
                        operations = ops.len(),
                        "mutated"
                    );
                    AdmissionResponse {
                        patch: Some(BASE64_STANDARD.encode(encoded)),
                        patch_type: Some(JSON_PATCH_TYPE.to_string()),
                        ..AdmissionResponse::allow()
                    }
                }
                Err(e) => deny(
                    request,
                    Report::new(AdmissionError::PatchEncoding {
                        message: e.to_string(),
                    }),
                ),
            },
            Err(report) => deny(request, report),
        }
    }

    /// Decide and build the mutation of the pod carried by `request`.
    ///
    /// # Errors
    ///
    /// - [`AdmissionError::ObjectDecode`] if the object is missing or not a pod
    /// - [`AdmissionError::ConfigurationGap`] if the requested client is unknown
    /// - [`AdmissionError::InvalidDemand`] and
    ///   [`AdmissionError::MissingTotalMemory`] from negotiation
    /// - [`AdmissionError::CredentialProvisioningFailure`] if the credential
    ///   cannot be copied into the pod namespace
    pub async fn mutate(
        &self,
        request: &AdmissionRequest,
    ) -> Result<Mutation, Report<AdmissionError>> {
        let pod = decode_pod(request)?;
        let namespace = pod
            .metadata
            .namespace
            .clone()
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| request.namespace.clone());
        let annotations = pod.metadata.annotations.as_ref();

        let decision = self.policy.decide(&namespace, annotations);
        if let InjectionDecision::Skip(reason) = decision {
            return Ok(Mutation::Unchanged {
                reason: reason.to_string(),
            });
        }

        let annotation = |key: &str| {
            annotations
                .and_then(|annotations| annotations.get(key))
                .map(String::as_str)
                .unwrap_or_default()
        };
        let guest_os = annotation(GUEST_OS_ANNOTATION);
        let client_version = annotation(CLIENT_VERSION_ANNOTATION);
        let client = match self.clients.resolve(guest_os, client_version) {
            ClientResolution::NotRequested => {
                return Ok(Mutation::Unchanged {
                    reason: "no client os or version requested".to_string(),
                });
            }
            ClientResolution::Missing {
                guest_os,
                client_version,
            } => {
                return Err(Report::new(AdmissionError::ConfigurationGap {
                    guest_os,
                    client_version,
                }));
            }
            ClientResolution::Found(client) => client,
        };

        let ops = self.build_patch(&pod, client, decision)?;

        if request.dry_run != Some(true) {
            self.credentials
                .ensure_credential(&namespace)
                .await
                .change_context(AdmissionError::CredentialProvisioningFailure {
                    namespace: namespace.clone(),
                })?;
        }

        Ok(Mutation::Patched(ops))
    }

    /// Every operation for `pod`, ending with the status annotation.
    pub fn build_patch(
        &self,
        pod: &Pod,
        client: &ClientBinaryConfig,
        decision: InjectionDecision,
    ) -> Result<Vec<PatchOperation>, Report<AdmissionError>> {
        let encoding = |e: serde_json::Error| {
            Report::new(AdmissionError::PatchEncoding {
                message: e.to_string(),
            })
        };
        let spec = pod.spec.clone().unwrap_or_default();
        let mut ops = Vec::new();

        let init_containers = self
            .sidecar
            .init_containers_for(&client.library_path_env, &spec.containers);
        ops.extend(
            patch::append_or_init(
                spec.init_containers.as_deref().unwrap_or_default(),
                &init_containers,
                "/spec/initContainers",
            )
            .map_err(encoding)?,
        );
        ops.extend(
            patch::append_or_init(
                spec.volumes.as_deref().unwrap_or_default(),
                &self.sidecar.volumes,
                "/spec/volumes",
            )
            .map_err(encoding)?,
        );

        let mounts = self.sidecar.mount_donors();
        for (index, container) in spec.containers.iter().enumerate() {
            if !requests_whole_gpus(container) {
                continue;
            }
            let path = format!("/spec/containers/{index}");
            ops.extend(
                patch::merge_runtime_environment(
                    container,
                    &path,
                    &mounts,
                    &client.library_path_env,
                )
                .map_err(encoding)?,
            );
        }

        let filter = pod
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(FILTER_ANNOTATION))
            .map(String::as_str);
        let launch = LaunchContext {
            client,
            filter,
            rewrite_command: decision.rewrites_command(),
        };
        for (index, container) in spec.containers.iter().enumerate() {
            if let Negotiation::Negotiated(negotiated) =
                self.negotiator.negotiate(container, launch)?
            {
                info!(
                    container = %container.name,
                    share = %negotiated.share,
                    command_rewritten = negotiated.command.is_some(),
                    "Negotiated GPU share"
                );
                ops.extend(
                    negotiated
                        .patch(&format!("/spec/containers/{index}"))
                        .map_err(encoding)?,
                );
            }
        }

        let status = BTreeMap::from([(
            STATUS_ANNOTATION.to_string(),
            STATUS_INJECTED.to_string(),
        )]);
        ops.extend(patch::annotate(pod.metadata.annotations.as_ref(), &status));
        Ok(ops)
    }
}

fn deny(request: &AdmissionRequest, report: Report<AdmissionError>) -> AdmissionResponse {
    warn!(
        target: AUDIT_TARGET,
        uid = %request.uid,
        namespace = %request.namespace,
        name = %request.name,
        error = ?report,
        "denied"
    );
    AdmissionResponse::deny(report.current_context().to_string())
}

fn decode_pod(request: &AdmissionRequest) -> Result<Pod, Report<AdmissionError>> {
    let object = request.object.clone().ok_or_else(|| {
        Report::new(AdmissionError::ObjectDecode {
            message: "request carries no object".to_string(),
        })
    })?;
    serde_json::from_value(object).map_err(|e| {
        Report::new(AdmissionError::ObjectDecode {
            message: e.to_string(),
        })
    })
}

/// Whether `container` asks for at least one whole GPU.
fn requests_whole_gpus(container: &Container) -> bool {
    container
        .resources
        .as_ref()
        .and_then(|resources| resources.requests.as_ref())
        .and_then(|requests| requests.get(GPU_COUNT_RESOURCE))
        .and_then(|count| ParsedQuantity::parse(&count.0).ok())
        .is_some_and(|count| count.ceil_integer() > 0)
}
