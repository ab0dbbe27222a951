//! Runtime credential provisioning.

use async_trait::async_trait;
use error_stack::Report;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::PostParams;
use kube::Api;
use kube::Client;
use tracing::debug;
use tracing::info;

use crate::infrastructure::k8s::KubernetesError;

/// Credential secret copied into every namespace with GPU workloads.
pub const DEFAULT_CREDENTIAL_SECRET: &str = "bitfusion-secret";
/// Namespace holding the credential secret every copy is made from.
pub const DEFAULT_CREDENTIAL_SOURCE_NAMESPACE: &str = "kube-system";

/// Makes the runtime credential available in a workload namespace.
#[async_trait]
pub trait CredentialProvisioner: Send + Sync {
    /// Ensure the credential exists in `namespace`, creating it if missing.
    ///
    /// Must be idempotent and safe to call concurrently for one namespace.
    async fn ensure_credential(&self, namespace: &str) -> Result<(), Report<KubernetesError>>;
}

/// Copies a secret from a source namespace, never overwriting an existing one.
pub struct SecretCopier {
    client: Client,
    secret_name: String,
    source_namespace: String,
}

impl SecretCopier {
    pub fn new(client: Client, secret_name: String, source_namespace: String) -> Self {
        Self {
            client,
            secret_name,
            source_namespace,
        }
    }

    fn request_failed(
        &self,
        action: &str,
        namespace: &str,
        error: kube::Error,
    ) -> Report<KubernetesError> {
        Report::new(error).change_context(KubernetesError::RequestFailed {
            message: format!(
                "Failed to {action} secret {} in namespace {namespace}",
                self.secret_name
            ),
        })
    }
}

#[async_trait]
impl CredentialProvisioner for SecretCopier {
    async fn ensure_credential(&self, namespace: &str) -> Result<(), Report<KubernetesError>> {
        if namespace == self.source_namespace {
            return Ok(());
        }

        let target: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let existing = target
            .get_opt(&self.secret_name)
            .await
            .map_err(|e| self.request_failed("read", namespace, e))?;
        if existing.is_some() {
            debug!(namespace, secret = %self.secret_name, "Credential already present");
            return Ok(());
        }

        let source: Api<Secret> = Api::namespaced(self.client.clone(), &self.source_namespace);
        let Some(original) = source
            .get_opt(&self.secret_name)
            .await
            .map_err(|e| self.request_failed("read", &self.source_namespace, e))?
        else {
            return Err(Report::new(KubernetesError::SecretNotFound {
                name: self.secret_name.clone(),
                namespace: self.source_namespace.clone(),
            }));
        };

        let copy = credential_copy(&original, &self.secret_name, namespace);
        let created = created_or_conflict(target.create(&PostParams::default(), &copy).await)
            .map_err(|e| self.request_failed("create", namespace, e))?;
        if created {
            info!(namespace, secret = %self.secret_name, "Copied credential secret");
        } else {
            debug!(namespace, secret = %self.secret_name, "Credential created concurrently");
        }
        Ok(())
    }
}

/// `true` if the create went through, `false` if a concurrent admission won the race.
fn created_or_conflict(result: Result<Secret, kube::Error>) -> Result<bool, kube::Error> {
    match result {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(response)) if response.code == 409 => Ok(false),
        Err(e) => Err(e),
    }
}

/// A copy of `original` named `name` in `namespace`, without any server-set metadata.
fn credential_copy(original: &Secret, name: &str, namespace: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: original.data.clone(),
        string_data: original.string_data.clone(),
        type_: original.type_.clone(),
        ..Default::default()
    }
}
