use thiserror::Error;

/// Errors that can occur during Kubernetes operations.
#[derive(Debug, Error)]
pub enum KubernetesError {
    #[error("Failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
    #[error("Secret {name} not found in namespace {namespace}")]
    SecretNotFound { name: String, namespace: String },
    #[error("Kubernetes API request failed: {message}")]
    RequestFailed { message: String },
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn kubernetes_error_display_formatting() {
        let missing = KubernetesError::SecretNotFound {
            name: "bitfusion-secret".to_string(),
            namespace: "kube-system".to_string(),
        };
        assert_eq!(
            missing.to_string(),
            "Secret bitfusion-secret not found in namespace kube-system"
        );

        let failed = KubernetesError::RequestFailed {
            message: "list nodes".to_string(),
        };
        assert_eq!(
            failed.to_string(),
            "Kubernetes API request failed: list nodes"
        );
    }
}
