//! Loading of the sidecar template and client distribution documents.

use std::path::Path;

use api_types::ClientDistribution;
use error_stack::Report;
use error_stack::ResultExt;
use serde::de::DeserializeOwned;
use tracing::info;

use crate::admission::ClientDistributionMatrix;
use crate::admission::SidecarTemplate;
use crate::config::ConfigError;

/// Both configuration documents, ready for the orchestrator.
#[derive(Debug, Clone)]
pub struct LoadedDocuments {
    pub sidecar: SidecarTemplate,
    pub clients: ClientDistributionMatrix,
}

async fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<T, Report<ConfigError>> {
    let display = path.display().to_string();
    let content = tokio::fs::read_to_string(path)
        .await
        .change_context_lazy(|| ConfigError::ReadFailed {
            path: display.clone(),
        })?;
    serde_yaml::from_str(&content).change_context(ConfigError::ParseFailed { path: display })
}

/// Load the sidecar template from `path`.
pub async fn load_sidecar_template(path: &Path) -> Result<SidecarTemplate, Report<ConfigError>> {
    let template: SidecarTemplate = load_yaml(path).await?;
    info!(
        path = %path.display(),
        init_containers = template.init_containers.len(),
        containers = template.containers.len(),
        volumes = template.volumes.len(),
        "Loaded sidecar template"
    );
    Ok(template)
}

/// Load the client distribution from `path` and index it by OS and version.
pub async fn load_client_distribution(
    path: &Path,
) -> Result<ClientDistributionMatrix, Report<ConfigError>> {
    let distribution: ClientDistribution = load_yaml(path).await?;
    let entries = distribution.clients.len();
    let matrix = ClientDistributionMatrix::from(distribution);
    info!(
        path = %path.display(),
        entries,
        pairs = matrix.len(),
        "Loaded client distribution"
    );
    Ok(matrix)
}

/// Load both documents.
pub async fn load_documents(
    sidecar_config: &Path,
    client_config: &Path,
) -> Result<LoadedDocuments, Report<ConfigError>> {
    Ok(LoadedDocuments {
        sidecar: load_sidecar_template(sidecar_config).await?,
        clients: load_client_distribution(client_config).await?,
    })
}
