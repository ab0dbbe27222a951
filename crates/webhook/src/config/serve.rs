use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Args;
use clap::Parser;
use error_stack::Report;
use error_stack::ResultExt;

use crate::admission::policy::DEFAULT_IGNORED_NAMESPACES;
use crate::admission::quantity::ParsedQuantity;
use crate::config::ConfigError;
use crate::infrastructure::credentials::DEFAULT_CREDENTIAL_SECRET;
use crate::infrastructure::credentials::DEFAULT_CREDENTIAL_SOURCE_NAMESPACE;

/// Locations of the two configuration documents.
#[derive(Args, Clone, Debug)]
pub struct DocumentArgs {
    #[arg(
        long,
        env = "SIDECAR_CONFIG_FILE",
        value_hint = clap::ValueHint::FilePath,
        default_value = "/etc/webhook/config/sidecarconfig.yaml",
        help = "Sidecar template with the init containers, mount donors and volumes to inject"
    )]
    pub sidecar_config: PathBuf,

    #[arg(
        long,
        env = "BITFUSION_CLIENT_CONFIG",
        value_hint = clap::ValueHint::FilePath,
        default_value = "/etc/webhook/bitfusion-client-config/bitfusion-client-config.yaml",
        help = "Client distribution listing the client binary for every guest OS and version"
    )]
    pub client_config: PathBuf,
}

#[derive(Parser, Clone, Debug)]
pub struct ServeArgs {
    #[arg(
        long,
        env = "WEBHOOK_LISTEN_ADDR",
        default_value = "0.0.0.0:8443",
        help = "Admission webhook listen address"
    )]
    pub listen_addr: SocketAddr,

    #[arg(
        long,
        env = "TLS_CERT_FILE",
        value_hint = clap::ValueHint::FilePath,
        default_value = "/etc/webhook/certs/cert.pem",
        help = "PEM encoded serving certificate"
    )]
    pub tls_cert_file: PathBuf,

    #[arg(
        long,
        env = "TLS_KEY_FILE",
        value_hint = clap::ValueHint::FilePath,
        default_value = "/etc/webhook/certs/key.pem",
        help = "PEM encoded private key of the serving certificate"
    )]
    pub tls_key_file: PathBuf,

    #[arg(
        long,
        help = "Serve plain HTTP, e.g. behind a TLS terminating proxy",
        default_value_t = false
    )]
    pub plain_http: bool,

    #[command(flatten)]
    pub documents: DocumentArgs,

    #[arg(
        long,
        env = "TOTAL_GPU_MEMORY",
        help = "Memory of one physical GPU in megabytes, required for gpu-memory requests"
    )]
    pub total_gpu_memory: Option<String>,

    #[arg(
        long,
        value_delimiter = ',',
        default_values_t = DEFAULT_IGNORED_NAMESPACES.map(String::from),
        help = "Namespaces whose pods are never mutated"
    )]
    pub ignored_namespaces: Vec<String>,

    #[arg(
        long,
        default_value = DEFAULT_CREDENTIAL_SECRET,
        help = "Secret holding the runtime credential"
    )]
    pub credential_secret: String,

    #[arg(
        long,
        default_value = DEFAULT_CREDENTIAL_SOURCE_NAMESPACE,
        help = "Namespace the credential secret is copied from"
    )]
    pub credential_source_namespace: String,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        env = "WEBHOOK_AUDIT_LOG",
        value_hint = clap::ValueHint::FilePath,
        help = "Write admission decisions to this daily rolling file instead of the main log"
    )]
    pub audit_log_file: Option<PathBuf>,
}

impl ServeArgs {
    /// Total GPU memory in megabytes, if configured.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::InvalidValue`] if the value is not a positive whole number
    pub fn total_memory_mb(&self) -> Result<Option<i128>, Report<ConfigError>> {
        self.total_gpu_memory
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(parse_total_memory)
            .transpose()
    }
}

fn parse_total_memory(value: &str) -> Result<i128, Report<ConfigError>> {
    let invalid = |reason: &str| ConfigError::InvalidValue {
        name: "total-gpu-memory".to_string(),
        reason: format!("{value:?} {reason}"),
    };
    let parsed = ParsedQuantity::parse(value).change_context_lazy(|| invalid("is not a quantity"))?;
    match parsed.exact_integer() {
        Some(megabytes) if megabytes > 0 => Ok(megabytes),
        _ => Err(Report::new(invalid("must be a positive whole number"))),
    }
}

#[derive(Parser, Clone, Debug)]
pub struct CheckConfigArgs {
    #[command(flatten)]
    pub documents: DocumentArgs,
}
