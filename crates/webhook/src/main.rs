use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use utils::version;
use vgpu_webhook::admission::CapacityValidator;
use vgpu_webhook::admission::InjectionPolicy;
use vgpu_webhook::admission::MutationOrchestrator;
use vgpu_webhook::admission::ResourceNegotiator;
use vgpu_webhook::api::TlsFiles;
use vgpu_webhook::api::WebhookServer;
use vgpu_webhook::config::load_documents;
use vgpu_webhook::config::CheckConfigArgs;
use vgpu_webhook::config::Cli;
use vgpu_webhook::config::Commands;
use vgpu_webhook::config::ServeArgs;
use vgpu_webhook::infrastructure::capacity::NodeCapacity;
use vgpu_webhook::infrastructure::credentials::SecretCopier;
use vgpu_webhook::infrastructure::kube_client::init_kube_client;
use vgpu_webhook::infrastructure::logging;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(serve_args) => run_serve(*serve_args).await,
        Commands::CheckConfig(check_args) => run_check_config(check_args).await,
    }
}

async fn run_serve(serve_args: ServeArgs) -> Result<()> {
    let _guards = logging::init(serve_args.audit_log_file.as_deref())?;

    tracing::info!("Starting vgpu webhook {}", &**version::VERSION);

    let documents = load_documents(
        &serve_args.documents.sidecar_config,
        &serve_args.documents.client_config,
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to load configuration documents: {e:?}"))?;
    let total_memory_mb = serve_args
        .total_memory_mb()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {e:?}"))?;
    if total_memory_mb.is_none() {
        tracing::warn!("Total GPU memory is not configured, gpu-memory requests will be denied");
    }

    let client = init_kube_client(serve_args.kubeconfig.clone())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to initialize Kubernetes client: {e:?}"))?;
    let credentials = SecretCopier::new(
        client.clone(),
        serve_args.credential_secret.clone(),
        serve_args.credential_source_namespace.clone(),
    );

    let orchestrator = MutationOrchestrator::new(
        InjectionPolicy::new(serve_args.ignored_namespaces.clone()),
        documents.clients,
        documents.sidecar,
        ResourceNegotiator::new(total_memory_mb),
        Arc::new(credentials),
    );
    let validator = CapacityValidator::new(Arc::new(NodeCapacity::new(client)));

    let tls = (!serve_args.plain_http).then(|| TlsFiles {
        cert_file: serve_args.tls_cert_file.clone(),
        key_file: serve_args.tls_key_file.clone(),
    });
    let server = WebhookServer::new(
        serve_args.listen_addr,
        tls,
        Arc::new(orchestrator),
        Arc::new(validator),
    );

    server
        .run(shutdown_signal())
        .await
        .map_err(|e| anyhow::anyhow!("Webhook server failed: {e:?}"))?;

    tracing::info!("Webhook shutdown complete");
    Ok(())
}

async fn run_check_config(check_args: CheckConfigArgs) -> Result<()> {
    let _guard = utils::logging::init();

    let documents = load_documents(
        &check_args.documents.sidecar_config,
        &check_args.documents.client_config,
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to load configuration documents: {e:?}"))?;

    for (guest_os, client_version, config) in documents.clients.entries() {
        tracing::info!(
            guest_os,
            client_version,
            binary_path = %config.binary_path,
            library_path_env = %config.library_path_env,
            "Client available"
        );
    }
    tracing::info!(
        pairs = documents.clients.len(),
        mount_donors = documents.sidecar.mount_donors().len(),
        "Configuration is valid"
    );
    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::warn!("Failed to install SIGTERM handler: {e}");
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {e}");
            }
            return;
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!("Failed to listen for Ctrl+C: {e}");
            }
            tracing::info!("Received Ctrl+C, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, shutting down");
        }
    }
}
