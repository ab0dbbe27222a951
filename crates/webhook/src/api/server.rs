use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use poem::get;
use poem::listener::Listener;
use poem::listener::RustlsCertificate;
use poem::listener::RustlsConfig;
use poem::listener::TcpListener;
use poem::middleware::Tracing;
use poem::post;
use poem::Endpoint;
use poem::EndpointExt;
use poem::Route;
use poem::Server;
use tracing::info;

use super::errors::ApiError;
use super::handlers::healthz;
use super::handlers::mutate;
use super::handlers::validate;
use crate::admission::CapacityValidator;
use crate::admission::MutationOrchestrator;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Certificate and private key served by the webhook, PEM encoded.
#[derive(Debug, Clone)]
pub struct TlsFiles {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

/// Admission webhook HTTP server
pub struct WebhookServer {
    listen_addr: SocketAddr,
    tls: Option<TlsFiles>,
    orchestrator: Arc<MutationOrchestrator>,
    validator: Arc<CapacityValidator>,
}

/// Webhook routes with their shared state attached.
pub fn routes(
    orchestrator: Arc<MutationOrchestrator>,
    validator: Arc<CapacityValidator>,
) -> impl Endpoint {
    Route::new()
        .at("/mutate", post(mutate))
        .at("/validate", post(validate))
        .at("/healthz", get(healthz))
        .data(orchestrator)
        .data(validator)
        .with(Tracing)
}

impl WebhookServer {
    /// Create a new webhook server; `tls` of `None` serves plain HTTP
    pub fn new(
        listen_addr: SocketAddr,
        tls: Option<TlsFiles>,
        orchestrator: Arc<MutationOrchestrator>,
        validator: Arc<CapacityValidator>,
    ) -> Self {
        Self {
            listen_addr,
            tls,
            orchestrator,
            validator,
        }
    }

    /// Serve until `shutdown` resolves, then drain in-flight reviews
    ///
    /// # Errors
    ///
    /// - [`ApiError::ServerError`] if the TLS material cannot be read or the
    ///   server fails to bind
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<(), Report<ApiError>> {
        let app = routes(self.orchestrator, self.validator);
        let listener = TcpListener::bind(self.listen_addr);

        let result = match self.tls {
            Some(tls) => {
                let certificate = load_certificate(&tls).await?;
                info!(
                    listen_addr = %self.listen_addr,
                    cert_file = %tls.cert_file.display(),
                    "Starting webhook server with TLS"
                );
                let listener =
                    listener.rustls(RustlsConfig::new().fallback(certificate));
                Server::new(listener)
                    .run_with_graceful_shutdown(app, shutdown, Some(SHUTDOWN_GRACE))
                    .await
            }
            None => {
                info!(listen_addr = %self.listen_addr, "Starting webhook server without TLS");
                Server::new(listener)
                    .run_with_graceful_shutdown(app, shutdown, Some(SHUTDOWN_GRACE))
                    .await
            }
        };

        result.map_err(|e| {
            Report::new(ApiError::ServerError {
                message: format!("Server failed: {e}"),
            })
        })?;
        info!("Webhook server stopped");
        Ok(())
    }
}

async fn load_certificate(tls: &TlsFiles) -> Result<RustlsCertificate, Report<ApiError>> {
    let cert = read_pem(&tls.cert_file).await?;
    let key = read_pem(&tls.key_file).await?;
    Ok(RustlsCertificate::new().cert(cert).key(key))
}

async fn read_pem(path: &Path) -> Result<Vec<u8>, Report<ApiError>> {
    tokio::fs::read(path)
        .await
        .change_context_lazy(|| ApiError::ServerError {
            message: format!("Failed to read {}", path.display()),
        })
}
