//! HTTP front end of the admission webhook
//!
//! The cluster control plane posts `AdmissionReview` documents and expects a
//! review carrying the decision back.
//!
//! # Endpoints
//!
//! - `POST /mutate` - inject the GPU-sharing runtime into a pod
//! - `POST /validate` - check a mutated pod against advertised node capacity
//! - `GET /healthz` - liveness probe
//!
//! Requests must carry a non-empty `application/json` body; anything else is
//! rejected before an admission decision is made.

pub mod errors;
pub mod handlers;
pub mod server;

pub use errors::ApiError;
pub use server::routes;
pub use server::TlsFiles;
pub use server::WebhookServer;
