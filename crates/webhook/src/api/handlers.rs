use std::sync::Arc;

use api_types::AdmissionRequest;
use api_types::AdmissionReview;
use error_stack::Report;
use poem::handler;
use poem::web::Data;
use poem::web::Json;
use poem::Request;
use tracing::debug;
use tracing::warn;

use super::errors::ApiError;
use crate::admission::AdmissionError;
use crate::admission::CapacityValidator;
use crate::admission::MutationOrchestrator;

const JSON_CONTENT_TYPE: &str = "application/json";

/// Mutate a pod admission review
#[handler]
pub async fn mutate(
    req: &Request,
    body: Vec<u8>,
    orchestrator: Data<&Arc<MutationOrchestrator>>,
) -> poem::Result<Json<AdmissionReview>> {
    let review = read_review(req, &body)?;
    let response = orchestrator.review(admission_request(&review)?).await;
    Ok(Json(AdmissionReview::answer(&review, response)))
}

/// Validate a mutated pod against cluster capacity
#[handler]
pub async fn validate(
    req: &Request,
    body: Vec<u8>,
    validator: Data<&Arc<CapacityValidator>>,
) -> poem::Result<Json<AdmissionReview>> {
    let review = read_review(req, &body)?;
    let response = validator.review(admission_request(&review)?).await;
    Ok(Json(AdmissionReview::answer(&review, response)))
}

/// Liveness probe
#[handler]
pub fn healthz() -> &'static str {
    "ok"
}

fn read_review(req: &Request, body: &[u8]) -> Result<AdmissionReview, ApiError> {
    if body.is_empty() {
        warn!(uri = %req.uri(), "Rejecting review with empty body");
        return Err(ApiError::EmptyBody);
    }

    let content_type = req.content_type().unwrap_or_default();
    if !is_json(content_type) {
        warn!(uri = %req.uri(), content_type, "Rejecting review with unsupported content type");
        return Err(ApiError::UnsupportedContentType {
            content_type: content_type.to_string(),
        });
    }

    decode_review(body).map_err(|report| {
        warn!(uri = %req.uri(), error = ?report, "Rejecting undecodable review");
        ApiError::MalformedReview {
            message: report.current_context().to_string(),
        }
    })
}

fn admission_request(review: &AdmissionReview) -> Result<&AdmissionRequest, ApiError> {
    review.request.as_ref().ok_or_else(|| ApiError::MalformedReview {
        message: AdmissionError::MalformedRequest {
            message: "review carries no request".to_string(),
        }
        .to_string(),
    })
}

fn decode_review(body: &[u8]) -> Result<AdmissionReview, Report<AdmissionError>> {
    let review: AdmissionReview = serde_json::from_slice(body).map_err(|e| {
        Report::new(AdmissionError::MalformedRequest {
            message: e.to_string(),
        })
    })?;
    if let Some(request) = &review.request {
        debug!(
            uid = %request.uid,
            namespace = %request.namespace,
            operation = %request.operation,
            "Decoded admission review"
        );
    }
    Ok(review)
}

/// Compares the media type essence, ignoring parameters such as `charset`.
fn is_json(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|essence| essence.eq_ignore_ascii_case(JSON_CONTENT_TYPE))
}
