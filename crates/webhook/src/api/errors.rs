use core::error::Error;

use poem::error::ResponseError;
use poem::http::StatusCode;

/// API errors
#[derive(Debug, derive_more::Display)]
pub enum ApiError {
    #[display("Empty body")]
    EmptyBody,
    #[display("Content-Type={content_type}, expect application/json")]
    UnsupportedContentType { content_type: String },
    #[display("{message}")]
    MalformedReview { message: String },
    #[display("Server error: {message}")]
    ServerError { message: String },
}

impl Error for ApiError {}

impl ResponseError for ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::EmptyBody | Self::MalformedReview { .. } => StatusCode::BAD_REQUEST,
            Self::UnsupportedContentType { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::ServerError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
