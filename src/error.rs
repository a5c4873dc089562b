use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::{storage::StorageError, store::StoreError};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("unsupported document format: {0}")]
    UnsupportedFormat(String),

    #[error("document source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("embedding provider failed: {0}")]
    EmbeddingProviderError(String),

    #[error("generation provider failed: {0}")]
    GenerationProviderError(String),

    #[error("generation output did not match the expected schema: {0}")]
    GenerationFormatError(String),

    #[error("no performance recorded for this activity")]
    PerformanceNotFound,

    #[error("you are already enrolled in this course")]
    AlreadyEnrolled,

    #[error("invalid enrollment code")]
    InvalidEnrollmentCode,

    #[error("module test was created concurrently and the stored copy could not be read")]
    ConcurrentActivityConflict,

    #[error("responses for this activity have already been scored")]
    AlreadySubmitted,

    #[error("module already has an indexed document")]
    DocumentAlreadyAttached,

    #[error("you are not enrolled in this course")]
    NotEnrolled,

    #[error("the diagnostic assessment must be completed first")]
    DiagnosticPending,

    #[error("you are not allowed to perform this action")]
    Forbidden,

    #[error("authentication required")]
    Unauthorized,

    #[error("identity provider unavailable: {0}")]
    IdentityUnavailable(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Storage(#[from] std::io::Error),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::UnsupportedFormat(_) | AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::IdentityUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::NotEnrolled | AppError::DiagnosticPending | AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::PerformanceNotFound | AppError::InvalidEnrollmentCode | AppError::NotFound(_) => {
                StatusCode::NOT_FOUND
            }
            AppError::AlreadyEnrolled
            | AppError::AlreadySubmitted
            | AppError::ConcurrentActivityConflict
            | AppError::DocumentAlreadyAttached => StatusCode::CONFLICT,
            AppError::EmbeddingProviderError(_)
            | AppError::GenerationProviderError(_)
            | AppError::GenerationFormatError(_) => StatusCode::BAD_GATEWAY,
            AppError::Store(StoreError::Conflict(_)) => StatusCode::CONFLICT,
            AppError::SourceUnavailable(_) | AppError::Store(_) | AppError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<StorageError> for AppError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::InvalidPath(p) => AppError::InvalidInput(format!("invalid object path: {}", p)),
            StorageError::NotFound(_) => AppError::NotFound("document"),
            StorageError::Signing(msg) => AppError::Storage(std::io::Error::other(msg)),
            StorageError::Io(io) => AppError::Storage(io),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "internal error");
        } else {
            tracing::debug!(error = %self, %status, "request rejected");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_correctable_errors_are_client_errors() {
        assert_eq!(AppError::AlreadyEnrolled.status(), StatusCode::CONFLICT);
        assert_eq!(AppError::InvalidEnrollmentCode.status(), StatusCode::NOT_FOUND);
        assert_eq!(AppError::UnsupportedFormat(".txt".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::DiagnosticPending.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn provider_failures_are_gateway_errors() {
        assert_eq!(
            AppError::GenerationFormatError("bad".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            AppError::EmbeddingProviderError("down".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            AppError::SourceUnavailable("gone".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
