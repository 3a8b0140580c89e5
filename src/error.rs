use axum::http::StatusCode;
use thiserror::Error;

/// Request- and startup-facing error taxonomy for the service.
///
/// `ModelUnavailable` only occurs during startup and aborts the process
/// before the listener binds; the other two variants are per-request and are
/// surfaced to the client, never mapped to a default label.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The `text` field was missing from the request.
    #[error("request is missing the `text` field")]
    InvalidInput,

    /// The tokenizer, configuration, or weights could not be loaded.
    #[error("model unavailable: {0}")]
    ModelUnavailable(#[source] anyhow::Error),

    /// The forward pass (or tokenization) failed at request time.
    #[error("inference failed: {0}")]
    Inference(#[source] anyhow::Error),
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::InvalidInput => StatusCode::UNPROCESSABLE_ENTITY,
            ServiceError::ModelUnavailable(_) | ServiceError::Inference(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}
