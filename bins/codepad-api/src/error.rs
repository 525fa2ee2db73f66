use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use codepad_common::BrokerError;
use thiserror::Error;
use tracing::error;

/// Failures a handler reports to the client as `{ "error": ... }`.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("job broker unavailable")]
    Unavailable,

    #[error("internal error")]
    Internal,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<BrokerError> for ApiError {
    fn from(e: BrokerError) -> Self {
        match e {
            BrokerError::InvalidArgument(reason) => ApiError::BadRequest(reason),
            BrokerError::NotFound(job_id) => ApiError::NotFound(format!("job {} not found", job_id)),
            BrokerError::Redis(e) => {
                error!(error = %e, "Broker call failed");
                ApiError::Unavailable
            }
            other => {
                error!(error = %other, "Unreadable job record");
                ApiError::Internal
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status_code(),
            Json(serde_json::json!({ "error": self.to_string() })),
        )
            .into_response()
    }
}
