use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::brokers::BrokerError;
use crate::types::BrokerKind;

/// Engine operation errors.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No connected {broker} broker for user {user_id}")]
    NoBrokerConnection { user_id: String, broker: BrokerKind },

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("Data unavailable: {0}")]
    DataUnavailable(String),

    #[error("Invariant violated: {0}")]
    InternalInvariant(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Application error types.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unprocessable: {0}")]
    Unprocessable(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Validation(msg) | EngineError::Unsupported(msg) => AppError::BadRequest(msg),
            EngineError::NotFound(msg) => AppError::NotFound(msg),
            e @ EngineError::NoBrokerConnection { .. } => AppError::NotFound(e.to_string()),
            EngineError::DataUnavailable(msg) => AppError::Unprocessable(msg),
            EngineError::Broker(e) => AppError::Broker(e.to_string()),
            e => AppError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg.clone()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            AppError::Broker(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            AppError::SerdeJson(e) => (StatusCode::BAD_REQUEST, e.to_string()),
            AppError::Anyhow(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };

        let body = Json(json!({
            "error": message,
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: EngineError) -> StatusCode {
        AppError::from(err).into_response().status()
    }

    #[test]
    fn test_engine_error_status_mapping() {
        assert_eq!(status_of(EngineError::Validation("bad".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(EngineError::Unsupported("macd".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(EngineError::NotFound("s1".into())), StatusCode::NOT_FOUND);
        assert_eq!(
            status_of(EngineError::NoBrokerConnection {
                user_id: "u1".into(),
                broker: BrokerKind::Dhan,
            }),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(EngineError::DataUnavailable("no bars".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_of(EngineError::Broker(BrokerError::Timeout)),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_of(EngineError::InternalInvariant("owner".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
