//! HTTP error responses.
//!
//! Every failure is answered with a status code and a JSON body of the
//! form `{"error": message}`. Internal failures are logged in full and
//! reported with a generic message.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use speda_conversation::{SessionError, StoreError, TurnFailed};
use std::fmt;

/// Errors returned by the API handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// The request was malformed.
    BadRequest { message: String },
    /// The addressed resource does not exist.
    NotFound { message: String },
    /// The request conflicts with a running turn.
    Conflict { message: String },
    /// The turn ran but ended in an error.
    TurnFailed { message: String },
    /// Something failed on our side.
    Internal { details: String },
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadRequest { message } => write!(f, "bad request: {message}"),
            Self::NotFound { message } => write!(f, "not found: {message}"),
            Self::Conflict { message } => write!(f, "conflict: {message}"),
            Self::TurnFailed { message } => write!(f, "turn failed: {message}"),
            Self::Internal { details } => write!(f, "internal error: {details}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl ApiError {
    fn status_and_message(&self) -> (StatusCode, String) {
        match self {
            Self::BadRequest { message } => (StatusCode::BAD_REQUEST, message.clone()),
            Self::NotFound { message } => (StatusCode::NOT_FOUND, message.clone()),
            Self::Conflict { message } => (StatusCode::CONFLICT, message.clone()),
            Self::TurnFailed { message } => (StatusCode::BAD_GATEWAY, message.clone()),
            Self::Internal { details } => {
                tracing::error!(%details, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = self.status_and_message();
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound { .. } => Self::NotFound {
                message: "Conversation not found".to_string(),
            },
            SessionError::TurnInProgress { .. } => Self::Conflict {
                message: "A response is already being generated for this conversation"
                    .to_string(),
            },
            SessionError::InvalidInput { reason } => Self::BadRequest { message: reason },
            SessionError::Store { reason } => Self::Internal { details: reason },
        }
    }
}

impl From<TurnFailed> for ApiError {
    fn from(err: TurnFailed) -> Self {
        Self::TurnFailed {
            message: err.message,
        }
    }
}

impl From<rootcause::Report<StoreError>> for ApiError {
    fn from(report: rootcause::Report<StoreError>) -> Self {
        match report.current_context() {
            StoreError::NotFound { .. } => Self::NotFound {
                message: "Conversation not found".to_string(),
            },
            _ => Self::Internal {
                details: report.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use speda_core::ConversationId;

    #[test]
    fn session_errors_map_to_statuses() {
        let id = ConversationId::new();
        let cases = [
            (SessionError::NotFound { id }, StatusCode::NOT_FOUND),
            (SessionError::TurnInProgress { id }, StatusCode::CONFLICT),
            (
                SessionError::InvalidInput {
                    reason: "message must not be empty".to_string(),
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                SessionError::Store {
                    reason: "pool timed out".to_string(),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status_and_message().0, status);
        }
    }

    #[test]
    fn internal_details_are_not_exposed() {
        let err = ApiError::Internal {
            details: "password authentication failed for user speda".to_string(),
        };
        assert_eq!(err.status_and_message().1, "Internal server error");
    }

    #[test]
    fn store_not_found_maps_to_404() {
        let report: rootcause::Report<StoreError> = StoreError::NotFound {
            id: ConversationId::new(),
        }
        .into();
        assert!(matches!(ApiError::from(report), ApiError::NotFound { .. }));
    }
}
