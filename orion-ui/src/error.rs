//! HTTP error mapping for control handlers.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use orion::error::{CommandError, ControlError, HubError, LeaseError};

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

/// A control error rendered as `{"code", "message"}` with a matching status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "not_found",
            message: message.into(),
        }
    }
}

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        let (status, code) = match &err {
            ControlError::Hub(HubError::UnknownInstance(_))
            | ControlError::Command(CommandError::UnknownTarget(_)) => {
                (StatusCode::NOT_FOUND, "unknown_instance")
            }
            ControlError::Command(CommandError::NotFound(_)) => {
                (StatusCode::NOT_FOUND, "unknown_command")
            }
            ControlError::Hub(HubError::ExecutorConflict { .. }) => {
                (StatusCode::CONFLICT, "executor_conflict")
            }
            ControlError::Lease(LeaseError::Conflict { .. }) => (StatusCode::CONFLICT, "lease_conflict"),
            ControlError::Lease(LeaseError::NotHeld { .. }) => (StatusCode::CONFLICT, "lease_not_held"),
            ControlError::Lease(LeaseError::Expired { .. }) => (StatusCode::GONE, "lease_expired"),
            ControlError::Command(CommandError::Denied { .. }) => (StatusCode::FORBIDDEN, "denied"),
            ControlError::Command(CommandError::Debounced { .. }) => {
                (StatusCode::TOO_MANY_REQUESTS, "debounced")
            }
            ControlError::Command(CommandError::NotPending(_)) => {
                (StatusCode::CONFLICT, "not_pending")
            }
            ControlError::Hub(HubError::Persistence(_))
            | ControlError::Command(CommandError::Persistence(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "persistence")
            }
        };
        Self {
            status,
            code,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.code,
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}
