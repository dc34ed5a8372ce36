//! HTTP error mapping for control plane handlers.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::Value;

use tenantry_kernel::KernelError;

#[derive(Clone, Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(ErrorState),
    Unauthorized(ErrorState),
    Forbidden(ErrorState),
    NotFound(ErrorState),
    Conflict(ErrorState),
    Internal(ErrorState),
    Unavailable(ErrorState),
}

#[derive(Clone, Debug)]
pub struct ErrorState {
    pub message: String,
    pub request_id: Option<String>,
    pub details: Option<Value>,
}

impl ErrorState {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            request_id: None,
            details: None,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
struct ErrorEnvelope {
    request_id: String,
    error: ErrorBody,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(ErrorState::new(message))
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(ErrorState::new(message))
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(ErrorState::new(message))
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(ErrorState::new(message))
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(ErrorState::new(message))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(ErrorState::new(message))
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(ErrorState::new(message))
    }

    fn state_mut(&mut self) -> &mut ErrorState {
        match self {
            Self::BadRequest(s)
            | Self::Unauthorized(s)
            | Self::Forbidden(s)
            | Self::NotFound(s)
            | Self::Conflict(s)
            | Self::Internal(s)
            | Self::Unavailable(s) => s,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.state_mut().request_id = Some(request_id.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.state_mut().details = Some(details);
        self
    }

    /// Maps a kernel error and tags it with the request id in one step.
    pub fn from_kernel(err: KernelError, request_id: &str) -> Self {
        Self::from(err).with_request_id(request_id.to_string())
    }
}

impl From<KernelError> for ApiError {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::Validation(m) => Self::bad_request(m),
            KernelError::Unauthorized(m) => Self::unauthorized(m),
            KernelError::Forbidden(m) => Self::forbidden(m),
            KernelError::NotFound(m) => Self::not_found(m),
            KernelError::Conflict(m) => Self::conflict(m),
            KernelError::Store(m) | KernelError::CoordinatorUnavailable(m) => {
                Self::unavailable(m)
            }
            KernelError::Misconfigured(m) => {
                tracing::error!(error = %m, "server_misconfigured");
                Self::internal(format!("misconfigured: {}", m))
            }
            KernelError::Engine(m) => Self::internal(m),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, state) = match self {
            Self::BadRequest(s) => (StatusCode::BAD_REQUEST, "invalid_argument", s),
            Self::Unauthorized(s) => (StatusCode::UNAUTHORIZED, "unauthorized", s),
            Self::Forbidden(s) => (StatusCode::FORBIDDEN, "forbidden", s),
            Self::NotFound(s) => (StatusCode::NOT_FOUND, "not_found", s),
            Self::Conflict(s) => (StatusCode::CONFLICT, "conflict", s),
            Self::Internal(s) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", s),
            Self::Unavailable(s) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", s),
        };
        let request_id = state
            .request_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let body = ErrorEnvelope {
            request_id,
            error: ErrorBody {
                code,
                message: state.message,
                details: state.details,
            },
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_errors_map_to_status_codes() {
        let cases = [
            (KernelError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (KernelError::Unauthorized("x".into()), StatusCode::UNAUTHORIZED),
            (KernelError::Forbidden("x".into()), StatusCode::FORBIDDEN),
            (KernelError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (KernelError::Conflict("x".into()), StatusCode::CONFLICT),
            (KernelError::Store("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (
                KernelError::Misconfigured("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            let resp = ApiError::from_kernel(err, "rid-1").into_response();
            assert_eq!(resp.status(), status);
        }
    }
}
