use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Uniform error surface returned by every HTTP handler. Subsystem code
/// never constructs this directly -- it returns its own typed error and
/// handlers translate at the boundary, per the propagation policy.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

#[derive(Serialize)]
struct ApiErrorBody {
    success: bool,
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            success: false,
            error: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::internal(e.to_string())
    }
}

impl From<crate::codec::DecodeError> for ApiError {
    fn from(e: crate::codec::DecodeError) -> Self {
        ApiError::bad_request(e.to_string())
    }
}

impl From<crate::registry::RegistryError> for ApiError {
    fn from(e: crate::registry::RegistryError) -> Self {
        match e {
            crate::registry::RegistryError::Full => ApiError::conflict(e.to_string()),
            crate::registry::RegistryError::NotFound => ApiError::not_found(e.to_string()),
        }
    }
}

impl From<crate::ota::OtaError> for ApiError {
    fn from(e: crate::ota::OtaError) -> Self {
        match e {
            crate::ota::OtaError::AlreadyActive => ApiError::conflict(e.to_string()),
            crate::ota::OtaError::NotActive => ApiError::conflict(e.to_string()),
            _ => ApiError::bad_request(e.to_string()),
        }
    }
}

impl From<crate::commission::CommissionError> for ApiError {
    fn from(e: crate::commission::CommissionError) -> Self {
        match e {
            crate::commission::CommissionError::WrongMode(_) => ApiError::conflict(e.to_string()),
            crate::commission::CommissionError::Timeout => ApiError::internal(e.to_string()),
        }
    }
}
