use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt::Display;

use crate::dispatch::{DispatchError, ErrorKind};

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn unprocessable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, message)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized")
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "resource not found")
    }

    /// Logs the cause and answers with a generic message.
    pub fn internal<E: Display>(error: E) -> Self {
        tracing::error!(error = %error, "internal error");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = Json(ErrorResponse {
            success: false,
            code: status.as_u16(),
            message: self.message,
        });
        (status, body).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    code: u16,
    message: String,
}

/// Success envelope shared by every handler.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub code: u16,
    pub message: String,
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self::with_status(StatusCode::OK, "ok", data)
    }

    pub fn with_status(status: StatusCode, message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            code: status.as_u16(),
            message: message.into(),
            data,
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.code).unwrap_or(StatusCode::OK);
        (status, Json(self)).into_response()
    }
}

impl From<DispatchError> for AppError {
    fn from(value: DispatchError) -> Self {
        match value.kind() {
            ErrorKind::Validation => AppError::unprocessable(value.to_string()),
            ErrorKind::NotFound => AppError::new(StatusCode::NOT_FOUND, value.to_string()),
            ErrorKind::Conflict => AppError::new(StatusCode::CONFLICT, value.to_string()),
            ErrorKind::Forbidden => AppError::forbidden(value.to_string()),
            ErrorKind::Internal => AppError::internal(value),
        }
    }
}

impl From<diesel::result::Error> for AppError {
    fn from(value: diesel::result::Error) -> Self {
        match value {
            diesel::result::Error::NotFound => AppError::not_found(),
            _ => AppError::internal(value),
        }
    }
}

impl From<jsonwebtoken::errors::Error> for AppError {
    fn from(value: jsonwebtoken::errors::Error) -> Self {
        AppError::internal(value)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        AppError::internal(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_errors_map_to_distinct_statuses() {
        let cases = [
            (
                DispatchError::validation("bad phone"),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (DispatchError::NotFound("record"), StatusCode::NOT_FOUND),
            (DispatchError::AlreadyClaimed, StatusCode::CONFLICT),
            (DispatchError::CannotClaimOwnRecord, StatusCode::CONFLICT),
            (DispatchError::NotPermitted, StatusCode::FORBIDDEN),
            (
                DispatchError::Pool("gone".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, status) in cases {
            assert_eq!(AppError::from(error).status(), status);
        }
    }

    #[test]
    fn internal_errors_do_not_leak_details() {
        let error = AppError::from(DispatchError::Pool("password=hunter2".into()));
        assert_eq!(error.message(), "internal server error");
    }

    #[test]
    fn conflict_messages_explain_the_failure() {
        let error = AppError::from(DispatchError::NotClaimedYet);
        assert!(error.message().contains("claimed before"));
    }
}
