//! HTTP-facing error model.
//! Domain errors (`SignInError`, `SessionError`) are mapped here into a code,
//! a message and a status, and rendered as a small JSON body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use crate::identity::SessionError;
use crate::users::SignInError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppError {
    UserInput { code: String, message: String },
    Auth { code: String, message: String },
    Forbidden { code: String, message: String },
    Io { code: String, message: String },
    Internal { code: String, message: String },
}

impl AppError {
    pub fn code_str(&self) -> &str {
        match self {
            AppError::UserInput { code, .. }
            | AppError::Auth { code, .. }
            | AppError::Forbidden { code, .. }
            | AppError::Io { code, .. }
            | AppError::Internal { code, .. } => code.as_str(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            AppError::UserInput { message, .. }
            | AppError::Auth { message, .. }
            | AppError::Forbidden { message, .. }
            | AppError::Io { message, .. }
            | AppError::Internal { message, .. } => message.as_str(),
        }
    }

    pub fn user<S: Into<String>>(code: S, msg: S) -> Self { AppError::UserInput { code: code.into(), message: msg.into() } }
    pub fn auth<S: Into<String>>(code: S, msg: S) -> Self { AppError::Auth { code: code.into(), message: msg.into() } }
    pub fn forbidden<S: Into<String>>(code: S, msg: S) -> Self { AppError::Forbidden { code: code.into(), message: msg.into() } }
    pub fn io<S: Into<String>>(code: S, msg: S) -> Self { AppError::Io { code: code.into(), message: msg.into() } }
    pub fn internal<S: Into<String>>(code: S, msg: S) -> Self { AppError::Internal { code: code.into(), message: msg.into() } }

    /// Map to HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            AppError::UserInput { .. } => 400,
            AppError::Auth { .. } => 401,
            AppError::Forbidden { .. } => 403,
            AppError::Io { .. } => 503,
            AppError::Internal { .. } => 500,
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code_str(), self.message())
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

impl From<SignInError> for AppError {
    fn from(err: SignInError) -> Self {
        let code = err.codes().join(",");
        match err {
            SignInError::IncorrectPassword => AppError::forbidden(code, err.to_string()),
            _ => AppError::user(code, err.to_string()),
        }
    }
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        let message = err.to_string();
        match err {
            SessionError::InvalidToken => AppError::auth("INVALID_SESSION".to_string(), message),
            _ if err.is_retryable() => AppError::io("SESSION_STORAGE_UNAVAILABLE".to_string(), message),
            _ => AppError::internal("SESSION_ERROR".to_string(), message),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(code = self.code_str(), error = %self.message(), "request failed");
        }
        let body = serde_json::json!({"status": "error", "code": self.code_str(), "error": self.message()});
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_mapping() {
        assert_eq!(AppError::user("bad_input", "oops").http_status(), 400);
        assert_eq!(AppError::auth("auth", "no").http_status(), 401);
        assert_eq!(AppError::forbidden("forbidden", "no").http_status(), 403);
        assert_eq!(AppError::io("io", "io").http_status(), 503);
        assert_eq!(AppError::internal("internal", "panic").http_status(), 500);
    }

    #[test]
    fn sign_in_errors_map_like_the_web_layer_expects() {
        let e = AppError::from(SignInError::IncorrectPassword);
        assert_eq!(e.http_status(), 403);
        assert_eq!(e.code_str(), "INCORRECT_USER_PASSWORD");

        let e = AppError::from(SignInError::UserDoesNotExist);
        assert_eq!(e.http_status(), 400);

        let e = AppError::from(SignInError::InvalidInput(vec!["INVALID_USER_NAME", "INVALID_USER_PASSWORD"]));
        assert_eq!(e.code_str(), "INVALID_USER_NAME,INVALID_USER_PASSWORD");
    }

    #[test]
    fn storage_failures_are_service_unavailable() {
        let e = AppError::from(SessionError::Timeout(std::time::Duration::from_millis(5)));
        assert_eq!(e.http_status(), 503);
        assert_eq!(AppError::from(SessionError::InvalidToken).http_status(), 401);
        assert_eq!(AppError::from(SessionError::Entropy("x".into())).http_status(), 500);
    }
}
