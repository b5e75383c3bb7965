//! Error envelope shared by every head route.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;

use super::config::ConfigError;
use super::registry::AuthError;

/// An error answered as `{"status", "source", "title", "detail"}`.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
    source: String,
}

#[derive(Serialize)]
struct Envelope<'a> {
    status: u16,
    source: &'a str,
    title: &'a str,
    detail: &'a str,
}

impl ApiError {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
            source: String::new(),
        }
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail)
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, detail)
    }

    pub fn unavailable(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, detail)
    }

    /// Attach the request path the error refers to.
    pub fn at(mut self, path: &str) -> Self {
        self.source = path.to_string();
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Envelope {
            status: self.status.as_u16(),
            source: &self.source,
            title: self.status.canonical_reason().unwrap_or("Error"),
            detail: &self.detail,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        let status = match err {
            AuthError::UnknownSatellite(_) => StatusCode::NOT_FOUND,
            AuthError::BadSecret => StatusCode::FORBIDDEN,
            AuthError::Inactive(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self::new(status, err.to_string())
    }
}

impl From<ConfigError> for ApiError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Io { .. } => {
                tracing::error!("Configuration I/O failed: {}", err);
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
            ConfigError::Parse(_) | ConfigError::Invalid(_) => Self::bad_request(err.to_string()),
        }
    }
}
