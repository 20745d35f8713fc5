//! Error taxonomy (§7). Every HTTP handler returns `Result<_, AppError>`;
//! `AppError` carries its own status code and a short machine-readable
//! reason so the boundary never needs a separate translation step.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use crcoach_protocol::ErrorBody;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("session full")]
    SessionFull,

    #[error("rate limited")]
    RateLimited,
}

impl AppError {
    pub fn reason(&self) -> String {
        match self {
            AppError::InvalidPayload(msg) => msg.clone(),
            AppError::NotFound(msg) => msg.clone(),
            AppError::SessionFull => "session at capacity".to_string(),
            AppError::RateLimited => "rate limit exceeded".to_string(),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::SessionFull => StatusCode::SERVICE_UNAVAILABLE,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            status: status.as_u16(),
            reason: self.reason(),
        };
        (status, Json(body)).into_response()
    }
}

/// WebSocket close code for `SessionFull` (§7: "WS close 1013").
pub const WS_CLOSE_SESSION_FULL: u16 = 1013;
/// WebSocket close code used when a broadcaster is replaced (last-writer-wins, §9).
pub const WS_CLOSE_REPLACED: u16 = 1000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_payload_maps_to_400() {
        let err = AppError::InvalidPayload("missing SOI".into());
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn not_found_maps_to_404() {
        assert_eq!(AppError::NotFound("no broadcast".into()).status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn session_full_maps_to_503() {
        assert_eq!(AppError::SessionFull.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn rate_limited_maps_to_429() {
        assert_eq!(AppError::RateLimited.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
