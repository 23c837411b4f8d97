//! Classified platform errors.
//!
//! Retry and reconnect policy dispatch on the error kind, so platform code
//! returns `ApiError` rather than an opaque `anyhow::Error`.

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("transient network error: {0}")]
    Transient(String),

    #[error("rate limited")]
    RateLimited,

    #[error("authentication expired")]
    AuthExpired,

    #[error("not found")]
    NotFound,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("cancelled")]
    Cancelled,
}

impl ApiError {
    /// Classify a non-success HTTP status
    pub fn from_status(status: StatusCode, context: &str) -> Self {
        match status.as_u16() {
            401 | 403 => Self::AuthExpired,
            404 => Self::NotFound,
            429 => Self::RateLimited,
            _ => Self::Transient(format!("{} returned {}", context, status)),
        }
    }

    /// Whether the generic retry helper should try again
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthExpired)
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return Self::Protocol(e.to_string());
        }
        match e.status() {
            Some(status) => Self::from_status(status, "request"),
            None => Self::Transient(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ApiError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match e {
            WsError::Http(response) => match StatusCode::from_u16(response.status().as_u16()) {
                Ok(status) => Self::from_status(status, "websocket upgrade"),
                Err(_) => Self::Transient(format!("websocket upgrade failed: {}", response.status())),
            },
            other => Self::Transient(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_http_statuses() {
        assert_eq!(
            ApiError::from_status(StatusCode::UNAUTHORIZED, "x"),
            ApiError::AuthExpired
        );
        assert_eq!(ApiError::from_status(StatusCode::NOT_FOUND, "x"), ApiError::NotFound);
        assert_eq!(
            ApiError::from_status(StatusCode::TOO_MANY_REQUESTS, "x"),
            ApiError::RateLimited
        );
        assert!(matches!(
            ApiError::from_status(StatusCode::BAD_GATEWAY, "x"),
            ApiError::Transient(_)
        ));
    }

    #[test]
    fn only_transient_and_rate_limit_retry() {
        assert!(ApiError::Transient("reset".into()).is_retryable());
        assert!(ApiError::RateLimited.is_retryable());
        assert!(!ApiError::AuthExpired.is_retryable());
        assert!(!ApiError::NotFound.is_retryable());
        assert!(!ApiError::Protocol("bad".into()).is_retryable());
    }
}
