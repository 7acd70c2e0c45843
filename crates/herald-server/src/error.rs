//! Request errors and their HTTP mapping.

use crate::metrics;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use herald_core::ConnectionError;
use herald_protocol::TokenError;
use thiserror::Error;
use tracing::{debug, error};

/// Errors a gateway request can end with.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Token missing, forged, tampered with or of the wrong kind.
    #[error("invalid token")]
    InvalidToken,

    /// Token authentic but past its lifetime.
    #[error("token expired")]
    ExpiredToken,

    /// The connection manager refused the subscription.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Submission carries more events than allowed.
    #[error("Too many events: {count} (max {max})")]
    TooManyEvents {
        /// Events submitted.
        count: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Topic list in a query could not be used.
    #[error("Bad topics: {0}")]
    BadTopics(String),

    /// Token issuing is not permitted for this topic.
    #[error("Topic not allowed: {0}")]
    TopicNotAllowed(String),

    /// Token issuing is switched off.
    #[error("Not found")]
    IssuerDisabled,

    /// Anything else.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<TokenError> for GatewayError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Expired => GatewayError::ExpiredToken,
            TokenError::Invalid => GatewayError::InvalidToken,
            other => GatewayError::Internal(other.to_string()),
        }
    }
}

impl GatewayError {
    /// HTTP status for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidToken | GatewayError::ExpiredToken => StatusCode::UNAUTHORIZED,
            GatewayError::Connection(ConnectionError::TooManyConnections) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::Connection(_)
            | GatewayError::TooManyEvents { .. }
            | GatewayError::BadTopics(_) => StatusCode::BAD_REQUEST,
            GatewayError::TopicNotAllowed(_) => StatusCode::FORBIDDEN,
            GatewayError::IssuerDisabled => StatusCode::NOT_FOUND,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            GatewayError::InvalidToken => "invalid_token",
            GatewayError::ExpiredToken => "expired_token",
            GatewayError::Connection(ConnectionError::TooManyConnections) => "capacity",
            GatewayError::Connection(_) => "bad_subscription",
            GatewayError::TooManyEvents { .. } => "too_many_events",
            GatewayError::BadTopics(_) => "bad_topics",
            GatewayError::TopicNotAllowed(_) => "topic_not_allowed",
            GatewayError::IssuerDisabled => "issuer_disabled",
            GatewayError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();

        match &self {
            GatewayError::InvalidToken | GatewayError::ExpiredToken => {
                metrics::record_token_rejected(self.kind());
            }
            _ => metrics::record_error(self.kind()),
        }

        if let GatewayError::Internal(_) = self {
            error!(error = %self, "Request failed");
        } else {
            debug!(error = %self, status = status.as_u16(), "Request rejected");
        }

        // Token failures share one body so callers cannot tell them apart.
        let body = match self {
            GatewayError::InvalidToken | GatewayError::ExpiredToken => "Unauthorized".to_string(),
            GatewayError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };

        (status, body).into_response()
    }
}
