// SPDX-License-Identifier: GPL-3.0-or-later

use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

use crate::models::QuotaTelemetry;

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Every way a pipeline call can end other than a successful response.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The limiter's wait queue was full; nothing was sent.
    #[error("rate limiter queue is full")]
    LimiterRejected,

    /// The caller cancelled while queued for a permit.
    #[error("cancelled while waiting for a rate limit permit")]
    LimiterCancelled,

    /// The caller cancelled while the request was in flight.
    #[error("request cancelled")]
    Cancelled,

    /// Network-level failure or a non-success status other than 429.
    #[error("transport fault: {cause}")]
    Transport {
        cause: String,
        status: Option<StatusCode>,
    },

    /// The remote service answered 429.
    #[error("rate limited by remote service ({quota})")]
    Throttled {
        retry_after: Option<Duration>,
        quota: QuotaTelemetry,
    },

    /// The request was refused locally before reaching the network.
    #[error("validation fault: {0}")]
    Validation(String),

    /// A successful response body was not the JSON document we expected.
    #[error("failed to decode response body: {0}")]
    Decode(#[from] serde_json::Error),
}

impl GatewayError {
    pub(crate) fn unexpected_status(status: StatusCode) -> Self {
        GatewayError::Transport {
            cause: format!("unexpected status {}", status.as_u16()),
            status: Some(status),
        }
    }

    /// HTTP status that produced this error, if any.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            GatewayError::Transport { status, .. } => *status,
            GatewayError::Throttled { .. } => Some(StatusCode::TOO_MANY_REQUESTS),
            _ => None,
        }
    }
}

/// Failure reported by an [`HttpTransport`](crate::transport::HttpTransport).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("HTTP request failed: {0}")]
    Request(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            TransportError::Timeout
        } else if error.is_connect() {
            TransportError::Connect(error.to_string())
        } else {
            TransportError::Request(error.to_string())
        }
    }
}

impl From<TransportError> for GatewayError {
    fn from(error: TransportError) -> Self {
        GatewayError::Transport {
            cause: error.to_string(),
            status: None,
        }
    }
}

/// Invalid limiter configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BudgetError {
    #[error("permits_per_window must be at least 1")]
    NoPermits,

    #[error("window duration must be greater than zero")]
    EmptyWindow,
}
