// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use thiserror::Error;

/// Failures surfaced by the request client.
///
/// Server-supplied messages are carried through when the response body had
/// one; the presentation layer decides how to render them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),
    #[error("request timed out")]
    Timeout,
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("forbidden: {}", detail(.0, "no permission to access this resource"))]
    Forbidden(Option<String>),
    #[error("not found: {}", detail(.0, "requested resource does not exist"))]
    NotFound(Option<String>),
    #[error("server error: {}", detail(.0, "internal server error"))]
    ServerError(Option<String>),
    #[error("service unavailable ({status}): {}", detail(.message, "try again later"))]
    ServiceUnavailable { status: u16, message: Option<String> },
    #[error("{0}")]
    BusinessError(String),
    #[error("request failed ({status}): {}", detail(.message, "unclassified response"))]
    Unclassified { status: u16, message: Option<String> },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl TransportError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkUnavailable(_) => "NETWORK_UNAVAILABLE",
            Self::Timeout => "TIMEOUT",
            Self::AuthenticationFailed(_) => "AUTHENTICATION_FAILED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::ServerError(_) => "SERVER_ERROR",
            Self::ServiceUnavailable { .. } => "SERVICE_UNAVAILABLE",
            Self::BusinessError(_) => "BUSINESS_ERROR",
            Self::Unclassified { .. } => "UNCLASSIFIED",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::InvalidResponse(_) => "INVALID_RESPONSE",
        }
    }

    /// HTTP status this error was classified from, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Forbidden(_) => Some(403),
            Self::NotFound(_) => Some(404),
            Self::ServerError(_) => Some(500),
            Self::ServiceUnavailable { status, .. } | Self::Unclassified { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }
}

impl From<AuthError> for TransportError {
    fn from(e: AuthError) -> Self {
        Self::AuthenticationFailed(e.to_string())
    }
}

/// Failures of the push channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("reconnect gave up after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("channel closed")]
    Closed,
}

impl ChannelError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectFailed(_) => "CONNECT_FAILED",
            Self::ReconnectExhausted { .. } => "RECONNECT_EXHAUSTED",
            Self::MalformedFrame(_) => "MALFORMED_FRAME",
            Self::Closed => "CLOSED",
        }
    }
}

/// Failures of token renewal. Cloned to every waiter of a shared renewal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("no refresh token stored")]
    MissingRefreshToken,
    #[error("renewal rejected: {0}")]
    Rejected(String),
    #[error("renewal request failed: {0}")]
    Network(String),
    #[error("renewal abandoned before completion")]
    Abandoned,
}

fn detail<'a>(message: &'a Option<String>, fallback: &'a str) -> &'a str {
    message.as_deref().filter(|m| !m.is_empty()).unwrap_or(fallback)
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
