// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Response classification.
//!
//! The backend wraps every payload in `{ success, code, message, data }`.
//! Transport status and the body's business discriminant are both checked: a
//! 200 carrying `success: false` is still a failure.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TransportError;

/// String code the backend uses on a 401 when the access token has expired.
pub const TOKEN_EXPIRED: &str = "TOKEN_EXPIRED";

/// Response envelope consumed from the backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub code: Option<ResponseCode>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

/// Business code; numeric on most endpoints, a string on auth failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseCode {
    Number(i64),
    Text(String),
}

impl ResponseEnvelope {
    fn is_success(&self) -> bool {
        self.success == Some(true)
            || matches!(self.code, Some(ResponseCode::Number(0) | ResponseCode::Number(200)))
    }

    fn has_discriminant(&self) -> bool {
        self.success.is_some() || self.code.is_some()
    }

    fn signals_expiry(&self, expired_code: i64) -> bool {
        match self.code {
            Some(ResponseCode::Text(ref s)) => s == TOKEN_EXPIRED,
            Some(ResponseCode::Number(n)) => n == expired_code,
            None => false,
        }
    }
}

/// Outcome of classifying one response.
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    /// The envelope's `data` (`null` when absent or the body was empty).
    Success(Value),
    /// The access token has expired; renewal may recover the call.
    CredentialExpired(Option<String>),
    Failure(TransportError),
}

/// Classify a response from its status code and raw body.
pub fn classify(status: u16, body: &[u8], expired_code: i64) -> Classified {
    let envelope = parse_envelope(body);
    let message = envelope
        .as_ref()
        .and_then(|e| e.message.clone())
        .filter(|m| !m.is_empty());

    match status {
        200..=299 => classify_success(body, envelope),
        401 => {
            if envelope.as_ref().is_some_and(|e| e.signals_expiry(expired_code)) {
                Classified::CredentialExpired(message)
            } else {
                Classified::Failure(TransportError::AuthenticationFailed(
                    message.unwrap_or_else(|| "credential rejected".to_owned()),
                ))
            }
        }
        403 => Classified::Failure(TransportError::Forbidden(message)),
        404 => Classified::Failure(TransportError::NotFound(message)),
        500 => Classified::Failure(TransportError::ServerError(message)),
        502..=504 => Classified::Failure(TransportError::ServiceUnavailable { status, message }),
        _ => Classified::Failure(TransportError::Unclassified { status, message }),
    }
}

fn classify_success(body: &[u8], envelope: Option<ResponseEnvelope>) -> Classified {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Classified::Success(Value::Null);
    }
    match envelope {
        Some(env) if env.is_success() => Classified::Success(env.data.unwrap_or(Value::Null)),
        Some(env) if env.has_discriminant() => Classified::Failure(TransportError::BusinessError(
            env.message.filter(|m| !m.is_empty()).unwrap_or_else(|| "request failed".to_owned()),
        )),
        _ => Classified::Failure(TransportError::InvalidResponse(
            "malformed response envelope".to_owned(),
        )),
    }
}

fn parse_envelope(body: &[u8]) -> Option<ResponseEnvelope> {
    serde_json::from_slice::<ResponseEnvelope>(body).ok()
}

#[cfg(test)]
#[path = "classify_tests.rs"]
mod tests;
