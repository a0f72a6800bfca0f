// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Token renewal network call.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::Deserialize;

use crate::credential::Token;
use crate::error::AuthError;
use crate::request::classify::{classify, Classified};

/// Performs one renewal call. No retries: the renewal gate owns the policy.
pub trait TokenRenewer: Send + Sync + 'static {
    fn renew<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Token, AuthError>> + Send + 'a>>;
}

/// `data` payload of the login and refresh endpoints.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenGrant {
    pub token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Lifetime in seconds.
    #[serde(default)]
    pub expires_in: Option<u64>,
}

impl TokenGrant {
    /// Build a token, keeping `previous_refresh` when the grant did not rotate it.
    pub fn into_token(self, previous_refresh: &str) -> Token {
        let refresh = self.refresh_token.unwrap_or_else(|| previous_refresh.to_owned());
        Token::new(self.token, refresh).expiring_in(self.expires_in)
    }
}

/// Renews against `POST {base}/auth/refresh`.
pub struct HttpRenewer {
    http: reqwest::Client,
    url: String,
    expired_code: i64,
}

impl HttpRenewer {
    pub fn new(base_url: &str, timeout: Duration, expired_code: i64) -> Self {
        let http = crate::http_client(Some(timeout));
        Self { http, url: format!("{}/auth/refresh", base_url.trim_end_matches('/')), expired_code }
    }

    async fn do_refresh(&self, refresh_token: &str) -> Result<Token, AuthError> {
        let resp = self
            .http
            .post(&self.url)
            .json(&serde_json::json!({ "refreshToken": refresh_token }))
            .send()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;

        let status = resp.status().as_u16();
        let body = resp.bytes().await.map_err(|e| AuthError::Network(e.to_string()))?;

        let data = match classify(status, &body, self.expired_code) {
            Classified::Success(data) => data,
            Classified::CredentialExpired(message) => {
                return Err(AuthError::Rejected(message.unwrap_or_else(|| "refresh token expired".into())))
            }
            Classified::Failure(e) => return Err(AuthError::Rejected(e.to_string())),
        };

        let grant: TokenGrant = serde_json::from_value(data)
            .map_err(|e| AuthError::Rejected(format!("unexpected refresh payload: {e}")))?;
        Ok(grant.into_token(refresh_token))
    }
}

impl TokenRenewer for HttpRenewer {
    fn renew<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Token, AuthError>> + Send + 'a>> {
        Box::pin(self.do_refresh(refresh_token))
    }
}
