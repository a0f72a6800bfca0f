// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session endpoints: login, logout, current user, captcha.

use std::sync::Arc;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::credential::refresh::TokenGrant;
use crate::error::TransportError;
use crate::request::{ApiRequest, RequestClient};

/// Dashboard user profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

fn default_role() -> String {
    "USER".to_owned()
}

impl User {
    /// Name to show: full name when known, else the username.
    pub fn display_name(&self) -> &str {
        self.full_name.as_deref().filter(|n| !n.is_empty()).unwrap_or(&self.username)
    }
}

/// Login challenge from `GET /auth/captcha`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Captcha {
    pub captcha_id: String,
    /// Image as the backend encodes it (usually a `data:` URL).
    pub captcha_image: String,
}

/// `data` payload of `POST /auth/login`.
#[derive(Debug, Deserialize)]
struct LoginGrant {
    #[serde(flatten)]
    grant: TokenGrant,
    #[serde(default)]
    user: Option<User>,
}

pub struct AuthApi {
    client: Arc<RequestClient>,
}

impl AuthApi {
    pub fn new(client: Arc<RequestClient>) -> Self {
        Self { client }
    }

    /// Exchange credentials for a token pair and install it.
    ///
    /// Sent without a bearer token; a rejected login never ends an existing
    /// session.
    pub async fn login(&self, username: &str, password: &str) -> Result<Option<User>, TransportError> {
        self.login_with_captcha(username, password, None).await
    }

    /// [`login`](Self::login) answering a challenge from [`captcha`](Self::captcha).
    pub async fn login_with_captcha(
        &self,
        username: &str,
        password: &str,
        captcha: Option<&str>,
    ) -> Result<Option<User>, TransportError> {
        let mut body = json!({ "username": username, "password": password });
        if let Some(captcha) = captcha {
            body["captcha"] = json!(captcha);
        }
        let request = ApiRequest::post("/auth/login", body).anonymous();
        let login: LoginGrant = self.client.call_json(request).await?;
        self.client.store().install_session(login.grant.into_token(""), login.user.clone());
        tracing::info!(username, "logged in");
        Ok(login.user)
    }

    /// Fetch a login challenge. Public endpoint.
    pub async fn captcha(&self) -> Result<Captcha, TransportError> {
        self.client.call_json(ApiRequest::get("/auth/captcha").anonymous()).await
    }

    /// Tell the backend the session ended, then clear credentials
    /// regardless of the outcome.
    pub async fn logout(&self) {
        if self.client.store().is_logged_in() {
            if let Err(e) = self.client.call(ApiRequest::new(Method::POST, "/auth/logout")).await {
                tracing::warn!(err = %e, code = e.as_str(), "logout request failed");
            }
        }
        self.client.store().clear();
        tracing::info!("logged out");
    }

    /// Fetch the profile and remember it for the current session.
    pub async fn current_user(&self) -> Result<User, TransportError> {
        let user: User = self.client.call_json(ApiRequest::get("/auth/user")).await?;
        self.client.store().set_user(user.clone());
        Ok(user)
    }

    pub async fn change_password(
        &self,
        old_password: &str,
        new_password: &str,
    ) -> Result<(), TransportError> {
        let body = json!({ "oldPassword": old_password, "newPassword": new_password });
        self.client.post("/auth/change-password", body).await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
