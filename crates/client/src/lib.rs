// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Dashlink: resilient transport for the operations dashboard.
//!
//! An authenticated request client with single-flight token renewal, and a
//! realtime push channel with heartbeat, bounded reconnect and a typed event
//! dispatcher. Both share one credential store and one logout trigger.

pub mod auth;
pub mod channel;
pub mod cli;
pub mod config;
pub mod credential;
pub mod dispatch;
pub mod error;
pub mod request;
pub mod test_support;

use std::sync::{Arc, Once};
use std::time::Duration;

use crate::auth::AuthApi;
use crate::channel::EventChannel;
use crate::config::ClientConfig;
use crate::credential::logout::{LogoutReason, LogoutTrigger};
use crate::credential::refresh::HttpRenewer;
use crate::credential::renewal::RenewalGate;
use crate::credential::CredentialStore;
use crate::dispatch::EventDispatcher;
use crate::request::RequestClient;

pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

static CRYPTO_INIT: Once = Once::new();

/// Install the ring crypto provider for reqwest/rustls.
/// Safe to call multiple times; only the first call has effect.
pub fn ensure_crypto() {
    CRYPTO_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Shared reqwest client constructor.
pub(crate) fn http_client(timeout: Option<Duration>) -> reqwest::Client {
    ensure_crypto();
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    match builder.build() {
        Ok(client) => client,
        Err(e) => {
            tracing::warn!(err = %e, "http client build failed, using defaults");
            reqwest::Client::new()
        }
    }
}

/// The full transport layer wired around one credential store.
pub struct Transport {
    pub store: Arc<CredentialStore>,
    pub renewal: Arc<RenewalGate>,
    pub logout: Arc<LogoutTrigger>,
    pub requests: Arc<RequestClient>,
    pub auth: AuthApi,
    pub dispatcher: Arc<EventDispatcher>,
    pub channel: EventChannel,
}

impl Transport {
    /// Wire every component. `on_logout` runs when the session ends for an
    /// unrecoverable reason (at most once per installed token).
    pub fn new(
        config: &ClientConfig,
        store: Arc<CredentialStore>,
        on_logout: impl Fn(LogoutReason) + Send + Sync + 'static,
    ) -> Self {
        let logout = LogoutTrigger::with_action(Arc::clone(&store), on_logout);
        let renewer =
            HttpRenewer::new(&config.base_url, config.request_timeout(), config.expired_code);
        let renewal = RenewalGate::new(Arc::clone(&store), Arc::new(renewer));
        let requests = Arc::new(RequestClient::new(
            config,
            Arc::clone(&store),
            Arc::clone(&renewal),
            Arc::clone(&logout),
        ));
        let dispatcher = EventDispatcher::new();
        let channel = EventChannel::new(
            config,
            Arc::clone(&store),
            Arc::clone(&dispatcher),
            Arc::clone(&logout),
        );
        Self {
            auth: AuthApi::new(Arc::clone(&requests)),
            store,
            renewal,
            logout,
            requests,
            dispatcher,
            channel,
        }
    }
}
