// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Realtime push channel.
//!
//! One logical WebSocket connection owned by a spawned driver task. The
//! driver is the only writer of state transitions, except that
//! [`EventChannel::disconnect`] publishes `Closed` directly; the driver never
//! overwrites `Closed`.

mod driver;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::credential::logout::LogoutTrigger;
use crate::credential::CredentialStore;
use crate::dispatch::EventDispatcher;
use crate::error::ChannelError;

/// Lifecycle state of the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal.
    Closed,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection parameters resolved from [`ClientConfig`].
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub url: String,
    pub connect_timeout: Duration,
    pub heartbeat: Duration,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl ChannelSettings {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            url: config.push_url(),
            connect_timeout: config.connect_timeout(),
            heartbeat: config.heartbeat_interval(),
            reconnect_attempts: config.reconnect_attempts,
            reconnect_delay: config.reconnect_delay(),
        }
    }
}

type ErrorCallback = Arc<dyn Fn(&ChannelError) + Send + Sync>;

/// State shared between the channel handle and its driver task.
struct Shared {
    settings: ChannelSettings,
    store: Arc<CredentialStore>,
    dispatcher: Arc<EventDispatcher>,
    logout: Arc<LogoutTrigger>,
    on_error: Mutex<Option<ErrorCallback>>,
    state: watch::Sender<ChannelState>,
    cancel: CancellationToken,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
}

impl Shared {
    /// Publish `next` unless the channel is closed. Returns `false` when closed.
    fn set_state(&self, next: ChannelState) -> bool {
        let mut open = true;
        self.state.send_if_modified(|current| {
            if *current == ChannelState::Closed {
                open = false;
                return false;
            }
            if *current == next {
                return false;
            }
            tracing::debug!(from = %current, to = %next, "push channel state");
            *current = next;
            true
        });
        open
    }

    fn report(&self, err: &ChannelError) {
        let callback = self.on_error.lock().clone();
        if let Some(callback) = callback {
            callback(err);
        }
    }
}

/// Handle to the push channel.
pub struct EventChannel {
    shared: Arc<Shared>,
}

impl EventChannel {
    pub fn new(
        config: &ClientConfig,
        store: Arc<CredentialStore>,
        dispatcher: Arc<EventDispatcher>,
        logout: Arc<LogoutTrigger>,
    ) -> Self {
        Self::with_settings(ChannelSettings::from_config(config), store, dispatcher, logout)
    }

    pub fn with_settings(
        settings: ChannelSettings,
        store: Arc<CredentialStore>,
        dispatcher: Arc<EventDispatcher>,
        logout: Arc<LogoutTrigger>,
    ) -> Self {
        let (state, _) = watch::channel(ChannelState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                settings,
                store,
                dispatcher,
                logout,
                on_error: Mutex::new(None),
                state,
                cancel: CancellationToken::new(),
                outbound: Mutex::new(None),
            }),
        }
    }

    /// Install the callback that receives unrecoverable channel errors.
    pub fn on_error(&self, callback: impl Fn(&ChannelError) + Send + Sync + 'static) {
        *self.shared.on_error.lock() = Some(Arc::new(callback));
    }

    pub fn state(&self) -> ChannelState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.shared.state.subscribe()
    }

    /// Open the channel.
    ///
    /// Resolves immediately when already connecting, connected or
    /// reconnecting. A failed initial open leaves the channel `Disconnected`
    /// and is not retried.
    pub async fn connect(&self) -> Result<(), ChannelError> {
        let started = self.shared.state.send_if_modified(|s| {
            if *s == ChannelState::Disconnected {
                *s = ChannelState::Connecting;
                true
            } else {
                false
            }
        });
        if !started {
            return match self.state() {
                ChannelState::Closed => Err(ChannelError::Closed),
                _ => Ok(()),
            };
        }

        // The driver performs the open so a dropped caller cannot strand
        // the channel in `Connecting`.
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(driver::run(Arc::clone(&self.shared), ready_tx));
        ready_rx.await.unwrap_or(Err(ChannelError::Closed))
    }

    /// Close the channel for good. Safe from any state.
    pub fn disconnect(&self) {
        self.shared.cancel.cancel();
        self.shared.outbound.lock().take();
        let previous = self.shared.state.send_replace(ChannelState::Closed);
        if previous != ChannelState::Closed {
            tracing::info!(from = %previous, "push channel closed");
        }
    }

    /// Queue `payload` for sending. Only valid while connected; otherwise
    /// the payload is dropped. Returns whether it was queued.
    pub fn send<T: Serialize + ?Sized>(&self, payload: &T) -> bool {
        if self.state() != ChannelState::Connected {
            tracing::warn!(state = %self.state(), "push channel not connected, dropping outbound message");
            return false;
        }
        let text = match serde_json::to_string(payload) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(err = %e, "unserializable outbound message");
                return false;
            }
        };
        let sender = self.shared.outbound.lock().clone();
        let Some(tx) = sender else {
            return false;
        };
        match tx.try_send(text) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("push channel outbound queue full, dropping outbound message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!("push channel driver gone, dropping outbound message");
                false
            }
        }
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
