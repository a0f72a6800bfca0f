// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared logout action for unrecoverable authentication failures.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::credential::CredentialStore;

/// Why the session was ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutReason {
    /// Token renewal failed.
    RenewalFailed,
    /// The backend rejected the credential outright (not an expiry).
    Rejected,
    /// The push channel exhausted its reconnect attempts.
    ReconnectExhausted,
}

impl LogoutReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RenewalFailed => "renewal_failed",
            Self::Rejected => "rejected",
            Self::ReconnectExhausted => "reconnect_exhausted",
        }
    }
}

impl fmt::Display for LogoutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type LogoutAction = Box<dyn Fn(LogoutReason) + Send + Sync>;

/// Clears credentials and runs the logout action at most once per session.
///
/// A session is one installed token; after the trigger fires it stays
/// disarmed until the store installs a new token.
pub struct LogoutTrigger {
    store: Arc<CredentialStore>,
    fired_generation: Mutex<Option<u64>>,
    action: Option<LogoutAction>,
}

impl LogoutTrigger {
    /// Trigger with no external action (credentials are still cleared).
    pub fn new(store: Arc<CredentialStore>) -> Arc<Self> {
        Arc::new(Self { store, fired_generation: Mutex::new(None), action: None })
    }

    /// Trigger that also invokes `action` (e.g. redirect to a login view).
    pub fn with_action(
        store: Arc<CredentialStore>,
        action: impl Fn(LogoutReason) + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self { store, fired_generation: Mutex::new(None), action: Some(Box::new(action)) })
    }

    /// Fire the logout. Returns `false` when this session was already logged out.
    pub fn fire(&self, reason: LogoutReason) -> bool {
        let generation = self.store.generation();
        {
            let mut fired = self.fired_generation.lock();
            if *fired == Some(generation) {
                return false;
            }
            *fired = Some(generation);
        }

        tracing::warn!(reason = %reason, "session ended, logging out");
        self.store.clear();
        if let Some(ref action) = self.action {
            action(reason);
        }
        true
    }
}

#[cfg(test)]
#[path = "logout_tests.rs"]
mod tests;
