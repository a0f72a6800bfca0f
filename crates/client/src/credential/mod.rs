// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Credential store: the current access/refresh token pair.
//!
//! The store is an injectable service object shared by `Arc` between the
//! request client and the event channel. Readers take an `Arc<Token>`
//! snapshot for the duration of one call; a renewal swaps the whole pair at
//! once so a reader never observes a half-updated token.

pub mod logout;
pub mod persist;
pub mod refresh;
pub mod renewal;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::auth::User;
use crate::epoch_ms;

/// An access/refresh token pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub access: String,
    pub refresh: String,
    /// Expiry as epoch millis, when the backend reported one.
    pub expires_at: Option<u64>,
}

impl Token {
    pub fn new(access: impl Into<String>, refresh: impl Into<String>) -> Self {
        Self { access: access.into(), refresh: refresh.into(), expires_at: None }
    }

    /// Set the expiry from a relative lifetime in seconds.
    pub fn expiring_in(mut self, secs: Option<u64>) -> Self {
        self.expires_at = secs.map(|s| epoch_ms() + s * 1000);
        self
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= epoch_ms())
    }
}

/// Holds the current token. Owned by the application, borrowed by transports.
#[derive(Debug, Default)]
pub struct CredentialStore {
    token: RwLock<Option<Arc<Token>>>,
    /// Profile of the logged-in user, when login reported one.
    user: RwLock<Option<User>>,
    /// Bumped on every install; lets the logout trigger tell sessions apart.
    generation: AtomicU64,
    persist_path: Option<PathBuf>,
}

impl CredentialStore {
    /// In-memory store with no token.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// In-memory store seeded with `token`.
    pub fn with_token(token: Token) -> Arc<Self> {
        let store = Self::default();
        *store.token.write() = Some(Arc::new(token));
        store.generation.store(1, Ordering::Release);
        Arc::new(store)
    }

    /// Store backed by a JSON file. Loads an existing file if present,
    /// restoring the user profile saved with the token.
    pub fn persistent(path: PathBuf) -> Arc<Self> {
        let loaded = match persist::load(&path) {
            Ok(loaded) => loaded,
            Err(e) => {
                tracing::warn!(path = %path.display(), err = %e, "ignoring unreadable credentials file");
                None
            }
        };
        let generation = u64::from(loaded.is_some());
        let (token, user) = match loaded {
            Some(p) => (Some(Arc::new(p.token())), p.user),
            None => (None, None),
        };
        Arc::new(Self {
            token: RwLock::new(token),
            user: RwLock::new(user),
            generation: AtomicU64::new(generation),
            persist_path: Some(path),
        })
    }

    /// Snapshot of the current token.
    pub fn current(&self) -> Option<Arc<Token>> {
        self.token.read().clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.token.read().as_ref().map(|t| t.access.clone())
    }

    pub fn is_logged_in(&self) -> bool {
        self.token.read().is_some()
    }

    /// Profile of the logged-in user, if known.
    pub fn user(&self) -> Option<User> {
        self.user.read().clone()
    }

    /// Number of tokens installed so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Replace the token pair atomically and persist it. The stored profile
    /// is kept: a renewal does not change who is logged in.
    pub fn install(&self, token: Token) -> Arc<Token> {
        let token = Arc::new(token);
        {
            let mut guard = self.token.write();
            *guard = Some(Arc::clone(&token));
            self.generation.fetch_add(1, Ordering::AcqRel);
        }
        self.persist(&token);
        token
    }

    /// Start a new session: install `token` and replace the profile.
    pub fn install_session(&self, token: Token, user: Option<User>) -> Arc<Token> {
        *self.user.write() = user;
        self.install(token)
    }

    /// Update the profile of the current session. Ignored when logged out.
    pub fn set_user(&self, user: User) {
        let Some(token) = self.current() else {
            return;
        };
        *self.user.write() = Some(user);
        self.persist(&token);
    }

    /// Drop the token pair and profile. Safe to call when already empty.
    pub fn clear(&self) {
        let had_token = self.token.write().take().is_some();
        self.user.write().take();
        if let Some(ref path) = self.persist_path {
            if let Err(e) = persist::remove(path) {
                tracing::warn!(path = %path.display(), err = %e, "failed to remove credentials file");
            }
        }
        if had_token {
            tracing::debug!("credentials cleared");
        }
    }

    fn persist(&self, token: &Token) {
        if let Some(ref path) = self.persist_path {
            let user = self.user.read().clone();
            if let Err(e) = persist::save(path, token, user.as_ref()) {
                tracing::warn!(path = %path.display(), err = %e, "failed to persist credentials");
            }
        }
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
