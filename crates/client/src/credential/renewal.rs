// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Single-flight token renewal.
//!
//! However many requests fail with an expired token at once, at most one
//! renewal call is in flight per gate. Callers arriving while a renewal runs
//! are queued and all receive its single outcome.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::credential::refresh::TokenRenewer;
use crate::credential::{CredentialStore, Token};
use crate::error::AuthError;

type Outcome = Result<Arc<Token>, AuthError>;

/// Gate state. Never held across an await.
enum RenewalState {
    Idle,
    InFlight(Vec<oneshot::Sender<Outcome>>),
}

pub struct RenewalGate {
    store: Arc<CredentialStore>,
    renewer: Arc<dyn TokenRenewer>,
    state: Mutex<RenewalState>,
    started: AtomicU64,
}

impl RenewalGate {
    pub fn new(store: Arc<CredentialStore>, renewer: Arc<dyn TokenRenewer>) -> Arc<Self> {
        Arc::new(Self {
            store,
            renewer,
            state: Mutex::new(RenewalState::Idle),
            started: AtomicU64::new(0),
        })
    }

    /// Number of renewals started by this gate.
    #[cfg(test)]
    pub(crate) fn renewals_started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn is_in_flight(&self) -> bool {
        matches!(*self.state.lock(), RenewalState::InFlight(_))
    }

    /// Obtain a renewed token.
    ///
    /// `stale_access` is the access token the failed request carried. If the
    /// store already holds a different one, a renewal finished after that
    /// request was sent and its token is returned without a new call.
    pub async fn renew(self: &Arc<Self>, stale_access: Option<&str>) -> Outcome {
        let rx = {
            let mut state = self.state.lock();
            match *state {
                RenewalState::InFlight(ref mut waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    tracing::debug!(queued = waiters.len(), "joined in-flight token renewal");
                    rx
                }
                RenewalState::Idle => {
                    if let Some(current) = self.store.current() {
                        if stale_access != Some(current.access.as_str()) {
                            return Ok(current);
                        }
                    }
                    let (tx, rx) = oneshot::channel();
                    *state = RenewalState::InFlight(vec![tx]);
                    self.started.fetch_add(1, Ordering::Relaxed);

                    // Detached so a cancelled caller cannot strand the waiters.
                    let gate = Arc::clone(self);
                    tokio::spawn(async move { gate.run_renewal().await });
                    rx
                }
            }
        };
        rx.await.unwrap_or(Err(AuthError::Abandoned))
    }

    async fn run_renewal(&self) {
        let outcome = self.perform().await;
        let waiters = match std::mem::replace(&mut *self.state.lock(), RenewalState::Idle) {
            RenewalState::InFlight(waiters) => waiters,
            RenewalState::Idle => Vec::new(),
        };
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    async fn perform(&self) -> Outcome {
        let refresh = match self.store.current() {
            Some(token) if !token.refresh.is_empty() => token.refresh.clone(),
            _ => {
                self.store.clear();
                return Err(AuthError::MissingRefreshToken);
            }
        };

        match self.renewer.renew(&refresh).await {
            Ok(token) => {
                let token = self.store.install(token);
                tracing::info!("access token renewed");
                Ok(token)
            }
            Err(e) => {
                tracing::warn!(err = %e, "token renewal failed, clearing credentials");
                self.store.clear();
                Err(e)
            }
        }
    }
}

#[cfg(test)]
#[path = "renewal_tests.rs"]
mod tests;
