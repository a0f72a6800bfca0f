// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed publish/subscribe registry for realtime events.
//!
//! Subscribers register per [`EventKind`] and are called synchronously, in
//! registration order, on the task that dispatches. The handler list is
//! snapshotted before fan-out so a handler may subscribe or unsubscribe
//! without deadlocking.

pub mod events;

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;

pub use events::{EventAction, EventKind, EventPayload, KindPayload, RealtimeEvent};

type Handler = Arc<dyn Fn(&RealtimeEvent) -> anyhow::Result<()> + Send + Sync>;

/// Opaque handle returned by [`EventDispatcher::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    kind: EventKind,
    id: u64,
}

impl SubscriptionHandle {
    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: HashMap<EventKind, Vec<(u64, Handler)>>,
}

#[derive(Default)]
pub struct EventDispatcher {
    registry: Mutex<Registry>,
}

impl EventDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `handler` for `kind`. An `Err` return is logged and does not
    /// affect other subscribers.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionHandle
    where
        F: Fn(&RealtimeEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock();
        registry.next_id += 1;
        let id = registry.next_id;
        registry.handlers.entry(kind).or_default().push((id, Arc::new(handler)));
        SubscriptionHandle { kind, id }
    }

    /// Register a handler that receives the kind's payload type directly.
    pub fn subscribe_typed<P, F>(&self, handler: F) -> SubscriptionHandle
    where
        P: KindPayload + 'static,
        F: Fn(&P) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(P::KIND, move |event| match P::extract(&event.payload) {
            Some(payload) => handler(payload),
            None => Ok(()),
        })
    }

    /// Remove one subscription. Returns `false` if it was already removed.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut registry = self.registry.lock();
        let Some(list) = registry.handlers.get_mut(&handle.kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != handle.id);
        before != list.len()
    }

    /// Remove every subscription for `kind`. Returns how many were removed.
    pub fn unsubscribe_all(&self, kind: EventKind) -> usize {
        self.registry.lock().handlers.remove(&kind).map_or(0, |list| list.len())
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.registry.lock().handlers.get(&kind).map_or(0, Vec::len)
    }

    /// Deliver `event` to the current subscribers of its kind.
    ///
    /// Returns the number of handlers that completed without error.
    pub fn dispatch(&self, event: &RealtimeEvent) -> usize {
        let kind = event.kind();
        let snapshot: Vec<(u64, Handler)> = match self.registry.lock().handlers.get(&kind) {
            Some(list) => list.clone(),
            None => return 0,
        };

        let mut delivered = 0;
        for (id, handler) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    tracing::warn!(kind = %kind, subscriber = id, err = %e, "event handler failed");
                }
                Err(_) => {
                    tracing::error!(kind = %kind, subscriber = id, "event handler panicked");
                }
            }
        }
        delivered
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
