//! Event bus: per-type subscriber registry with isolated dispatch.
//!
//! DESIGN
//! ======
//! One registry serves both remote-origin events (decoded inbound frames)
//! and local events (`open`, `close`, `error`, same-process broadcasts), so
//! both share the same type-key namespace. Membership is by callback
//! identity (`Arc` pointer), never by value.
//!
//! Dispatch clones the matching callback list before invoking anything, so
//! callbacks may subscribe, unsubscribe or send without deadlocking. Each
//! callback's membership is re-checked right before it runs, so one removed
//! by an earlier callback of the same emission is skipped.
//!
//! ERROR HANDLING
//! ==============
//! A panicking callback is caught, logged, and skipped; remaining callbacks
//! still run and the emitter never observes the failure.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tracing::error;

/// Key whose subscribers receive every emitted event.
pub const WILDCARD: &str = "*";

/// Subscriber callback: `(event_type, payload)`.
pub type Callback = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// Shared subscriber registry. Cloning yields another handle to the same registry.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<HashMap<String, Vec<Callback>>>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys = self.lock().keys().cloned().collect::<Vec<_>>();
        f.debug_struct("EventBus").field("event_types", &keys).finish()
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `event_type`. Registering the same `Arc` twice is a no-op.
    pub fn subscribe(&self, event_type: &str, callback: Callback) {
        let mut subscribers = self.lock();
        let set = subscribers.entry(event_type.to_owned()).or_default();
        if !set.iter().any(|existing| Arc::ptr_eq(existing, &callback)) {
            set.push(callback);
        }
    }

    /// Remove `callback` from `event_type`; empty keys are pruned.
    pub fn unsubscribe(&self, event_type: &str, callback: &Callback) {
        let mut subscribers = self.lock();
        let Some(set) = subscribers.get_mut(event_type) else {
            return;
        };
        set.retain(|existing| !Arc::ptr_eq(existing, callback));
        if set.is_empty() {
            subscribers.remove(event_type);
        }
    }

    /// Deliver `data` to every subscriber of `event_type`, then to wildcard subscribers.
    ///
    /// Callbacks subscribed during the emission wait for the next one; callbacks
    /// unsubscribed during it are skipped if they have not run yet.
    pub fn emit(&self, event_type: &str, data: &Value) {
        let targets = {
            let subscribers = self.lock();
            let mut targets = subscribers
                .get(event_type)
                .map(|set| set.iter().map(|cb| (event_type, Arc::clone(cb))).collect::<Vec<_>>())
                .unwrap_or_default();
            if event_type != WILDCARD {
                if let Some(all) = subscribers.get(WILDCARD) {
                    targets.extend(all.iter().map(|cb| (WILDCARD, Arc::clone(cb))));
                }
            }
            targets
        };

        for (key, callback) in targets {
            if !self.is_subscribed(key, &callback) {
                continue;
            }
            let outcome = catch_unwind(AssertUnwindSafe(|| callback(event_type, data)));
            if let Err(panic) = outcome {
                error!(event_type, panic = %panic_message(panic.as_ref()), "event bus: subscriber callback panicked");
            }
        }
    }

    /// Number of callbacks registered for exactly `event_type`.
    #[must_use]
    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.lock().get(event_type).map_or(0, Vec::len)
    }

    /// Whether any key is registered at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn is_subscribed(&self, event_type: &str, callback: &Callback) -> bool {
        self.lock().get(event_type).is_some_and(|set| set.iter().any(|existing| Arc::ptr_eq(existing, callback)))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Callback>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        return (*s).to_owned();
    }
    if let Some(s) = panic.downcast_ref::<String>() {
        return s.clone();
    }
    "non-string panic payload".to_owned()
}

#[cfg(test)]
#[path = "bus_test.rs"]
mod tests;
