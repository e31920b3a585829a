//! Per-key trailing-edge throttle.
//!
//! The first call for a quiet key opens a window; calls inside the window
//! only replace the pending value; when the window closes the action runs
//! once with the latest value. A call after that opens a fresh window, so
//! two fires for the same key are always at least one window apart.
//!
//! Keys are independent: each has at most one sleeping timer task. Timer
//! tasks own what they need, so pending windows still fire after the
//! `Throttle` itself is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::task::JoinHandle;
use tracing::debug;

/// Action run when a key's window closes.
pub type FireFn<V> = Arc<dyn Fn(String, V) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct Throttle<V> {
    window: Duration,
    fire: FireFn<V>,
    state: Arc<Mutex<State<V>>>,
}

struct State<V> {
    pending: HashMap<String, Pending<V>>,
    next_id: u64,
}

struct Pending<V> {
    id: u64,
    latest: V,
    timer: JoinHandle<()>,
}

impl<V: Send + 'static> std::fmt::Debug for Throttle<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttle")
            .field("window", &self.window)
            .field("pending", &self.pending_len())
            .finish_non_exhaustive()
    }
}

impl<V: Send + 'static> Throttle<V> {
    #[must_use]
    pub fn new(window: Duration, fire: FireFn<V>) -> Self {
        Self { window, fire, state: Arc::new(Mutex::new(State { pending: HashMap::new(), next_id: 0 })) }
    }

    /// Record `value` for `key`, opening a window if none is pending.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn call(&self, key: &str, value: V) {
        let mut state = lock(&self.state);
        if let Some(pending) = state.pending.get_mut(key) {
            pending.latest = value;
            return;
        }

        state.next_id += 1;
        let id = state.next_id;
        let timer = tokio::spawn(fire_after(
            Arc::clone(&self.state),
            Arc::clone(&self.fire),
            self.window,
            key.to_owned(),
            id,
        ));
        state.pending.insert(key.to_owned(), Pending { id, latest: value, timer });
        debug!(key, window_ms = u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX), "throttle: window opened");
    }

    /// Run every pending action now, in no particular order, and wait for
    /// them to finish.
    pub async fn flush(&self) {
        let drained = {
            let mut state = lock(&self.state);
            state.pending.drain().collect::<Vec<_>>()
        };
        for (key, pending) in drained {
            pending.timer.abort();
            (self.fire)(key, pending.latest).await;
        }
    }

    #[must_use]
    pub fn is_pending(&self, key: &str) -> bool {
        lock(&self.state).pending.contains_key(key)
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        lock(&self.state).pending.len()
    }
}

async fn fire_after<V>(state: Arc<Mutex<State<V>>>, fire: FireFn<V>, window: Duration, key: String, id: u64) {
    tokio::time::sleep(window).await;
    let latest = {
        let mut state = lock(&state);
        // A flush may have taken this window meanwhile.
        let current = state.pending.get(&key).is_some_and(|pending| pending.id == id);
        if current { state.pending.remove(&key).map(|pending| pending.latest) } else { None }
    };
    if let Some(value) = latest {
        debug!(key = %key, "throttle: window closed, firing");
        fire(key, value).await;
    }
}

fn lock<V>(state: &Mutex<State<V>>) -> MutexGuard<'_, State<V>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[path = "throttle_test.rs"]
mod tests;
