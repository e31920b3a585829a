//! Canvas connection: one reconnecting WebSocket session per canvas.
//!
//! DESIGN
//! ======
//! `Connection` is a cheap `Clone` handle over shared state. `connect`
//! spawns a session task that owns the transport and runs the lifecycle:
//!
//! 1. Open transport → reset attempts → write `authenticate` (if a
//!    credential is set) → publish as `Open` → emit `open`
//! 2. Select over inbound frames, queued outbound frames, keepalive ticks,
//!    and the shutdown signal
//! 3. Transport ends → emit `close` → retry with jittered backoff while
//!    attempts remain and a resource id and credential are still set
//!
//! On `disconnect` the task flushes frames that were already queued, closes
//! the transport and exits without emitting anything.
//!
//! The `authenticate` frame is written before the outbound queue is
//! published, so no application frame can reach the server ahead of it.
//!
//! Each `connect` bumps an epoch; a session task whose epoch is stale
//! never touches state or emits events again.
//!
//! ERROR HANDLING
//! ==============
//! Transport failures never surface as `Err` to callers. They become
//! `error`/`close` events on the bus and drive reconnection. Malformed
//! inbound frames are dropped and only logged at debug level. `send` on a
//! connection that is not open is a silent no-op (nothing is queued).

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use frames::Frame;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::bus::{Callback, EventBus};
use crate::config::{ConnectionConfig, Origin};
use crate::transport::{Connector, FrameSink, FrameStream};

/// Emitted (payload null) once the transport is open and authenticated.
pub const OPEN_EVENT: &str = "open";
/// Emitted (payload null) whenever an open or opening transport ends.
pub const CLOSE_EVENT: &str = "close";
/// Emitted with the error text as a JSON string.
pub const ERROR_EVENT: &str = "error";

const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No transport; possibly waiting out a reconnect delay.
    #[default]
    Disconnected,
    /// Transport handshake in progress.
    Connecting,
    /// Transport open; `send` delivers.
    Open,
    /// `disconnect` requested; transport is being closed.
    Closing,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("already connected to canvas {current}; disconnect before connecting to {requested}")]
    AlreadyConnected { current: String, requested: String },
}

/// Shared handle to one canvas connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    config: ConnectionConfig,
    backoff: Backoff,
    origin: Origin,
    connector: Arc<dyn Connector>,
    bus: EventBus,
    shared: Mutex<Shared>,
}

#[derive(Default)]
struct Shared {
    status: ConnectionStatus,
    resource_id: Option<String>,
    credential: Option<String>,
    attempts: u32,
    outbound: Option<mpsc::UnboundedSender<String>>,
    session: Option<watch::Sender<bool>>,
    epoch: u64,
}

enum SessionEnd {
    Closed,
    Shutdown,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.inner.lock();
        f.debug_struct("Connection")
            .field("status", &shared.status)
            .field("resource_id", &shared.resource_id)
            .field("attempts", &shared.attempts)
            .finish_non_exhaustive()
    }
}

impl Connection {
    #[must_use]
    pub fn new(config: ConnectionConfig, origin: Origin, connector: Arc<dyn Connector>, bus: EventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                backoff: Backoff::from_config(&config),
                config,
                origin,
                connector,
                bus,
                shared: Mutex::new(Shared::default()),
            }),
        }
    }

    /// Start a session for `resource_id`.
    ///
    /// Calling again for the same resource while a session is live only
    /// refreshes the credential (when one is given).
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::AlreadyConnected`] when a session for a
    /// different resource is live.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn connect(&self, resource_id: &str, credential: Option<String>) -> Result<(), ConnectionError> {
        let mut shared = self.inner.lock();
        if shared.session.is_some() {
            return match shared.resource_id.as_deref() {
                Some(current) if current != resource_id => Err(ConnectionError::AlreadyConnected {
                    current: current.to_owned(),
                    requested: resource_id.to_owned(),
                }),
                _ => {
                    if credential.is_some() {
                        shared.credential = credential;
                    }
                    Ok(())
                }
            };
        }

        shared.epoch += 1;
        let epoch = shared.epoch;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        shared.resource_id = Some(resource_id.to_owned());
        shared.credential = credential;
        shared.status = ConnectionStatus::Connecting;
        shared.session = Some(shutdown_tx);
        drop(shared);

        info!(resource_id, epoch, "connection: session started");
        tokio::spawn(run_session(Arc::clone(&self.inner), epoch, shutdown_rx));
        Ok(())
    }

    /// Tear down the session. Idempotent; emits no events and prevents any
    /// further reconnect attempt.
    pub fn disconnect(&self) {
        let mut shared = self.inner.lock();
        if let Some(shutdown) = shared.session.take() {
            let _ = shutdown.send(true);
            shared.epoch += 1;
            shared.status = ConnectionStatus::Closing;
            info!("connection: disconnect requested");
        }
        shared.outbound = None;
        shared.resource_id = None;
        shared.credential = None;
        shared.attempts = 0;
    }

    /// Send one frame. Returns `false` (and drops the frame) unless the
    /// transport is open.
    pub fn send(&self, kind: &str, payload: Value) -> bool {
        let shared = self.inner.lock();
        if shared.status != ConnectionStatus::Open {
            debug!(kind, status = ?shared.status, "connection: dropping send while not open");
            return false;
        }
        let Some(outbound) = shared.outbound.as_ref() else {
            return false;
        };
        outbound.send(frames::encode_frame(&Frame::new(kind, payload))).is_ok()
    }

    /// Canvas-level update broadcast (`canvas:update`).
    pub fn send_canvas_update(&self, payload: Value) -> bool {
        self.send(frames::CANVAS_UPDATE, payload)
    }

    pub fn subscribe(&self, event_type: &str, callback: Callback) {
        self.inner.bus.subscribe(event_type, callback);
    }

    pub fn unsubscribe(&self, event_type: &str, callback: &Callback) {
        self.inner.bus.unsubscribe(event_type, callback);
    }

    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.inner.lock().status
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.status() == ConnectionStatus::Open
    }

    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.lock().attempts
    }

    #[must_use]
    pub fn resource_id(&self) -> Option<String> {
        self.inner.lock().resource_id.clone()
    }

    /// Whether a session task is live (open, connecting, or waiting to retry).
    #[must_use]
    pub fn has_session(&self) -> bool {
        self.inner.lock().session.is_some()
    }
}

// =============================================================================
// SESSION TASK
// =============================================================================

async fn run_session(inner: Arc<Inner>, epoch: u64, mut shutdown: watch::Receiver<bool>) {
    loop {
        let Some(url) = inner.begin_attempt(epoch) else {
            return;
        };

        debug!(%url, epoch, "connection: opening transport");
        let opened = tokio::select! {
            () = wait_shutdown(&mut shutdown) => {
                inner.finish_shutdown();
                return;
            }
            opened = inner.connector.open(&url) => opened,
        };

        match opened {
            Ok((sink, stream)) => {
                if let SessionEnd::Shutdown = run_open(&inner, epoch, sink, stream, &mut shutdown).await {
                    inner.finish_shutdown();
                    return;
                }
            }
            Err(error) => {
                warn!(%url, error = %error, "connection: transport open failed");
                inner.bus.emit(ERROR_EVENT, &Value::String(error.to_string()));
            }
        }

        let Some(delay) = inner.handle_close(epoch) else {
            return;
        };

        tokio::select! {
            () = wait_shutdown(&mut shutdown) => {
                inner.finish_shutdown();
                return;
            }
            () = tokio::time::sleep(delay) => {}
        }
    }
}

async fn run_open(
    inner: &Inner,
    epoch: u64,
    mut sink: FrameSink,
    mut stream: FrameStream,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let Some(credential) = inner.begin_open(epoch) else {
        return SessionEnd::Shutdown;
    };

    if let Some(token) = credential {
        if let Err(error) = sink.send(frames::encode_frame(&Frame::authenticate(&token))).await {
            warn!(error = %error, "connection: authenticate send failed");
            inner.bus.emit(ERROR_EVENT, &Value::String(error.to_string()));
            return SessionEnd::Closed;
        }
    }

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    if !inner.publish_open(epoch, outbound_tx) {
        return SessionEnd::Shutdown;
    }
    info!(epoch, "connection: open");
    inner.bus.emit(OPEN_EVENT, &Value::Null);

    let period = inner.config.keepalive_interval;
    let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let outgoing = tokio::select! {
            () = wait_shutdown(shutdown) => {
                let _ = tokio::time::timeout(CLOSE_GRACE, drain_and_close(&mut sink, &mut outbound_rx)).await;
                return SessionEnd::Shutdown;
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(text)) => {
                        inner.dispatch_inbound(&text);
                        continue;
                    }
                    Some(Err(error)) => {
                        warn!(error = %error, "connection: transport error");
                        inner.bus.emit(ERROR_EVENT, &Value::String(error.to_string()));
                        return SessionEnd::Closed;
                    }
                    None => {
                        info!(epoch, "connection: transport closed by peer");
                        return SessionEnd::Closed;
                    }
                }
            }
            Some(text) = outbound_rx.recv() => text,
            _ = keepalive.tick() => frames::encode_frame(&Frame::ping()),
        };

        if let Err(error) = sink.send(outgoing).await {
            warn!(error = %error, "connection: send failed");
            inner.bus.emit(ERROR_EVENT, &Value::String(error.to_string()));
            return SessionEnd::Closed;
        }
    }
}

/// Deliver frames accepted by `send` before the disconnect, then close.
async fn drain_and_close(sink: &mut FrameSink, outbound: &mut mpsc::UnboundedReceiver<String>) {
    while let Ok(text) = outbound.try_recv() {
        if sink.send(text).await.is_err() {
            return;
        }
    }
    let _ = sink.close().await;
}

/// Resolves once shutdown is signalled or the signalling side is gone.
async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

// =============================================================================
// STATE TRANSITIONS
// =============================================================================

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `Connecting` and return the URL, or `None` if this session is stale.
    fn begin_attempt(&self, epoch: u64) -> Option<String> {
        let mut shared = self.lock();
        if shared.epoch != epoch {
            return None;
        }
        let resource_id = shared.resource_id.clone()?;
        shared.status = ConnectionStatus::Connecting;
        Some(self.origin.canvas_ws_url(&resource_id))
    }

    /// Reset the attempt counter and hand back the credential to authenticate with.
    fn begin_open(&self, epoch: u64) -> Option<Option<String>> {
        let mut shared = self.lock();
        if shared.epoch != epoch {
            return None;
        }
        shared.attempts = 0;
        Some(shared.credential.clone())
    }

    fn publish_open(&self, epoch: u64, outbound: mpsc::UnboundedSender<String>) -> bool {
        let mut shared = self.lock();
        if shared.epoch != epoch {
            return false;
        }
        shared.status = ConnectionStatus::Open;
        shared.outbound = Some(outbound);
        true
    }

    fn dispatch_inbound(&self, text: &str) {
        match frames::decode_frame(text) {
            Ok(frame) if frame.is_pong() => {}
            Ok(frame) => self.bus.emit(&frame.kind, &frame.payload_or_null()),
            Err(error) => debug!(error = %error, "connection: dropping malformed frame"),
        }
    }

    /// Transport ended: emit `close` and decide whether to retry.
    fn handle_close(&self, epoch: u64) -> Option<Duration> {
        let retry = {
            let mut shared = self.lock();
            if shared.epoch != epoch {
                return None;
            }
            shared.status = ConnectionStatus::Disconnected;
            shared.outbound = None;

            let can_rejoin = shared.resource_id.is_some() && shared.credential.is_some();
            if can_rejoin && self.backoff.allows_retry(shared.attempts) {
                let delay = self.backoff.jittered(shared.attempts);
                shared.attempts += 1;
                Some((delay, shared.attempts))
            } else {
                shared.session = None;
                None
            }
        };

        self.bus.emit(CLOSE_EVENT, &Value::Null);

        match retry {
            Some((delay, attempt)) => {
                let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                info!(delay_ms, attempt, "connection: reconnect scheduled");
                Some(delay)
            }
            None => {
                info!(epoch, "connection: closed, not reconnecting");
                None
            }
        }
    }

    fn finish_shutdown(&self) {
        let mut shared = self.lock();
        if shared.status == ConnectionStatus::Closing && shared.session.is_none() {
            shared.status = ConnectionStatus::Disconnected;
        }
    }
}

#[cfg(test)]
#[path = "connection_test.rs"]
mod tests;
