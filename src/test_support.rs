//! In-memory transport, REST and bus helpers shared by unit tests.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{sink, stream};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::api::{ApiError, CanvasApi, HistoryEntry, Section};
use crate::bus::{Callback, EventBus};
use crate::config::{ConnectionConfig, Origin};
use crate::connection::Connection;
use crate::transport::{Connector, FrameSink, FrameStream, TransportError};

/// Server side of one accepted in-memory transport.
pub(crate) struct Peer {
    pub url: String,
    to_client: Option<mpsc::UnboundedSender<Result<String, TransportError>>>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl Peer {
    pub fn push(&self, text: &str) {
        if let Some(tx) = &self.to_client {
            tx.send(Ok(text.to_owned())).expect("client stream alive");
        }
    }

    pub fn push_error(&self) {
        if let Some(tx) = &self.to_client {
            tx.send(Err(TransportError::Closed)).expect("client stream alive");
        }
    }

    /// Close the server side; the client sees its stream end.
    pub fn close(&mut self) {
        self.to_client = None;
    }

    pub async fn recv(&mut self) -> Value {
        let text = timeout(Duration::from_secs(60), self.from_client.recv())
            .await
            .expect("peer receive timed out")
            .expect("client sink closed");
        serde_json::from_str(&text).expect("client sent valid json")
    }

    /// `None` once the client has dropped or closed its sink.
    pub async fn recv_or_closed(&mut self) -> Option<String> {
        timeout(Duration::from_secs(60), self.from_client.recv())
            .await
            .expect("peer receive timed out")
    }

    pub fn try_recv(&mut self) -> Option<Value> {
        self.from_client
            .try_recv()
            .ok()
            .map(|text| serde_json::from_str(&text).expect("client sent valid json"))
    }
}

/// Connector that hands every opened transport to the test as a [`Peer`].
pub(crate) struct MockConnector {
    accepted: mpsc::UnboundedSender<Peer>,
    fail_opens: AtomicUsize,
    opens: AtomicUsize,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Peer>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self { accepted, fail_opens: AtomicUsize::new(0), opens: AtomicUsize::new(0) });
        (connector, rx)
    }

    /// Make the next `count` open attempts fail.
    pub fn fail_next(&self, count: usize) {
        self.fail_opens.store(count, Ordering::SeqCst);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Connector for MockConnector {
    async fn open(&self, url: &str) -> Result<(FrameSink, FrameStream), TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_opens.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_opens.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::Closed);
        }

        let (to_client, client_rx) = mpsc::unbounded_channel::<Result<String, TransportError>>();
        let (client_tx, from_client) = mpsc::unbounded_channel::<String>();

        let frame_sink = sink::unfold(client_tx, |tx, text: String| async move {
            tx.send(text).map_err(|_| TransportError::Closed)?;
            Ok::<_, TransportError>(tx)
        });
        let frame_stream = stream::unfold(client_rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) });

        let peer = Peer { url: url.to_owned(), to_client: Some(to_client), from_client };
        self.accepted.send(peer).map_err(|_| TransportError::Closed)?;
        Ok((Box::pin(frame_sink), Box::pin(frame_stream)))
    }
}

pub(crate) async fn next_peer(accepted: &mut mpsc::UnboundedReceiver<Peer>) -> Peer {
    timeout(Duration::from_secs(120), accepted.recv())
        .await
        .expect("no transport opened in time")
        .expect("connector dropped")
}

pub(crate) fn test_origin() -> Origin {
    Origin { secure: false, host: "canvas.test".to_owned() }
}

pub(crate) fn test_connection(config: ConnectionConfig) -> (Connection, Arc<MockConnector>, mpsc::UnboundedReceiver<Peer>) {
    let (connector, accepted) = MockConnector::new();
    let connection = Connection::new(config, test_origin(), Arc::clone(&connector) as Arc<dyn Connector>, EventBus::new());
    (connection, connector, accepted)
}

/// Forward every `event_type` emission into a channel.
pub(crate) fn watch_event(bus: &EventBus, event_type: &str) -> mpsc::UnboundedReceiver<Value> {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: Callback = Arc::new(move |_: &str, payload: &Value| {
        let _ = tx.send(payload.clone());
    });
    bus.subscribe(event_type, callback);
    rx
}

pub(crate) async fn next_event(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
    timeout(Duration::from_secs(120), rx.recv())
        .await
        .expect("event not emitted in time")
        .expect("event channel closed")
}

// =============================================================================
// REST
// =============================================================================

/// One recorded [`MockApi`] call.
#[derive(Debug, Clone)]
pub(crate) struct ApiCall {
    pub op: &'static str,
    pub args: Vec<String>,
    pub at: tokio::time::Instant,
}

/// In-memory [`CanvasApi`] that records calls and fails on demand.
#[derive(Default)]
pub(crate) struct MockApi {
    state: Mutex<ApiState>,
}

#[derive(Default)]
struct ApiState {
    sections: Vec<Section>,
    history: Vec<HistoryEntry>,
    failing: HashSet<&'static str>,
    calls: Vec<ApiCall>,
}

impl MockApi {
    pub fn with(sections: Vec<Section>, history: Vec<HistoryEntry>) -> Arc<Self> {
        let api = Self::default();
        {
            let mut state = api.lock();
            state.sections = sections;
            state.history = history;
        }
        Arc::new(api)
    }

    pub fn set_sections(&self, sections: Vec<Section>) {
        self.lock().sections = sections;
    }

    /// Make every later call of `op` fail with HTTP 500.
    pub fn fail(&self, op: &'static str) {
        self.lock().failing.insert(op);
    }

    pub fn calls(&self, op: &str) -> Vec<ApiCall> {
        self.lock().calls.iter().filter(|call| call.op == op).cloned().collect()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls(op).len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ApiState> {
        self.state.lock().expect("mock api lock")
    }

    fn record(&self, op: &'static str, args: &[&str]) -> Result<std::sync::MutexGuard<'_, ApiState>, ApiError> {
        let mut state = self.lock();
        state.calls.push(ApiCall {
            op,
            args: args.iter().map(|arg| (*arg).to_owned()).collect(),
            at: tokio::time::Instant::now(),
        });
        if state.failing.contains(op) {
            return Err(ApiError::Status { status: 500, message: format!("{op} failed") });
        }
        Ok(state)
    }
}

#[async_trait::async_trait]
impl CanvasApi for MockApi {
    async fn list_sections(&self, idea_id: &str) -> Result<Vec<Section>, ApiError> {
        let state = self.record("list_sections", &[idea_id])?;
        Ok(state.sections.clone())
    }

    async fn update_section(&self, idea_id: &str, section_id: &str, text: &str) -> Result<(), ApiError> {
        let mut state = self.record("update_section", &[idea_id, section_id, text])?;
        if let Some(section) = state.sections.iter_mut().find(|s| s.id == section_id) {
            text.clone_into(&mut section.text);
        }
        Ok(())
    }

    async fn append_history(&self, idea_id: &str, section_id: &str, text: &str) -> Result<Value, ApiError> {
        let mut state = self.record("append_history", &[idea_id, section_id, text])?;
        let entry = HistoryEntry {
            id: format!("h{}", state.history.len() + 1),
            author: "me".to_owned(),
            timestamp: 0,
            text: Some(text.to_owned()),
        };
        state.history.push(entry.clone());
        Ok(serde_json::to_value(entry).expect("entry json"))
    }

    async fn list_history(&self, idea_id: &str) -> Result<Vec<HistoryEntry>, ApiError> {
        let state = self.record("list_history", &[idea_id])?;
        Ok(state.history.clone())
    }

    async fn get_history_entry(&self, idea_id: &str, entry_id: &str) -> Result<HistoryEntry, ApiError> {
        let state = self.record("get_history_entry", &[idea_id, entry_id])?;
        state
            .history
            .iter()
            .find(|entry| entry.id == entry_id)
            .cloned()
            .ok_or(ApiError::Status { status: 404, message: "not found".to_owned() })
    }

    async fn revert_history(&self, idea_id: &str, entry_id: &str) -> Result<(), ApiError> {
        let _state = self.record("revert_history", &[idea_id, entry_id])?;
        Ok(())
    }
}
