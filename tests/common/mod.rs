//! In-process canvas server for integration tests: a relaying WebSocket
//! endpoint at `/ws/canvas/{id}` plus the REST routes the client calls.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use canvas_sync::bus::{Callback, EventBus};
use canvas_sync::config::{ConnectionConfig, Origin};
use canvas_sync::connection::Connection;
use canvas_sync::transport::WsConnector;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};

pub const TOKEN: &str = "tok";

/// A frame the server received, tagged with the connection it came from.
#[derive(Debug, Clone)]
pub struct Received {
    pub conn: usize,
    pub canvas_id: String,
    pub frame: Value,
}

/// A REST request the server handled.
#[derive(Debug, Clone)]
pub struct RestCall {
    pub method: String,
    pub path: String,
    pub authorization: Option<String>,
    pub body: String,
}

#[derive(Clone)]
pub struct TestServer {
    pub addr: SocketAddr,
    state: AppState,
}

#[derive(Clone)]
struct AppState {
    frames: Arc<Mutex<Vec<Received>>>,
    rest: Arc<Mutex<Vec<RestCall>>>,
    sections: Arc<Mutex<Vec<Value>>>,
    history: Arc<Mutex<Vec<Value>>>,
    hub: broadcast::Sender<(usize, String)>,
    next_conn: Arc<AtomicUsize>,
    drop_first_after_auth: bool,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(false).await
    }

    /// Server that hangs up on the very first connection right after it
    /// authenticates.
    pub async fn start_dropping_first() -> Self {
        Self::start_with(true).await
    }

    async fn start_with(drop_first_after_auth: bool) -> Self {
        let (hub, _) = broadcast::channel(64);
        let state = AppState {
            frames: Arc::default(),
            rest: Arc::default(),
            sections: Arc::new(Mutex::new(vec![
                json!({"id": "s1", "text": "hello"}),
                json!({"id": 2, "text": "second"}),
            ])),
            history: Arc::new(Mutex::new(vec![
                json!({"id": "h1", "author": "ana", "timestamp": 0, "text": "first draft"}),
            ])),
            hub,
            next_conn: Arc::default(),
            drop_first_after_auth,
        };

        let app = Router::new()
            .route("/ws/canvas/{canvas_id}", get(ws_canvas))
            .fallback(rest)
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind test server");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("test server");
        });
        Self { addr, state }
    }

    pub fn origin(&self) -> Origin {
        Origin::parse(&format!("http://{}", self.addr)).expect("origin")
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn frames(&self) -> Vec<Received> {
        self.state.frames.lock().expect("frames lock").clone()
    }

    pub fn frames_from(&self, conn: usize) -> Vec<Value> {
        self.frames().into_iter().filter(|r| r.conn == conn).map(|r| r.frame).collect()
    }

    pub fn rest_calls(&self) -> Vec<RestCall> {
        self.state.rest.lock().expect("rest lock").clone()
    }

    pub fn connections(&self) -> usize {
        self.state.next_conn.load(Ordering::SeqCst)
    }

    /// Poll until `check` holds, or panic after five seconds.
    pub async fn wait_until(&self, what: &str, check: impl Fn(&Self) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !check(self) {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Connection config with short timings for real-time tests.
pub fn fast_config() -> ConnectionConfig {
    ConnectionConfig {
        keepalive_interval: Duration::from_secs(3_600),
        backoff_base: Duration::from_millis(50),
        backoff_max: Duration::from_millis(200),
        max_reconnect_attempts: 5,
    }
}

pub fn ws_connection(server: &TestServer, config: ConnectionConfig) -> Connection {
    Connection::new(config, server.origin(), Arc::new(WsConnector), EventBus::new())
}

/// Forward every `event_type` emission into a channel.
pub fn watch(bus: &EventBus, event_type: &str) -> mpsc::UnboundedReceiver<(String, Value)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: Callback = Arc::new(move |kind: &str, payload: &Value| {
        let _ = tx.send((kind.to_owned(), payload.clone()));
    });
    bus.subscribe(event_type, callback);
    rx
}

pub async fn next(rx: &mut mpsc::UnboundedReceiver<(String, Value)>) -> (String, Value) {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event not emitted in time")
        .expect("event channel closed")
}

// =============================================================================
// WEBSOCKET
// =============================================================================

async fn ws_canvas(ws: WebSocketUpgrade, Path(canvas_id): Path<String>, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, canvas_id, state))
}

async fn serve_socket(socket: WebSocket, canvas_id: String, state: AppState) {
    let conn = state.next_conn.fetch_add(1, Ordering::SeqCst);
    let (mut tx, mut rx) = socket.split();
    let mut hub = state.hub.subscribe();

    loop {
        tokio::select! {
            incoming = rx.next() => {
                let Some(Ok(Message::Text(text))) = incoming else {
                    return;
                };
                let frame = serde_json::from_str::<Value>(text.as_str()).unwrap_or(Value::Null);
                state.frames.lock().expect("frames lock").push(Received {
                    conn,
                    canvas_id: canvas_id.clone(),
                    frame: frame.clone(),
                });
                match frame["type"].as_str() {
                    Some("ping") => {
                        if tx.send(Message::Text(r#"{"type":"pong"}"#.into())).await.is_err() {
                            return;
                        }
                    }
                    Some("authenticate") => {
                        if state.drop_first_after_auth && conn == 0 {
                            return;
                        }
                    }
                    Some(_) => {
                        let _ = state.hub.send((conn, text.as_str().to_owned()));
                    }
                    None => {}
                }
            }
            relayed = hub.recv() => {
                let Ok((from, text)) = relayed else {
                    continue;
                };
                if from != conn && tx.send(Message::Text(text.into())).await.is_err() {
                    return;
                }
            }
        }
    }
}

// =============================================================================
// REST
// =============================================================================

async fn rest(State(state): State<AppState>, method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Response {
    let authorization = headers.get("authorization").and_then(|v| v.to_str().ok()).map(ToOwned::to_owned);
    state.rest.lock().expect("rest lock").push(RestCall {
        method: method.to_string(),
        path: uri.path().to_owned(),
        authorization: authorization.clone(),
        body: String::from_utf8_lossy(&body).into_owned(),
    });

    if authorization.as_deref() != Some(format!("Bearer {TOKEN}").as_str()) {
        return (StatusCode::UNAUTHORIZED, axum::Json(json!({"message": "unauthorized"}))).into_response();
    }

    let body = serde_json::from_slice::<Value>(&body).unwrap_or(Value::Null);
    let path = uri.path().trim_matches('/').to_owned();
    let segments = path.split('/').collect::<Vec<_>>();

    match (method.as_str(), segments.as_slice()) {
        ("GET", ["ideas", _, "sections"]) => ok(Value::Array(state.sections.lock().expect("sections").clone())),
        ("PUT", ["ideas", _, "sections", section_id]) => {
            let mut sections = state.sections.lock().expect("sections");
            for section in sections.iter_mut() {
                if id_of(section) == *section_id {
                    section["text"] = body["text"].clone();
                }
            }
            ok(json!({"ok": true}))
        }
        ("POST", ["ideas", _, "sections", _section_id, "history"]) => {
            let mut history = state.history.lock().expect("history");
            let entry = json!({
                "id": format!("h{}", history.len() + 1),
                "author": "cli",
                "timestamp": 1_706_724_245_000_i64,
                "text": body["text"].clone(),
            });
            history.push(entry.clone());
            (StatusCode::CREATED, axum::Json(entry)).into_response()
        }
        ("GET", ["ideas", _, "history"]) => ok(Value::Array(state.history.lock().expect("history").clone())),
        ("GET", ["ideas", _, "history", entry_id]) => {
            let history = state.history.lock().expect("history");
            match history.iter().find(|entry| id_of(entry) == *entry_id) {
                Some(entry) => ok(entry.clone()),
                None => (StatusCode::NOT_FOUND, axum::Json(json!({"message": "entry not found"}))).into_response(),
            }
        }
        ("POST", ["ideas", _, "history", "broken", "revert"]) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "revert exploded").into_response()
        }
        ("POST", ["ideas", _, "history", entry_id, "revert"]) => {
            let text = {
                let history = state.history.lock().expect("history");
                history.iter().find(|entry| id_of(entry) == *entry_id).map(|entry| entry["text"].clone())
            };
            let Some(text) = text else {
                return (StatusCode::NOT_FOUND, axum::Json(json!({"message": "entry not found"}))).into_response();
            };
            let mut sections = state.sections.lock().expect("sections");
            if let Some(first) = sections.first_mut() {
                first["text"] = text;
            }
            ok(json!({"ok": true}))
        }
        _ => (StatusCode::NOT_FOUND, axum::Json(json!({"message": "no route"}))).into_response(),
    }
}

fn ok(value: Value) -> Response {
    axum::Json(value).into_response()
}

fn id_of(value: &Value) -> String {
    match &value["id"] {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
