//! Common Test Utilities for Integration Tests
//!
//! An in-process server that plays both roles the harness talks to: the
//! WebSocket endpoint under test and the REST collaborator that owns the
//! targets.

#![allow(dead_code)]

use axum::{
    Json, Router,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use ws_loadtest::fixture::{ApiResponse, LoginData, LoginRequest, Target, TargetPage, TargetSpec};

pub const ROUTE_KEY_FIELD: &str = "activation_code";
pub const USERNAME: &str = "admin";
pub const PASSWORD: &str = "admin123";
const TOKEN: &str = "test-token";

/// Server-side bookkeeping the tests assert against
#[derive(Default)]
pub struct ServerState {
    close_immediately: AtomicBool,
    rejected_keys: Mutex<HashSet<String>>,
    targets: Mutex<Vec<Target>>,

    pub accepted: AtomicUsize,
    pub active: AtomicUsize,
    pub frames: AtomicUsize,
    pub heartbeats: AtomicUsize,
    pub test_messages: AtomicUsize,
    /// Frames whose route key did not match the connection's key
    pub misrouted: AtomicUsize,
}

impl ServerState {
    fn is_rejected(&self, key: &str) -> bool {
        self.rejected_keys
            .lock()
            .map(|keys| keys.contains(key))
            .unwrap_or(false)
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// Test server on a random local port, aborted on drop
pub struct TestServer {
    pub addr: SocketAddr,
    pub state: Arc<ServerState>,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        let state = Arc::new(ServerState::default());

        let app = Router::new()
            .route("/api/ws/client", get(ws_handler))
            .route("/api/v1/auth/login", post(login))
            .route("/api/v1/groups", get(list_groups).post(create_group))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Give server time to start
        tokio::time::sleep(Duration::from_millis(50)).await;

        Self {
            addr,
            state,
            handle,
        }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/api/ws/client", self.addr)
    }

    pub fn api_url(&self) -> String {
        format!("http://{}/api/v1", self.addr)
    }

    /// Complete every handshake, then close straight away
    pub fn close_immediately(&self) {
        self.state.close_immediately.store(true, Ordering::SeqCst);
    }

    /// Refuse the upgrade for connections carrying `key`
    pub fn reject_key(&self, key: &str) {
        self.state
            .rejected_keys
            .lock()
            .unwrap()
            .insert(key.to_string());
    }

    /// Seed a target as if created by an earlier run
    pub fn seed_target(&self, remark: &str) -> Target {
        insert_target(&self.state, remark.to_string())
    }

    pub fn targets(&self) -> Vec<Target> {
        self.state.targets.lock().unwrap().clone()
    }

    pub fn active_connections(&self) -> usize {
        ServerState::count(&self.state.active)
    }

    /// Wait until the server has seen every client close, or give up after `limit`
    pub async fn wait_for_idle(&self, limit: Duration) -> bool {
        tokio::time::timeout(limit, async {
            while self.active_connections() > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .is_ok()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn insert_target(state: &ServerState, remark: String) -> Target {
    let mut targets = state.targets.lock().unwrap();
    let id = targets.len() as u64 + 1;
    let target = Target {
        id: Some(id),
        key: format!("KEY{:05}", id),
        remark,
        is_active: true,
    };
    targets.push(target.clone());
    target
}

// ============================================================================
// WebSocket endpoint
// ============================================================================

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<ServerState>>,
) -> Response {
    let key = params.get(ROUTE_KEY_FIELD).cloned().unwrap_or_default();
    if key.is_empty() || state.is_rejected(&key) {
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, key, state))
}

async fn handle_socket(mut socket: WebSocket, key: String, state: Arc<ServerState>) {
    state.accepted.fetch_add(1, Ordering::SeqCst);
    if state.close_immediately.load(Ordering::SeqCst) {
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    state.active.fetch_add(1, Ordering::SeqCst);
    let hello = json!({ "type": "auth_success", "data": { ROUTE_KEY_FIELD: key } });
    let _ = socket.send(Message::Text(hello.to_string())).await;

    while let Some(Ok(msg)) = socket.recv().await {
        match msg {
            Message::Text(text) => {
                state.frames.fetch_add(1, Ordering::SeqCst);
                let Ok(envelope) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                if envelope[ROUTE_KEY_FIELD] != key.as_str() {
                    state.misrouted.fetch_add(1, Ordering::SeqCst);
                }
                match envelope["type"].as_str() {
                    Some("heartbeat") => {
                        state.heartbeats.fetch_add(1, Ordering::SeqCst);
                        let ack = json!({ "type": "heartbeat_ack", "data": { "status": "ok" } });
                        if socket.send(Message::Text(ack.to_string())).await.is_err() {
                            break;
                        }
                    }
                    Some("test_message") => {
                        state.test_messages.fetch_add(1, Ordering::SeqCst);
                    }
                    _ => {}
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.active.fetch_sub(1, Ordering::SeqCst);
}

// ============================================================================
// REST collaborator
// ============================================================================

fn failure(code: i64, message: &str) -> Json<Value> {
    Json(json!({ "code": code, "message": message, "data": null }))
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {}", TOKEN))
}

async fn login(Json(request): Json<LoginRequest>) -> Json<Value> {
    if request.username != USERNAME || request.password != PASSWORD {
        return failure(1001, "invalid username or password");
    }
    Json(json!(ApiResponse::ok(LoginData {
        token: TOKEN.to_string()
    })))
}

#[derive(Deserialize)]
struct PageQuery {
    page: usize,
    page_size: usize,
}

async fn list_groups(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Query(query): Query<PageQuery>,
) -> Json<Value> {
    if !authorized(&headers) {
        return failure(1002, "unauthorized");
    }
    let targets = state.targets.lock().unwrap();
    let start = query.page.saturating_sub(1) * query.page_size;
    let page = TargetPage {
        list: targets
            .iter()
            .skip(start)
            .take(query.page_size)
            .cloned()
            .collect(),
        total: targets.len() as u64,
    };
    Json(json!(ApiResponse::ok(page)))
}

async fn create_group(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(spec): Json<TargetSpec>,
) -> Json<Value> {
    if !authorized(&headers) {
        return failure(1002, "unauthorized");
    }
    Json(json!(ApiResponse::ok(insert_target(&state, spec.remark))))
}

/// Initialize test logging for detailed output
pub fn init_test_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ws_loadtest=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}
