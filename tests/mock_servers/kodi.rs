//! Mock Kodi JSON-RPC endpoint
//!
//! Answers single and batched requests. Batches are answered in reverse order,
//! the way a busy Kodi may interleave them.

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Default)]
pub struct MockKodiState {
    /// Full `Authorization` header value required on every request
    pub required_auth: Option<String>,
    /// Active player ids with their type
    pub players: Vec<(u64, String)>,
    pub speed: i64,
    pub opened: Option<String>,
    /// (method, params) in arrival order
    pub calls: Vec<(String, Value)>,
}

pub struct MockKodiServer {
    addr: SocketAddr,
    state: Arc<RwLock<MockKodiState>>,
    handle: JoinHandle<()>,
}

impl MockKodiServer {
    pub async fn start() -> Self {
        Self::start_with_state(MockKodiState::default()).await
    }

    pub async fn start_with_state(initial_state: MockKodiState) -> Self {
        let state = Arc::new(RwLock::new(initial_state));

        let app = Router::new()
            .route("/jsonrpc", post(handle_rpc))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            handle,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn calls(&self) -> Vec<(String, Value)> {
        self.state.read().await.calls.clone()
    }

    pub async fn methods(&self) -> Vec<String> {
        self.calls().await.into_iter().map(|(m, _)| m).collect()
    }

    pub async fn opened(&self) -> Option<String> {
        self.state.read().await.opened.clone()
    }

    pub async fn set_players(&self, players: Vec<(u64, &str)>) {
        self.state.write().await.players = players
            .into_iter()
            .map(|(id, kind)| (id, kind.to_string()))
            .collect();
    }

    pub async fn stop(self) {
        self.handle.abort();
    }
}

async fn handle_rpc(
    State(state): State<Arc<RwLock<MockKodiState>>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let mut s = state.write().await;

    if let Some(required) = &s.required_auth {
        let given = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if given != Some(required.as_str()) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    match body {
        Value::Array(requests) => {
            let mut replies: Vec<Value> = requests.iter().map(|r| answer(&mut s, r)).collect();
            replies.reverse();
            Json(Value::Array(replies)).into_response()
        }
        request => Json(answer(&mut s, &request)).into_response(),
    }
}

fn answer(state: &mut MockKodiState, request: &Value) -> Value {
    let id = request["id"].clone();
    let method = request["method"].as_str().unwrap_or("").to_string();
    let params = request["params"].clone();
    state.calls.push((method.clone(), params.clone()));

    let result = match method.as_str() {
        "Player.Open" => {
            state.opened = params["item"]["file"].as_str().map(str::to_string);
            state.players = vec![(1, "video".to_string())];
            state.speed = 1;
            json!("OK")
        }
        "Player.GetActivePlayers" => Value::Array(
            state
                .players
                .iter()
                .map(|(id, kind)| json!({"playerid": id, "type": kind}))
                .collect(),
        ),
        "Player.GetProperties" => {
            let player = params["playerid"].as_u64();
            // Only the video player moves; audio players sit paused
            let is_video = state
                .players
                .iter()
                .any(|(id, kind)| Some(*id) == player && kind == "video");
            let speed = if is_video { state.speed } else { 0 };
            json!({
                "speed": speed,
                "time": {"hours": 0, "minutes": 1, "seconds": 30, "milliseconds": 0},
                "totaltime": {"hours": 1, "minutes": 0, "seconds": 0, "milliseconds": 0},
            })
        }
        "Player.PlayPause" => {
            state.speed = if params["play"].as_bool() == Some(true) { 1 } else { 0 };
            json!({"speed": state.speed})
        }
        "Player.Stop" => {
            let player = params["playerid"].as_u64();
            state.players.retain(|(id, _)| Some(*id) != player);
            json!("OK")
        }
        _ => {
            return json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32601, "message": "Method not found."},
            })
        }
    };

    json!({"jsonrpc": "2.0", "id": id, "result": result})
}
