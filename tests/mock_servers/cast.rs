//! Mock Cast v2 receiver (plain TCP, no TLS)
//!
//! Launches the requested app, accepts LOAD/PAUSE/PLAY/STOP on its transport and
//! answers every request with the sender's `requestId`.

use castbridge::adapters::cast_proto::{
    read_frame, write_frame, CastMessage, CONNECTION_NS, HEARTBEAT_NS, MEDIA_NS, RECEIVER_NS,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

pub const TRANSPORT_ID: &str = "web-7";

/// One message as the receiver saw it
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub destination: String,
    pub namespace: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Default)]
pub struct MockCastState {
    /// App id currently running, if any
    pub running_app: Option<String>,
    pub reject_launch: bool,
    pub media_session_id: Option<i64>,
    pub player_state: String,
    pub received: Vec<ReceivedMessage>,
}

pub struct MockCastReceiver {
    addr: SocketAddr,
    state: Arc<RwLock<MockCastState>>,
    handle: JoinHandle<()>,
}

impl MockCastReceiver {
    pub async fn start() -> Self {
        Self::start_with_state(MockCastState {
            player_state: "IDLE".to_string(),
            ..MockCastState::default()
        })
        .await
    }

    pub async fn start_with_state(initial_state: MockCastState) -> Self {
        let state = Arc::new(RwLock::new(initial_state));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = {
            let state = state.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(serve_connection(stream, state.clone()));
                }
            })
        };

        Self {
            addr,
            state,
            handle,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn received(&self) -> Vec<ReceivedMessage> {
        self.state.read().await.received.clone()
    }

    /// `type` field of every received payload, heartbeats excluded
    pub async fn message_types(&self) -> Vec<String> {
        self.received()
            .await
            .into_iter()
            .filter(|m| m.namespace != HEARTBEAT_NS)
            .filter_map(|m| m.payload["type"].as_str().map(str::to_string))
            .collect()
    }

    pub async fn last_load(&self) -> Option<Value> {
        self.received()
            .await
            .into_iter()
            .rev()
            .find(|m| m.payload["type"] == "LOAD")
            .map(|m| m.payload)
    }

    pub async fn stop(self) {
        self.handle.abort();
    }
}

async fn serve_connection(stream: TcpStream, state: Arc<RwLock<MockCastState>>) {
    let (mut reader, mut writer) = stream.into_split();

    while let Ok(message) = read_frame(&mut reader).await {
        let Some(payload) = message.json_payload() else {
            continue;
        };
        let replies = {
            let mut s = state.write().await;
            s.received.push(ReceivedMessage {
                destination: message.destination_id.clone(),
                namespace: message.namespace.clone(),
                payload: payload.clone(),
            });
            respond(&mut s, &message, &payload)
        };

        for (namespace, reply) in replies {
            let frame = CastMessage::json(
                &message.destination_id,
                &message.source_id,
                namespace,
                &reply,
            );
            if write_frame(&mut writer, &frame).await.is_err() {
                return;
            }
        }
    }
}

fn receiver_status(state: &MockCastState, request_id: &Value) -> Value {
    let applications: Vec<Value> = state
        .running_app
        .iter()
        .map(|app| {
            json!({
                "appId": app,
                "displayName": "Default Media Receiver",
                "sessionId": "mock-session",
                "transportId": TRANSPORT_ID,
            })
        })
        .collect();
    json!({
        "type": "RECEIVER_STATUS",
        "requestId": request_id,
        "status": {"applications": applications, "volume": {"level": 1.0, "muted": false}},
    })
}

fn media_status(state: &MockCastState, request_id: &Value) -> Value {
    let status: Vec<Value> = state
        .media_session_id
        .iter()
        .map(|id| {
            json!({
                "mediaSessionId": id,
                "playerState": state.player_state,
                "currentTime": 0.0,
                "media": {"duration": 600.0},
            })
        })
        .collect();
    json!({"type": "MEDIA_STATUS", "requestId": request_id, "status": status})
}

fn respond(
    state: &mut MockCastState,
    message: &CastMessage,
    payload: &Value,
) -> Vec<(&'static str, Value)> {
    let request_id = payload["requestId"].clone();
    let kind = payload["type"].as_str().unwrap_or_default();

    match (message.namespace.as_str(), kind) {
        (HEARTBEAT_NS, "PING") => vec![(HEARTBEAT_NS, json!({"type": "PONG"}))],
        (CONNECTION_NS, _) => Vec::new(),
        (RECEIVER_NS, "LAUNCH") => {
            if state.reject_launch {
                return vec![(
                    RECEIVER_NS,
                    json!({"type": "LAUNCH_ERROR", "requestId": request_id, "reason": "NOT_FOUND"}),
                )];
            }
            state.running_app = payload["appId"].as_str().map(str::to_string);
            vec![(RECEIVER_NS, receiver_status(state, &request_id))]
        }
        (RECEIVER_NS, "GET_STATUS") => vec![(RECEIVER_NS, receiver_status(state, &request_id))],
        (MEDIA_NS, _) if message.destination_id != TRANSPORT_ID => vec![(
            MEDIA_NS,
            json!({"type": "INVALID_REQUEST", "requestId": request_id, "reason": "INVALID_DESTINATION"}),
        )],
        (MEDIA_NS, "LOAD") => {
            if payload["media"]["contentType"].as_str().is_none() {
                return vec![(
                    MEDIA_NS,
                    json!({"type": "LOAD_FAILED", "requestId": request_id}),
                )];
            }
            state.media_session_id = Some(state.media_session_id.unwrap_or(0) + 1);
            state.player_state = "BUFFERING".to_string();
            vec![(MEDIA_NS, media_status(state, &request_id))]
        }
        (MEDIA_NS, "PAUSE") | (MEDIA_NS, "PLAY") | (MEDIA_NS, "STOP") => {
            if payload["mediaSessionId"].as_i64() != state.media_session_id {
                return vec![(
                    MEDIA_NS,
                    json!({"type": "INVALID_REQUEST", "requestId": request_id, "reason": "INVALID_MEDIA_SESSION_ID"}),
                )];
            }
            state.player_state = match kind {
                "PAUSE" => "PAUSED",
                "PLAY" => "PLAYING",
                _ => "IDLE",
            }
            .to_string();
            let reply = media_status(state, &request_id);
            if kind == "STOP" {
                state.media_session_id = None;
            }
            vec![(MEDIA_NS, reply)]
        }
        (MEDIA_NS, "GET_STATUS") => vec![(MEDIA_NS, media_status(state, &request_id))],
        _ => Vec::new(),
    }
}
