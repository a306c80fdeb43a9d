// In-process mock of the voice backend: the streaming socket and the
// request/response endpoints, served by axum on an ephemeral port.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_voice::audio::AudioArtifact;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use serde_json::{json, Value};
use tokio::net::TcpListener;

pub const TOKEN: &str = "secret";
pub const USER_TEXT: &str = "hello there";
pub const AGENT_TEXT: &str = "Hello world foo";

/// How the socket behaves after a client connects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Ack, then answer each capture with junk, transcript, response and "ABC" in 3 chunks
    Chunks,
    /// Like `Chunks` but the reply audio is a decodable WAV clip
    Speech,
    /// Answer the handshake with a failure status
    RejectAuth,
    /// Answer the handshake with an error envelope
    ErrorOnAuth,
    /// Send a domain message before the ack
    EarlyDomain,
    /// First capture is answered with a chunk gap, later ones normally
    Gap,
    /// Chunks arrive as 1, 0, 2 so chunk 0 lands mid-sequence
    Shuffled,
    /// Close right after the ack
    CloseAfterAuth,
}

#[derive(Debug, Clone)]
pub struct Upload {
    pub agent_id: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub len: usize,
}

#[derive(Clone, Default)]
pub struct Recorded {
    pub ws: Arc<Mutex<Vec<Value>>>,
    pub uploads: Arc<Mutex<Vec<Upload>>>,
    pub spoken: Arc<Mutex<Vec<String>>>,
}

#[derive(Clone)]
struct MockState {
    mode: Mode,
    recorded: Recorded,
}

pub struct MockBackend {
    pub addr: SocketAddr,
    pub recorded: Recorded,
}

impl MockBackend {
    pub async fn start(mode: Mode) -> Self {
        let recorded = Recorded::default();
        let state = MockState {
            mode,
            recorded: recorded.clone(),
        };

        let router = Router::new()
            .route("/api/ws/voice/:agent_id", get(voice_ws))
            .route("/api/voice/chat", post(voice_chat))
            .route("/api/voice/speak", post(voice_speak))
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { addr, recorded }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/api/ws", self.addr)
    }

    pub fn http_url(&self) -> String {
        format!("http://{}/api", self.addr)
    }

    pub fn ws_messages(&self) -> Vec<Value> {
        self.recorded.ws.lock().unwrap().clone()
    }
}

/// 16kHz mono WAV of silence
pub fn speech_wav(seconds: f64) -> Vec<u8> {
    let samples = vec![0.0; (seconds * 16000.0) as usize];
    AudioArtifact::encode(&samples, 16000).unwrap().into_bytes()
}

pub fn b64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub async fn within<T>(future: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

async fn send_json(socket: &mut WebSocket, value: Value) {
    let _ = socket.send(Message::Text(value.to_string())).await;
}

async fn voice_ws(
    ws: WebSocketUpgrade,
    Path(agent_id): Path<String>,
    State(state): State<MockState>,
) -> Response {
    ws.on_upgrade(move |socket| serve_voice(socket, agent_id, state))
}

async fn serve_voice(mut socket: WebSocket, agent_id: String, state: MockState) {
    let Some(Ok(Message::Text(first))) = socket.recv().await else {
        return;
    };
    let auth: Value = serde_json::from_str(&first).unwrap();
    state.recorded.ws.lock().unwrap().push(auth.clone());

    match state.mode {
        Mode::RejectAuth => {
            send_json(&mut socket, json!({"type": "auth", "status": "failure"})).await;
            return;
        }
        Mode::ErrorOnAuth => {
            send_json(&mut socket, json!({"type": "error", "message": "Agent not found"})).await;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
        Mode::EarlyDomain => {
            send_json(&mut socket, json!({"type": "transcript", "text": "too early"})).await;
        }
        _ => {}
    }

    if auth["type"] != "auth" || auth["token"] != TOKEN {
        send_json(&mut socket, json!({"type": "error", "message": "Invalid token"})).await;
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    send_json(
        &mut socket,
        json!({"type": "auth", "status": "success", "agent_name": format!("Agent {agent_id}")}),
    )
    .await;

    if state.mode == Mode::CloseAfterAuth {
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    let mut captures = 0;
    while let Some(Ok(msg)) = socket.recv().await {
        let Message::Text(text) = msg else {
            continue;
        };
        let value: Value = serde_json::from_str(&text).unwrap();
        state.recorded.ws.lock().unwrap().push(value.clone());

        match value["type"].as_str() {
            Some("ping") => send_json(&mut socket, json!({"type": "pong"})).await,
            Some("audio") => {
                captures += 1;
                answer_capture(&mut socket, state.mode, captures).await;
            }
            _ => {}
        }
    }
}

async fn answer_capture(socket: &mut WebSocket, mode: Mode, capture: usize) {
    let _ = socket.send(Message::Text("not json at all".into())).await;
    send_json(socket, json!({"type": "viseme", "frame": 1})).await;
    send_json(socket, json!({"type": "status", "message": "Transcribing..."})).await;
    send_json(socket, json!({"type": "transcript", "text": USER_TEXT})).await;
    send_json(socket, json!({"type": "response", "text": AGENT_TEXT})).await;

    let payload = match mode {
        Mode::Speech => speech_wav(0.2),
        _ => b"ABC".to_vec(),
    };
    let third = payload.len().div_ceil(3);
    let chunks: Vec<&[u8]> = payload.chunks(third).collect();
    let total = chunks.len();

    // Out of order on purpose
    let mut order: Vec<usize> = match mode {
        Mode::Shuffled => vec![1, 0, 2],
        _ => (0..total).rev().collect(),
    };
    if mode == Mode::Gap && capture == 1 {
        order.retain(|i| *i != 1);
    }
    for index in order {
        send_json(
            socket,
            json!({
                "type": "audio_chunk",
                "data": b64(chunks[index]),
                "chunk_index": index,
                "total_chunks": total,
            }),
        )
        .await;
    }
    send_json(socket, json!({"type": "audio_complete", "total_bytes": payload.len()})).await;
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("Bearer {TOKEN}"))
        .unwrap_or(false)
}

fn detail(status: StatusCode, detail: &str) -> Response {
    (status, Json(json!({ "detail": detail }))).into_response()
}

async fn voice_chat(
    State(state): State<MockState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    if !authorized(&headers) {
        return detail(StatusCode::UNAUTHORIZED, "Not authenticated");
    }
    let agent_id = params.get("agent_id").cloned().unwrap_or_default();
    if agent_id == "missing" {
        return detail(StatusCode::NOT_FOUND, "Agent not found");
    }

    let mut upload = None;
    while let Some(field) = multipart.next_field().await.unwrap() {
        if field.name() != Some("audio") {
            continue;
        }
        let file_name = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        let bytes = field.bytes().await.unwrap();
        upload = Some(Upload {
            agent_id: agent_id.clone(),
            file_name,
            content_type,
            len: bytes.len(),
        });
    }
    let Some(upload) = upload else {
        return detail(StatusCode::BAD_REQUEST, "No audio file");
    };
    state.recorded.uploads.lock().unwrap().push(upload);

    let (user_text, agent_response) = if agent_id == "silent" {
        ("", "")
    } else {
        (USER_TEXT, AGENT_TEXT)
    };

    Json(json!({
        "user_text": user_text,
        "agent_response": agent_response,
        "audio_base64": b64(&speech_wav(0.2)),
        "audio_type": "audio/wav",
        "agent_name": "Ada",
    }))
    .into_response()
}

async fn voice_speak(
    State(state): State<MockState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&headers) {
        return detail(StatusCode::UNAUTHORIZED, "Not authenticated");
    }
    let text = params.get("text").cloned().unwrap_or_default();
    if text.is_empty() {
        return detail(StatusCode::BAD_REQUEST, "Text is required");
    }
    state.recorded.spoken.lock().unwrap().push(text);

    (
        [(header::CONTENT_TYPE, "audio/wav")],
        speech_wav(0.2),
    )
        .into_response()
}
