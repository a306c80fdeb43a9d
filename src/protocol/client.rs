use std::sync::Arc;

use base64::Engine;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::chunks::ChunkBuffer;
use super::messages::{ClientMessage, ServerMessage, AUTH_SUCCESS};
use crate::audio::AudioArtifact;
use crate::error::{Result, VoiceError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Lifecycle of the one connection a client owns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    AwaitingAuth,
    Ready,
    Closed,
}

/// Where and as whom to connect
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the voice socket, e.g. `ws://localhost:8000/api/ws`
    pub ws_url: String,
    /// Agent the conversation is held with
    pub agent_id: String,
    /// Bearer token presented in the handshake
    pub token: String,
}

impl ClientConfig {
    pub fn endpoint(&self) -> String {
        format!("{}/voice/{}", self.ws_url.trim_end_matches('/'), self.agent_id)
    }
}

/// Decoded inbound traffic, delivered only after a successful handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Transcript(String),
    Response(String),
    /// Reassembled synthesized audio (empty if the server sent no chunks)
    Audio(Vec<u8>),
    Status(String),
    /// Server-reported failure of the current request
    Error(String),
    /// A chunk sequence could not be reassembled
    ProtocolError(String),
    /// The transport went away
    Closed(String),
}

/// Duplex client for the streaming voice protocol.
///
/// Reconnection is always up to the caller: once `Closed`, the client stays
/// closed until `connect` is called again.
pub struct ProtocolClient {
    config: ClientConfig,
    state: Arc<watch::Sender<ConnectionState>>,
    sink: Arc<Mutex<Option<WsSink>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    identity: Mutex<Option<String>>,
}

impl ProtocolClient {
    pub fn new(config: ClientConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            state: Arc::new(state),
            sink: Arc::new(Mutex::new(None)),
            reader: Mutex::new(None),
            identity: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Agent name reported in the handshake
    pub async fn identity(&self) -> Option<String> {
        self.identity.lock().await.clone()
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!("Connection state {:?} -> {:?}", prev, next);
        }
    }

    /// Open the transport and complete the auth handshake.
    ///
    /// Resolves only on a successful auth ack; any other outcome leaves the
    /// client `Closed`. Returns the stream of inbound events.
    pub async fn connect(&self) -> Result<mpsc::Receiver<ServerEvent>> {
        match self.state() {
            ConnectionState::Disconnected | ConnectionState::Closed => {}
            state => {
                return Err(VoiceError::Connection(format!(
                    "connect called while {state:?}"
                )))
            }
        }

        let endpoint = self.config.endpoint();
        info!("Connecting to voice socket at {}", endpoint);
        self.set_state(ConnectionState::Connecting);

        let (ws_stream, _response) = match tokio_tungstenite::connect_async(endpoint.as_str()).await {
            Ok(connected) => connected,
            Err(e) => {
                self.set_state(ConnectionState::Closed);
                return Err(VoiceError::Connection(format!("failed to connect: {e}")));
            }
        };

        let (mut sink, mut stream) = ws_stream.split();

        let auth = ClientMessage::Auth {
            token: self.config.token.clone(),
        }
        .to_json()?;
        if let Err(e) = sink.send(Message::Text(auth)).await {
            self.set_state(ConnectionState::Closed);
            return Err(VoiceError::Connection(format!("failed to send auth: {e}")));
        }
        self.set_state(ConnectionState::AwaitingAuth);

        match await_auth_ack(&mut stream).await {
            Ok(identity) => {
                info!(
                    "Authenticated for agent {}",
                    identity.as_deref().unwrap_or(&self.config.agent_id)
                );
                *self.identity.lock().await = identity;
            }
            Err(e) => {
                warn!("Handshake failed: {}", e);
                let _ = sink.send(Message::Close(None)).await;
                self.set_state(ConnectionState::Closed);
                return Err(e);
            }
        }

        let (event_tx, event_rx) = mpsc::channel(256);
        *self.sink.lock().await = Some(sink);
        self.set_state(ConnectionState::Ready);

        let state = Arc::clone(&self.state);
        let reader = tokio::spawn(async move {
            inbound_loop(stream, event_tx).await;
            state.send_replace(ConnectionState::Closed);
        });
        *self.reader.lock().await = Some(reader);

        Ok(event_rx)
    }

    /// Transmit one artifact as an `audio` envelope
    pub async fn send_audio(&self, artifact: &AudioArtifact) -> Result<()> {
        self.ensure_ready()?;

        let data = base64::engine::general_purpose::STANDARD.encode(artifact.as_bytes());
        self.send(ClientMessage::Audio { data }).await?;

        info!("Sent audio ({} bytes)", artifact.len());
        Ok(())
    }

    /// Keep-alive request; the server answers with `pong`
    pub async fn ping(&self) -> Result<()> {
        self.ensure_ready()?;
        self.send(ClientMessage::Ping).await
    }

    /// Close the transport. No reconnect is attempted.
    pub async fn disconnect(&self) {
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        }
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
        if self.state() != ConnectionState::Closed {
            info!("Disconnected from {}", self.config.endpoint());
        }
        self.set_state(ConnectionState::Closed);
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Ready => Ok(()),
            state => Err(VoiceError::NotConnected { state }),
        }
    }

    async fn send(&self, message: ClientMessage) -> Result<()> {
        let json = message.to_json()?;
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(VoiceError::NotConnected {
            state: self.state(),
        })?;

        if let Err(e) = sink.send(Message::Text(json)).await {
            error!("Send failed, closing connection: {}", e);
            guard.take();
            self.set_state(ConnectionState::Closed);
            return Err(VoiceError::Connection(format!("send failed: {e}")));
        }
        Ok(())
    }
}

impl Drop for ProtocolClient {
    fn drop(&mut self) {
        if let Ok(mut reader) = self.reader.try_lock() {
            if let Some(reader) = reader.take() {
                reader.abort();
            }
        }
    }
}

/// Wait for the handshake answer. Domain messages arriving first are dropped.
async fn await_auth_ack(stream: &mut SplitStream<WsStream>) -> Result<Option<String>> {
    while let Some(msg) = stream.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(frame)) => {
                return Err(VoiceError::Connection(format!(
                    "closed during handshake: {frame:?}"
                )))
            }
            Ok(_) => continue,
            Err(e) => return Err(VoiceError::Connection(format!("handshake failed: {e}"))),
        };

        match ServerMessage::parse(&text) {
            Ok(ServerMessage::AuthAck { status, identity }) => {
                if status == AUTH_SUCCESS {
                    return Ok(identity);
                }
                return Err(VoiceError::Auth(format!("server answered status '{status}'")));
            }
            Ok(ServerMessage::Error { message }) => return Err(VoiceError::Auth(message)),
            Ok(other) => warn!("Dropping '{}' received before handshake", other.kind()),
            Err(e) => warn!("Dropping envelope during handshake: {}", e),
        }
    }

    Err(VoiceError::Connection("closed during handshake".into()))
}

/// Decode inbound envelopes until the transport closes
async fn inbound_loop(mut stream: SplitStream<WsStream>, event_tx: mpsc::Sender<ServerEvent>) {
    let mut chunks = ChunkBuffer::new();

    let reason = loop {
        let text = match stream.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(frame))) => break format!("closed by server: {frame:?}"),
            Some(Ok(Message::Binary(bytes))) => {
                warn!("Dropping unexpected binary frame ({} bytes)", bytes.len());
                continue;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => break format!("transport error: {e}"),
            None => break "connection ended".to_string(),
        };

        let message = match ServerMessage::parse(&text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping envelope: {}", e);
                continue;
            }
        };

        let event = match message {
            ServerMessage::Transcript { text } => ServerEvent::Transcript(text),
            ServerMessage::Response { text } => ServerEvent::Response(text),
            ServerMessage::AudioChunk {
                index,
                total,
                payload,
            } => {
                if let Err(e) = chunks.push(index, total, &payload) {
                    warn!("Dropping audio chunk: {}", e);
                }
                continue;
            }
            ServerMessage::AudioComplete { total_bytes } => match chunks.complete() {
                Ok(bytes) => {
                    if let Some(expected) = total_bytes {
                        if expected != bytes.len() as u64 {
                            warn!(
                                "Reassembled {} bytes, server announced {}",
                                bytes.len(),
                                expected
                            );
                        }
                    }
                    ServerEvent::Audio(bytes)
                }
                Err(e) => ServerEvent::ProtocolError(e.to_string()),
            },
            ServerMessage::Status { message } => ServerEvent::Status(message),
            ServerMessage::Error { message } => ServerEvent::Error(message),
            ServerMessage::Pong => {
                debug!("Pong");
                continue;
            }
            ServerMessage::AuthAck { .. } => {
                debug!("Ignoring repeated auth ack");
                continue;
            }
            ServerMessage::Unknown => {
                warn!("Dropping envelope of unknown type");
                continue;
            }
        };

        if event_tx.send(event).await.is_err() {
            debug!("Event receiver dropped, closing inbound loop");
            return;
        }
    };

    info!("Voice socket closed: {}", reason);
    let _ = event_tx.send(ServerEvent::Closed(reason)).await;
}
