use serde::{Deserialize, Serialize};

use crate::error::{Result, VoiceError};

/// Status value the server sends on a successful handshake
pub const AUTH_SUCCESS: &str = "success";

/// Envelope sent by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Mandatory first message on every connection
    Auth { token: String },
    /// One finalized capture, base64 WAV bytes
    Audio { data: String },
    Ping,
}

/// Envelope sent by the server
///
/// Unrecognized `type` values land in `Unknown`; a known type with missing
/// or mistyped fields fails to parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake answer
    #[serde(rename = "auth")]
    AuthAck {
        status: String,
        #[serde(rename = "agent_name", default, skip_serializing_if = "Option::is_none")]
        identity: Option<String>,
    },
    Transcript {
        text: String,
    },
    Response {
        text: String,
    },
    AudioChunk {
        #[serde(rename = "chunk_index")]
        index: u32,
        #[serde(rename = "total_chunks")]
        total: u32,
        /// Base64 payload fragment
        #[serde(rename = "data")]
        payload: String,
    },
    AudioComplete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_bytes: Option<u64>,
    },
    Status {
        message: String,
    },
    Error {
        message: String,
    },
    Pong,
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| VoiceError::Protocol(format!("failed to serialize envelope: {e}")))
    }
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| VoiceError::Protocol(format!("malformed envelope: {e}")))
    }

    /// Messages that belong to a voice exchange rather than connection upkeep
    pub fn is_domain(&self) -> bool {
        !matches!(
            self,
            ServerMessage::AuthAck { .. } | ServerMessage::Pong | ServerMessage::Unknown
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::AuthAck { .. } => "auth",
            ServerMessage::Transcript { .. } => "transcript",
            ServerMessage::Response { .. } => "response",
            ServerMessage::AudioChunk { .. } => "audio_chunk",
            ServerMessage::AudioComplete { .. } => "audio_complete",
            ServerMessage::Status { .. } => "status",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Pong => "pong",
            ServerMessage::Unknown => "unknown",
        }
    }
}
