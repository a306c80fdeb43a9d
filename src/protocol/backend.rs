use base64::Engine;
use reqwest::header::CONTENT_TYPE;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::audio::{AudioArtifact, AudioClip, DEFAULT_MEDIA_TYPE};
use crate::error::{Result, VoiceError};

/// Answer of `POST /voice/chat`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ChatReply {
    #[serde(default)]
    pub user_text: String,
    #[serde(default)]
    pub agent_response: String,
    #[serde(default)]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub audio_base64: Option<String>,
    #[serde(default)]
    pub audio_type: Option<String>,
}

impl ChatReply {
    /// Synthesized reply audio, if the backend produced any
    pub fn audio(&self) -> Result<Option<AudioClip>> {
        let Some(encoded) = self.audio_base64.as_deref().filter(|s| !s.is_empty()) else {
            return Ok(None);
        };
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| VoiceError::Protocol(format!("reply audio is not valid base64: {e}")))?;
        let media_type = self.audio_type.as_deref().unwrap_or(DEFAULT_MEDIA_TYPE);
        Ok(Some(AudioClip::new(bytes, media_type)))
    }
}

/// HTTP client for the request/response voice endpoints
#[derive(Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    agent_id: String,
}

impl BackendClient {
    /// `base_url` is the API root, e.g. `http://localhost:8000/api`
    pub fn new(base_url: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
            agent_id: agent_id.into(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.token = (!token.is_empty()).then_some(token);
        self
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.http.post(format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Upload one capture and receive transcript, reply text and reply audio
    pub async fn voice_chat(&self, artifact: &AudioArtifact) -> Result<ChatReply> {
        let part = Part::bytes(artifact.as_bytes().to_vec())
            .file_name("recording.wav")
            .mime_str("audio/wav")?;
        let form = Form::new().part("audio", part);

        info!(
            "Posting {} bytes to /voice/chat for agent {}",
            artifact.len(),
            self.agent_id
        );
        let response = self
            .post("/voice/chat")
            .query(&[("agent_id", self.agent_id.as_str())])
            .multipart(form)
            .send()
            .await?;
        let response = check_status(response).await?;

        let reply: ChatReply = response.json().await?;
        debug!(
            "Chat reply: user_text={} chars, agent_response={} chars",
            reply.user_text.len(),
            reply.agent_response.len()
        );
        Ok(reply)
    }

    /// Synthesize `text` in the agent's voice
    pub async fn speak(&self, text: &str) -> Result<AudioClip> {
        let response = self
            .post("/voice/speak")
            .query(&[("agent_id", self.agent_id.as_str()), ("text", text)])
            .send()
            .await?;
        let response = check_status(response).await?;

        let media_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
            .unwrap_or_else(|| DEFAULT_MEDIA_TYPE.to_string());
        let bytes = response.bytes().await?;

        info!("Synthesized {} bytes of {}", bytes.len(), media_type);
        Ok(AudioClip::new(bytes.to_vec(), media_type))
    }
}

/// Map non-2xx answers to `Backend`, using the `detail` field when present
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let detail = match serde_json::from_str::<serde_json::Value>(&body) {
        Ok(json) => match json.get("detail") {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => body.clone(),
        },
        Err(_) if !body.is_empty() => body.clone(),
        Err(_) => status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string(),
    };

    warn!("Backend answered {}: {}", status, detail);
    Err(VoiceError::Backend {
        status: status.as_u16(),
        detail,
    })
}
