use thiserror::Error;

use crate::protocol::ConnectionState;

pub type Result<T> = std::result::Result<T, VoiceError>;

/// Failures acquiring or driving an audio device.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Microphone permission denied")]
    PermissionDenied,

    #[error("Audio device unavailable: {0}")]
    Unavailable(String),

    #[error("Audio device failure: {0}")]
    Failed(String),
}

#[derive(Error, Debug)]
pub enum VoiceError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("Recording too short to process ({bytes} bytes, need {threshold})")]
    RecordingTooShort { bytes: usize, threshold: usize },

    #[error("A recording session is already active")]
    AlreadyRecording,

    #[error("No recording session is active")]
    NotRecording,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication rejected: {0}")]
    Auth(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Not connected (connection is {state:?})")]
    NotConnected { state: ConnectionState },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Cannot do that while {state}")]
    Busy { state: &'static str },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("Audio decoding failed: {0}")]
    Decode(String),

    #[error("Backend error ({status}): {detail}")]
    Backend { status: u16, detail: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Category of a user-facing notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    RecordingTooShort,
    Device,
    Connection,
    Auth,
    Protocol,
    Transport,
    Backend,
    Playback,
    Busy,
}

/// A single transient, dismissable notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub message: String,
}

impl Notice {
    pub fn new(kind: NoticeKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl VoiceError {
    /// The notice to show for this error, or `None` when it must stay silent.
    pub fn notice(&self) -> Option<Notice> {
        let kind = match self {
            VoiceError::Cancelled => return None,
            VoiceError::Device(_) => NoticeKind::Device,
            VoiceError::RecordingTooShort { .. } => NoticeKind::RecordingTooShort,
            VoiceError::AlreadyRecording | VoiceError::NotRecording | VoiceError::Busy { .. } => {
                NoticeKind::Busy
            }
            VoiceError::Connection(_) => NoticeKind::Connection,
            VoiceError::Auth(_) => NoticeKind::Auth,
            VoiceError::Protocol(_) => NoticeKind::Protocol,
            VoiceError::NotConnected { .. } => NoticeKind::Transport,
            VoiceError::Backend { .. } | VoiceError::Http(_) => NoticeKind::Backend,
            VoiceError::Wav(_) | VoiceError::InvalidConfig(_) => NoticeKind::Device,
            VoiceError::Decode(_) => NoticeKind::Playback,
        };

        Some(Notice::new(kind, self.to_string()))
    }
}
