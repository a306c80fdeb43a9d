pub mod audio;
pub mod config;
pub mod error;
pub mod protocol;
pub mod session;

pub use audio::{
    AudioArtifact, AudioCaptureEngine, AudioClip, AudioFile, AudioPlayer, CaptureConfig,
    CaptureSource, ClockPlayer, FileSource, PcmFrame, PlaybackEvent, PlaybackHandle, PlaybackId,
};
pub use config::{Config, Transport};
pub use error::{DeviceError, Notice, NoticeKind, Result, VoiceError};
pub use protocol::{BackendClient, ChatReply, ClientConfig, ConnectionState, ProtocolClient, ServerEvent};
pub use session::{
    CaptionState, Command, ConversationTurn, Epoch, ExchangeEvent, Input, OrchestratorConfig,
    OrchestratorHandle, RequestExchange, SessionEvent, SpeechSource, StreamingExchange,
    TurnExchange, TurnOrchestrator, TurnState,
};
