//! Voice session management
//!
//! This module provides the `TurnOrchestrator` state machine that sequences:
//! - Audio capture into a canonical artifact
//! - Submission through a `TurnExchange` (streaming socket or HTTP)
//! - Turn assembly from transcript and reply
//! - Exclusive playback with caption highlighting
//! - Replay, deletion and cancellation, all gated by request epochs

mod caption;
mod epoch;
mod exchange;
mod orchestrator;
mod turn;

pub use caption::CaptionState;
pub use epoch::Epoch;
pub use exchange::{ExchangeEvent, RequestExchange, SpeechSource, StreamingExchange, TurnExchange};
pub use orchestrator::{
    Command, Input, OrchestratorConfig, OrchestratorHandle, SessionEvent, TurnOrchestrator,
    TurnState,
};
pub use turn::ConversationTurn;
