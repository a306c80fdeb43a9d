//! Wire surfaces of the voice backend
//!
//! - `client`: streaming duplex socket with auth handshake and chunked replies
//! - `backend`: request/response HTTP endpoints (`/voice/chat`, `/voice/speak`)

pub mod backend;
pub mod chunks;
pub mod client;
pub mod messages;

pub use backend::{BackendClient, ChatReply};
pub use chunks::ChunkBuffer;
pub use client::{ClientConfig, ConnectionState, ProtocolClient, ServerEvent};
pub use messages::{ClientMessage, ServerMessage, AUTH_SUCCESS};
