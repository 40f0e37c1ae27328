//! Client for realtime conversational agent sessions.
//!
//! A [`ConversationSession`] decodes the server's JSON events, keeps track of
//! who is speaking, runs client-side tools the agent asks for and sends
//! replies back over a [`Transport`] supplied by the application.

pub mod audio;
pub mod callbacks;
pub mod codec;
pub mod config;
pub mod error;
pub mod router;
pub mod session;
pub mod tools;
pub mod transport;

pub use audio::{AudioIo, NoAudio};
pub use callbacks::Callbacks;
pub use config::{ConfigError, ConversationConfig, Language, Overrides};
pub use error::{DecodeError, SessionError};
pub use session::ConversationSession;
pub use tools::{ClientTool, END_CALL_TOOL, FnTool, ToolRegistry, ToolResult};
pub use transport::{Transport, TransportEvent, TransportEvents};

pub use convai_types as types;
