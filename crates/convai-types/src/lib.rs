//! Wire-level event model for the conversational agent protocol.
//!
//! Inbound events are what the server pushes to the client, outbound events
//! are the control messages the client sends back. Both are closed enums so
//! every consumer has to handle a newly added variant explicitly.

pub mod inbound;
pub mod outbound;
pub mod state;

pub use inbound::*;
pub use outbound::{FeedbackScore, OutboundEvent};
pub use state::{ConversationMode, DisconnectReason, SessionState};

/// Generic JSON object used for alignment data, response metadata and tool
/// parameters. Key order follows the source document.
pub type Payload = serde_json::Map<String, serde_json::Value>;
