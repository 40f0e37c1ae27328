use serde::{Deserialize, Serialize};

/// Control messages sent from the client to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    /// A typed message from the user; triggers an agent response.
    UserMessage { text: String },
    /// Tells the agent the user is active (e.g. typing) so it holds off speaking.
    UserActivity,
    /// Like/dislike for an agent turn.
    Feedback { score: FeedbackScore, event_id: i64 },
    /// Background context that does not trigger a response.
    ContextualUpdate { text: String },
    /// Reply to a `client_tool_call`. `result` is always a string, plain text or JSON.
    ClientToolResult {
        tool_call_id: String,
        result: String,
        is_error: bool,
    },
    /// Answer to a ping.
    Pong { event_id: i64 },
}

impl OutboundEvent {
    /// The wire discriminator of this event.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UserMessage { .. } => "user_message",
            Self::UserActivity => "user_activity",
            Self::Feedback { .. } => "feedback",
            Self::ContextualUpdate { .. } => "contextual_update",
            Self::ClientToolResult { .. } => "client_tool_result",
            Self::Pong { .. } => "pong",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackScore {
    Like,
    Dislike,
}

impl From<bool> for FeedbackScore {
    fn from(is_positive: bool) -> Self {
        if is_positive { Self::Like } else { Self::Dislike }
    }
}
