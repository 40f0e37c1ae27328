use crate::Payload;
use base64::Engine;

/// Every event the server can push during a conversation.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    AudioAlignment(AudioAlignment),
    AgentResponseMetadata(AgentResponseMetadata),
    AgentChatResponsePart(AgentChatResponsePart),
    TentativeUserTranscript(TentativeUserTranscript),
    TentativeAgentResponse(TentativeAgentResponse),
    ConversationInitiationMetadata(ConversationInitiationMetadata),
    Audio(AudioChunk),
    AgentResponse(AgentResponse),
    AgentResponseCorrection(AgentResponseCorrection),
    UserTranscript(UserTranscript),
    ClientToolCall(ClientToolCall),
    AgentToolResponse(AgentToolResponse),
    VadScore(VadScore),
    Ping(Ping),
    Interruption(Interruption),
    ServerError(ServerError),
}

impl InboundEvent {
    /// Short name of the variant, used as a structured logging field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AudioAlignment(_) => "audio_alignment",
            Self::AgentResponseMetadata(_) => "agent_response_metadata",
            Self::AgentChatResponsePart(_) => "agent_chat_response_part",
            Self::TentativeUserTranscript(_) => "tentative_user_transcript",
            Self::TentativeAgentResponse(_) => "internal_tentative_agent_response",
            Self::ConversationInitiationMetadata(_) => "conversation_initiation_metadata",
            Self::Audio(_) => "audio",
            Self::AgentResponse(_) => "agent_response",
            Self::AgentResponseCorrection(_) => "agent_response_correction",
            Self::UserTranscript(_) => "user_transcript",
            Self::ClientToolCall(_) => "client_tool_call",
            Self::AgentToolResponse(_) => "agent_tool_response",
            Self::VadScore(_) => "vad_score",
            Self::Ping(_) => "ping",
            Self::Interruption(_) => "interruption",
            Self::ServerError(_) => "error",
        }
    }
}

/// Character-level timing data for synthesized speech. The structure varies
/// between server versions, so it is kept as a generic map.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioAlignment {
    pub alignment: Payload,
}

/// Additional timing/semantic info about an agent response.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentResponseMetadata {
    pub metadata: Payload,
}

/// Lifecycle of a streamed text response: `start`, any number of `delta`s, `stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatPartPhase {
    Start,
    Delta,
    Stop,
}

impl ChatPartPhase {
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "start" => Some(Self::Start),
            "delta" => Some(Self::Delta),
            "stop" => Some(Self::Stop),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentChatResponsePart {
    pub phase: ChatPartPhase,
    pub text: String,
}

/// A partial user transcript that may still be superseded.
#[derive(Debug, Clone, PartialEq)]
pub struct TentativeUserTranscript {
    pub text: String,
    pub event_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TentativeAgentResponse {
    pub text: String,
}

/// First event of every conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationInitiationMetadata {
    pub conversation_id: String,
    pub agent_output_audio_format: String,
    pub user_input_audio_format: String,
}

/// A chunk of agent audio. Playback is owned by the audio layer; the client
/// only observes these.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub event_id: i64,
    pub audio_base64: String,
}

impl AudioChunk {
    /// Number of raw bytes carried by the chunk, or `None` if the payload is
    /// not valid base64.
    pub fn decoded_len(&self) -> Option<usize> {
        base64::engine::general_purpose::STANDARD
            .decode(&self.audio_base64)
            .ok()
            .map(|bytes| bytes.len())
    }
}

/// The final text of an agent turn.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentResponse {
    pub text: String,
    /// Server event id of the turn, when the protocol variant carries one.
    pub event_id: Option<i64>,
}

/// Sent after an interruption, when the agent's spoken text was cut short.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentResponseCorrection {
    pub original: String,
    pub corrected: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserTranscript {
    pub text: String,
}

/// A request from the agent to run a tool on the client.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientToolCall {
    pub tool_name: String,
    pub parameters: Payload,
    pub tool_call_id: String,
    /// Whether the agent waits for a `client_tool_result`.
    pub expects_response: bool,
}

/// Notification that a server-side tool ran.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentToolResponse {
    pub tool_name: String,
    pub tool_call_id: String,
    pub tool_type: String,
    pub is_error: bool,
}

/// Voice activity detection score, 0.0 to 1.0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadScore {
    pub score: f32,
}

/// Liveness probe; must be answered with a pong carrying the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    pub event_id: i64,
    pub ping_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interruption {
    pub event_id: i64,
}

/// Error reported by the server. Does not end the session by itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub code: i64,
    pub message: Option<String>,
}

impl ServerError {
    /// Code used when the server omits one (websocket "internal error").
    pub const DEFAULT_CODE: i64 = 1011;
}
