//! Application observers for session and conversation events.
//!
//! Every observer runs behind [`guarded`]: a panicking observer is logged and
//! skipped, and the event loop carries on with the next event.

use convai_types::{
    AgentResponseCorrection, AgentToolResponse, ClientToolCall, ConversationInitiationMetadata,
    ConversationMode, DisconnectReason, Payload, ServerError, SessionState,
    TentativeUserTranscript,
};
use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};
use tracing::warn;

type Observer<T> = Option<Arc<T>>;

/// Optional observers, one per event category.
///
/// Built with the `on_*` methods:
///
/// ```
/// use convai_client::Callbacks;
///
/// let callbacks = Callbacks::default()
///     .on_agent_response(|text| println!("agent: {text}"))
///     .on_mode_change(|mode| println!("mode: {mode}"));
/// ```
#[derive(Clone, Default)]
pub struct Callbacks {
    connect: Observer<dyn Fn(&str) + Send + Sync>,
    disconnect: Observer<dyn Fn(&DisconnectReason) + Send + Sync>,
    status_change: Observer<dyn Fn(SessionState) + Send + Sync>,
    mode_change: Observer<dyn Fn(ConversationMode) + Send + Sync>,
    can_send_feedback_change: Observer<dyn Fn(bool) + Send + Sync>,
    unhandled_client_tool_call: Observer<dyn Fn(&ClientToolCall) + Send + Sync>,
    vad_score: Observer<dyn Fn(f32) + Send + Sync>,
    audio_alignment: Observer<dyn Fn(&Payload) + Send + Sync>,
    agent_response_metadata: Observer<dyn Fn(&Payload) + Send + Sync>,
    user_transcript: Observer<dyn Fn(&str) + Send + Sync>,
    tentative_user_transcript: Observer<dyn Fn(&TentativeUserTranscript) + Send + Sync>,
    agent_response: Observer<dyn Fn(&str) + Send + Sync>,
    tentative_agent_response: Observer<dyn Fn(&str) + Send + Sync>,
    agent_response_correction: Observer<dyn Fn(&AgentResponseCorrection) + Send + Sync>,
    agent_tool_response: Observer<dyn Fn(&AgentToolResponse) + Send + Sync>,
    conversation_initiation_metadata: Observer<dyn Fn(&ConversationInitiationMetadata) + Send + Sync>,
    interruption: Observer<dyn Fn(i64) + Send + Sync>,
    error: Observer<dyn Fn(&ServerError) + Send + Sync>,
}

impl Callbacks {
    /// Called with the conversation id once the server has accepted the session.
    pub fn on_connect(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.connect = Some(Arc::new(f));
        self
    }

    pub fn on_disconnect(mut self, f: impl Fn(&DisconnectReason) + Send + Sync + 'static) -> Self {
        self.disconnect = Some(Arc::new(f));
        self
    }

    pub fn on_status_change(mut self, f: impl Fn(SessionState) + Send + Sync + 'static) -> Self {
        self.status_change = Some(Arc::new(f));
        self
    }

    pub fn on_mode_change(mut self, f: impl Fn(ConversationMode) + Send + Sync + 'static) -> Self {
        self.mode_change = Some(Arc::new(f));
        self
    }

    /// Fires `true` when an agent turn becomes eligible for feedback and
    /// `false` once feedback was sent or the turn was interrupted.
    pub fn on_can_send_feedback_change(mut self, f: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.can_send_feedback_change = Some(Arc::new(f));
        self
    }

    /// Receives tool calls with no registered tool. Setting this disables the
    /// automatic error reply; answer with `send_tool_result` instead.
    pub fn on_unhandled_client_tool_call(
        mut self,
        f: impl Fn(&ClientToolCall) + Send + Sync + 'static,
    ) -> Self {
        self.unhandled_client_tool_call = Some(Arc::new(f));
        self
    }

    pub fn on_vad_score(mut self, f: impl Fn(f32) + Send + Sync + 'static) -> Self {
        self.vad_score = Some(Arc::new(f));
        self
    }

    pub fn on_audio_alignment(mut self, f: impl Fn(&Payload) + Send + Sync + 'static) -> Self {
        self.audio_alignment = Some(Arc::new(f));
        self
    }

    pub fn on_agent_response_metadata(mut self, f: impl Fn(&Payload) + Send + Sync + 'static) -> Self {
        self.agent_response_metadata = Some(Arc::new(f));
        self
    }

    pub fn on_user_transcript(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.user_transcript = Some(Arc::new(f));
        self
    }

    pub fn on_tentative_user_transcript(
        mut self,
        f: impl Fn(&TentativeUserTranscript) + Send + Sync + 'static,
    ) -> Self {
        self.tentative_user_transcript = Some(Arc::new(f));
        self
    }

    /// Receives final agent responses and streamed text deltas.
    pub fn on_agent_response(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.agent_response = Some(Arc::new(f));
        self
    }

    pub fn on_tentative_agent_response(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.tentative_agent_response = Some(Arc::new(f));
        self
    }

    pub fn on_agent_response_correction(
        mut self,
        f: impl Fn(&AgentResponseCorrection) + Send + Sync + 'static,
    ) -> Self {
        self.agent_response_correction = Some(Arc::new(f));
        self
    }

    pub fn on_agent_tool_response(
        mut self,
        f: impl Fn(&AgentToolResponse) + Send + Sync + 'static,
    ) -> Self {
        self.agent_tool_response = Some(Arc::new(f));
        self
    }

    pub fn on_conversation_initiation_metadata(
        mut self,
        f: impl Fn(&ConversationInitiationMetadata) + Send + Sync + 'static,
    ) -> Self {
        self.conversation_initiation_metadata = Some(Arc::new(f));
        self
    }

    pub fn on_interruption(mut self, f: impl Fn(i64) + Send + Sync + 'static) -> Self {
        self.interruption = Some(Arc::new(f));
        self
    }

    /// Receives server-sent error events.
    pub fn on_error(mut self, f: impl Fn(&ServerError) + Send + Sync + 'static) -> Self {
        self.error = Some(Arc::new(f));
        self
    }

    pub(crate) fn has_unhandled_client_tool_call(&self) -> bool {
        self.unhandled_client_tool_call.is_some()
    }

    // --- Guarded dispatch ---

    pub(crate) fn connect(&self, conversation_id: &str) {
        fire("on_connect", &self.connect, |f| f(conversation_id));
    }

    pub(crate) fn disconnect(&self, reason: &DisconnectReason) {
        fire("on_disconnect", &self.disconnect, |f| f(reason));
    }

    pub(crate) fn status_change(&self, status: SessionState) {
        fire("on_status_change", &self.status_change, |f| f(status));
    }

    pub(crate) fn mode_change(&self, mode: ConversationMode) {
        fire("on_mode_change", &self.mode_change, |f| f(mode));
    }

    pub(crate) fn can_send_feedback_change(&self, can_send: bool) {
        fire("on_can_send_feedback_change", &self.can_send_feedback_change, |f| f(can_send));
    }

    pub(crate) fn unhandled_client_tool_call(&self, call: &ClientToolCall) {
        fire("on_unhandled_client_tool_call", &self.unhandled_client_tool_call, |f| f(call));
    }

    pub(crate) fn vad_score(&self, score: f32) {
        fire("on_vad_score", &self.vad_score, |f| f(score));
    }

    pub(crate) fn audio_alignment(&self, alignment: &Payload) {
        fire("on_audio_alignment", &self.audio_alignment, |f| f(alignment));
    }

    pub(crate) fn agent_response_metadata(&self, metadata: &Payload) {
        fire("on_agent_response_metadata", &self.agent_response_metadata, |f| f(metadata));
    }

    pub(crate) fn user_transcript(&self, text: &str) {
        fire("on_user_transcript", &self.user_transcript, |f| f(text));
    }

    pub(crate) fn tentative_user_transcript(&self, transcript: &TentativeUserTranscript) {
        fire("on_tentative_user_transcript", &self.tentative_user_transcript, |f| f(transcript));
    }

    pub(crate) fn agent_response(&self, text: &str) {
        fire("on_agent_response", &self.agent_response, |f| f(text));
    }

    pub(crate) fn tentative_agent_response(&self, text: &str) {
        fire("on_tentative_agent_response", &self.tentative_agent_response, |f| f(text));
    }

    pub(crate) fn agent_response_correction(&self, correction: &AgentResponseCorrection) {
        fire("on_agent_response_correction", &self.agent_response_correction, |f| f(correction));
    }

    pub(crate) fn agent_tool_response(&self, response: &AgentToolResponse) {
        fire("on_agent_tool_response", &self.agent_tool_response, |f| f(response));
    }

    pub(crate) fn conversation_initiation_metadata(&self, metadata: &ConversationInitiationMetadata) {
        fire(
            "on_conversation_initiation_metadata",
            &self.conversation_initiation_metadata,
            |f| f(metadata),
        );
    }

    pub(crate) fn interruption(&self, event_id: i64) {
        fire("on_interruption", &self.interruption, |f| f(event_id));
    }

    pub(crate) fn error(&self, error: &ServerError) {
        fire("on_error", &self.error, |f| f(error));
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks").finish_non_exhaustive()
    }
}

fn fire<F: ?Sized>(name: &'static str, observer: &Observer<F>, call: impl FnOnce(&F)) {
    if let Some(observer) = observer {
        guarded(name, || call(&**observer));
    }
}

/// Runs `f`, logging and swallowing a panic instead of unwinding into the caller.
pub(crate) fn guarded(name: &'static str, f: impl FnOnce()) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(payload) => {
            warn!(callback = name, reason = %panic_message(payload.as_ref()), "Callback panicked; continuing");
            false
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
