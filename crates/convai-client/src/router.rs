//! Routes decoded inbound events to state updates, callbacks, tool
//! executions and replies.

use crate::{
    audio::AudioIo,
    callbacks::Callbacks,
    tools::{END_CALL_TOOL, ToolRegistry},
};
use convai_types::{ChatPartPhase, ClientToolCall, ConversationMode, FeedbackScore, InboundEvent, OutboundEvent};
use std::sync::Arc;
use tokio::{
    sync::{mpsc, watch},
    task::JoinSet,
};
use tracing::{Instrument, debug, trace, warn};

/// Requests from the router to the session that owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterSignal {
    /// The agent invoked `end_call`.
    EndRequested,
    /// The server accepted the session under this conversation id.
    ConversationStarted(String),
}

/// Non-blocking handle onto the session's outbound queue.
#[derive(Debug, Clone)]
pub struct Outbound(mpsc::UnboundedSender<OutboundEvent>);

impl Outbound {
    pub fn new(tx: mpsc::UnboundedSender<OutboundEvent>) -> Self {
        Self(tx)
    }

    /// Queues `event`. Returns false once the session has shut its queue down.
    pub fn send(&self, event: OutboundEvent) -> bool {
        let kind = event.kind();
        if self.0.send(event).is_err() {
            debug!(event = kind, "Outbound queue closed; dropping event");
            return false;
        }
        true
    }
}

/// Feedback bookkeeping for the current session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedbackState {
    pub last_agent_event_id: Option<i64>,
    pub last_feedback_sent_for_event_id: Option<i64>,
}

impl FeedbackState {
    /// The event id feedback would be sent for right now, if any.
    pub fn pending(&self) -> Option<i64> {
        let target = self.last_agent_event_id?;
        match self.last_feedback_sent_for_event_id {
            Some(sent) if target <= sent => None,
            _ => Some(target),
        }
    }

    fn next_synthetic_id(&self) -> i64 {
        self.last_agent_event_id
            .max(self.last_feedback_sent_for_event_id)
            .map_or(1, |id| id + 1)
    }
}

/// Processes inbound events one at a time.
///
/// The router is the only writer of the conversation mode and of the feedback
/// state. Everything that may take time (tool executions) runs in its own
/// task, and every reply goes through the unbounded outbound queue, so
/// `handle` never waits.
pub struct EventRouter {
    mode: Arc<watch::Sender<ConversationMode>>,
    feedback: FeedbackState,
    tools: ToolRegistry,
    callbacks: Arc<Callbacks>,
    outbound: Outbound,
    playback: Option<Arc<dyn AudioIo>>,
    signals: mpsc::UnboundedSender<RouterSignal>,
    tasks: JoinSet<()>,
}

impl EventRouter {
    /// `playback` is `None` for text-only sessions.
    pub fn new(
        mode: Arc<watch::Sender<ConversationMode>>,
        tools: ToolRegistry,
        callbacks: Arc<Callbacks>,
        outbound: Outbound,
        playback: Option<Arc<dyn AudioIo>>,
        signals: mpsc::UnboundedSender<RouterSignal>,
    ) -> Self {
        Self {
            mode,
            feedback: FeedbackState::default(),
            tools,
            callbacks,
            outbound,
            playback,
            signals,
            tasks: JoinSet::new(),
        }
    }

    pub fn mode(&self) -> ConversationMode {
        *self.mode.borrow()
    }

    pub fn feedback(&self) -> FeedbackState {
        self.feedback
    }

    /// Number of tool executions still running.
    pub fn pending_tools(&self) -> usize {
        self.tasks.len()
    }

    pub fn handle(&mut self, event: InboundEvent) {
        self.reap_finished_tools();
        trace!(event = event.kind(), "Routing inbound event");

        match event {
            InboundEvent::AgentChatResponsePart(part) => match part.phase {
                ChatPartPhase::Start => {
                    self.set_mode(ConversationMode::Speaking);
                    self.ensure_playback();
                }
                ChatPartPhase::Delta => {
                    if !part.text.is_empty() {
                        self.callbacks.agent_response(&part.text);
                    }
                }
                ChatPartPhase::Stop => self.set_mode(ConversationMode::Listening),
            },
            InboundEvent::AgentResponse(response) => {
                self.set_mode(ConversationMode::Speaking);
                let event_id = response
                    .event_id
                    .unwrap_or_else(|| self.feedback.next_synthetic_id());
                self.feedback.last_agent_event_id = Some(event_id);
                self.callbacks.can_send_feedback_change(true);
                self.ensure_playback();
                self.callbacks.agent_response(&response.text);
            }
            InboundEvent::Interruption(interruption) => {
                self.set_mode(ConversationMode::Listening);
                self.callbacks.can_send_feedback_change(false);
                self.callbacks.interruption(interruption.event_id);
            }
            InboundEvent::ClientToolCall(call) => self.dispatch_tool_call(call),
            InboundEvent::Ping(ping) => {
                trace!(event_id = ping.event_id, ping_ms = ?ping.ping_ms, "Ping");
                self.outbound.send(OutboundEvent::Pong {
                    event_id: ping.event_id,
                });
            }
            InboundEvent::VadScore(vad) => self.callbacks.vad_score(vad.score),
            InboundEvent::AudioAlignment(alignment) => {
                self.callbacks.audio_alignment(&alignment.alignment)
            }
            InboundEvent::AgentResponseMetadata(metadata) => {
                self.callbacks.agent_response_metadata(&metadata.metadata)
            }
            InboundEvent::UserTranscript(transcript) => {
                self.callbacks.user_transcript(&transcript.text)
            }
            InboundEvent::TentativeUserTranscript(transcript) => {
                self.callbacks.tentative_user_transcript(&transcript)
            }
            InboundEvent::TentativeAgentResponse(response) => {
                self.callbacks.tentative_agent_response(&response.text)
            }
            InboundEvent::AgentResponseCorrection(correction) => {
                self.callbacks.agent_response_correction(&correction)
            }
            InboundEvent::AgentToolResponse(response) => {
                debug!(
                    tool = %response.tool_name,
                    tool_call_id = %response.tool_call_id,
                    tool_type = %response.tool_type,
                    is_error = response.is_error,
                    "Agent tool response"
                );
                self.callbacks.agent_tool_response(&response);
                if response.tool_name == END_CALL_TOOL {
                    self.signal(RouterSignal::EndRequested);
                }
            }
            InboundEvent::ConversationInitiationMetadata(metadata) => {
                debug!(
                    conversation_id = %metadata.conversation_id,
                    output_format = %metadata.agent_output_audio_format,
                    input_format = %metadata.user_input_audio_format,
                    "Conversation initiated"
                );
                self.signal(RouterSignal::ConversationStarted(metadata.conversation_id.clone()));
                self.callbacks.conversation_initiation_metadata(&metadata);
            }
            InboundEvent::Audio(chunk) => {
                trace!(event_id = chunk.event_id, bytes = ?chunk.decoded_len(), "Audio chunk");
            }
            InboundEvent::ServerError(error) => {
                warn!(
                    code = error.code,
                    message = error.message.as_deref().unwrap_or("unknown"),
                    "Server reported an error"
                );
                self.callbacks.error(&error);
            }
        }
    }

    /// Sends feedback for the latest agent response, at most once per response.
    pub fn send_feedback(&mut self, positive: bool) {
        let Some(last) = self.feedback.last_agent_event_id else {
            debug!("No agent response to provide feedback for");
            return;
        };
        let Some(event_id) = self.feedback.pending() else {
            debug!(
                event_id = last,
                last_sent = ?self.feedback.last_feedback_sent_for_event_id,
                "Feedback already sent for this response"
            );
            return;
        };

        if self.outbound.send(OutboundEvent::Feedback {
            score: FeedbackScore::from(positive),
            event_id,
        }) {
            debug!(event_id, positive, "Sent feedback");
            self.feedback.last_feedback_sent_for_event_id = Some(event_id);
            self.callbacks.can_send_feedback_change(false);
        }
    }

    /// Cancels running tools and returns mode and feedback to their initial values.
    pub fn reset(&mut self) {
        self.tasks.abort_all();
        self.set_mode(ConversationMode::Listening);
        self.feedback = FeedbackState::default();
    }

    /// Resets, then waits until every cancelled tool task has finished.
    pub async fn shutdown(&mut self) {
        self.reset();
        while self.tasks.join_next().await.is_some() {}
    }

    fn dispatch_tool_call(&mut self, call: ClientToolCall) {
        let ends_call = call.tool_name == END_CALL_TOOL;

        if !self.tools.is_registered(&call.tool_name) {
            self.callbacks.unhandled_client_tool_call(&call);
            if !self.callbacks.has_unhandled_client_tool_call() && call.expects_response {
                self.outbound.send(OutboundEvent::ClientToolResult {
                    tool_call_id: call.tool_call_id.clone(),
                    result: format!(
                        "Tool '{}' not registered and no handler provided",
                        call.tool_name
                    ),
                    is_error: true,
                });
                debug!(tool = %call.tool_name, "Tool not registered; sent automatic failure");
            } else {
                debug!(tool = %call.tool_name, "Tool not registered; awaiting manual result");
            }
            if ends_call {
                self.signal(RouterSignal::EndRequested);
            }
            return;
        }

        let tools = self.tools.clone();
        let outbound = self.outbound.clone();
        let signals = self.signals.clone();
        let span = tracing::debug_span!("client_tool", tool = %call.tool_name, tool_call_id = %call.tool_call_id);
        self.tasks.spawn(
            async move {
                let result = tools.execute(&call.tool_name, &call.parameters).await;
                let outcome = match &result {
                    None => "no_response",
                    Some(r) if r.is_success() => "success",
                    Some(_) => "failed",
                };
                debug!(outcome, "Tool executed");
                if let Some(result) = result.filter(|_| call.expects_response) {
                    outbound.send(OutboundEvent::ClientToolResult {
                        tool_call_id: call.tool_call_id,
                        is_error: !result.is_success(),
                        result: result.value().to_string(),
                    });
                }
                if ends_call {
                    let _ = signals.send(RouterSignal::EndRequested);
                }
            }
            .instrument(span),
        );
    }

    fn reap_finished_tools(&mut self) {
        while let Some(finished) = self.tasks.try_join_next() {
            match finished {
                Err(e) if e.is_panic() => warn!(error = %e, "Tool task panicked"),
                _ => {}
            }
        }
    }

    fn set_mode(&self, mode: ConversationMode) {
        let changed = self.mode.send_if_modified(|current| {
            if *current == mode {
                return false;
            }
            *current = mode;
            true
        });
        if changed {
            debug!(%mode, "Conversation mode changed");
            self.callbacks.mode_change(mode);
        }
    }

    fn ensure_playback(&self) {
        let Some(audio) = &self.playback else {
            return;
        };
        if audio.is_playing() {
            return;
        }
        if let Err(e) = audio.start_playback() {
            debug!(error = %e, "Failed to start audio playback");
        }
    }

    fn signal(&self, signal: RouterSignal) {
        if self.signals.send(signal).is_err() {
            debug!("Session no longer listening for router signals");
        }
    }
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("mode", &self.mode())
            .field("feedback", &self.feedback)
            .field("pending_tools", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::MockAudioIo,
        codec::decode,
        tools::ToolResult,
    };
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    struct Harness {
        router: EventRouter,
        outbound: mpsc::UnboundedReceiver<OutboundEvent>,
        signals: mpsc::UnboundedReceiver<RouterSignal>,
        tools: ToolRegistry,
    }

    impl Harness {
        fn new(callbacks: Callbacks) -> Self {
            Self::with_playback(callbacks, None)
        }

        fn with_playback(callbacks: Callbacks, playback: Option<Arc<dyn AudioIo>>) -> Self {
            let (out_tx, outbound) = mpsc::unbounded_channel();
            let (sig_tx, signals) = mpsc::unbounded_channel();
            let tools = ToolRegistry::new();
            let router = EventRouter::new(
                Arc::new(watch::Sender::new(ConversationMode::Listening)),
                tools.clone(),
                Arc::new(callbacks),
                Outbound::new(out_tx),
                playback,
                sig_tx,
            );
            Self {
                router,
                outbound,
                signals,
                tools,
            }
        }

        fn feed(&mut self, raw: &str) {
            self.router.handle(decode(raw).unwrap());
        }

        fn drain(&mut self) -> Vec<OutboundEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.outbound.try_recv() {
                events.push(event);
            }
            events
        }
    }

    #[tokio::test]
    async fn test_ping_is_answered_with_pong() {
        let mut h = Harness::new(Callbacks::default());
        h.feed(r#"{"type":"ping","ping_event":{"event_id":7,"ping_ms":null}}"#);
        assert_eq!(h.drain(), vec![OutboundEvent::Pong { event_id: 7 }]);
    }

    #[tokio::test]
    async fn test_feedback_sent_once_per_response() {
        let changes = Arc::new(Mutex::new(Vec::new()));
        let seen = changes.clone();
        let mut h = Harness::new(
            Callbacks::default().on_can_send_feedback_change(move |can| seen.lock().unwrap().push(can)),
        );

        h.router.send_feedback(true);
        assert!(h.drain().is_empty());

        h.feed(r#"{"type":"agent_response","agent_response_event":{"agent_response":"Hi","event_id":12}}"#);
        h.router.send_feedback(true);
        h.router.send_feedback(false);

        assert_eq!(
            h.drain(),
            vec![OutboundEvent::Feedback {
                score: FeedbackScore::Like,
                event_id: 12
            }]
        );
        assert_eq!(*changes.lock().unwrap(), vec![true, false]);
        assert_eq!(h.router.feedback().pending(), None);
    }

    #[tokio::test]
    async fn test_feedback_ids_are_synthesized_when_missing() {
        let mut h = Harness::new(Callbacks::default());
        h.feed(r#"{"type":"agent_response","agent_response_event":{"agent_response":"one"}}"#);
        assert_eq!(h.router.feedback().last_agent_event_id, Some(1));
        h.router.send_feedback(false);

        h.feed(r#"{"type":"agent_response","agent_response_event":{"agent_response":"two"}}"#);
        assert_eq!(h.router.feedback().pending(), Some(2));
        h.router.send_feedback(true);

        assert_eq!(
            h.drain(),
            vec![
                OutboundEvent::Feedback {
                    score: FeedbackScore::Dislike,
                    event_id: 1
                },
                OutboundEvent::Feedback {
                    score: FeedbackScore::Like,
                    event_id: 2
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_unregistered_tool_is_failed_automatically() {
        let mut h = Harness::new(Callbacks::default());
        h.feed(r#"{"type":"client_tool_call","client_tool_call":{"tool_name":"x","tool_call_id":"c1","parameters":{}}}"#);
        assert_eq!(
            h.drain(),
            vec![OutboundEvent::ClientToolResult {
                tool_call_id: "c1".into(),
                result: "Tool 'x' not registered and no handler provided".into(),
                is_error: true,
            }]
        );
    }

    #[tokio::test]
    async fn test_unregistered_tool_goes_to_observer_when_set() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = calls.clone();
        let mut h = Harness::new(
            Callbacks::default()
                .on_unhandled_client_tool_call(move |call| seen.lock().unwrap().push(call.tool_call_id.clone())),
        );
        h.feed(r#"{"type":"client_tool_call","client_tool_call":{"tool_name":"x","tool_call_id":"c1"}}"#);
        assert!(h.drain().is_empty());
        assert_eq!(*calls.lock().unwrap(), vec!["c1".to_string()]);
    }

    #[tokio::test]
    async fn test_registered_tool_result_is_sent() {
        let mut h = Harness::new(Callbacks::default());
        h.tools.register_fn("lookup", |p: convai_types::Payload| async move {
            let city = p.get("city").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            Ok(Some(ToolResult::success(format!("sunny in {city}"))))
        });
        h.tools.register_fn("broken", |_| async { Err(anyhow::anyhow!("offline")) });

        h.feed(r#"{"type":"client_tool_call","client_tool_call":{"tool_name":"lookup","tool_call_id":"a","parameters":{"city":"Oslo"}}}"#);
        h.feed(r#"{"type":"client_tool_call","client_tool_call":{"tool_name":"broken","tool_call_id":"b"}}"#);

        let mut results = vec![
            h.outbound.recv().await.unwrap(),
            h.outbound.recv().await.unwrap(),
        ];
        results.sort_by_key(|event| match event {
            OutboundEvent::ClientToolResult { tool_call_id, .. } => tool_call_id.clone(),
            _ => String::new(),
        });
        assert_eq!(
            results,
            vec![
                OutboundEvent::ClientToolResult {
                    tool_call_id: "a".into(),
                    result: "sunny in Oslo".into(),
                    is_error: false,
                },
                OutboundEvent::ClientToolResult {
                    tool_call_id: "b".into(),
                    result: "Tool execution failed: offline".into(),
                    is_error: true,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_tool_without_expected_response_stays_silent() {
        let mut h = Harness::new(Callbacks::default());
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        h.tools.register_fn("log", move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Some(ToolResult::success("logged")))
            }
        });
        h.feed(r#"{"type":"client_tool_call","client_tool_call":{"tool_name":"log","tool_call_id":"c","expects_response":false}}"#);
        h.router.shutdown().await;
        assert!(h.drain().is_empty());
        assert!(runs.load(Ordering::SeqCst) <= 1);
    }

    #[tokio::test]
    async fn test_end_call_requests_termination() {
        let mut h = Harness::new(Callbacks::default());
        h.tools.register_fn(END_CALL_TOOL, |_| async { Ok(None) });
        h.feed(r#"{"type":"client_tool_call","client_tool_call":{"tool_name":"end_call","tool_call_id":"e1"}}"#);
        assert_eq!(h.signals.recv().await, Some(RouterSignal::EndRequested));

        h.feed(r#"{"type":"agent_tool_response","agent_tool_response":{"tool_name":"end_call","tool_call_id":"e2","tool_type":"system","is_error":false}}"#);
        assert_eq!(h.signals.recv().await, Some(RouterSignal::EndRequested));
    }

    #[tokio::test]
    async fn test_mode_transitions_fire_on_change_only() {
        let modes = Arc::new(Mutex::new(Vec::new()));
        let seen = modes.clone();
        let mut h = Harness::new(Callbacks::default().on_mode_change(move |m| seen.lock().unwrap().push(m)));

        h.feed(r#"{"type":"agent_chat_response_part","text_response_part":{"type":"start","text":""}}"#);
        h.feed(r#"{"type":"agent_chat_response_part","text_response_part":{"type":"start","text":""}}"#);
        assert_eq!(h.router.mode(), ConversationMode::Speaking);
        h.feed(r#"{"type":"agent_chat_response_part","text_response_part":{"type":"stop","text":""}}"#);
        assert_eq!(h.router.mode(), ConversationMode::Listening);

        assert_eq!(
            *modes.lock().unwrap(),
            vec![ConversationMode::Speaking, ConversationMode::Listening]
        );
    }

    #[tokio::test]
    async fn test_interruption_returns_to_listening() {
        let interrupted = Arc::new(Mutex::new(Vec::new()));
        let seen = interrupted.clone();
        let mut h = Harness::new(Callbacks::default().on_interruption(move |id| seen.lock().unwrap().push(id)));
        h.feed(r#"{"type":"agent_response","agent_response_event":{"agent_response":"long answer"}}"#);
        assert_eq!(h.router.mode(), ConversationMode::Speaking);
        h.feed(r#"{"type":"interruption","interruption_event":{"event_id":4}}"#);
        assert_eq!(h.router.mode(), ConversationMode::Listening);
        assert_eq!(*interrupted.lock().unwrap(), vec![4]);
    }

    #[tokio::test]
    async fn test_playback_started_when_idle() {
        let mut audio = MockAudioIo::new();
        audio.expect_is_playing().times(1).return_const(false);
        audio.expect_start_playback().times(1).returning(|| Ok(()));
        let mut h = Harness::with_playback(Callbacks::default(), Some(Arc::new(audio)));
        h.feed(r#"{"type":"agent_chat_response_part","text_response_part":{"type":"start","text":""}}"#);
    }

    #[tokio::test]
    async fn test_panicking_callback_does_not_stop_processing() {
        let transcripts = Arc::new(AtomicUsize::new(0));
        let seen = transcripts.clone();
        let mut h = Harness::new(
            Callbacks::default()
                .on_agent_response(|_| panic!("ui thread gone"))
                .on_user_transcript(move |_| {
                    seen.fetch_add(1, Ordering::SeqCst);
                }),
        );
        h.feed(r#"{"type":"agent_response","agent_response_event":{"agent_response":"Hi","event_id":3}}"#);
        h.feed(r#"{"type":"user_transcript","user_transcription_event":{"user_transcript":"hello"}}"#);
        h.feed(r#"{"type":"ping","ping_event":{"event_id":8}}"#);

        assert_eq!(transcripts.load(Ordering::SeqCst), 1);
        assert_eq!(h.router.mode(), ConversationMode::Speaking);
        assert_eq!(h.drain(), vec![OutboundEvent::Pong { event_id: 8 }]);
    }

    #[tokio::test]
    async fn test_conversation_id_is_signalled() {
        let mut h = Harness::new(Callbacks::default());
        h.feed(r#"{"type":"conversation_initiation_metadata","conversation_initiation_metadata":{"conversation_id":"conv_1","agent_output_audio_format":"pcm_16000","user_input_audio_format":"pcm_16000"}}"#);
        assert_eq!(
            h.signals.recv().await,
            Some(RouterSignal::ConversationStarted("conv_1".into()))
        );
    }

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_hung_tool_does_not_block_events_and_shutdown_cancels_it() {
        let mut h = Harness::new(Callbacks::default());
        let started = Arc::new(AtomicUsize::new(0));
        let dropped = Arc::new(AtomicUsize::new(0));
        let (calls, drops) = (started.clone(), dropped.clone());
        h.tools.register_fn("wait_forever", move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            let guard = DropCounter(drops.clone());
            async move {
                let _guard = guard;
                std::future::pending::<()>().await;
                Ok(Some(ToolResult::success("never")))
            }
        });

        h.feed(r#"{"type":"client_tool_call","client_tool_call":{"tool_name":"wait_forever","tool_call_id":"h1"}}"#);
        h.feed(r#"{"type":"ping","ping_event":{"event_id":11}}"#);
        assert_eq!(h.drain(), vec![OutboundEvent::Pong { event_id: 11 }]);
        assert_eq!(h.router.pending_tools(), 1);

        while started.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        h.feed(r#"{"type":"ping","ping_event":{"event_id":12}}"#);
        assert_eq!(h.drain(), vec![OutboundEvent::Pong { event_id: 12 }]);
        assert_eq!(dropped.load(Ordering::SeqCst), 0);

        h.router.shutdown().await;
        assert_eq!(h.router.pending_tools(), 0);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert!(h.drain().is_empty());
    }

    #[tokio::test]
    async fn test_reset_clears_state() {
        let mut h = Harness::new(Callbacks::default());
        h.feed(r#"{"type":"agent_response","agent_response_event":{"agent_response":"Hi","event_id":5}}"#);
        h.router.reset();
        assert_eq!(h.router.mode(), ConversationMode::Listening);
        assert_eq!(h.router.feedback(), FeedbackState::default());
        assert_eq!(h.router.pending_tools(), 0);
    }
}
