//! Lifecycle of a single conversation: start, run, end.

use crate::{
    audio::AudioIo,
    callbacks::Callbacks,
    codec,
    config::ConversationConfig,
    error::{DecodeError, SessionError},
    router::{EventRouter, Outbound, RouterSignal},
    tools::{ClientTool, ToolRegistry},
    transport::{Transport, TransportEvent},
};
use anyhow::Context;
use convai_types::{ConversationMode, DisconnectReason, OutboundEvent, SessionState};
use std::{
    sync::{Arc, Mutex, PoisonError, Weak},
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::timeout,
};
use tracing::{Instrument, debug, info, info_span, trace, warn};
use uuid::Uuid;

/// How long `end` waits for queued outbound events to reach the transport.
const OUTBOUND_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

enum RouterCommand {
    Feedback(bool),
    Shutdown,
}

/// Tasks and channels that exist only while a session is running.
struct SessionRuntime {
    commands: mpsc::UnboundedSender<RouterCommand>,
    outbound: Outbound,
    actor: JoinHandle<()>,
    pump: JoinHandle<()>,
    watcher: JoinHandle<()>,
}

impl SessionRuntime {
    /// Stops the router (cancelling tool executions), then lets the outbound
    /// pump drain what is already queued.
    async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.commands.send(RouterCommand::Shutdown);
        let joined = self.actor.await;
        self.watcher.abort();

        // The router and its tool tasks are gone; this is the last sender.
        drop(self.outbound);
        let mut pump = self.pump;
        if timeout(OUTBOUND_FLUSH_TIMEOUT, &mut pump).await.is_err() {
            warn!("Outbound queue not flushed in time; dropping the rest");
            pump.abort();
        }
        joined.context("Session actor did not stop cleanly")
    }

    fn abort(&self) {
        self.actor.abort();
        self.pump.abort();
        self.watcher.abort();
    }
}

struct SessionInner {
    id: Uuid,
    config: ConversationConfig,
    transport: Arc<dyn Transport>,
    audio: Arc<dyn AudioIo>,
    tools: ToolRegistry,
    callbacks: Arc<Callbacks>,
    status: Arc<watch::Sender<SessionState>>,
    mode: Arc<watch::Sender<ConversationMode>>,
    conversation_id: Mutex<Option<String>>,
    runtime: Mutex<Option<SessionRuntime>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl SessionInner {
    fn set_status(&self, status: SessionState) -> bool {
        publish_status(&self.status, &self.callbacks, status)
    }

    fn has_runtime(&self) -> bool {
        self.runtime.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    fn take_runtime(&self) -> Option<SessionRuntime> {
        self.runtime.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    fn set_conversation_id(&self, id: Option<String>) {
        *self.conversation_id.lock().unwrap_or_else(PoisonError::into_inner) = id;
    }

    fn voice(&self) -> bool {
        !self.config.text_only
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            runtime.abort();
        }
    }
}

/// A conversation with one agent.
///
/// Cloning yields another handle to the same session. All methods take
/// `&self`; `start` and `end` are serialized against each other.
#[derive(Clone)]
pub struct ConversationSession {
    inner: Arc<SessionInner>,
}

impl ConversationSession {
    /// Validates `config` and builds an idle session. The tools in
    /// `config.client_tools` are shared with the session, not copied.
    pub fn new(
        config: ConversationConfig,
        transport: Arc<dyn Transport>,
        audio: Arc<dyn AudioIo>,
        callbacks: Callbacks,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let tools = config.client_tools.clone();
        Ok(Self {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4(),
                config,
                transport,
                audio,
                tools,
                callbacks: Arc::new(callbacks),
                status: Arc::new(watch::Sender::new(SessionState::Disconnected)),
                mode: Arc::new(watch::Sender::new(ConversationMode::Listening)),
                conversation_id: Mutex::new(None),
                runtime: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        })
    }

    /// Local identifier used in logs. Unrelated to the server's conversation id.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn config(&self) -> &ConversationConfig {
        &self.inner.config
    }

    pub fn status(&self) -> SessionState {
        *self.inner.status.borrow()
    }

    pub fn mode(&self) -> ConversationMode {
        *self.inner.mode.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionState> {
        self.inner.status.subscribe()
    }

    pub fn watch_mode(&self) -> watch::Receiver<ConversationMode> {
        self.inner.mode.subscribe()
    }

    /// The server-assigned conversation id, once the server has sent it.
    pub fn conversation_id(&self) -> Option<String> {
        self.inner
            .conversation_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn register_tool(&self, name: impl Into<String>, tool: Arc<dyn ClientTool>) {
        self.inner.tools.register(name, tool);
    }

    pub fn unregister_tool(&self, name: &str) -> bool {
        self.inner.tools.unregister(name)
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.inner.tools
    }

    /// Connects to the agent.
    ///
    /// Returns once the transport has accepted the connection attempt; the
    /// transport reports `Connected` through the status channel. In voice mode
    /// recording and playback start when microphone permission is granted.
    pub async fn start(&self) -> Result<(), SessionError> {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;

        let current = self.status();
        if !matches!(current, SessionState::Disconnected | SessionState::Error) {
            return Err(SessionError::AlreadyActive);
        }
        if inner.has_runtime() {
            debug!(session = %inner.id, "Releasing resources left by a previous connection");
            if let Some(failure) = self.teardown().await {
                warn!(session = %inner.id, error = %failure, "Previous connection did not shut down cleanly");
            }
        }

        info!(
            session = %inner.id,
            private_agent = inner.config.is_private_agent(),
            text_only = inner.config.text_only,
            "Starting conversation session"
        );
        inner.set_status(SessionState::Connecting);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let outbound = Outbound::new(outbound_tx);

        let router = EventRouter::new(
            inner.mode.clone(),
            inner.tools.clone(),
            inner.callbacks.clone(),
            outbound.clone(),
            inner.voice().then(|| inner.audio.clone()),
            signals_tx,
        );

        let span = info_span!("conversation_session", session = %inner.id);
        let actor = tokio::spawn(
            run_actor(
                router,
                events_rx,
                commands_rx,
                inner.status.clone(),
                inner.callbacks.clone(),
            )
            .instrument(span.clone()),
        );
        let pump = tokio::spawn(run_pump(outbound_rx, inner.transport.clone()).instrument(span.clone()));
        let watcher = tokio::spawn(watch_signals(signals_rx, Arc::downgrade(inner)).instrument(span));

        *inner.runtime.lock().unwrap_or_else(PoisonError::into_inner) = Some(SessionRuntime {
            commands: commands_tx,
            outbound,
            actor,
            pump,
            watcher,
        });

        if let Err(e) = self.connect(events_tx).await {
            warn!(session = %inner.id, error = %e, "Failed to start conversation session");
            if let Some(failure) = self.teardown().await {
                debug!(session = %inner.id, error = %failure, "Cleanup after failed start was incomplete");
            }
            inner.set_status(SessionState::Error);
            return Err(SessionError::connect(e));
        }
        Ok(())
    }

    async fn connect(&self, events: mpsc::UnboundedSender<TransportEvent>) -> anyhow::Result<()> {
        let inner = &self.inner;
        inner
            .transport
            .connect(&inner.config, events)
            .await
            .context("Transport refused the connection")?;

        if inner.voice() {
            if inner.audio.has_permission() {
                inner.audio.start_recording().context("Failed to start recording")?;
                inner.audio.start_playback().context("Failed to start playback")?;
            } else {
                info!(session = %inner.id, "Microphone permission not granted; continuing without recording");
            }
        }
        Ok(())
    }

    /// Ends the conversation and releases every resource it holds.
    ///
    /// Calling `end` on a session that holds nothing does nothing. After a
    /// remote close the remaining resources are released without reporting a
    /// second disconnect. A failing step does not stop the remaining ones; the
    /// first failure is returned and the session is left in `Error`.
    pub async fn end(&self) -> Result<(), SessionError> {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;

        let closed_remotely = self.status() == SessionState::Disconnected;
        if closed_remotely && !inner.has_runtime() {
            return Ok(());
        }

        if closed_remotely {
            info!(session = %inner.id, "Releasing resources after remote close");
        } else {
            info!(session = %inner.id, "Ending conversation session");
            inner.set_status(SessionState::Disconnecting);
        }

        let failure = self.teardown().await;
        inner.set_status(if failure.is_some() {
            SessionState::Error
        } else {
            SessionState::Disconnected
        });
        if !closed_remotely {
            inner.callbacks.disconnect(&DisconnectReason::User);
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Runs every teardown step and returns the first failure.
    ///
    /// The router stops before the transport disconnects so that results
    /// already queued, such as the reply to `end_call`, still go out.
    async fn teardown(&self) -> Option<SessionError> {
        let inner = &self.inner;
        let mut failure = None;

        if inner.voice() {
            record(&mut failure, "stop_recording", inner.audio.stop_recording());
            record(&mut failure, "stop_playback", inner.audio.stop_playback());
        }
        if let Some(runtime) = inner.take_runtime() {
            record(&mut failure, "router_shutdown", runtime.shutdown().await);
        }
        record(&mut failure, "disconnect", inner.transport.disconnect().await);
        if inner.voice() {
            record(&mut failure, "audio_cleanup", inner.audio.cleanup());
        }
        inner.set_conversation_id(None);
        failure
    }

    pub fn send_user_message(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.send(OutboundEvent::UserMessage { text: text.into() })
    }

    /// Adds context for the agent without prompting a reply.
    pub fn send_contextual_update(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.send(OutboundEvent::ContextualUpdate { text: text.into() })
    }

    /// Tells the agent the user is active, e.g. typing.
    pub fn send_user_activity(&self) -> Result<(), SessionError> {
        self.send(OutboundEvent::UserActivity)
    }

    /// Answers a tool call that was passed to `on_unhandled_client_tool_call`.
    pub fn send_tool_result(
        &self,
        tool_call_id: impl Into<String>,
        result: impl Into<String>,
        is_error: bool,
    ) -> Result<(), SessionError> {
        self.send(OutboundEvent::ClientToolResult {
            tool_call_id: tool_call_id.into(),
            result: result.into(),
            is_error,
        })
    }

    /// Rates the latest agent response. Repeated calls for the same response
    /// are ignored.
    pub fn send_feedback(&self, positive: bool) -> Result<(), SessionError> {
        let runtime = self.inner.runtime.lock().unwrap_or_else(PoisonError::into_inner);
        let runtime = runtime.as_ref().ok_or(SessionError::NotActive)?;
        runtime
            .commands
            .send(RouterCommand::Feedback(positive))
            .map_err(|_| SessionError::NotActive)
    }

    fn send(&self, event: OutboundEvent) -> Result<(), SessionError> {
        let runtime = self.inner.runtime.lock().unwrap_or_else(PoisonError::into_inner);
        let runtime = runtime.as_ref().ok_or(SessionError::NotActive)?;
        if runtime.outbound.send(event) {
            Ok(())
        } else {
            Err(SessionError::NotActive)
        }
    }
}

impl std::fmt::Debug for ConversationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationSession")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .field("mode", &self.mode())
            .finish_non_exhaustive()
    }
}

fn record(failure: &mut Option<SessionError>, step: &'static str, result: anyhow::Result<()>) {
    if let Err(e) = result {
        warn!(step, error = %e, "Error ending conversation session");
        failure.get_or_insert(SessionError::teardown(step, e));
    }
}

fn publish_status(
    status: &watch::Sender<SessionState>,
    callbacks: &Callbacks,
    next: SessionState,
) -> bool {
    let changed = status.send_if_modified(|current| {
        if *current == next {
            return false;
        }
        *current = next;
        true
    });
    if changed {
        debug!(status = %next, "Session status changed");
        callbacks.status_change(next);
    }
    changed
}

/// Feeds transport events and controller commands through the router, one
/// at a time, until told to shut down.
async fn run_actor(
    mut router: EventRouter,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    mut commands: mpsc::UnboundedReceiver<RouterCommand>,
    status: Arc<watch::Sender<SessionState>>,
    callbacks: Arc<Callbacks>,
) {
    let mut transport_open = true;
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(RouterCommand::Feedback(positive)) => router.send_feedback(positive),
                Some(RouterCommand::Shutdown) | None => break,
            },
            event = events.recv(), if transport_open => match event {
                Some(TransportEvent::Message(raw)) => match codec::decode(&raw) {
                    Ok(event) => router.handle(event),
                    Err(e @ DecodeError::UnknownEventType(_)) => debug!(error = %e, "Ignoring message"),
                    Err(e) => warn!(error = %e, "Dropping undecodable message"),
                },
                Some(TransportEvent::State(state)) => apply_transport_state(&status, &callbacks, state),
                None => {
                    debug!("Transport event stream closed");
                    transport_open = false;
                }
            },
        }
    }
    router.shutdown().await;
    debug!("Session actor stopped");
}

fn apply_transport_state(status: &watch::Sender<SessionState>, callbacks: &Callbacks, state: SessionState) {
    let previous = *status.borrow();
    if previous == SessionState::Disconnecting {
        trace!(%state, "Ignoring transport state while disconnecting");
        return;
    }
    if publish_status(status, callbacks, state) && state == SessionState::Disconnected && previous.is_active() {
        info!("Connection closed by the remote side");
        callbacks.disconnect(&DisconnectReason::Remote);
    }
}

/// Encodes queued outbound events and hands them to the transport in order.
async fn run_pump(mut outbound: mpsc::UnboundedReceiver<OutboundEvent>, transport: Arc<dyn Transport>) {
    while let Some(event) = outbound.recv().await {
        let kind = event.kind();
        let payload = match codec::encode(&event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(event = kind, error = %e, "Failed to encode outbound event");
                continue;
            }
        };
        match transport.send(payload).await {
            Ok(()) => trace!(event = kind, "Sent outbound event"),
            Err(e) => warn!(event = kind, error = %e, "Failed to send outbound event"),
        }
    }
}

async fn watch_signals(mut signals: mpsc::UnboundedReceiver<RouterSignal>, session: Weak<SessionInner>) {
    while let Some(signal) = signals.recv().await {
        let Some(inner) = session.upgrade() else {
            break;
        };
        match signal {
            RouterSignal::ConversationStarted(conversation_id) => {
                info!(%conversation_id, "Conversation started");
                inner.set_conversation_id(Some(conversation_id.clone()));
                inner.callbacks.connect(&conversation_id);
            }
            RouterSignal::EndRequested => {
                info!("Agent requested the end of the call");
                let session = ConversationSession { inner };
                tokio::spawn(
                    async move {
                        if let Err(e) = session.end().await {
                            warn!(error = %e, "Failed to end session after end_call");
                        }
                    }
                    .in_current_span(),
                );
            }
        }
    }
}
