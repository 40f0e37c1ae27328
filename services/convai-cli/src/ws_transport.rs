//! WebSocket transport for the conversation protocol.

use anyhow::{Context, Result};
use async_trait::async_trait;
use convai_client::{
    ConversationConfig, Transport, TransportEvent, TransportEvents, types::SessionState,
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use secrecy::ExposeSecret;
use tokio::{net::TcpStream, sync::Mutex, task::JoinHandle};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{client::IntoClientRequest, protocol::Message as WsMessage},
};
use tracing::{Instrument, debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CONVERSATION_PATH: &str = "/v1/convai/conversation";

/// Talks to the agent over a single WebSocket.
///
/// Text frames are forwarded to the session as raw messages. A close frame or
/// the end of the stream is reported as `Disconnected`, a read error as `Error`.
#[derive(Default)]
pub struct WsTransport {
    sink: Mutex<Option<SplitSink<WsStream, WsMessage>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl WsTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Builds the conversation endpoint for a public agent or a signed private one.
pub fn conversation_url(config: &ConversationConfig) -> Result<String> {
    let base = config.websocket_url.trim_end_matches('/');
    if let Some(token) = &config.conversation_token {
        return Ok(format!(
            "{base}{CONVERSATION_PATH}?conversation_signature={}",
            token.expose_secret()
        ));
    }
    let agent_id = config
        .agent_id
        .as_deref()
        .context("Either an agent id or a conversation token is required")?;
    Ok(format!("{base}{CONVERSATION_PATH}?agent_id={agent_id}"))
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, config: &ConversationConfig, events: TransportEvents) -> Result<()> {
        let request = conversation_url(config)?.into_client_request()?;
        let (ws_stream, _) = connect_async(request)
            .await
            .context("Failed to connect to the conversation WebSocket")?;
        let (mut ws_tx, ws_rx) = ws_stream.split();
        info!(url = %config.websocket_url, "Connected to conversation WebSocket.");

        let init = config.initiation_client_data().to_string();
        ws_tx
            .send(WsMessage::Text(init.into()))
            .await
            .context("Failed to send conversation initiation data")?;

        *self.sink.lock().await = Some(ws_tx);
        events
            .send(TransportEvent::State(SessionState::Connected))
            .context("Session stopped listening")?;

        let reader = tokio::spawn(read_loop(ws_rx, events).in_current_span());
        if let Some(previous) = self.reader.lock().await.replace(reader) {
            previous.abort();
        }
        Ok(())
    }

    async fn send(&self, payload: String) -> Result<()> {
        let mut sink = self.sink.lock().await;
        let sink = sink.as_mut().context("WebSocket is not connected")?;
        sink.send(WsMessage::Text(payload.into()))
            .await
            .context("Failed to write to the WebSocket")
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
        let Some(mut sink) = self.sink.lock().await.take() else {
            return Ok(());
        };
        sink.close().await.context("Failed to close the WebSocket")
    }
}

async fn read_loop(mut ws_rx: SplitStream<WsStream>, events: TransportEvents) {
    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(WsMessage::Text(text)) => {
                if events.send(TransportEvent::Message(text.as_str().to_owned())).is_err() {
                    return;
                }
            }
            Ok(WsMessage::Close(frame)) => {
                info!(?frame, "Server closed the conversation.");
                break;
            }
            Ok(_) => debug!("Ignoring non-text frame"),
            Err(e) => {
                warn!(error = %e, "WebSocket read failed");
                let _ = events.send(TransportEvent::State(SessionState::Error));
                return;
            }
        }
    }
    let _ = events.send(TransportEvent::State(SessionState::Disconnected));
}
