//! The connection to the agent server, provided by the embedding application.

use crate::config::ConversationConfig;
use async_trait::async_trait;
use convai_types::SessionState;
use tokio::sync::mpsc;

/// What a transport reports back to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// One raw JSON protocol message.
    Message(String),
    /// A connection state change.
    State(SessionState),
}

pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

/// A bidirectional message channel to the agent.
///
/// `connect` returns once the connection attempt is underway. The transport
/// reports `Connected` (and later `Disconnected` or `Error`) through `events`,
/// and delivers every inbound message there in arrival order.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, config: &ConversationConfig, events: TransportEvents) -> anyhow::Result<()>;
    async fn send(&self, payload: String) -> anyhow::Result<()>;
    async fn disconnect(&self) -> anyhow::Result<()>;
}
