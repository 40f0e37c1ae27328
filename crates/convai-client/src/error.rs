//! Error types surfaced by the client.
//!
//! Only [`SessionError`] is ever returned to callers of the session API. A
//! [`DecodeError`] is logged and the offending message dropped.

use crate::config::ConfigError;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A raw message could not be turned into an inbound event.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Message is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("Message is not a JSON object")]
    NotAnObject,
    #[error("Unknown event type: {}", .0.as_deref().unwrap_or("<missing>"))]
    UnknownEventType(Option<String>),
    #[error("Invalid value for field '{field}': {value}")]
    InvalidField { field: &'static str, value: String },
}

/// Failures of the session lifecycle and of the send API.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session is already active")]
    AlreadyActive,
    #[error("Session is not active")]
    NotActive,
    #[error("Invalid session configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
    #[error("Failed to start conversation session: {0}")]
    Connect(#[source] BoxError),
    #[error("Error ending conversation session ({step}): {source}")]
    Teardown {
        step: &'static str,
        #[source]
        source: BoxError,
    },
}

impl SessionError {
    pub(crate) fn connect(err: anyhow::Error) -> Self {
        Self::Connect(err.into())
    }

    pub(crate) fn teardown(step: &'static str, err: anyhow::Error) -> Self {
        Self::Teardown {
            step,
            source: err.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_display() {
        assert_eq!(
            DecodeError::UnknownEventType(Some("bogus".into())).to_string(),
            "Unknown event type: bogus"
        );
        assert_eq!(
            DecodeError::UnknownEventType(None).to_string(),
            "Unknown event type: <missing>"
        );
        let err = DecodeError::InvalidField {
            field: "text_response_part.type",
            value: "\"middle\"".into(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid value for field 'text_response_part.type': \"middle\""
        );
    }

    #[test]
    fn test_session_error_keeps_source_message() {
        let err = SessionError::connect(anyhow::anyhow!("room unreachable"));
        assert_eq!(
            err.to_string(),
            "Failed to start conversation session: room unreachable"
        );
        let err = SessionError::teardown("disconnect", anyhow::anyhow!("socket gone"));
        assert_eq!(
            err.to_string(),
            "Error ending conversation session (disconnect): socket gone"
        );
    }
}
