//! Session configuration.

use crate::tools::ToolRegistry;
use convai_types::Payload;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::{Value, json};
use std::{fmt, str::FromStr};

pub const DEFAULT_API_ENDPOINT: &str = "https://api.elevenlabs.io";
pub const DEFAULT_WEBSOCKET_URL: &str = "wss://livekit.rtc.elevenlabs.io";
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;
pub const SUPPORTED_SAMPLE_RATES: [u32; 5] = [8_000, 16_000, 22_050, 44_100, 48_000];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("agent_id cannot be blank")]
    BlankAgentId,
    #[error("conversation_token cannot be blank")]
    BlankConversationToken,
    #[error("Either agent_id or conversation_token must be set")]
    MissingIdentity,
    #[error("agent_id and conversation_token are mutually exclusive")]
    ConflictingIdentity,
    #[error("Unsupported audio input sample rate {0} Hz (expected one of 8000, 16000, 22050, 44100, 48000)")]
    UnsupportedSampleRate(u32),
}

/// Everything needed to start one conversation.
///
/// Public agents are addressed by `agent_id`. Private agents use a
/// `conversation_token` issued by the application's backend.
#[derive(Clone, Debug)]
pub struct ConversationConfig {
    pub agent_id: Option<String>,
    pub conversation_token: Option<SecretString>,
    pub user_id: Option<String>,
    pub text_only: bool,
    pub audio_input_sample_rate: u32,
    /// HTTP base of the agent platform.
    pub api_endpoint: String,
    /// Where transports open the realtime connection. See
    /// [`ConversationConfig::api_websocket_url`] for the platform's own socket.
    pub websocket_url: String,
    pub overrides: Option<Overrides>,
    pub custom_llm_extra_body: Option<Payload>,
    pub dynamic_variables: Option<Payload>,
    /// Tools registered on the session when it is created.
    pub client_tools: ToolRegistry,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            agent_id: None,
            conversation_token: None,
            user_id: None,
            text_only: false,
            audio_input_sample_rate: DEFAULT_SAMPLE_RATE,
            api_endpoint: DEFAULT_API_ENDPOINT.to_string(),
            websocket_url: DEFAULT_WEBSOCKET_URL.to_string(),
            overrides: None,
            custom_llm_extra_body: None,
            dynamic_variables: None,
            client_tools: ToolRegistry::default(),
        }
    }
}

impl ConversationConfig {
    pub fn public_agent(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: Some(agent_id.into()),
            ..Self::default()
        }
    }

    pub fn private_agent(conversation_token: impl Into<String>) -> Self {
        Self {
            conversation_token: Some(SecretString::from(conversation_token.into())),
            ..Self::default()
        }
    }

    pub fn is_private_agent(&self) -> bool {
        self.conversation_token.is_some()
    }

    /// `api_endpoint` with its scheme switched to `wss`/`ws`.
    pub fn api_websocket_url(&self) -> String {
        let endpoint = self.api_endpoint.trim_end_matches('/');
        if let Some(rest) = endpoint.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = endpoint.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            endpoint.to_string()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent_id.as_deref().is_some_and(|id| id.trim().is_empty()) {
            return Err(ConfigError::BlankAgentId);
        }
        if self
            .conversation_token
            .as_ref()
            .is_some_and(|token| token.expose_secret().trim().is_empty())
        {
            return Err(ConfigError::BlankConversationToken);
        }
        match (&self.agent_id, &self.conversation_token) {
            (None, None) => return Err(ConfigError::MissingIdentity),
            (Some(_), Some(_)) => return Err(ConfigError::ConflictingIdentity),
            _ => {}
        }
        if !SUPPORTED_SAMPLE_RATES.contains(&self.audio_input_sample_rate) {
            return Err(ConfigError::UnsupportedSampleRate(self.audio_input_sample_rate));
        }
        Ok(())
    }

    /// The `conversation_initiation_client_data` message sent right after the
    /// connection opens.
    pub fn initiation_client_data(&self) -> Value {
        let mut message = json!({ "type": "conversation_initiation_client_data" });
        if let Some(object) = message.as_object_mut() {
            if let Some(overrides) = &self.overrides {
                object.insert(
                    "conversation_config_override".into(),
                    serde_json::to_value(overrides).unwrap_or(Value::Null),
                );
            }
            if let Some(body) = &self.custom_llm_extra_body {
                object.insert("custom_llm_extra_body".into(), Value::Object(body.clone()));
            }
            if let Some(variables) = &self.dynamic_variables {
                object.insert("dynamic_variables".into(), Value::Object(variables.clone()));
            }
            if let Some(user_id) = &self.user_id {
                object.insert("user_id".into(), Value::String(user_id.clone()));
            }
        }
        message
    }
}

/// Per-conversation overrides of the agent's configured behavior.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts: Option<TtsOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation: Option<ConversationOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientOverrides>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AgentOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<PromptOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<Language>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PromptOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TtsOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ConversationOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_only: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ClientOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Languages the agent can be asked to speak.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    En,
    Ja,
    Zh,
    De,
    Hi,
    Fr,
    Ko,
    Pt,
    #[serde(rename = "pt-br")]
    PtBr,
    It,
    Es,
    Id,
    Nl,
    Tr,
    Pl,
    Sv,
    Bg,
    Ro,
    Ar,
    Cs,
    El,
    Fi,
    Ms,
    Da,
    Ta,
    Uk,
    Ru,
    Hu,
    Hr,
    Sk,
    No,
    Vi,
    Tl,
}

impl Language {
    pub const ALL: [Language; 33] = [
        Self::En,
        Self::Ja,
        Self::Zh,
        Self::De,
        Self::Hi,
        Self::Fr,
        Self::Ko,
        Self::Pt,
        Self::PtBr,
        Self::It,
        Self::Es,
        Self::Id,
        Self::Nl,
        Self::Tr,
        Self::Pl,
        Self::Sv,
        Self::Bg,
        Self::Ro,
        Self::Ar,
        Self::Cs,
        Self::El,
        Self::Fi,
        Self::Ms,
        Self::Da,
        Self::Ta,
        Self::Uk,
        Self::Ru,
        Self::Hu,
        Self::Hr,
        Self::Sk,
        Self::No,
        Self::Vi,
        Self::Tl,
    ];

    /// Wire code, e.g. `"pt-br"`.
    pub fn code(self) -> &'static str {
        match self {
            Self::En => "en",
            Self::Ja => "ja",
            Self::Zh => "zh",
            Self::De => "de",
            Self::Hi => "hi",
            Self::Fr => "fr",
            Self::Ko => "ko",
            Self::Pt => "pt",
            Self::PtBr => "pt-br",
            Self::It => "it",
            Self::Es => "es",
            Self::Id => "id",
            Self::Nl => "nl",
            Self::Tr => "tr",
            Self::Pl => "pl",
            Self::Sv => "sv",
            Self::Bg => "bg",
            Self::Ro => "ro",
            Self::Ar => "ar",
            Self::Cs => "cs",
            Self::El => "el",
            Self::Fi => "fi",
            Self::Ms => "ms",
            Self::Da => "da",
            Self::Ta => "ta",
            Self::Uk => "uk",
            Self::Ru => "ru",
            Self::Hu => "hu",
            Self::Hr => "hr",
            Self::Sk => "sk",
            Self::No => "no",
            Self::Vi => "vi",
            Self::Tl => "tl",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unsupported language code '{0}'")]
pub struct UnknownLanguage(pub String);

impl FromStr for Language {
    type Err = UnknownLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|language| language.code() == code)
            .ok_or_else(|| UnknownLanguage(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConversationConfig::public_agent("agent_123");
        assert_eq!(config.audio_input_sample_rate, 48_000);
        assert_eq!(config.api_endpoint, "https://api.elevenlabs.io");
        assert_eq!(config.websocket_url, "wss://livekit.rtc.elevenlabs.io");
        assert!(!config.text_only);
        assert!(!config.is_private_agent());
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_identity_validation() {
        assert_eq!(
            ConversationConfig::default().validate(),
            Err(ConfigError::MissingIdentity)
        );
        assert_eq!(
            ConversationConfig::public_agent("  ").validate(),
            Err(ConfigError::BlankAgentId)
        );
        assert_eq!(
            ConversationConfig::private_agent("").validate(),
            Err(ConfigError::BlankConversationToken)
        );

        let mut both = ConversationConfig::private_agent("tok");
        both.agent_id = Some("agent".into());
        assert_eq!(both.validate(), Err(ConfigError::ConflictingIdentity));

        let private = ConversationConfig::private_agent("tok");
        assert!(private.is_private_agent());
        assert_eq!(private.validate(), Ok(()));
    }

    #[test]
    fn test_api_websocket_url() {
        let mut config = ConversationConfig::public_agent("agent");
        assert_eq!(config.api_websocket_url(), "wss://api.elevenlabs.io");
        config.api_endpoint = "http://localhost:8080/".into();
        assert_eq!(config.api_websocket_url(), "ws://localhost:8080");
        config.api_endpoint = "wss://already.socket".into();
        assert_eq!(config.api_websocket_url(), "wss://already.socket");
    }

    #[test]
    fn test_sample_rate_validation() {
        let mut config = ConversationConfig::public_agent("agent");
        for rate in SUPPORTED_SAMPLE_RATES {
            config.audio_input_sample_rate = rate;
            assert_eq!(config.validate(), Ok(()));
        }
        config.audio_input_sample_rate = 11_025;
        let err = config.validate().unwrap_err();
        assert_eq!(err, ConfigError::UnsupportedSampleRate(11_025));
        assert!(err.to_string().contains("11025 Hz"));
    }

    #[test]
    fn test_token_is_redacted_in_debug() {
        let config = ConversationConfig::private_agent("super-secret");
        assert!(!format!("{config:?}").contains("super-secret"));
    }

    #[test]
    fn test_language_codes() {
        assert_eq!("pt-br".parse::<Language>().unwrap(), Language::PtBr);
        assert_eq!("EN".parse::<Language>().unwrap(), Language::En);
        assert!("klingon".parse::<Language>().is_err());
        assert_eq!(serde_json::to_value(Language::PtBr).unwrap(), json!("pt-br"));
        for language in Language::ALL {
            assert_eq!(serde_json::to_value(language).unwrap(), json!(language.code()));
        }
    }

    #[test]
    fn test_initiation_client_data() {
        let mut config = ConversationConfig::public_agent("agent");
        config.user_id = Some("user-1".into());
        config.overrides = Some(Overrides {
            agent: Some(AgentOverrides {
                first_message: Some("Hi there".into()),
                language: Some(Language::De),
                ..Default::default()
            }),
            conversation: Some(ConversationOverrides {
                text_only: Some(true),
            }),
            ..Default::default()
        });
        let mut variables = Payload::new();
        variables.insert("name".into(), json!("Ada"));
        config.dynamic_variables = Some(variables);

        assert_eq!(
            config.initiation_client_data(),
            json!({
                "type": "conversation_initiation_client_data",
                "conversation_config_override": {
                    "agent": {"first_message": "Hi there", "language": "de"},
                    "conversation": {"text_only": true}
                },
                "dynamic_variables": {"name": "Ada"},
                "user_id": "user-1"
            })
        );
    }
}
