use convai_client::{
    ConversationConfig, Language, Overrides,
    config::{AgentOverrides, ClientOverrides, ConversationOverrides},
};
use secrecy::SecretString;
use tracing::Level;

pub const DEFAULT_API_URL: &str = "https://api.elevenlabs.io";

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub agent_id: Option<String>,
    pub conversation_token: Option<SecretString>,
    pub user_id: Option<String>,
    /// Explicit socket URL; derived from `api_url` when unset.
    pub ws_url: Option<String>,
    pub api_url: String,
    pub language: Option<Language>,
    pub first_message: Option<String>,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let agent_id = non_empty_var("CONVAI_AGENT_ID");
        let conversation_token = non_empty_var("CONVAI_CONVERSATION_TOKEN").map(SecretString::from);
        if agent_id.is_some() && conversation_token.is_some() {
            return Err(ConfigError::InvalidValue(
                "CONVAI_CONVERSATION_TOKEN".to_string(),
                "cannot be combined with CONVAI_AGENT_ID".to_string(),
            ));
        }

        let user_id = non_empty_var("CONVAI_USER_ID");
        let ws_url = non_empty_var("CONVAI_WS_URL");
        let api_url = std::env::var("CONVAI_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string());

        let language = non_empty_var("CONVAI_LANGUAGE")
            .map(|code| {
                code.parse::<Language>()
                    .map_err(|e| ConfigError::InvalidValue("CONVAI_LANGUAGE".to_string(), e.to_string()))
            })
            .transpose()?;
        let first_message = non_empty_var("CONVAI_FIRST_MESSAGE");

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = parse_level(&log_level_str)?;

        Ok(Self {
            agent_id,
            conversation_token,
            user_id,
            ws_url,
            api_url,
            language,
            first_message,
            log_level,
        })
    }

    /// Session configuration for a text-only conversation.
    pub fn conversation_config(&self) -> Result<ConversationConfig, ConfigError> {
        if self.agent_id.is_none() && self.conversation_token.is_none() {
            return Err(ConfigError::MissingVar(
                "CONVAI_AGENT_ID or CONVAI_CONVERSATION_TOKEN".to_string(),
            ));
        }

        let agent = (self.language.is_some() || self.first_message.is_some()).then(|| AgentOverrides {
            first_message: self.first_message.clone(),
            language: self.language,
            ..Default::default()
        });

        let mut config = ConversationConfig {
            agent_id: self.agent_id.clone(),
            conversation_token: self.conversation_token.clone(),
            user_id: self.user_id.clone(),
            text_only: true,
            api_endpoint: self.api_url.clone(),
            overrides: Some(Overrides {
                agent,
                conversation: Some(ConversationOverrides { text_only: Some(true) }),
                client: Some(ClientOverrides {
                    source: Some("convai-cli".to_string()),
                    version: Some(env!("CARGO_PKG_VERSION").to_string()),
                }),
                ..Default::default()
            }),
            ..ConversationConfig::default()
        };
        config.websocket_url = match &self.ws_url {
            Some(url) => url.clone(),
            None => config.api_websocket_url(),
        };
        Ok(config)
    }
}

pub fn parse_level(value: &str) -> Result<Level, ConfigError> {
    value.parse::<Level>().map_err(|_| {
        ConfigError::InvalidValue(
            "RUST_LOG".to_string(),
            format!("'{}' is not a valid log level", value),
        )
    })
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use serial_test::serial;
    use std::env;

    fn clear_env_vars() {
        unsafe {
            env::remove_var("CONVAI_AGENT_ID");
            env::remove_var("CONVAI_CONVERSATION_TOKEN");
            env::remove_var("CONVAI_USER_ID");
            env::remove_var("CONVAI_WS_URL");
            env::remove_var("CONVAI_API_URL");
            env::remove_var("CONVAI_LANGUAGE");
            env::remove_var("CONVAI_FIRST_MESSAGE");
            env::remove_var("RUST_LOG");
        }
    }

    #[test]
    fn test_config_error_display() {
        let missing_var = ConfigError::MissingVar("TEST_VAR".to_string());
        assert_eq!(
            format!("{}", missing_var),
            "Missing environment variable: TEST_VAR"
        );

        let invalid_value =
            ConfigError::InvalidValue("TEST_VAR".to_string(), "bad_value".to_string());
        assert_eq!(
            format!("{}", invalid_value),
            "Invalid value for environment variable TEST_VAR: bad_value"
        );
    }

    #[test]
    #[serial]
    fn test_config_from_env_minimal() {
        clear_env_vars();
        unsafe {
            env::set_var("CONVAI_AGENT_ID", "agent_123");
        }

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.agent_id.as_deref(), Some("agent_123"));
        assert!(config.conversation_token.is_none());
        assert_eq!(config.ws_url, None);
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert_eq!(config.language, None);
        assert_eq!(config.log_level, Level::INFO);

        let session = config.conversation_config().unwrap();
        assert_eq!(session.websocket_url, "wss://api.elevenlabs.io");
        assert!(session.text_only);
        assert_eq!(session.validate(), Ok(()));
        let overrides = session.overrides.unwrap();
        assert!(overrides.agent.is_none());
        assert_eq!(overrides.conversation.unwrap().text_only, Some(true));
    }

    #[test]
    #[serial]
    fn test_config_from_env_custom_values() {
        clear_env_vars();
        unsafe {
            env::set_var("CONVAI_CONVERSATION_TOKEN", "signed-token");
            env::set_var("CONVAI_USER_ID", "user-7");
            env::set_var("CONVAI_WS_URL", "ws://127.0.0.1:9000");
            env::set_var("CONVAI_LANGUAGE", "pt-br");
            env::set_var("CONVAI_FIRST_MESSAGE", "Olá!");
            env::set_var("RUST_LOG", "debug");
        }

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(
            config.conversation_token.as_ref().map(|t| t.expose_secret()),
            Some("signed-token")
        );
        assert_eq!(config.user_id.as_deref(), Some("user-7"));
        assert_eq!(config.ws_url.as_deref(), Some("ws://127.0.0.1:9000"));
        assert_eq!(config.language, Some(Language::PtBr));
        assert_eq!(config.log_level, Level::DEBUG);

        let session = config.conversation_config().unwrap();
        assert_eq!(session.websocket_url, "ws://127.0.0.1:9000");
        assert!(session.is_private_agent());
        let agent = session.overrides.unwrap().agent.unwrap();
        assert_eq!(agent.first_message.as_deref(), Some("Olá!"));
        assert_eq!(agent.language, Some(Language::PtBr));
    }

    #[test]
    #[serial]
    fn test_socket_url_follows_api_url() {
        clear_env_vars();
        unsafe {
            env::set_var("CONVAI_AGENT_ID", "agent_123");
            env::set_var("CONVAI_API_URL", "http://localhost:8080");
        }

        let session = Config::from_env().unwrap().conversation_config().unwrap();
        assert_eq!(session.api_endpoint, "http://localhost:8080");
        assert_eq!(session.websocket_url, "ws://localhost:8080");
    }

    #[test]
    #[serial]
    fn test_config_missing_identity() {
        clear_env_vars();

        let config = Config::from_env().expect("Identity is checked when building the session");
        match config.conversation_config().unwrap_err() {
            ConfigError::MissingVar(msg) => assert!(msg.contains("CONVAI_AGENT_ID")),
            _ => panic!("Expected MissingVar for the agent identity"),
        }
    }

    #[test]
    #[serial]
    fn test_config_conflicting_identity() {
        clear_env_vars();
        unsafe {
            env::set_var("CONVAI_AGENT_ID", "agent_123");
            env::set_var("CONVAI_CONVERSATION_TOKEN", "signed-token");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "CONVAI_CONVERSATION_TOKEN"),
            _ => panic!("Expected InvalidValue for CONVAI_CONVERSATION_TOKEN"),
        }
    }

    #[test]
    #[serial]
    fn test_config_invalid_language() {
        clear_env_vars();
        unsafe {
            env::set_var("CONVAI_AGENT_ID", "agent_123");
            env::set_var("CONVAI_LANGUAGE", "klingon");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, msg) => {
                assert_eq!(var, "CONVAI_LANGUAGE");
                assert!(msg.contains("klingon"));
            }
            _ => panic!("Expected InvalidValue for CONVAI_LANGUAGE"),
        }
    }

    #[test]
    #[serial]
    fn test_config_invalid_log_level() {
        clear_env_vars();
        unsafe {
            env::set_var("CONVAI_AGENT_ID", "agent_123");
            env::set_var("RUST_LOG", "not-a-level");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "RUST_LOG"),
            _ => panic!("Expected InvalidValue for RUST_LOG"),
        }
    }
}
