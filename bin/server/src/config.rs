//! Centralized server configuration.
//!
//! Loaded via the `config` crate from environment variables, using `__` to
//! separate nested keys (`LLM__MODEL`, `TURN__MAX_TOOL_ROUNDS`, ...).

use serde::Deserialize;
use speda_ai::{LlmBackendConfig, LlmProvider};
use speda_conversation::{SessionConfig, TextDelivery, TurnConfig};
use std::time::Duration;

/// Server configuration composed from library configs.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP listener binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection URL. Conversations are kept in memory when unset.
    #[serde(default)]
    pub database_url: Option<String>,

    /// Language model connection.
    #[serde(default)]
    pub llm: LlmConfig,

    /// Turn loop limits.
    #[serde(default)]
    pub turn: TurnSettings,

    /// Conversation title generation.
    #[serde(default)]
    pub title: TitleSettings,

    /// Long-term memory about the owner.
    #[serde(default)]
    pub memory: MemorySettings,

    /// The assistant's owner.
    #[serde(default)]
    pub owner: OwnerConfig,
}

/// Language model connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: LlmProvider,

    /// Base URL up to and including the API version segment.
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    #[serde(default = "default_llm_model")]
    pub model: String,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub temperature: Option<f32>,

    #[serde(default)]
    pub max_tokens: Option<u32>,

    /// Deadline for non-streaming calls such as title generation.
    #[serde(default)]
    pub request_timeout_seconds: Option<u64>,
}

fn default_llm_provider() -> LlmProvider {
    LlmProvider::Ollama
}

fn default_llm_base_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_llm_model() -> String {
    "llama3.1".to_string()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            api_key: None,
            temperature: None,
            max_tokens: None,
            request_timeout_seconds: None,
        }
    }
}

impl LlmConfig {
    /// Returns the backend configuration.
    #[must_use]
    pub fn backend_config(&self) -> LlmBackendConfig {
        LlmBackendConfig {
            provider: self.provider,
            base_url: self.base_url.clone(),
            model: self.model.clone(),
            api_key: self.api_key.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            request_timeout_secs: self.request_timeout_seconds,
        }
    }
}

/// Turn loop settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TurnSettings {
    /// Maximum number of model steps that may request tools in one turn.
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,

    /// Number of prior messages sent to the model.
    #[serde(default = "default_max_context_messages")]
    pub max_context_messages: usize,

    /// Deadline for connecting to the model and for each streamed fragment.
    #[serde(default = "default_gateway_timeout_seconds")]
    pub gateway_timeout_seconds: u64,

    #[serde(default)]
    pub text_delivery: TextDelivery,

    /// Timezone used when the client does not report one.
    #[serde(default = "default_timezone")]
    pub default_timezone: String,

    /// Replaces the built-in persona.
    #[serde(default)]
    pub persona: Option<String>,
}

fn default_max_tool_rounds() -> usize {
    10
}

fn default_max_context_messages() -> usize {
    20
}

fn default_gateway_timeout_seconds() -> u64 {
    60
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            max_tool_rounds: default_max_tool_rounds(),
            max_context_messages: default_max_context_messages(),
            gateway_timeout_seconds: default_gateway_timeout_seconds(),
            text_delivery: TextDelivery::default(),
            default_timezone: default_timezone(),
            persona: None,
        }
    }
}

impl TurnSettings {
    /// Returns the executor configuration.
    #[must_use]
    pub fn turn_config(&self) -> TurnConfig {
        let mut config = TurnConfig {
            max_tool_rounds: self.max_tool_rounds,
            max_context_messages: self.max_context_messages,
            gateway_timeout: Duration::from_secs(self.gateway_timeout_seconds),
            text_delivery: self.text_delivery,
            default_timezone: self.default_timezone.clone(),
            ..TurnConfig::default()
        };
        if let Some(persona) = &self.persona {
            config.persona.clone_from(persona);
        }
        config
    }
}

/// Title generation settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TitleSettings {
    /// How long a first turn waits for its title before finishing.
    #[serde(default = "default_title_wait_seconds")]
    pub wait_seconds: u64,
}

fn default_title_wait_seconds() -> u64 {
    5
}

impl Default for TitleSettings {
    fn default() -> Self {
        Self {
            wait_seconds: default_title_wait_seconds(),
        }
    }
}

/// Long-term memory settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MemorySettings {
    /// Adds remembered facts and recent conversations to the prompt.
    #[serde(default = "default_memory_enabled")]
    pub enabled: bool,

    /// Facts are extracted each time a conversation passes a multiple of
    /// this many messages. Zero disables extraction.
    #[serde(default = "default_extract_every")]
    pub extract_every: usize,
}

fn default_memory_enabled() -> bool {
    true
}

fn default_extract_every() -> usize {
    10
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            enabled: default_memory_enabled(),
            extract_every: default_extract_every(),
        }
    }
}

/// The single user this assistant serves.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OwnerConfig {
    /// Stable user id. A fresh one is generated at startup when unset.
    #[serde(default)]
    pub user_id: Option<String>,

    /// Name the assistant uses for the owner.
    #[serde(default)]
    pub name: Option<String>,
}

impl ServerConfig {
    /// Returns the session controller configuration.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            title_wait: Duration::from_secs(self.title.wait_seconds),
            extract_every: self.memory.extract_every,
            ..SessionConfig::default()
        }
    }

    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is present but invalid.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}
