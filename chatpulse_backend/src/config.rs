use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::llm_client::ModelEndpoint;

/// How the jealousy window decides that the user favors someone else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JealousyBasis {
    /// Another member was @mentioned by the user in the room's recent messages
    /// while this character was not.
    Mentions,
    /// The user exchanged direct messages with another member of the room more
    /// recently than with this character.
    DirectActivity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JealousyConfig {
    #[serde(default = "default_jealousy_basis")]
    pub basis: JealousyBasis,
    /// Number of most recent room messages inspected.
    #[serde(default = "default_jealousy_window_messages")]
    pub window_messages: usize,
}

fn default_jealousy_basis() -> JealousyBasis {
    JealousyBasis::Mentions
}

fn default_jealousy_window_messages() -> usize {
    10
}

impl Default for JealousyConfig {
    fn default() -> Self {
        Self {
            basis: default_jealousy_basis(),
            window_messages: default_jealousy_window_messages(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // HTTP shell
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    // Storage; one SQLite file per tenant lives under `<data_dir>/tenants`
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    // Fallback LLM endpoint for characters without their own (OpenAI-compatible)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub llm_max_tokens: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: u64,

    // Embeddings; when no URL is configured the offline hashing embedder is used
    #[serde(default)]
    pub embedding_api_url: Option<String>,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default)]
    pub embedding_api_key: Option<String>,

    // Orchestration timing
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_pause_secs")]
    pub pause_secs: u64,
    #[serde(default = "default_state_broadcast_ms")]
    pub state_broadcast_ms: u64,
    #[serde(default = "default_max_chain_followups")]
    pub max_chain_followups: usize,

    // Memory
    #[serde(default = "default_memory_extract_every")]
    pub memory_extract_every: u32,
    #[serde(default = "default_memory_search_k")]
    pub memory_search_k: usize,
    #[serde(default = "default_context_messages")]
    pub context_messages: usize,

    #[serde(default)]
    pub jealousy: JealousyConfig,

    /// Chance that each room member grabs a red packet the user drops into a group.
    #[serde(default = "default_red_packet_grab_chance")]
    pub red_packet_grab_chance: f64,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_data_dir() -> String {
    dirs::data_local_dir()
        .map(|dir| dir.join("chatpulse"))
        .unwrap_or_else(|| PathBuf::from("chatpulse_data"))
        .to_string_lossy()
        .into_owned()
}

fn default_llm_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_llm_model() -> String {
    "llama3.2".to_string()
}

fn default_max_tokens() -> u32 {
    800
}

fn default_llm_timeout_secs() -> u64 {
    60
}

fn default_embedding_model() -> String {
    "all-minilm".to_string()
}

fn default_debounce_ms() -> u64 {
    3000
}

fn default_pause_secs() -> u64 {
    10
}

fn default_state_broadcast_ms() -> u64 {
    1000
}

fn default_max_chain_followups() -> usize {
    3
}

fn default_memory_extract_every() -> u32 {
    6
}

fn default_memory_search_k() -> usize {
    5
}

fn default_context_messages() -> usize {
    30
}

fn default_red_packet_grab_chance() -> f64 {
    0.8
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            data_dir: default_data_dir(),
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            llm_max_tokens: default_max_tokens(),
            llm_timeout_secs: default_llm_timeout_secs(),
            embedding_api_url: None,
            embedding_model: default_embedding_model(),
            embedding_api_key: None,
            debounce_ms: default_debounce_ms(),
            pause_secs: default_pause_secs(),
            state_broadcast_ms: default_state_broadcast_ms(),
            max_chain_followups: default_max_chain_followups(),
            memory_extract_every: default_memory_extract_every(),
            memory_search_k: default_memory_search_k(),
            context_messages: default_context_messages(),
            jealousy: JealousyConfig::default(),
            red_packet_grab_chance: default_red_packet_grab_chance(),
        }
    }
}

impl EngineConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("chatpulse_config.toml")
    }

    /// Load config from chatpulse_config.toml next to the executable.
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<EngineConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = env::var("CHATPULSE_BIND") {
            config.bind_addr = addr;
        }

        if let Ok(dir) = env::var("CHATPULSE_DATA_DIR") {
            if !dir.trim().is_empty() {
                config.data_dir = dir;
            }
        }

        if let Ok(url) = env::var("LLM_API_URL") {
            config.llm_api_url = url;
        }

        if let Ok(model) = env::var("LLM_MODEL") {
            config.llm_model = model;
        }

        if let Ok(key) = env::var("LLM_API_KEY") {
            config.llm_api_key = Some(key);
        }

        if let Ok(timeout) = env::var("LLM_TIMEOUT_SECS") {
            if let Ok(seconds) = timeout.parse() {
                config.llm_timeout_secs = seconds;
            }
        }

        if let Ok(url) = env::var("EMBEDDING_API_URL") {
            if !url.trim().is_empty() {
                config.embedding_api_url = Some(url);
            }
        }

        if let Ok(model) = env::var("EMBEDDING_MODEL") {
            config.embedding_model = model;
        }

        if let Ok(key) = env::var("EMBEDDING_API_KEY") {
            config.embedding_api_key = Some(key);
        }

        if let Ok(debounce) = env::var("CHATPULSE_DEBOUNCE_MS") {
            if let Ok(ms) = debounce.parse() {
                config.debounce_ms = ms;
            }
        }

        if let Ok(every) = env::var("CHATPULSE_MEMORY_EXTRACT_EVERY") {
            if let Ok(count) = every.parse() {
                config.memory_extract_every = count;
            }
        }

        config
    }

    pub fn default_endpoint(&self) -> ModelEndpoint {
        ModelEndpoint {
            api_url: self.llm_api_url.clone(),
            api_key: self.llm_api_key.clone(),
            model: self.llm_model.clone(),
            max_tokens: self.llm_max_tokens,
        }
    }

    pub fn tenants_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("tenants")
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_secs.max(1))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn pause(&self) -> Duration {
        Duration::from_secs(self.pause_secs)
    }

    pub fn state_broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.state_broadcast_ms.max(100))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
            debounce_ms = 1500
            [jealousy]
            basis = "direct_activity"
            "#,
        )
        .expect("parse config");

        assert_eq!(config.debounce_ms, 1500);
        assert_eq!(config.jealousy.basis, JealousyBasis::DirectActivity);
        assert_eq!(config.jealousy.window_messages, 10);
        assert_eq!(config.pause_secs, 10);
        assert_eq!(config.llm_max_tokens, 800);
        assert_eq!(config.memory_extract_every, 6);
    }

    #[test]
    fn serialized_defaults_round_trip_through_toml() {
        let config = EngineConfig::default();
        let raw = toml::to_string_pretty(&config).expect("serialize");
        let parsed: EngineConfig = toml::from_str(&raw).expect("parse");
        assert_eq!(parsed.bind_addr, config.bind_addr);
        assert_eq!(parsed.state_broadcast_ms, 1000);
        assert_eq!(parsed.default_endpoint().model, config.llm_model);
    }
}
