//! relaybot configuration loader.
//!
//! Values come from an optional TOML file, then environment overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayBotConfig {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub watch: WatchConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_relay_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_resolve_timeout_secs")]
    pub resolve_timeout_secs: u64,
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
    /// Scope prefix of the synthetic `<scope>;-;<sender>` conversation id.
    #[serde(default = "default_fallback_scope")]
    pub fallback_scope: String,
    /// Conversations whose id contains this marker are group chats and ignored.
    #[serde(default = "default_group_marker")]
    pub group_marker: String,
}

fn default_relay_base_url() -> String {
    "http://localhost:1234".to_string()
}

fn default_resolve_timeout_secs() -> u64 {
    10
}

fn default_send_timeout_secs() -> u64 {
    5
}

fn default_fallback_scope() -> String {
    "any".to_string()
}

fn default_group_marker() -> String {
    ";+;".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            base_url: default_relay_base_url(),
            password: String::new(),
            resolve_timeout_secs: default_resolve_timeout_secs(),
            send_timeout_secs: default_send_timeout_secs(),
            fallback_scope: default_fallback_scope(),
            group_marker: default_group_marker(),
        }
    }
}

impl RelayConfig {
    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.resolve_timeout_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_api_base_url")]
    pub api_base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_priority_models")]
    pub priority_models: Vec<String>,
    #[serde(default = "default_fallback_model")]
    pub fallback_model: Option<String>,
    /// System instruction for priority models.
    #[serde(default)]
    pub system_prompt: String,
    /// Text prepended to the user prompt for the fallback model.
    #[serde(default)]
    pub fallback_preamble: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_llm_api_base_url() -> String {
    rb_llm::DEFAULT_API_BASE_URL.to_string()
}

fn default_priority_models() -> Vec<String> {
    vec![
        "gemini-3-flash-preview".to_string(),
        "gemini-2.5-flash".to_string(),
        "gemini-2.5-flash-lite".to_string(),
    ]
}

fn default_fallback_model() -> Option<String> {
    Some("gemma-3-27b-it".to_string())
}

fn default_request_timeout_secs() -> u64 {
    15
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_llm_api_base_url(),
            api_key: String::new(),
            priority_models: default_priority_models(),
            fallback_model: default_fallback_model(),
            system_prompt: String::new(),
            fallback_preamble: String::new(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl LlmConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn model_chain(&self) -> rb_llm::ModelChain {
        rb_llm::ModelChain {
            priority_models: self
                .priority_models
                .iter()
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .collect(),
            fallback_model: self
                .fallback_model
                .as_deref()
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(ToOwned::to_owned),
            system_prompt: self.system_prompt.clone(),
            fallback_preamble: self.fallback_preamble.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Lower bound of the randomized quiet window.
    #[serde(default = "default_debounce_min_ms")]
    pub debounce_min_ms: u64,
    /// Upper bound (inclusive) of the randomized quiet window.
    #[serde(default = "default_debounce_max_ms")]
    pub debounce_max_ms: u64,
}

fn default_debounce_min_ms() -> u64 {
    10_000
}

fn default_debounce_max_ms() -> u64 {
    18_000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            debounce_min_ms: default_debounce_min_ms(),
            debounce_max_ms: default_debounce_max_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Presence of this file disables replies to untrusted senders.
    #[serde(default = "default_disabled_marker")]
    pub disabled_marker: PathBuf,
    #[serde(default = "default_blacklist_file")]
    pub blacklist_file: PathBuf,
    #[serde(default = "default_history_dir")]
    pub history_dir: PathBuf,
    /// Transcript lines included as prompt context.
    #[serde(default = "default_history_lines")]
    pub history_lines: usize,
}

fn default_disabled_marker() -> PathBuf {
    PathBuf::from("bot_disabled")
}

fn default_blacklist_file() -> PathBuf {
    PathBuf::from("blacklist.txt")
}

fn default_history_dir() -> PathBuf {
    PathBuf::from("history")
}

fn default_history_lines() -> usize {
    15
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            disabled_marker: default_disabled_marker(),
            blacklist_file: default_blacklist_file(),
            history_dir: default_history_dir(),
            history_lines: default_history_lines(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdminConfig {
    #[serde(default)]
    pub trusted_senders: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "default_watch_command")]
    pub command: Vec<String>,
}

fn default_watch_command() -> Vec<String> {
    rb_channels::WatchSource::default_command()
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            command: default_watch_command(),
        }
    }
}

impl RelayBotConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        Self::load_with_path(path).await.map(|(cfg, _)| cfg)
    }

    /// Load the config and report which file (if any) it came from. An
    /// explicit path must exist; a missing default file means built-in defaults.
    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, Option<PathBuf>)> {
        let explicit = path.is_some();
        let path = path.unwrap_or_else(default_config_path);

        let (mut cfg, source) = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let cfg = Self::from_toml_str(&contents)
                    .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;
                (cfg, Some(path))
            }
            Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => {
                (Self::default(), None)
            }
            Err(e) => return Err(anyhow::anyhow!("read config {}: {e}", path.display())),
        };

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok((cfg, source))
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("BB_URL") {
            self.relay.base_url = v;
        }
        if let Some(v) = get("BB_PASSWORD") {
            self.relay.password = v;
        }
        if let Some(v) = get("GEMINI_API_KEY") {
            self.llm.api_key = v;
        }
        if let Some(v) = get("MY_IDENTITIES") {
            self.admin.trusted_senders = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToOwned::to_owned)
                .collect();
        }
        if let Some(v) = get("SYSTEM_PROMPT_GEMINI") {
            self.llm.system_prompt = v;
        }
        if let Some(v) = get("SYSTEM_PROMPT_GEMMA") {
            self.llm.fallback_preamble = v;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.relay.base_url.trim().is_empty() {
            return Err(anyhow::anyhow!("relay.base_url is required"));
        }
        if self.relay.resolve_timeout_secs == 0 || self.relay.send_timeout_secs == 0 {
            return Err(anyhow::anyhow!("relay timeouts must be > 0"));
        }
        if self.llm.api_key.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "llm.api_key is required (set GEMINI_API_KEY)"
            ));
        }
        if self.llm.model_chain().is_empty() {
            return Err(anyhow::anyhow!(
                "at least one of llm.priority_models or llm.fallback_model is required"
            ));
        }
        if self.llm.request_timeout_secs == 0 {
            return Err(anyhow::anyhow!("llm.request_timeout_secs must be > 0"));
        }
        if self.scheduler.debounce_min_ms == 0 {
            return Err(anyhow::anyhow!("scheduler.debounce_min_ms must be > 0"));
        }
        if self.scheduler.debounce_min_ms > self.scheduler.debounce_max_ms {
            return Err(anyhow::anyhow!(
                "scheduler.debounce_min_ms must be <= scheduler.debounce_max_ms"
            ));
        }
        if self.storage.history_lines == 0 {
            return Err(anyhow::anyhow!("storage.history_lines must be > 0"));
        }
        if self.watch.command.iter().all(|part| part.trim().is_empty()) {
            return Err(anyhow::anyhow!("watch.command is required"));
        }
        Ok(())
    }
}

pub fn default_config_path() -> PathBuf {
    Path::new(".").join("relaybot.toml")
}
