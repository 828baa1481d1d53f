use std::path::Path;

use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub telegram: TelegramConfig,
    pub runner: RunnerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub tts: Option<TtsConfig>,
    #[serde(default)]
    pub webhook: WebhookConfig,
    /// Prefix replies with correlation ID, duration, and exit code.
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Users allowed to dispatch commands. Empty means nobody —
    /// fail-closed.
    #[serde(default)]
    pub allowed_user_ids: Vec<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RunnerConfig {
    /// Where dispatch requests are POSTed.
    pub endpoint: String,
    /// Public URL of our own callback endpoint, echoed to the runner.
    pub callback_url: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_call_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Shared expiring KV for correlation records. When unset, an
    /// in-process store is used and pending requests do not survive a
    /// restart.
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            ttl_secs: default_ttl_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TtsConfig {
    pub endpoint: String,
    #[serde(default = "default_voice")]
    pub voice: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebhookConfig {
    #[serde(default = "default_webhook_port")]
    pub port: u16,
    /// Shared secret the runner must present in the callback header.
    #[serde(default)]
    pub shared_secret: Option<String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            port: default_webhook_port(),
            shared_secret: None,
        }
    }
}

fn default_call_timeout_secs() -> u64 {
    30
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_ttl_secs() -> u64 {
    3600
}
fn default_voice() -> String {
    "alloy".to_string()
}
fn default_webhook_port() -> u16 {
    8090
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }
}
