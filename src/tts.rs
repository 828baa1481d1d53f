use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use crate::config::TtsConfig;

/// Text in, audio file out. The returned file is a temporary artifact;
/// the caller owns deleting it after the send.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> anyhow::Result<PathBuf>;
}

/// HTTP speech-synthesis client. Posts the text to a configured
/// endpoint and writes the returned audio bytes to a temp OGG file.
pub struct HttpTts {
    client: reqwest::Client,
    endpoint: String,
    voice: String,
    api_key: Option<String>,
}

impl HttpTts {
    pub fn new(config: &TtsConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            voice: config.voice.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl Synthesizer for HttpTts {
    async fn synthesize(&self, text: &str) -> anyhow::Result<PathBuf> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "text": text, "voice": self.voice }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?.error_for_status()?;
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            anyhow::bail!("synthesis endpoint returned an empty body");
        }

        let path = std::env::temp_dir().join(format!("relaybot-tts-{}.ogg", Uuid::new_v4()));
        tokio::fs::write(&path, &bytes).await?;
        Ok(path)
    }
}
