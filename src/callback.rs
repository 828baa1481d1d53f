use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};

use crate::correlation::{CorrelationError, CorrelationStore, PendingRequest};
use crate::deadline::with_deadline;
use crate::delivery::{DeliveryChannel, TELEGRAM_MAX_LEN};
use crate::retry::{with_retry, RetryPolicy};
use crate::tts::Synthesizer;

/// Canonical inbound callback payload. The webhook boundary normalizes
/// field-name variants before this type is built; nothing past it
/// branches on payload shape.
#[derive(Debug, Clone)]
pub struct CallbackResult {
    pub correlation_id: String,
    pub success: bool,
    pub output: String,
    pub error_message: Option<String>,
    pub duration_secs: Option<f64>,
    pub exit_code: Option<i32>,
}

/// Terminal state of one callback's processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryOutcome {
    /// Synthesized audio reached the chat.
    DeliveredAudio,
    /// Audio synthesis or the audio send failed; plain text reached the
    /// chat instead.
    DeliveredTextFallback,
    /// No synthesizer configured; text was the primary path.
    DeliveredTextPrimary,
    /// The correlation record was unknown or already expired. Expected
    /// race with TTL expiry, not an error.
    StaleIgnored,
}

/// Both delivery paths failed for a callback that had a live record.
#[derive(Debug)]
pub struct DeliveryError {
    pub text_error: anyhow::Error,
    pub audio_error: Option<anyhow::Error>,
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.audio_error {
            Some(audio) => write!(
                f,
                "audio and text delivery both failed (audio: {}; text: {})",
                audio, self.text_error
            ),
            None => write!(f, "text delivery failed: {}", self.text_error),
        }
    }
}

impl std::error::Error for DeliveryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.text_error)
    }
}

/// Matches callbacks to their stored chat context and delivers the
/// formatted result, preferring audio when a synthesizer is configured
/// and falling back to text on any audio-path failure.
pub struct CallbackCoordinator {
    store: CorrelationStore,
    delivery: Arc<dyn DeliveryChannel>,
    synthesizer: Option<Arc<dyn Synthesizer>>,
    retry_policy: RetryPolicy,
    call_timeout: Duration,
    debug: bool,
}

impl CallbackCoordinator {
    pub fn new(
        store: CorrelationStore,
        delivery: Arc<dyn DeliveryChannel>,
        synthesizer: Option<Arc<dyn Synthesizer>>,
        retry_policy: RetryPolicy,
        call_timeout: Duration,
        debug: bool,
    ) -> Self {
        Self {
            store,
            delivery,
            synthesizer,
            retry_policy,
            call_timeout,
            debug,
        }
    }

    /// Process one callback end to end. The correlation record is
    /// removed whatever the delivery outcome, so a callback is only
    /// ever acted on once.
    pub async fn handle_callback(&self, result: &CallbackResult) -> anyhow::Result<DeliveryOutcome> {
        let pending = match self.store.fetch(&result.correlation_id).await {
            Ok(Some(pending)) => pending,
            Ok(None) => {
                info!(
                    correlation_id = %result.correlation_id,
                    "Callback for unknown or expired correlation ID, ignoring"
                );
                return Ok(DeliveryOutcome::StaleIgnored);
            }
            Err(CorrelationError::InvalidId(id)) => {
                warn!(correlation_id = %id, "Callback carried a malformed correlation ID, ignoring");
                return Ok(DeliveryOutcome::StaleIgnored);
            }
            Err(err @ CorrelationError::Backend(_)) => return Err(err.into()),
        };

        let reply = self.format_reply(result);
        let delivery_result = self.deliver(&pending, &reply).await;

        // Finalize regardless of how delivery went. If the delete
        // itself fails the TTL still reclaims the record.
        if let Err(err) = self.store.remove(&result.correlation_id).await {
            warn!(
                correlation_id = %result.correlation_id,
                error = %err,
                "Failed to remove correlation record after delivery"
            );
        }

        match delivery_result {
            Ok(outcome) => {
                info!(
                    correlation_id = %result.correlation_id,
                    chat_id = pending.chat_id,
                    outcome = ?outcome,
                    "Callback delivered"
                );
                Ok(outcome)
            }
            Err(err) => {
                warn!(
                    correlation_id = %result.correlation_id,
                    chat_id = pending.chat_id,
                    error = %err,
                    "Callback delivery failed"
                );
                Err(err.into())
            }
        }
    }

    /// Build the user-facing message. Success output is stripped of
    /// terminal escape sequences and capped to the channel limit;
    /// failures get a ❌ prefix. Internal error kinds never leak here.
    fn format_reply(&self, result: &CallbackResult) -> String {
        let body = if result.success {
            let cleaned = sanitize_output(&result.output);
            if cleaned.is_empty() {
                "✅ Command completed with no output.".to_string()
            } else {
                cleaned
            }
        } else {
            let message = result
                .error_message
                .as_deref()
                .filter(|m| !m.trim().is_empty())
                .unwrap_or("Unknown error occurred");
            format!("❌ {}", message)
        };

        let text = if self.debug {
            let mut preamble = format!("[{}", result.correlation_id);
            if let Some(secs) = result.duration_secs {
                preamble.push_str(&format!(" · {:.1}s", secs));
            }
            if let Some(code) = result.exit_code {
                preamble.push_str(&format!(" · exit {}", code));
            }
            preamble.push_str("]\n");
            preamble + &body
        } else {
            body
        };

        cap_length(&text, TELEGRAM_MAX_LEN)
    }

    async fn deliver(
        &self,
        pending: &PendingRequest,
        reply: &str,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        if let Some(synthesizer) = &self.synthesizer {
            match self.try_audio(synthesizer.as_ref(), pending, reply).await {
                Ok(()) => return Ok(DeliveryOutcome::DeliveredAudio),
                Err(audio_error) => {
                    warn!(
                        chat_id = pending.chat_id,
                        error = %audio_error,
                        "Audio delivery failed, falling back to text"
                    );
                    return match self.send_text(pending, reply).await {
                        Ok(()) => Ok(DeliveryOutcome::DeliveredTextFallback),
                        Err(text_error) => Err(DeliveryError {
                            text_error,
                            audio_error: Some(audio_error),
                        }),
                    };
                }
            }
        }

        match self.send_text(pending, reply).await {
            Ok(()) => Ok(DeliveryOutcome::DeliveredTextPrimary),
            Err(text_error) => Err(DeliveryError {
                text_error,
                audio_error: None,
            }),
        }
    }

    /// Synthesize and send a voice reply. The temp audio artifact is
    /// deleted best-effort after the send attempt, success or not.
    async fn try_audio(
        &self,
        synthesizer: &dyn Synthesizer,
        pending: &PendingRequest,
        reply: &str,
    ) -> anyhow::Result<()> {
        let audio_path = with_retry(&self.retry_policy, || async {
            with_deadline(self.call_timeout, synthesizer.synthesize(reply))
                .await
                .map_err(anyhow::Error::new)
        })
        .await?;

        let sent = with_retry(&self.retry_policy, || async {
            with_deadline(
                self.call_timeout,
                self.delivery
                    .send_audio(pending.chat_id, pending.message_id, &audio_path),
            )
            .await
            .map_err(anyhow::Error::new)
        })
        .await;

        if let Err(err) = tokio::fs::remove_file(&audio_path).await {
            warn!(
                path = %audio_path.display(),
                error = %err,
                "Failed to delete temporary audio file"
            );
        }

        sent?;
        Ok(())
    }

    async fn send_text(&self, pending: &PendingRequest, reply: &str) -> anyhow::Result<()> {
        with_retry(&self.retry_policy, || async {
            with_deadline(
                self.call_timeout,
                self.delivery
                    .send_text(pending.chat_id, pending.message_id, reply),
            )
            .await
            .map_err(anyhow::Error::new)
        })
        .await?;
        Ok(())
    }
}

static ANSI_ESCAPES: Lazy<Regex> = Lazy::new(|| {
    // CSI sequences, OSC sequences, and stray two-byte escapes.
    Regex::new(r"\x1B\[[0-9;?]*[A-Za-z]|\x1B\][^\x07\x1B]*(\x07|\x1B\\)|\x1B.").unwrap()
});

/// Strip terminal escape sequences and control characters (except
/// newlines and tabs) from runner output.
pub fn sanitize_output(output: &str) -> String {
    let stripped = ANSI_ESCAPES.replace_all(output, "");
    stripped
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect::<String>()
        .trim()
        .to_string()
}

/// Cap `text` to `max_chars` characters, marking the cut.
fn cap_length(text: &str, max_chars: usize) -> String {
    const NOTE: &str = "…[truncated]";
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let keep = max_chars.saturating_sub(NOTE.chars().count());
    let mut capped: String = text.chars().take(keep).collect();
    capped.push_str(NOTE);
    capped
}
