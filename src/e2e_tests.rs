//! End-to-end tests of the correlation lifecycle with fake external
//! services: dispatch, callback, delivery fallback, and expiry.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::callback::{CallbackCoordinator, CallbackResult, DeliveryOutcome};
use crate::correlation::{CorrelationStore, PendingRequest, DEFAULT_TTL};
use crate::delivery::DeliveryChannel;
use crate::kv::MemoryKv;
use crate::retry::RetryPolicy;
use crate::tts::Synthesizer;

#[derive(Default)]
struct RecordingDelivery {
    texts: Mutex<Vec<(i64, Option<i32>, String)>>,
    audios: Mutex<Vec<(i64, Option<i32>, PathBuf)>>,
    fail_text: AtomicBool,
    fail_audio: AtomicBool,
}

impl RecordingDelivery {
    fn sent_texts(&self) -> Vec<(i64, Option<i32>, String)> {
        self.texts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn sent_audios(&self) -> Vec<(i64, Option<i32>, PathBuf)> {
        self.audios.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl DeliveryChannel for RecordingDelivery {
    async fn send_text(
        &self,
        chat_id: i64,
        reply_to: Option<i32>,
        text: &str,
    ) -> anyhow::Result<()> {
        if self.fail_text.load(Ordering::SeqCst) {
            anyhow::bail!("chat unreachable");
        }
        self.texts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((chat_id, reply_to, text.to_string()));
        Ok(())
    }

    async fn send_audio(
        &self,
        chat_id: i64,
        reply_to: Option<i32>,
        audio: &Path,
    ) -> anyhow::Result<()> {
        if self.fail_audio.load(Ordering::SeqCst) {
            anyhow::bail!("voice upload rejected");
        }
        self.audios
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((chat_id, reply_to, audio.to_path_buf()));
        Ok(())
    }
}

/// Writes a real temp file so artifact cleanup is exercised.
struct TempFileSynthesizer;

#[async_trait]
impl Synthesizer for TempFileSynthesizer {
    async fn synthesize(&self, _text: &str) -> anyhow::Result<PathBuf> {
        let path =
            std::env::temp_dir().join(format!("relaybot-test-{}.ogg", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, b"fake-ogg").await?;
        Ok(path)
    }
}

struct FailingSynthesizer;

#[async_trait]
impl Synthesizer for FailingSynthesizer {
    async fn synthesize(&self, _text: &str) -> anyhow::Result<PathBuf> {
        anyhow::bail!("synthesis backend down")
    }
}

struct Harness {
    store: CorrelationStore,
    delivery: Arc<RecordingDelivery>,
    coordinator: CallbackCoordinator,
}

fn harness(synthesizer: Option<Arc<dyn Synthesizer>>) -> Harness {
    let store = CorrelationStore::new(Arc::new(MemoryKv::new()), DEFAULT_TTL);
    let delivery = Arc::new(RecordingDelivery::default());
    let coordinator = CallbackCoordinator::new(
        store.clone(),
        Arc::clone(&delivery) as Arc<dyn DeliveryChannel>,
        synthesizer,
        // Retries off: these tests assert call counts, not retry
        // behavior (covered in retry::tests).
        RetryPolicy::default().with_attempts(0),
        Duration::from_secs(30),
        false,
    );
    Harness {
        store,
        delivery,
        coordinator,
    }
}

async fn seed(store: &CorrelationStore, id: &str, chat_id: i64) {
    let pending = PendingRequest::new(
        id.to_string(),
        chat_id,
        Some(7),
        Duration::from_secs(60),
        json!({ "command": "uptime" }),
    );
    store.store(&pending).await.unwrap();
}

fn success_callback(id: &str, output: &str) -> CallbackResult {
    CallbackResult {
        correlation_id: id.to_string(),
        success: true,
        output: output.to_string(),
        error_message: None,
        duration_secs: Some(1.2),
        exit_code: Some(0),
    }
}

#[tokio::test]
async fn unknown_correlation_id_is_stale_ignored() {
    let h = harness(None);
    let outcome = h
        .coordinator
        .handle_callback(&success_callback("req-unknown", "done"))
        .await
        .unwrap();
    assert_eq!(outcome, DeliveryOutcome::StaleIgnored);
    assert!(h.delivery.sent_texts().is_empty());
    assert!(h.delivery.sent_audios().is_empty());
}

#[tokio::test]
async fn text_primary_when_no_synthesizer() {
    let h = harness(None);
    seed(&h.store, "req-1", 42).await;

    let outcome = h
        .coordinator
        .handle_callback(&success_callback("req-1", "done"))
        .await
        .unwrap();

    assert_eq!(outcome, DeliveryOutcome::DeliveredTextPrimary);
    let texts = h.delivery.sent_texts();
    assert_eq!(texts.len(), 1);
    assert_eq!(texts[0].0, 42);
    assert_eq!(texts[0].1, Some(7));
    assert!(texts[0].2.contains("done"));

    // Record removed: a replay of the same callback is stale.
    assert!(h.store.fetch("req-1").await.unwrap().is_none());
    let replay = h
        .coordinator
        .handle_callback(&success_callback("req-1", "done"))
        .await
        .unwrap();
    assert_eq!(replay, DeliveryOutcome::StaleIgnored);
}

#[tokio::test]
async fn audio_delivery_cleans_up_the_artifact() {
    let h = harness(Some(Arc::new(TempFileSynthesizer)));
    seed(&h.store, "req-audio", 42).await;

    let outcome = h
        .coordinator
        .handle_callback(&success_callback("req-audio", "done"))
        .await
        .unwrap();

    assert_eq!(outcome, DeliveryOutcome::DeliveredAudio);
    assert!(h.delivery.sent_texts().is_empty());
    let audios = h.delivery.sent_audios();
    assert_eq!(audios.len(), 1);
    assert_eq!(audios[0].0, 42);
    // Temp artifact deleted after the send.
    assert!(!audios[0].2.exists());
}

#[tokio::test]
async fn synthesis_failure_falls_back_to_text() {
    let h = harness(Some(Arc::new(FailingSynthesizer)));
    seed(&h.store, "req-fb", 42).await;

    let outcome = h
        .coordinator
        .handle_callback(&success_callback("req-fb", "done"))
        .await
        .unwrap();

    assert_eq!(outcome, DeliveryOutcome::DeliveredTextFallback);
    assert_eq!(h.delivery.sent_texts().len(), 1);
    assert!(h.store.fetch("req-fb").await.unwrap().is_none());
}

#[tokio::test]
async fn audio_send_failure_falls_back_to_text() {
    let h = harness(Some(Arc::new(TempFileSynthesizer)));
    h.delivery.fail_audio.store(true, Ordering::SeqCst);
    seed(&h.store, "req-fb2", 42).await;

    let outcome = h
        .coordinator
        .handle_callback(&success_callback("req-fb2", "done"))
        .await
        .unwrap();

    assert_eq!(outcome, DeliveryOutcome::DeliveredTextFallback);
    assert_eq!(h.delivery.sent_texts().len(), 1);
}

#[tokio::test]
async fn total_delivery_failure_still_removes_the_record() {
    let h = harness(Some(Arc::new(FailingSynthesizer)));
    h.delivery.fail_text.store(true, Ordering::SeqCst);
    seed(&h.store, "req-dead", 42).await;

    let err = h
        .coordinator
        .handle_callback(&success_callback("req-dead", "done"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("audio and text delivery both failed"));

    // Finalize ran anyway.
    assert!(h.store.fetch("req-dead").await.unwrap().is_none());
}

#[tokio::test]
async fn failure_callback_formats_an_error_reply() {
    let h = harness(None);
    seed(&h.store, "req-err", 42).await;

    let callback = CallbackResult {
        correlation_id: "req-err".to_string(),
        success: false,
        output: String::new(),
        error_message: Some("disk full".to_string()),
        duration_secs: None,
        exit_code: Some(1),
    };
    h.coordinator.handle_callback(&callback).await.unwrap();

    let texts = h.delivery.sent_texts();
    assert_eq!(texts[0].2, "❌ disk full");
}

#[tokio::test]
async fn failure_callback_without_message_uses_the_generic_text() {
    let h = harness(None);
    seed(&h.store, "req-err2", 42).await;

    let callback = CallbackResult {
        correlation_id: "req-err2".to_string(),
        success: false,
        output: String::new(),
        error_message: None,
        duration_secs: None,
        exit_code: None,
    };
    h.coordinator.handle_callback(&callback).await.unwrap();

    let texts = h.delivery.sent_texts();
    assert_eq!(texts[0].2, "❌ Unknown error occurred");
}

#[tokio::test]
async fn debug_mode_prefixes_replies_with_run_metadata() {
    let store = CorrelationStore::new(Arc::new(MemoryKv::new()), DEFAULT_TTL);
    let delivery = Arc::new(RecordingDelivery::default());
    let coordinator = CallbackCoordinator::new(
        store.clone(),
        Arc::clone(&delivery) as Arc<dyn DeliveryChannel>,
        None,
        RetryPolicy::default().with_attempts(0),
        Duration::from_secs(30),
        true,
    );
    seed(&store, "req-dbg", 42).await;

    coordinator
        .handle_callback(&success_callback("req-dbg", "done"))
        .await
        .unwrap();

    let texts = delivery.sent_texts();
    assert!(texts[0].2.starts_with("[req-dbg · 1.2s · exit 0]\n"));
    assert!(texts[0].2.ends_with("done"));
}

#[tokio::test(start_paused = true)]
async fn expired_record_makes_a_late_callback_stale() {
    let h = harness(None);
    let pending = PendingRequest::new(
        "req-late".to_string(),
        42,
        None,
        Duration::from_secs(1),
        json!({}),
    );
    h.store.store(&pending).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1100)).await;

    let outcome = h
        .coordinator
        .handle_callback(&success_callback("req-late", "too late"))
        .await
        .unwrap();
    assert_eq!(outcome, DeliveryOutcome::StaleIgnored);
    assert!(h.delivery.sent_texts().is_empty());
}
