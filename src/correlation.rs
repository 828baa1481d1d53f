use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Namespace prefix for correlation keys in the shared backing store.
pub const KEY_PREFIX: &str = "relaybot:pending:";

/// How long a pending request lives if its callback never arrives.
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

const MAX_CORRELATION_ID_LEN: usize = 64;

/// Everything needed to act on a callback: where the reply goes and
/// what triggered it. Created when a command is dispatched to the
/// runner, destroyed when the callback is processed or the TTL fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingRequest {
    pub correlation_id: String,
    pub chat_id: i64,
    #[serde(default)]
    pub message_id: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub ttl_secs: u64,
    /// Opaque dispatch metadata (e.g. the command text), carried for
    /// logging and debug replies only.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl PendingRequest {
    pub fn new(
        correlation_id: String,
        chat_id: i64,
        message_id: Option<i32>,
        ttl: Duration,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            correlation_id,
            chat_id,
            message_id,
            created_at: Utc::now(),
            ttl_secs: ttl.as_secs(),
            payload,
        }
    }
}

#[derive(Debug)]
pub enum CorrelationError {
    /// The correlation ID failed validation and was never used as a key.
    InvalidId(String),
    /// The backing store call failed.
    Backend(anyhow::Error),
}

impl fmt::Display for CorrelationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrelationError::InvalidId(id) => {
                write!(f, "invalid correlation ID: {:?}", id)
            }
            CorrelationError::Backend(err) => write!(f, "correlation store backend: {}", err),
        }
    }
}

impl std::error::Error for CorrelationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CorrelationError::InvalidId(_) => None,
            CorrelationError::Backend(err) => Some(&**err),
        }
    }
}

/// Expiring key/value capability backing the correlation store. Kept
/// minimal so production Redis and the in-memory test backend are
/// interchangeable.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()>;
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn del(&self, key: &str) -> anyhow::Result<()>;
}

/// Correlation IDs become store keys, so they are validated before any
/// key is built: bounded length, ASCII alphanumerics and hyphens only
/// (covers UUIDs). Malformed IDs are rejected outright, never
/// truncated.
pub fn is_valid_correlation_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_CORRELATION_ID_LEN
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// Map from correlation ID to [`PendingRequest`], backed by a shared
/// expiring key/value service. The store is the sole owner of pending
/// records; single-key atomicity comes from the backing service.
#[derive(Clone)]
pub struct CorrelationStore {
    kv: Arc<dyn KvStore>,
    default_ttl: Duration,
}

impl CorrelationStore {
    pub fn new(kv: Arc<dyn KvStore>, default_ttl: Duration) -> Self {
        Self { kv, default_ttl }
    }

    fn key_for(id: &str) -> Result<String, CorrelationError> {
        if !is_valid_correlation_id(id) {
            return Err(CorrelationError::InvalidId(id.to_string()));
        }
        Ok(format!("{}{}", KEY_PREFIX, id))
    }

    /// Store a pending request under its correlation ID. A second store
    /// with the same ID overwrites (IDs are generated unique per
    /// dispatch, so an overwrite indicates a caller bug).
    pub async fn store(&self, request: &PendingRequest) -> Result<(), CorrelationError> {
        let key = Self::key_for(&request.correlation_id)?;
        let ttl = if request.ttl_secs > 0 {
            Duration::from_secs(request.ttl_secs)
        } else {
            self.default_ttl
        };
        let blob = serde_json::to_string(request)
            .map_err(|e| CorrelationError::Backend(e.into()))?;
        self.kv
            .set_ex(&key, &blob, ttl)
            .await
            .map_err(CorrelationError::Backend)
    }

    /// Fetch the pending request for `id`, or `None` if it never
    /// existed or has expired.
    pub async fn fetch(&self, id: &str) -> Result<Option<PendingRequest>, CorrelationError> {
        let key = Self::key_for(id)?;
        let blob = match self.kv.get(&key).await.map_err(CorrelationError::Backend)? {
            Some(blob) => blob,
            None => return Ok(None),
        };
        match serde_json::from_str(&blob) {
            Ok(request) => Ok(Some(request)),
            Err(err) => {
                // A corrupt record is unusable; drop it so it cannot
                // wedge this correlation ID until the TTL fires.
                warn!(correlation_id = %id, error = %err, "Dropping corrupt pending record");
                let _ = self.kv.del(&key).await;
                Ok(None)
            }
        }
    }

    /// Delete the record for `id`. Deleting an absent key is not an
    /// error; the first remover wins.
    pub async fn remove(&self, id: &str) -> Result<(), CorrelationError> {
        let key = Self::key_for(id)?;
        self.kv.del(&key).await.map_err(CorrelationError::Backend)
    }
}
