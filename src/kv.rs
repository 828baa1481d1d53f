use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::correlation::KvStore;

/// Lifecycle of the backing-store connection. Explicit states rather
/// than ad hoc booleans; transitions are logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(label)
    }
}

/// Redis-backed [`KvStore`]. The multiplexed connection is cheap to
/// clone and reconnects internally; `state` tracks what the last
/// observed transition was so operators can see flaps in the logs.
#[derive(Clone)]
pub struct RedisKv {
    conn: redis::aio::MultiplexedConnection,
    state: Arc<StdMutex<ConnectionState>>,
}

impl RedisKv {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let state = Arc::new(StdMutex::new(ConnectionState::Disconnected));
        transition(&state, ConnectionState::Connecting);

        let client = redis::Client::open(url)?;
        let conn = match client.get_multiplexed_tokio_connection().await {
            Ok(conn) => conn,
            Err(err) => {
                transition(&state, ConnectionState::Disconnected);
                return Err(err.into());
            }
        };
        transition(&state, ConnectionState::Connected);

        Ok(Self { conn, state })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn observe<T>(&self, result: Result<T, redis::RedisError>) -> anyhow::Result<T> {
        match result {
            Ok(value) => {
                transition(&self.state, ConnectionState::Connected);
                Ok(value)
            }
            Err(err) => {
                if err.is_connection_dropped() || err.is_io_error() {
                    transition(&self.state, ConnectionState::Disconnected);
                }
                Err(err.into())
            }
        }
    }
}

fn transition(state: &Arc<StdMutex<ConnectionState>>, next: ConnectionState) {
    let mut current = state.lock().unwrap_or_else(|e| e.into_inner());
    if *current != next {
        if next == ConnectionState::Disconnected {
            warn!(from = %current, to = %next, "Backing store connection state changed");
        } else {
            info!(from = %current, to = %next, "Backing store connection state changed");
        }
        *current = next;
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        // SETEX rejects a zero expiry.
        let secs = ttl.as_secs().max(1);
        self.observe(conn.set_ex::<_, _, ()>(key, value, secs).await)
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut conn = self.conn.clone();
        self.observe(conn.get::<_, Option<String>>(key).await)
    }

    async fn del(&self, key: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        self.observe(conn.del::<_, ()>(key).await)
    }
}

/// In-process [`KvStore`] with real expiry. Used when no Redis URL is
/// configured (correlation state then dies with the process) and by
/// tests.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                // Lazy expiry.
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn del(&self, key: &str) -> anyhow::Result<()> {
        let mut entries = self.entries.lock().await;
        entries.remove(key);
        Ok(())
    }
}
