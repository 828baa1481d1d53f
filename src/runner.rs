use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::correlation::{CorrelationStore, PendingRequest};
use crate::deadline::with_deadline;
use crate::limiter::{run_limited_default, AggregateTaskError};
use crate::retry::{with_retry, RetryPolicy};

/// What the external runner needs: the command, the correlation ID it
/// must echo back, and where to post the callback.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchRequest {
    pub command: String,
    pub correlation_id: String,
    pub callback_url: String,
}

/// The external long-running command runner. `dispatch` only enqueues;
/// the result arrives later, out of band, on the callback endpoint.
#[async_trait]
pub trait RunnerClient: Send + Sync {
    async fn dispatch(&self, request: &DispatchRequest) -> anyhow::Result<()>;
}

pub struct HttpRunner {
    client: reqwest::Client,
    endpoint: String,
    auth_token: Option<String>,
}

impl HttpRunner {
    pub fn new(endpoint: String, auth_token: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            endpoint,
            auth_token,
        })
    }
}

#[async_trait]
impl RunnerClient for HttpRunner {
    async fn dispatch(&self, request: &DispatchRequest) -> anyhow::Result<()> {
        let mut http = self.client.post(&self.endpoint).json(request);
        if let Some(token) = &self.auth_token {
            http = http.bearer_auth(token);
        }
        http.send().await?.error_for_status()?;
        Ok(())
    }
}

/// Outbound half of the correlation lifecycle: store a pending record,
/// then hand the command to the runner.
pub struct Dispatcher {
    store: CorrelationStore,
    runner: Arc<dyn RunnerClient>,
    callback_url: String,
    retry_policy: RetryPolicy,
    call_timeout: Duration,
    ttl: Duration,
}

impl Dispatcher {
    pub fn new(
        store: CorrelationStore,
        runner: Arc<dyn RunnerClient>,
        callback_url: String,
        retry_policy: RetryPolicy,
        call_timeout: Duration,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            runner,
            callback_url,
            retry_policy,
            call_timeout,
            ttl,
        }
    }

    /// Dispatch `command` to the runner on behalf of a chat message.
    /// The pending record is stored before the dispatch call; if the
    /// dispatch ultimately fails the record is rolled back so no
    /// orphan waits out its TTL.
    pub async fn dispatch_command(
        &self,
        chat_id: i64,
        message_id: Option<i32>,
        command: &str,
    ) -> anyhow::Result<String> {
        let correlation_id = Uuid::new_v4().to_string();
        let pending = PendingRequest::new(
            correlation_id.clone(),
            chat_id,
            message_id,
            self.ttl,
            json!({ "command": command }),
        );
        self.store.store(&pending).await?;

        let request = DispatchRequest {
            command: command.to_string(),
            correlation_id: correlation_id.clone(),
            callback_url: self.callback_url.clone(),
        };
        let dispatched = with_retry(&self.retry_policy, || async {
            with_deadline(self.call_timeout, self.runner.dispatch(&request))
                .await
                .map_err(anyhow::Error::new)
        })
        .await;

        if let Err(err) = dispatched {
            if let Err(remove_err) = self.store.remove(&correlation_id).await {
                warn!(
                    correlation_id = %correlation_id,
                    error = %remove_err,
                    "Failed to roll back pending record after dispatch failure"
                );
            }
            return Err(err.into());
        }

        info!(
            correlation_id = %correlation_id,
            chat_id,
            "Command dispatched to runner"
        );
        Ok(correlation_id)
    }

    /// Dispatch several commands for one chat with bounded concurrency.
    /// One command failing to dispatch does not block the others; the
    /// correlation IDs come back in input order.
    pub async fn dispatch_batch(
        &self,
        chat_id: i64,
        message_id: Option<i32>,
        commands: &[String],
    ) -> Result<Vec<String>, AggregateTaskError> {
        let tasks: Vec<_> = commands
            .iter()
            .map(|command| {
                let command = command.clone();
                move || async move { self.dispatch_command(chat_id, message_id, &command).await }
            })
            .collect();
        run_limited_default(tasks).await
    }
}
