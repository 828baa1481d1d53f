use std::sync::Arc;
use std::time::Duration;

use teloxide::Bot;
use tracing::{info, warn};

use crate::bot::CommandBot;
use crate::callback::CallbackCoordinator;
use crate::config::AppConfig;
use crate::correlation::{CorrelationStore, KvStore};
use crate::delivery::TelegramDelivery;
use crate::kv::{MemoryKv, RedisKv};
use crate::retry::RetryPolicy;
use crate::runner::{Dispatcher, HttpRunner};
use crate::tts::{HttpTts, Synthesizer};
use crate::webhook::{self, WebhookState};

/// Wire everything together and run until the Telegram dispatcher
/// stops.
pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let kv: Arc<dyn KvStore> = match &config.store.redis_url {
        Some(url) => {
            let redis = RedisKv::connect(url).await?;
            info!(state = %redis.state(), "Correlation store backed by Redis");
            Arc::new(redis)
        }
        None => {
            warn!("No redis_url configured; pending requests will not survive a restart");
            Arc::new(MemoryKv::new())
        }
    };

    let ttl = Duration::from_secs(config.store.ttl_secs);
    let store = CorrelationStore::new(kv, ttl);

    let retry_policy = RetryPolicy::default().with_attempts(config.runner.retry_attempts);
    let call_timeout = Duration::from_secs(config.runner.timeout_secs);

    let bot = Bot::new(&config.telegram.bot_token);
    let delivery = Arc::new(TelegramDelivery::new(bot.clone()));

    let synthesizer: Option<Arc<dyn Synthesizer>> = match &config.tts {
        Some(tts_config) => Some(Arc::new(HttpTts::new(tts_config)?)),
        None => None,
    };

    let coordinator = Arc::new(CallbackCoordinator::new(
        store.clone(),
        delivery,
        synthesizer,
        retry_policy.clone(),
        call_timeout,
        config.debug,
    ));

    let runner = Arc::new(HttpRunner::new(
        config.runner.endpoint.clone(),
        config.runner.auth_token.clone(),
    )?);
    let dispatcher = Arc::new(Dispatcher::new(
        store,
        runner,
        config.runner.callback_url.clone(),
        retry_policy,
        call_timeout,
        ttl,
    ));

    let webhook_state = WebhookState {
        coordinator,
        shared_secret: config.webhook.shared_secret.clone(),
    };
    let webhook_port = config.webhook.port;
    let server = tokio::spawn(async move {
        if let Err(err) = webhook::serve(webhook_port, webhook_state).await {
            tracing::error!(error = %err, "Callback server exited");
        }
    });

    let listener = Arc::new(CommandBot::new(
        bot,
        dispatcher,
        config.telegram.allowed_user_ids.clone(),
    ));
    listener.start().await;

    server.abort();
    Ok(())
}
