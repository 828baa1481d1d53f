use std::sync::Arc;

use teloxide::prelude::*;
use tracing::{info, warn};

use crate::runner::Dispatcher as CommandDispatcher;

const USAGE: &str = "Send /run <command> to execute it on the runner.\n\
    You'll get the result here once it finishes.";

/// Thin inbound boundary: listens for Telegram messages and forwards
/// `/run` commands to the dispatcher. All resilience and correlation
/// logic lives behind [`CommandDispatcher`].
pub struct CommandBot {
    bot: Bot,
    dispatcher: Arc<CommandDispatcher>,
    allowed_user_ids: Vec<u64>,
}

impl CommandBot {
    pub fn new(bot: Bot, dispatcher: Arc<CommandDispatcher>, allowed_user_ids: Vec<u64>) -> Self {
        Self {
            bot,
            dispatcher,
            allowed_user_ids,
        }
    }

    pub async fn start(self: Arc<Self>) {
        info!("Starting Telegram listener");

        let handler = dptree::entry().branch(Update::filter_message().endpoint({
            let listener = Arc::clone(&self);
            move |msg: Message, bot: Bot| {
                let listener = Arc::clone(&listener);
                async move {
                    listener.handle_message(msg, bot).await;
                    respond(())
                }
            }
        }));

        Dispatcher::builder(self.bot.clone(), handler)
            .enable_ctrlc_handler()
            .build()
            .dispatch()
            .await;
    }

    async fn handle_message(&self, msg: Message, bot: Bot) {
        let text = match msg.text() {
            Some(text) => text.trim(),
            None => return,
        };

        // Fail-closed: no allowlist means nobody may dispatch.
        let user_id = msg.from.as_ref().map(|u| u.id.0);
        let authorized = user_id
            .map(|id| self.allowed_user_ids.contains(&id))
            .unwrap_or(false);
        if !authorized {
            warn!(user_id, chat_id = msg.chat.id.0, "Ignoring message from unauthorized user");
            return;
        }

        if text == "/start" || text == "/help" {
            let _ = bot.send_message(msg.chat.id, USAGE).await;
            return;
        }

        // Only "/run" followed by whitespace counts; "/runx" is not ours.
        let rest = match text.strip_prefix("/run") {
            Some(rest) if rest.starts_with(char::is_whitespace) && !rest.trim().is_empty() => {
                rest.trim()
            }
            Some(rest) if rest.trim().is_empty() => {
                let _ = bot.send_message(msg.chat.id, "Usage: /run <command>").await;
                return;
            }
            _ => return,
        };

        // One command per line; multi-line messages become a bounded
        // concurrent batch.
        let commands: Vec<String> = rest
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();

        if commands.len() > 1 {
            match self
                .dispatcher
                .dispatch_batch(msg.chat.id.0, Some(msg.id.0), &commands)
                .await
            {
                Ok(ids) => {
                    let _ = bot
                        .send_message(
                            msg.chat.id,
                            format!("⏳ Running {} commands... I'll reply as they finish.", ids.len()),
                        )
                        .await;
                }
                Err(err) => {
                    warn!(chat_id = msg.chat.id.0, error = %err, "Batch dispatch partially failed");
                    let _ = bot
                        .send_message(msg.chat.id, format!("⚠️ {}. The rest were dispatched.", err))
                        .await;
                }
            }
            return;
        }

        match self
            .dispatcher
            .dispatch_command(msg.chat.id.0, Some(msg.id.0), &commands[0])
            .await
        {
            Ok(correlation_id) => {
                let _ = bot
                    .send_message(
                        msg.chat.id,
                        format!("⏳ Running... I'll reply when it finishes. ({})", correlation_id),
                    )
                    .await;
            }
            Err(err) => {
                warn!(chat_id = msg.chat.id.0, error = %err, "Dispatch failed");
                let _ = bot
                    .send_message(msg.chat.id, "❌ Could not reach the runner. Try again later.")
                    .await;
            }
        }
    }
}
