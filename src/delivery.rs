use std::path::Path;

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{InputFile, MessageId, ReplyParameters};

/// Telegram's hard cap on message text length.
pub const TELEGRAM_MAX_LEN: usize = 4096;

/// Outbound side of the chat platform: text and audio replies addressed
/// by chat ID with an optional reply-to message. Both calls hit the
/// network and may fail or stall; callers wrap them in retry + deadline.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn send_text(&self, chat_id: i64, reply_to: Option<i32>, text: &str)
        -> anyhow::Result<()>;

    async fn send_audio(&self, chat_id: i64, reply_to: Option<i32>, audio: &Path)
        -> anyhow::Result<()>;
}

pub struct TelegramDelivery {
    bot: Bot,
}

impl TelegramDelivery {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl DeliveryChannel for TelegramDelivery {
    async fn send_text(
        &self,
        chat_id: i64,
        reply_to: Option<i32>,
        text: &str,
    ) -> anyhow::Result<()> {
        for chunk in split_message(text, TELEGRAM_MAX_LEN) {
            let mut request = self.bot.send_message(ChatId(chat_id), chunk);
            if let Some(message_id) = reply_to {
                request = request.reply_parameters(ReplyParameters::new(MessageId(message_id)));
            }
            request.await?;
        }
        Ok(())
    }

    async fn send_audio(
        &self,
        chat_id: i64,
        reply_to: Option<i32>,
        audio: &Path,
    ) -> anyhow::Result<()> {
        let voice = InputFile::file(audio.to_path_buf());
        let mut request = self.bot.send_voice(ChatId(chat_id), voice);
        if let Some(message_id) = reply_to {
            request = request.reply_parameters(ReplyParameters::new(MessageId(message_id)));
        }
        request.await?;
        Ok(())
    }
}

/// Split `text` into chunks of at most `max_len` bytes, preferring
/// paragraph and line boundaries and never slicing inside a multi-byte
/// character.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        // Largest char boundary at or before max_len.
        let mut boundary = max_len;
        while boundary > 0 && !remaining.is_char_boundary(boundary) {
            boundary -= 1;
        }

        let search_region = &remaining[..boundary];
        let split_at = search_region
            .rfind("\n\n")
            .map(|p| p + 1)
            .or_else(|| search_region.rfind('\n'))
            .unwrap_or(boundary);

        // Force progress when no boundary was usable (e.g. max_len
        // smaller than the first character).
        let split_at = if split_at == 0 {
            remaining
                .char_indices()
                .nth(1)
                .map(|(i, _)| i)
                .unwrap_or(remaining.len())
        } else {
            split_at
        };

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start_matches('\n');
    }

    chunks
}
