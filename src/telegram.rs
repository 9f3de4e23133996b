use crate::rate_limiters::telegram::SharedTelegramRateLimiter;
use log::warn;
use serde::Serialize;
use std::time::Duration;
use teloxide::payloads::RestrictChatMemberSetters;
use teloxide::prelude::*;
use teloxide::requests::Requester;
use teloxide::types::{ChatId, ChatPermissions, InlineKeyboardMarkup, ParseMode, ReplyMarkup, UserId};
use thiserror::Error;
use tokio::time::{sleep, timeout};

#[derive(Debug, Error)]
pub enum TelegramApiError {
    #[error("telegram api call failed: {0}")]
    Request(String),
    #[error("telegram api call timed out")]
    Timeout,
}

const REQUEST_TIMEOUT_SECS: u64 = 10;
const WEBHOOK_RETRY_DELAYS_SECS: [u64; 3] = [2, 4, 8];
const WEBHOOK_ATTEMPT_TIMEOUTS_SECS: [u64; 3] = [30, 45, 60];

#[derive(Clone, Serialize)]
#[serde(untagged)]
pub enum Reply {
    Text(String),
    Structured {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        parse_mode: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reply_markup: Option<serde_json::Value>,
    },
}

impl Reply {
    pub fn text(&self) -> &str {
        match self {
            Reply::Text(t) => t,
            Reply::Structured { text, .. } => text,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text().trim().is_empty()
    }
}

/// Telegram API Client (C5): thin wrapper over the Bot API subset the
/// dispatcher and creation flow use, built on teloxide's `Bot` request
/// builders rather than a hand-rolled HTTP layer.
pub struct TelegramApiClient {
    rate_limiter: SharedTelegramRateLimiter,
}

impl TelegramApiClient {
    pub fn new(rate_limiter: SharedTelegramRateLimiter) -> Self {
        Self { rate_limiter }
    }

    fn bot(&self, token: &str) -> Bot {
        Bot::new(token)
    }

    pub async fn send_message(
        &self,
        token: &str,
        chat_id: i64,
        reply: &Reply,
    ) -> Result<(), TelegramApiError> {
        self.rate_limiter.wait_for_token(token).await;
        let bot = self.bot(token);
        let mut request = bot.send_message(ChatId(chat_id), reply.text());
        if let Reply::Structured { parse_mode, reply_markup, .. } = reply {
            if let Some(pm) = parse_mode {
                request.parse_mode = parse_mode_from_str(pm);
            }
            if let Some(markup) = reply_markup {
                match serde_json::from_value::<InlineKeyboardMarkup>(markup.clone()) {
                    Ok(keyboard) => request.reply_markup = Some(ReplyMarkup::InlineKeyboard(keyboard)),
                    Err(e) => warn!("dropping malformed reply_markup: {}", e),
                }
            }
        }
        self.with_timeout(REQUEST_TIMEOUT_SECS, request.send()).await?;
        Ok(())
    }

    pub async fn answer_callback(&self, token: &str, id: &str, text: Option<&str>) -> Result<(), TelegramApiError> {
        self.rate_limiter.wait_for_token(token).await;
        let bot = self.bot(token);
        let mut request = bot.answer_callback_query(id);
        request.text = text.map(|t| t.to_string());
        self.with_timeout(REQUEST_TIMEOUT_SECS, request.send()).await?;
        Ok(())
    }

    /// Retries up to 3 times with 2/4/8s backoff and 30/45/60s per-attempt
    /// timeouts (§4.5). Exhausted retries are a caller-visible condition
    /// (the creation flow maps it to `created_webhook_pending`, not `failed`).
    pub async fn set_webhook(&self, token: &str, url: &str) -> Result<(), TelegramApiError> {
        let bot = self.bot(token);
        let mut last_err = TelegramApiError::Timeout;
        for attempt in 0..3 {
            let request_timeout = Duration::from_secs(WEBHOOK_ATTEMPT_TIMEOUTS_SECS[attempt]);
            match timeout(request_timeout, bot.set_webhook(url.parse().unwrap()).send()).await {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(e)) => last_err = TelegramApiError::Request(e.to_string()),
                Err(_) => last_err = TelegramApiError::Timeout,
            }
            if attempt < 2 {
                warn!(
                    "set_webhook attempt {}/3 failed: {}. retrying in {}s",
                    attempt + 1,
                    last_err,
                    WEBHOOK_RETRY_DELAYS_SECS[attempt]
                );
                sleep(Duration::from_secs(WEBHOOK_RETRY_DELAYS_SECS[attempt])).await;
            }
        }
        Err(last_err)
    }

    pub async fn delete_message(&self, token: &str, chat_id: i64, message_id: i64) -> Result<(), TelegramApiError> {
        let bot = self.bot(token);
        self.with_timeout(
            REQUEST_TIMEOUT_SECS,
            bot.delete_message(ChatId(chat_id), teloxide::types::MessageId(message_id as i32))
                .send(),
        )
        .await?;
        Ok(())
    }

    pub async fn ban_user(&self, token: &str, chat_id: i64, user_id: i64) -> Result<(), TelegramApiError> {
        let bot = self.bot(token);
        self.with_timeout(REQUEST_TIMEOUT_SECS, bot.ban_chat_member(ChatId(chat_id), UserId(user_id as u64)).send())
            .await?;
        Ok(())
    }

    /// Ban then unban, per §4.5's `kick_user` = ban followed by unban. Telegram
    /// has no native "kick"; `unban_chat_member` after a ban removes the user
    /// from the chat while leaving them free to rejoin.
    pub async fn kick_user(&self, token: &str, chat_id: i64, user_id: i64) -> Result<(), TelegramApiError> {
        self.ban_user(token, chat_id, user_id).await?;
        self.unban_user(token, chat_id, user_id).await
    }

    pub async fn unban_user(&self, token: &str, chat_id: i64, user_id: i64) -> Result<(), TelegramApiError> {
        let bot = self.bot(token);
        self.with_timeout(
            REQUEST_TIMEOUT_SECS,
            bot.unban_chat_member(ChatId(chat_id), UserId(user_id as u64)).send(),
        )
        .await?;
        Ok(())
    }

    pub async fn mute_user(&self, token: &str, chat_id: i64, user_id: i64) -> Result<(), TelegramApiError> {
        let bot = self.bot(token);
        let perms = ChatPermissions::empty();
        self.with_timeout(
            REQUEST_TIMEOUT_SECS,
            bot.restrict_chat_member(ChatId(chat_id), UserId(user_id as u64))
                .permissions(perms)
                .send(),
        )
        .await?;
        Ok(())
    }

    pub async fn unmute_user(&self, token: &str, chat_id: i64, user_id: i64) -> Result<(), TelegramApiError> {
        let bot = self.bot(token);
        let perms = ChatPermissions::all();
        let restrict_result = self
            .with_timeout(
                REQUEST_TIMEOUT_SECS,
                bot.restrict_chat_member(ChatId(chat_id), UserId(user_id as u64))
                    .permissions(perms)
                    .send(),
            )
            .await;
        match restrict_result {
            Ok(_) => Ok(()),
            Err(e) => {
                // the user may have been banned rather than muted; unban_chat_member
                // is the correct call in that case.
                warn!("unmute via restrict failed ({}), falling back to unban", e);
                self.unban_user(token, chat_id, user_id).await
            }
        }
    }

    pub async fn is_admin(&self, token: &str, chat_id: i64, user_id: i64) -> Result<bool, TelegramApiError> {
        let bot = self.bot(token);
        let member = self
            .with_timeout(REQUEST_TIMEOUT_SECS, bot.get_chat_member(ChatId(chat_id), UserId(user_id as u64)).send())
            .await?;
        Ok(member.is_owner() || member.is_administrator())
    }

    async fn with_timeout<F, T, E>(&self, secs: u64, fut: F) -> Result<T, TelegramApiError>
    where
        F: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        match timeout(Duration::from_secs(secs), fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(TelegramApiError::Request(e.to_string())),
            Err(_) => Err(TelegramApiError::Timeout),
        }
    }
}

fn parse_mode_from_str(s: &str) -> Option<ParseMode> {
    match s.to_lowercase().as_str() {
        "html" => Some(ParseMode::Html),
        "markdown" => Some(ParseMode::Markdown),
        "markdownv2" => Some(ParseMode::MarkdownV2),
        _ => None,
    }
}
