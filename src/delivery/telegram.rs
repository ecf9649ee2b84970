//! Teloxide-backed delivery adapter.
//!
//! Resolves a per-project `Bot` from the stored token, funnels every
//! transport call through the shared global rate limiter, and retries
//! transient errors with backoff before reporting failure upward.

use dashmap::DashMap;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::{
    FileId, InlineKeyboardButton, InlineKeyboardMarkup, InputFile, InputMedia, InputMediaPhoto,
    InputMediaVideo,
};
use teloxide::RequestError;

use crate::core::config;
use crate::core::errors::DeliveryError;
use crate::core::rate_limiter::GlobalRateLimiter;
use crate::core::retry::{retry, RetryConfig, Retryable};
use crate::delivery::{
    Button, ButtonAction, ContentType, DeliveryAck, DeliveryAdapter, MediaKind, OutboundMessage,
    Recipient,
};
use crate::storage::db::{self, DbPool};

impl Retryable for RequestError {
    fn is_retryable(&self) -> bool {
        match self {
            RequestError::Network(_) | RequestError::Io(_) => true,
            RequestError::RetryAfter(_) => true,
            RequestError::Api(api_error) => {
                // Server-side errors (5xx equivalents) are worth another try
                let error_str = format!("{api_error:?}");
                error_str.contains("Bad Gateway")
                    || error_str.contains("Service Unavailable")
                    || error_str.contains("Gateway Timeout")
            }
            _ => false,
        }
    }

    fn retry_after(&self) -> Option<std::time::Duration> {
        if let RequestError::RetryAfter(seconds) = self {
            Some(seconds.duration())
        } else {
            None
        }
    }
}

/// Anything the transport rejected about the recipient or message is
/// final; everything else may clear up on a later attempt.
fn classify(err: &RequestError) -> DeliveryError {
    match err {
        RequestError::Api(api) => DeliveryError::Permanent(api.to_string()),
        RequestError::MigrateToChatId(_) => DeliveryError::Permanent(err.to_string()),
        _ => DeliveryError::Transient(err.to_string()),
    }
}

pub struct TelegramDelivery {
    db_pool: Arc<DbPool>,
    bots: DashMap<i64, Bot>,
    limiter: GlobalRateLimiter,
    retry_config: RetryConfig,
}

impl TelegramDelivery {
    pub fn new(db_pool: Arc<DbPool>, limiter: GlobalRateLimiter) -> Self {
        Self {
            db_pool,
            bots: DashMap::new(),
            limiter,
            retry_config: RetryConfig::default()
                .max_attempts(config::delivery::MAX_ATTEMPTS)
                .initial_delay(config::delivery::initial_backoff()),
        }
    }

    fn bot_for(&self, project_id: i64) -> Result<Bot, DeliveryError> {
        if let Some(bot) = self.bots.get(&project_id) {
            return Ok(bot.clone());
        }

        let conn = db::get_connection(&self.db_pool)
            .map_err(|e| DeliveryError::Transient(format!("db pool: {e}")))?;
        let project = db::get_project(&conn, project_id)
            .map_err(|e| DeliveryError::Transient(format!("db: {e}")))?
            .ok_or_else(|| DeliveryError::Permanent(format!("unknown project {project_id}")))?;

        let bot = Bot::new(project.bot_token);
        self.bots.insert(project_id, bot.clone());
        Ok(bot)
    }

    async fn send_once(
        &self,
        bot: &Bot,
        chat: ChatId,
        message: &OutboundMessage,
    ) -> Result<DeliveryAck, RequestError> {
        let keyboard = build_keyboard(&message.buttons);
        let caption = message.text.clone();

        match message.content_type {
            ContentType::Text => {
                let mut req = bot.send_message(chat, caption.unwrap_or_default());
                if let Some(kb) = keyboard {
                    req = req.reply_markup(kb);
                }
                let msg = req.await?;
                Ok(DeliveryAck {
                    message_id: Some(msg.id.0),
                })
            }
            ContentType::Photo => {
                let file = input_file(&message.media[0].file_ref);
                let mut req = bot.send_photo(chat, file);
                if let Some(text) = caption {
                    req = req.caption(text);
                }
                if let Some(kb) = keyboard {
                    req = req.reply_markup(kb);
                }
                let msg = req.await?;
                Ok(DeliveryAck {
                    message_id: Some(msg.id.0),
                })
            }
            ContentType::Video => {
                let file = input_file(&message.media[0].file_ref);
                let mut req = bot.send_video(chat, file);
                if let Some(text) = caption {
                    req = req.caption(text);
                }
                if let Some(kb) = keyboard {
                    req = req.reply_markup(kb);
                }
                let msg = req.await?;
                Ok(DeliveryAck {
                    message_id: Some(msg.id.0),
                })
            }
            ContentType::Album => {
                let group: Vec<InputMedia> = message
                    .media
                    .iter()
                    .enumerate()
                    .map(|(i, media)| {
                        let file = input_file(&media.file_ref);
                        // Caption only on the first item, Telegram shows it
                        // under the whole album.
                        let text = if i == 0 { caption.clone() } else { None };
                        match media.kind {
                            MediaKind::Photo => {
                                let mut item = InputMediaPhoto::new(file);
                                item.caption = text;
                                InputMedia::Photo(item)
                            }
                            MediaKind::Video => {
                                let mut item = InputMediaVideo::new(file);
                                item.caption = text;
                                InputMedia::Video(item)
                            }
                        }
                    })
                    .collect();

                let messages = bot.send_media_group(chat, group).await?;

                // Albums cannot carry an inline keyboard, send it as a
                // small follow-up message instead.
                if let Some(kb) = keyboard {
                    self.limiter.acquire().await;
                    bot.send_message(chat, "⬇️ Выберите действие:")
                        .reply_markup(kb)
                        .await?;
                }

                Ok(DeliveryAck {
                    message_id: messages.first().map(|m| m.id.0),
                })
            }
        }
    }
}

#[async_trait::async_trait]
impl DeliveryAdapter for TelegramDelivery {
    async fn send(
        &self,
        to: &Recipient,
        message: &OutboundMessage,
    ) -> Result<DeliveryAck, DeliveryError> {
        let bot = self.bot_for(to.project_id)?;
        let chat = ChatId(to.chat_id);

        let outcome = retry(&self.retry_config, || {
            let bot = bot.clone();
            async move {
                // Every attempt pays a fresh token from the shared budget.
                self.limiter.acquire().await;
                self.send_once(&bot, chat, message).await
            }
        })
        .await;

        match outcome.result {
            Ok(ack) => {
                if outcome.attempts > 1 {
                    log::info!(
                        "Delivery to chat {} succeeded after {} attempts",
                        to.chat_id,
                        outcome.attempts
                    );
                }
                Ok(ack)
            }
            Err(err) => {
                log::warn!(
                    "Delivery to chat {} failed after {} attempt(s): {}",
                    to.chat_id,
                    outcome.attempts,
                    err
                );
                Err(classify(&err))
            }
        }
    }
}

fn input_file(file_ref: &str) -> InputFile {
    InputFile::file_id(FileId(file_ref.to_string()))
}

fn build_keyboard(buttons: &[Button]) -> Option<InlineKeyboardMarkup> {
    if buttons.is_empty() {
        return None;
    }
    let rows: Vec<Vec<InlineKeyboardButton>> = buttons
        .iter()
        .filter_map(|button| match &button.action {
            ButtonAction::OpenLink(link) => url::Url::parse(link)
                .ok()
                .map(|parsed| InlineKeyboardButton::url(button.label.clone(), parsed)),
            ButtonAction::SendReply(reply) => Some(InlineKeyboardButton::callback(
                button.label.clone(),
                reply.clone(),
            )),
        })
        .map(|button| vec![button])
        .collect();
    Some(InlineKeyboardMarkup::new(rows))
}
