//! Outbound message delivery.
use crate::error::{DispatchError, DispatchResult};
use crate::model::{Button, Recipient, RenderedContent};
use async_trait::async_trait;
use std::time::Duration;
use teloxide::payloads::{SendMessageSetters, SendPhotoSetters};
use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup, InputFile};
use teloxide::RequestError;
use tracing::debug;

/// What the channel reported for a successful send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub response_code: Option<i32>,
}

#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Fails with [`DispatchError::MissingCredentials`] when the channel is
    /// not configured. Checked before a campaign starts sending.
    fn ensure_configured(&self) -> DispatchResult<()> {
        Ok(())
    }

    /// Deliver one message. Failures are [`DispatchError::Transport`].
    async fn send(
        &self,
        recipient: &Recipient,
        content: &RenderedContent,
    ) -> DispatchResult<SendReceipt>;
}

#[derive(Clone)]
pub struct TelegramSender {
    bot: Option<Bot>,
    timeout: Duration,
}

impl std::fmt::Debug for TelegramSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramSender")
            .field("configured", &self.bot.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl TelegramSender {
    /// An empty or placeholder token leaves the sender unconfigured.
    pub fn new(token: &str, timeout: Duration) -> Self {
        let token = token.trim();
        let bot = if token.is_empty() || token.starts_with("YOUR_") {
            None
        } else {
            Some(Bot::new(token))
        };
        Self { bot, timeout }
    }

    async fn deliver(
        &self,
        bot: &Bot,
        chat: ChatId,
        content: &RenderedContent,
    ) -> Result<(), RequestError> {
        match content {
            RenderedContent::Text { text } => {
                bot.send_message(chat, text.clone()).await?;
            }
            RenderedContent::Image { image, caption } => {
                let file = match reqwest::Url::parse(image) {
                    Ok(url) if matches!(url.scheme(), "http" | "https") => InputFile::url(url),
                    _ => InputFile::file(image.clone()),
                };
                let mut req = bot.send_photo(chat, file);
                if let Some(caption) = caption {
                    req = req.caption(caption.clone());
                }
                req.await?;
            }
            RenderedContent::Buttons { text, buttons } => {
                bot.send_message(chat, text.clone())
                    .reply_markup(keyboard(buttons))
                    .await?;
            }
        }
        Ok(())
    }
}

/// One button per row, in the order given.
fn keyboard(buttons: &[Button]) -> InlineKeyboardMarkup {
    let rows = buttons.iter().map(|b| {
        let button = match b.url.as_deref().map(reqwest::Url::parse) {
            Some(Ok(url)) => InlineKeyboardButton::url(b.label.clone(), url),
            _ => InlineKeyboardButton::callback(
                b.label.clone(),
                b.callback.clone().unwrap_or_else(|| b.label.clone()),
            ),
        };
        vec![button]
    });
    InlineKeyboardMarkup::new(rows)
}

fn response_code(err: &RequestError) -> Option<i32> {
    match err {
        RequestError::Api(_) => Some(400),
        RequestError::RetryAfter(_) => Some(429),
        RequestError::MigrateToChatId(_) => Some(400),
        _ => None,
    }
}

#[async_trait]
impl MessageSender for TelegramSender {
    fn ensure_configured(&self) -> DispatchResult<()> {
        match self.bot {
            Some(_) => Ok(()),
            None => Err(DispatchError::MissingCredentials),
        }
    }

    async fn send(
        &self,
        recipient: &Recipient,
        content: &RenderedContent,
    ) -> DispatchResult<SendReceipt> {
        let bot = self.bot.as_ref().ok_or(DispatchError::MissingCredentials)?;
        let chat_id: i64 = recipient.number.trim().parse().map_err(|_| {
            DispatchError::transport(
                None,
                format!("'{}' is not a Telegram chat id", recipient.number),
            )
        })?;

        match tokio::time::timeout(self.timeout, self.deliver(bot, ChatId(chat_id), content)).await
        {
            Ok(Ok(())) => {
                debug!(chat_id, contact_id = %recipient.contact_id, "message delivered");
                Ok(SendReceipt {
                    response_code: Some(200),
                })
            }
            Ok(Err(err)) => Err(DispatchError::transport(response_code(&err), err.to_string())),
            Err(_) => Err(DispatchError::transport(
                None,
                format!("send timed out after {:?}", self.timeout),
            )),
        }
    }
}
