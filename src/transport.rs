//! Message delivery to recipients via the Telegram Bot API.
//!
//! All API calls retry transient failures with exponential backoff and
//! jitter. Delivery is per-call fire-and-fail: a send either lands or
//! returns an error for the dispatcher to count.

use crate::config::{
    TELEGRAM_API_INITIAL_BACKOFF_MS, TELEGRAM_API_MAX_BACKOFF_MS, TELEGRAM_API_MAX_RETRIES,
};
use crate::job::InlineButton;
use crate::report::{ChatReportSink, ReportError};
use async_trait::async_trait;
use std::time::Duration;
use teloxide::prelude::*;
use teloxide::types::{
    ChatId, InlineKeyboardButton, InlineKeyboardMarkup, InputFile, MessageId, ParseMode,
};
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::debug;

/// A single recipient send failed. Counted by the dispatcher, never fatal.
#[derive(Error, Debug)]
pub enum SendError {
    /// Telegram rejected the call (after retries for transient errors)
    #[error("telegram api error: {0}")]
    Api(String),
    /// The dispatcher's per-send deadline expired
    #[error("send timed out after {0:?}")]
    Timeout(Duration),
    /// A button or image URL failed to parse
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

/// Per-recipient delivery options shared across a run
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Inline buttons rendered as one keyboard row
    pub buttons: Vec<InlineButton>,
}

/// Delivers one message to one recipient
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a text message
    async fn send_text(&self, chat_id: i64, text: &str, opts: &SendOptions)
        -> Result<(), SendError>;
    /// Send an image with a caption
    async fn send_photo(
        &self,
        chat_id: i64,
        image_url: &str,
        caption: &str,
        opts: &SendOptions,
    ) -> Result<(), SendError>;
}

/// Telegram Bot API transport
pub struct TelegramTransport {
    bot: Bot,
}

impl TelegramTransport {
    /// Wrap a teloxide bot handle
    #[must_use]
    pub const fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

/// Retry a Telegram API operation with exponential backoff and jitter
async fn retry_api<F, Fut, T>(operation: F) -> Result<T, SendError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, SendError>>,
{
    let strategy = ExponentialBackoff::from_millis(TELEGRAM_API_INITIAL_BACKOFF_MS)
        .max_delay(Duration::from_millis(TELEGRAM_API_MAX_BACKOFF_MS))
        .map(jitter)
        .take(TELEGRAM_API_MAX_RETRIES);

    Retry::spawn(strategy, operation).await
}

/// Render the job's buttons as a one-row inline keyboard
fn keyboard(buttons: &[InlineButton]) -> Result<Option<InlineKeyboardMarkup>, SendError> {
    if buttons.is_empty() {
        return Ok(None);
    }
    let row = buttons
        .iter()
        .map(|b| {
            let url = reqwest::Url::parse(&b.url)
                .map_err(|e| SendError::InvalidUrl(format!("{}: {e}", b.url)))?;
            Ok(InlineKeyboardButton::url(b.text.clone(), url))
        })
        .collect::<Result<Vec<_>, SendError>>()?;
    Ok(Some(InlineKeyboardMarkup::new([row])))
}

#[async_trait]
impl Transport for TelegramTransport {
    async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        opts: &SendOptions,
    ) -> Result<(), SendError> {
        let markup = keyboard(&opts.buttons)?;
        retry_api(|| async {
            let mut req = self
                .bot
                .send_message(ChatId(chat_id), text)
                .parse_mode(ParseMode::Markdown);
            if let Some(kb) = markup.clone() {
                req = req.reply_markup(kb);
            }
            req.await
                .map(drop)
                .map_err(|e| SendError::Api(e.to_string()))
        })
        .await
    }

    async fn send_photo(
        &self,
        chat_id: i64,
        image_url: &str,
        caption: &str,
        opts: &SendOptions,
    ) -> Result<(), SendError> {
        let markup = keyboard(&opts.buttons)?;
        let photo_url = reqwest::Url::parse(image_url)
            .map_err(|e| SendError::InvalidUrl(format!("{image_url}: {e}")))?;
        retry_api(|| async {
            let mut req = self
                .bot
                .send_photo(ChatId(chat_id), InputFile::url(photo_url.clone()))
                .caption(caption)
                .parse_mode(ParseMode::Markdown);
            if let Some(kb) = markup.clone() {
                req = req.reply_markup(kb);
            }
            req.await
                .map(drop)
                .map_err(|e| SendError::Api(e.to_string()))
        })
        .await
    }
}

#[async_trait]
impl ChatReportSink for TelegramTransport {
    async fn send_report(&self, chat_id: i64, text: &str) -> Result<i32, ReportError> {
        let message = retry_api(|| async {
            self.bot
                .send_message(ChatId(chat_id), text)
                .await
                .map_err(|e| SendError::Api(e.to_string()))
        })
        .await
        .map_err(|e| ReportError::Chat(e.to_string()))?;
        Ok(message.id.0)
    }

    async fn edit_report(
        &self,
        chat_id: i64,
        message_id: i32,
        text: &str,
    ) -> Result<(), ReportError> {
        const ERROR_NOT_MODIFIED: &str = "message is not modified";

        let result = retry_api(|| async {
            self.bot
                .edit_message_text(ChatId(chat_id), MessageId(message_id), text)
                .await
                .map(drop)
                .map_err(|e| SendError::Api(e.to_string()))
        })
        .await;

        match result {
            Ok(()) => Ok(()),
            // counters unchanged between ticks; nothing to update
            Err(e) if e.to_string().contains(ERROR_NOT_MODIFIED) => {
                debug!("report edit skipped: {e}");
                Ok(())
            }
            Err(e) => Err(ReportError::Chat(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyboard_renders_single_row() -> Result<(), SendError> {
        let buttons = vec![
            InlineButton {
                text: "Open".to_string(),
                url: "https://example.com".to_string(),
            },
            InlineButton {
                text: "Docs".to_string(),
                url: "https://example.com/docs".to_string(),
            },
        ];
        let markup = keyboard(&buttons)?.expect("markup for non-empty buttons");
        assert_eq!(markup.inline_keyboard.len(), 1);
        assert_eq!(markup.inline_keyboard[0].len(), 2);
        Ok(())
    }

    #[test]
    fn keyboard_absent_without_buttons() -> Result<(), SendError> {
        assert!(keyboard(&[])?.is_none());
        Ok(())
    }

    #[test]
    fn keyboard_rejects_bad_url() {
        let buttons = vec![InlineButton {
            text: "Open".to_string(),
            url: "definitely not a url".to_string(),
        }];
        assert!(matches!(keyboard(&buttons), Err(SendError::InvalidUrl(_))));
    }
}
