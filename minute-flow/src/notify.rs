use crate::error::NotifyError;
use async_trait::async_trait;
use serde::Serialize;
use smol_str::SmolStr;
use std::time::Duration;
use tracing::{info, warn};

/// Default Telegram Bot API base url.
pub const TELEGRAM_API_URL: &str = "https://api.telegram.org";

/// Operator notification channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, text: &str) -> Result<(), NotifyError>;
}

/// Send a notification, logging and swallowing any delivery failure.
pub async fn notify_best_effort(notifier: &dyn Notifier, text: &str) {
    if let Err(error) = notifier.send(text).await {
        warn!(%error, text, "operator notification not delivered");
    }
}

/// [`Notifier`] that only writes to the log. Used when no chat channel is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        info!(text, "operator notification");
        Ok(())
    }
}

/// [`Notifier`] posting to a chat via the Telegram Bot API `sendMessage` method.
#[derive(Debug, Clone)]
pub struct TelegramNotifier {
    client: reqwest::Client,
    endpoint: String,
    chat_id: SmolStr,
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
}

impl TelegramNotifier {
    pub fn new(bot_token: &str, chat_id: impl Into<SmolStr>) -> Self {
        Self::with_base_url(TELEGRAM_API_URL, bot_token, chat_id)
    }

    pub fn with_base_url(base_url: &str, bot_token: &str, chat_id: impl Into<SmolStr>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: format!(
                "{}/bot{bot_token}/sendMessage",
                base_url.trim_end_matches('/')
            ),
            chat_id: chat_id.into(),
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.endpoint)
            .timeout(Duration::from_secs(10))
            .json(&SendMessage {
                chat_id: &self.chat_id,
                text,
            })
            .send()
            .await
            .map_err(|error| NotifyError(format!("HTTP request failed: {error}")))?;

        if !response.status().is_success() {
            return Err(NotifyError(format!("HTTP error: {}", response.status())));
        }

        Ok(())
    }
}
