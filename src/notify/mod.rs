//! Notification channels
//!
//! Every channel implements the single-method [`Notify`] capability. The set
//! of channels is closed: [`ChannelConfig`] is a serde-tagged enum stored as
//! JSON with the output channel, and new transports extend the enum.

pub mod discord;
pub mod matrix;
pub mod telegram;
pub mod template;
pub mod webhook;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

pub use template::{NotificationContext, TemplateRenderer};

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("template rendering failed: {0}")]
    Template(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Push rendered text to a destination
#[async_trait]
pub trait Notify: Send + Sync {
    async fn notify(&self, text: &str) -> Result<(), NotifyError>;

    fn channel_name(&self) -> &'static str;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelConfig {
    Webhook(webhook::WebhookConfig),
    Matrix(matrix::MatrixConfig),
    Telegram(telegram::TelegramConfig),
    Discord(discord::DiscordConfig),
}

impl ChannelConfig {
    pub fn name(&self) -> &'static str {
        match self {
            ChannelConfig::Webhook(_) => "webhook",
            ChannelConfig::Matrix(_) => "matrix",
            ChannelConfig::Telegram(_) => "telegram",
            ChannelConfig::Discord(_) => "discord",
        }
    }

    /// Reject configurations that can never deliver
    pub fn validate(&self) -> Result<(), NotifyError> {
        let required = match self {
            ChannelConfig::Webhook(config) => vec![("url", &config.url)],
            ChannelConfig::Matrix(config) => vec![
                ("host", &config.host),
                ("room_id", &config.room_id),
                ("token", &config.token),
            ],
            ChannelConfig::Telegram(config) => {
                vec![("bot_key", &config.bot_key), ("chat_id", &config.chat_id)]
            }
            ChannelConfig::Discord(config) => vec![("url", &config.url)],
        };

        match required.iter().find(|(_, value)| value.trim().is_empty()) {
            Some((field, _)) => Err(NotifyError::Config(format!(
                "{} channel requires '{field}'",
                self.name()
            ))),
            None => Ok(()),
        }
    }
}

/// A channel bound to an HTTP client
#[derive(Debug, Clone)]
pub struct Notifier {
    client: Client,
    config: ChannelConfig,
}

impl Notifier {
    pub fn new(client: Client, config: ChannelConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl Notify for Notifier {
    #[instrument(skip(self, text), fields(channel = self.config.name()))]
    async fn notify(&self, text: &str) -> Result<(), NotifyError> {
        self.config.validate()?;
        debug!("pushing {} bytes", text.len());

        match &self.config {
            ChannelConfig::Webhook(config) => config.send(&self.client, text).await,
            ChannelConfig::Matrix(config) => config.send(&self.client, text).await,
            ChannelConfig::Telegram(config) => config.send(&self.client, text).await,
            ChannelConfig::Discord(config) => config.send(&self.client, text).await,
        }
    }

    fn channel_name(&self) -> &'static str {
        self.config.name()
    }
}

/// Turn a non-success response into [`NotifyError::Status`]
pub(crate) async fn check_status(
    response: reqwest::Response,
    expected: Option<u16>,
) -> Result<(), NotifyError> {
    let status = response.status();
    let accepted = match expected {
        Some(code) => status.as_u16() == code,
        None => status.is_success(),
    };
    if accepted {
        return Ok(());
    }

    let body = response.text().await.unwrap_or_default();
    Err(NotifyError::Status {
        status: status.as_u16(),
        body,
    })
}
