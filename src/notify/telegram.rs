use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, instrument};

use super::{NotifyError, check_status};

const TELEGRAM_API: &str = "https://api.telegram.org";

/// Telegram chat reached through a bot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub bot_key: String,
    pub chat_id: String,

    /// Bot API base url, overridable for self-hosted API servers
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

fn default_api_url() -> String {
    TELEGRAM_API.to_string()
}

impl TelegramConfig {
    pub fn new(bot_key: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            bot_key: bot_key.into(),
            chat_id: chat_id.into(),
            api_url: default_api_url(),
        }
    }

    #[instrument(skip(self, client, text), fields(chat_id = %self.chat_id))]
    pub async fn send(&self, client: &Client, text: &str) -> Result<(), NotifyError> {
        let url = format!(
            "{}/bot{}/sendMessage",
            self.api_url.trim_end_matches('/'),
            self.bot_key
        );
        let body = json!({
            "chat_id": self.chat_id,
            "text": text,
        });

        let response = client
            .post(url)
            .json(&body)
            .send()
            .await
            .inspect_err(|e| error!("Failed to push telegram message: {}", e))?;

        check_status(response, Some(200))
            .await
            .inspect(|_| info!("Successfully sent telegram message"))
            .inspect_err(|e| error!("Failed to push telegram message: {}", e))
    }
}
