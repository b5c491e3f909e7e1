use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};

use super::{NotifyError, check_status};

const ALARM_COLOR: u32 = 15158332; // Red

/// Discord channel webhook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscordConfig {
    pub url: String,

    /// User mentioned in the message content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub embeds: Vec<Embed>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Embed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Default)]
pub struct MessageBuilder {
    content: Option<String>,
    embeds: Vec<Embed>,
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content(mut self, content: impl ToString) -> Self {
        self.content = Some(content.to_string());
        self
    }

    pub fn add_embed(mut self, embed: Embed) -> Self {
        self.embeds.push(embed);
        self
    }

    pub fn build(self) -> Message {
        Message {
            content: self.content,
            embeds: self.embeds,
        }
    }
}

impl DiscordConfig {
    pub fn message(&self, text: &str) -> Message {
        let embed = Embed {
            title: Some("🔔 Alarm".to_string()),
            description: Some(text.to_string()),
            color: Some(ALARM_COLOR),
            timestamp: Some(Utc::now().to_rfc3339()),
        };

        let mut builder = MessageBuilder::new().add_embed(embed);
        if let Some(user_id) = &self.user_id {
            builder = builder.content(format!("<@{user_id}>"));
        }
        builder.build()
    }

    #[instrument(skip(self, client, text))]
    pub async fn send(&self, client: &Client, text: &str) -> Result<(), NotifyError> {
        let response = client
            .post(&self.url)
            .json(&self.message(text))
            .send()
            .await
            .inspect_err(|e| error!("Failed to send Discord message: {}", e))?;

        check_status(response, None)
            .await
            .inspect(|_| info!("Successfully sent Discord message"))
            .inspect_err(|e| error!("Discord API error response: {}", e))
    }
}
