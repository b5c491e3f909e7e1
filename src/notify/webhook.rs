use std::collections::BTreeMap;

use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};

use super::{NotifyError, check_status};

/// Plain HTTP endpoint receiving the rendered text as request body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,

    #[serde(default = "default_method")]
    pub method: String,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Exact status the endpoint must answer with; any 2xx if unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect_status_code: Option<u16>,
}

fn default_method() -> String {
    "POST".to_string()
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: default_method(),
            headers: BTreeMap::new(),
            expect_status_code: None,
        }
    }

    #[instrument(skip(self, client, text), fields(url = %self.url))]
    pub async fn send(&self, client: &Client, text: &str) -> Result<(), NotifyError> {
        let method = Method::from_bytes(self.method.to_uppercase().as_bytes())
            .map_err(|_| NotifyError::Config(format!("invalid method '{}'", self.method)))?;

        let mut request = client.request(method, &self.url).body(text.to_string());
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }

        let response = request.send().await.inspect_err(|e| {
            error!("Failed to send webhook: {}", e);
        })?;

        check_status(response, self.expect_status_code)
            .await
            .inspect(|_| info!("Successfully sent webhook"))
            .inspect_err(|e| error!("Webhook failed: {}", e))
    }
}
