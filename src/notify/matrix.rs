use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, instrument};
use uuid::Uuid;

use super::{NotifyError, check_status};

/// Matrix room, written to through the client-server API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatrixConfig {
    /// Homeserver base url, e.g. `https://matrix.org`
    pub host: String,
    pub room_id: String,
    pub token: String,
}

impl MatrixConfig {
    fn message_url(&self, txid: &str) -> String {
        format!(
            "{}/_matrix/client/r0/rooms/{}/send/m.room.message/{txid}",
            self.host.trim_end_matches('/'),
            self.room_id
        )
    }

    #[instrument(skip(self, client, text), fields(room = %self.room_id))]
    pub async fn send(&self, client: &Client, text: &str) -> Result<(), NotifyError> {
        let txid = Uuid::new_v4().simple().to_string();
        let body = json!({
            "msgtype": "m.text",
            "body": text,
        });

        let response = client
            .put(self.message_url(&txid))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .inspect_err(|e| error!("Failed to push matrix message: {}", e))?;

        check_status(response, None)
            .await
            .inspect(|_| info!("Successfully sent matrix message"))
            .inspect_err(|e| error!("Failed to push matrix message: {}", e))
    }
}
