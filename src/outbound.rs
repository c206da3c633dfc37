use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::SendError;
use crate::types::{Platform, PlatformConnection};

pub const DEFAULT_GRAPH_BASE_URL: &str = "https://graph.facebook.com/v18.0";

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound side of a platform integration: deliver one text message to one
/// recipient and report the platform-assigned message id.
#[async_trait]
pub trait PlatformSender: Send + Sync {
    async fn send_text(
        &self,
        connection: &PlatformConnection,
        recipient_id: &str,
        text: &str,
    ) -> Result<String, SendError>;
}

/// Meta Graph API client covering WhatsApp Cloud, Instagram Messaging and
/// Facebook Messenger sends.
pub struct GraphClient {
    base_url: String,
    client: reqwest::Client,
}

impl GraphClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(SEND_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn messages_url(&self, account_id: &str) -> String {
        format!("{}/{}/messages", self.base_url, account_id)
    }
}

fn config_field<'a>(config: &'a Value, key: &str) -> &'a str {
    config
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("")
}

pub fn send_payload(platform: Platform, recipient_id: &str, text: &str) -> Value {
    match platform {
        Platform::Whatsapp => json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": recipient_id,
            "type": "text",
            "text": { "preview_url": false, "body": text }
        }),
        _ => json!({
            "recipient": { "id": recipient_id },
            "messaging_type": "RESPONSE",
            "message": { "text": text }
        }),
    }
}

pub fn extract_message_id(platform: Platform, body: &Value) -> String {
    let id = match platform {
        Platform::Whatsapp => body
            .get("messages")
            .and_then(Value::as_array)
            .and_then(|list| list.first())
            .and_then(|m| m.get("id"))
            .and_then(Value::as_str),
        _ => body.get("message_id").and_then(Value::as_str),
    };
    id.unwrap_or("unknown").to_string()
}

fn is_transient(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

#[async_trait]
impl PlatformSender for GraphClient {
    async fn send_text(
        &self,
        connection: &PlatformConnection,
        recipient_id: &str,
        text: &str,
    ) -> Result<String, SendError> {
        let access_token = config_field(&connection.config, "accessToken");
        if access_token.is_empty() {
            return Err(SendError::Config("accessToken"));
        }
        let account_id = config_field(&connection.config, "accountId");
        if account_id.is_empty() {
            return Err(SendError::Config("accountId"));
        }

        let url = self.messages_url(account_id);
        let payload = send_payload(connection.platform, recipient_id, text);

        let mut retried = false;
        let response = loop {
            match self
                .client
                .post(&url)
                .bearer_auth(access_token)
                .json(&payload)
                .send()
                .await
            {
                Ok(response) => break response,
                Err(err) if !retried && is_transient(&err) => {
                    tracing::warn!(
                        platform = %connection.platform,
                        error = %err,
                        "outbound send failed, retrying once"
                    );
                    retried = true;
                }
                Err(err) => return Err(err.into()),
            }
        };

        let status = response.status();
        let raw_body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(SendError::Api {
                status: status.as_u16(),
                body: raw_body,
            });
        }

        let body = serde_json::from_str::<Value>(&raw_body).unwrap_or(Value::Null);
        Ok(extract_message_id(connection.platform, &body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn connection(platform: Platform, config: Value) -> PlatformConnection {
        PlatformConnection {
            id: "conn-1".to_string(),
            tenant_id: "tenant-1".to_string(),
            platform,
            name: "test connection".to_string(),
            config,
            enabled: true,
            created_at: "2026-01-01T00:00:00+00:00".to_string(),
            updated_at: "2026-01-01T00:00:00+00:00".to_string(),
        }
    }

    #[test]
    fn base_url_strips_trailing_slash() {
        let client = GraphClient::new("https://graph.test/");
        assert_eq!(client.base_url(), "https://graph.test");
        assert_eq!(
            client.messages_url("12345"),
            "https://graph.test/12345/messages"
        );
    }

    #[test]
    fn whatsapp_payload_shape() {
        let payload = send_payload(Platform::Whatsapp, "15551234567", "Hello!");
        assert_eq!(payload["messaging_product"], "whatsapp");
        assert_eq!(payload["to"], "15551234567");
        assert_eq!(payload["type"], "text");
        assert_eq!(payload["text"]["body"], "Hello!");
        assert_eq!(payload["text"]["preview_url"], false);
    }

    #[test]
    fn messenger_payload_shape() {
        for platform in [Platform::Instagram, Platform::Facebook] {
            let payload = send_payload(platform, "889900", "Hello!");
            assert_eq!(payload["recipient"]["id"], "889900");
            assert_eq!(payload["messaging_type"], "RESPONSE");
            assert_eq!(payload["message"]["text"], "Hello!");
        }
    }

    #[test]
    fn whatsapp_message_id_extraction() {
        let body = json!({ "messages": [{ "id": "wamid.out.1" }] });
        assert_eq!(extract_message_id(Platform::Whatsapp, &body), "wamid.out.1");
    }

    #[test]
    fn messenger_message_id_extraction() {
        let body = json!({ "recipient_id": "889900", "message_id": "mid.out.1" });
        assert_eq!(extract_message_id(Platform::Instagram, &body), "mid.out.1");
        assert_eq!(extract_message_id(Platform::Facebook, &body), "mid.out.1");
    }

    #[test]
    fn missing_message_id_falls_back() {
        assert_eq!(
            extract_message_id(Platform::Whatsapp, &Value::Null),
            "unknown"
        );
    }

    #[tokio::test]
    async fn send_without_access_token_is_config_error() {
        let client = GraphClient::new(DEFAULT_GRAPH_BASE_URL);
        let conn = connection(Platform::Whatsapp, json!({ "accountId": "123" }));
        let err = client.send_text(&conn, "15551234567", "hi").await.unwrap_err();
        assert!(matches!(err, SendError::Config("accessToken")));
    }

    #[tokio::test]
    async fn send_without_account_id_is_config_error() {
        let client = GraphClient::new(DEFAULT_GRAPH_BASE_URL);
        let conn = connection(Platform::Whatsapp, json!({ "accessToken": "token" }));
        let err = client.send_text(&conn, "15551234567", "hi").await.unwrap_err();
        assert!(matches!(err, SendError::Config("accountId")));
    }
}
