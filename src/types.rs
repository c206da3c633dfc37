use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;

use crate::outbound::PlatformSender;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Whatsapp,
    Instagram,
    Facebook,
    Direct,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Whatsapp => "whatsapp",
            Platform::Instagram => "instagram",
            Platform::Facebook => "facebook",
            Platform::Direct => "direct",
        }
    }

    pub fn parse(value: &str) -> Option<Platform> {
        match value.trim().to_ascii_lowercase().as_str() {
            "whatsapp" => Some(Platform::Whatsapp),
            "instagram" => Some(Platform::Instagram),
            "facebook" => Some(Platform::Facebook),
            "direct" => Some(Platform::Direct),
            _ => None,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Media,
    Other,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Media => "media",
            MessageKind::Other => "other",
        }
    }
}

/// Normalized shape of one inbound platform event. Never persisted.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub platform: Platform,
    pub sender_id: String,
    pub sender_name: Option<String>,
    pub recipient_id: String,
    pub text: String,
    pub message_type: MessageKind,
    pub platform_message_id: Option<String>,
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub id: String,
    pub tenant_id: String,
    pub platform: Platform,
    pub external_id: String,
    pub display_name: String,
    pub email: String,
    pub phone: String,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: String,
    pub tenant_id: String,
    pub customer_id: String,
    pub platform: Platform,
    pub last_message: String,
    pub unread_count: i32,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    pub id: String,
    pub tenant_id: String,
    pub customer_id: String,
    pub customer_name: String,
    pub customer_external_id: String,
    pub platform: Platform,
    pub last_message: String,
    pub unread_count: i32,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub chat_id: String,
    pub sender_type: String,
    pub content: String,
    pub message_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform_message_id: Option<String>,
    pub is_read: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformConnection {
    pub id: String,
    pub tenant_id: String,
    pub platform: Platform,
    pub name: String,
    pub config: Value,
    pub enabled: bool,
    pub created_at: String,
    pub updated_at: String,
}

pub struct AppState {
    pub db: PgPool,
    pub sender: Arc<dyn PlatformSender>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    pub text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConnectionBody {
    pub tenant_id: String,
    pub platform: String,
    pub name: Option<String>,
    #[serde(default)]
    pub config: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateConnectionBody {
    pub name: Option<String>,
    #[serde(default)]
    pub config: Option<Value>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantQuery {
    pub tenant_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_round_trips_through_strings() {
        for platform in [
            Platform::Whatsapp,
            Platform::Instagram,
            Platform::Facebook,
            Platform::Direct,
        ] {
            assert_eq!(Platform::parse(platform.as_str()), Some(platform));
        }
    }

    #[test]
    fn platform_parse_is_case_insensitive() {
        assert_eq!(Platform::parse(" WhatsApp "), Some(Platform::Whatsapp));
        assert_eq!(Platform::parse("INSTAGRAM"), Some(Platform::Instagram));
        assert_eq!(Platform::parse("telegram"), None);
    }

    #[test]
    fn platform_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&Platform::Whatsapp).unwrap(),
            "\"whatsapp\""
        );
    }
}
