use std::collections::HashMap;

use chrono::{TimeZone, Utc};
use serde_json::Value;

use crate::types::{InboundMessage, MessageKind, Platform};

/// Flatten a raw webhook body into the inbound events it carries, in array
/// order. Malformed events are logged and dropped; the caller still acks.
pub fn normalize(platform: Platform, payload: &Value) -> Vec<InboundMessage> {
    match platform {
        Platform::Whatsapp => normalize_whatsapp(payload),
        Platform::Instagram | Platform::Facebook => normalize_messaging(platform, payload),
        Platform::Direct => Vec::new(),
    }
}

pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits = raw
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

fn contact_profile_names(value: &Value) -> HashMap<String, String> {
    let contacts = value
        .get("contacts")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut map = HashMap::new();
    for contact in contacts {
        let wa_id = contact
            .get("wa_id")
            .and_then(Value::as_str)
            .or_else(|| contact.get("input").and_then(Value::as_str))
            .unwrap_or("");
        let Some(digits) = normalize_phone(wa_id) else {
            continue;
        };
        let name = contact
            .get("profile")
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        if !name.is_empty() {
            map.insert(digits, name);
        }
    }
    map
}

fn bracket_tag(raw_type: &str) -> String {
    let mut chars = raw_type.chars();
    let capitalized = match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    };
    format!("[{capitalized}]")
}

fn whatsapp_content(message: &Value) -> Option<(String, MessageKind)> {
    let msg_type = message
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_ascii_lowercase();

    if msg_type == "text" {
        let text = message
            .get("text")
            .and_then(|v| v.get("body"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        return if text.is_empty() {
            None
        } else {
            Some((text, MessageKind::Text))
        };
    }

    if matches!(
        msg_type.as_str(),
        "image" | "audio" | "video" | "document" | "sticker"
    ) {
        let body = message.get(&msg_type).cloned().unwrap_or(Value::Null);
        let caption = body
            .get("caption")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        let filename = body
            .get("filename")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        let tag = bracket_tag(&msg_type);
        let text = if msg_type == "document" && !filename.is_empty() {
            format!("{tag} {filename}")
        } else if !caption.is_empty() {
            format!("{tag} {caption}")
        } else {
            tag
        };
        return Some((text, MessageKind::Media));
    }

    if msg_type.is_empty() {
        None
    } else {
        Some((bracket_tag(&msg_type), MessageKind::Other))
    }
}

fn unix_seconds_to_iso(secs: i64) -> Option<String> {
    Utc.timestamp_opt(secs, 0).single().map(|ts| ts.to_rfc3339())
}

fn unix_millis_to_iso(millis: i64) -> Option<String> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(|ts| ts.to_rfc3339())
}

fn normalize_whatsapp(payload: &Value) -> Vec<InboundMessage> {
    let mut events = Vec::new();
    let entries = payload
        .get("entry")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    for entry in entries {
        let changes = entry
            .get("changes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for change in changes {
            let value = change.get("value").cloned().unwrap_or(Value::Null);
            let names = contact_profile_names(&value);
            let recipient_id = value
                .get("metadata")
                .and_then(|m| m.get("phone_number_id"))
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            let messages = value
                .get("messages")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();

            for message in messages {
                let from = message.get("from").and_then(Value::as_str).unwrap_or("");
                let Some(sender_id) = normalize_phone(from) else {
                    tracing::warn!("whatsapp event without sender phone, skipping");
                    continue;
                };
                let Some((text, message_type)) = whatsapp_content(&message) else {
                    tracing::warn!(sender = %sender_id, "whatsapp event without content, skipping");
                    continue;
                };
                let platform_message_id = message
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let timestamp = message
                    .get("timestamp")
                    .and_then(Value::as_str)
                    .and_then(|raw| raw.parse::<i64>().ok())
                    .and_then(unix_seconds_to_iso);

                events.push(InboundMessage {
                    platform: Platform::Whatsapp,
                    sender_name: names.get(&sender_id).cloned(),
                    sender_id,
                    recipient_id: recipient_id.clone(),
                    text,
                    message_type,
                    platform_message_id,
                    timestamp,
                });
            }
        }
    }

    events
}

fn messaging_content(message: &Value) -> Option<(String, MessageKind)> {
    let text = message
        .get("text")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string();
    if !text.is_empty() {
        return Some((text, MessageKind::Text));
    }

    let attachment_type = message
        .get("attachments")
        .and_then(Value::as_array)
        .and_then(|list| list.first())
        .and_then(|att| att.get("type"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_ascii_lowercase();
    if attachment_type.is_empty() {
        return None;
    }
    match attachment_type.as_str() {
        "image" | "video" | "audio" | "file" => {
            Some((bracket_tag(&attachment_type), MessageKind::Media))
        }
        _ => Some((bracket_tag(&attachment_type), MessageKind::Other)),
    }
}

/// Instagram and Facebook Messenger share the `entry[].messaging[]` shape;
/// only the top-level object tag and the id namespace differ.
fn normalize_messaging(platform: Platform, payload: &Value) -> Vec<InboundMessage> {
    let mut events = Vec::new();
    let entries = payload
        .get("entry")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    for entry in entries {
        let messaging = entry
            .get("messaging")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for event in messaging {
            let Some(message) = event.get("message") else {
                tracing::warn!(platform = %platform, "messaging event without message, skipping");
                continue;
            };
            let Some(sender_id) = event
                .get("sender")
                .and_then(|s| s.get("id"))
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
            else {
                tracing::warn!(platform = %platform, "messaging event without sender, skipping");
                continue;
            };
            let Some(recipient_id) = event
                .get("recipient")
                .and_then(|r| r.get("id"))
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
            else {
                tracing::warn!(platform = %platform, "messaging event without recipient, skipping");
                continue;
            };
            if message
                .get("is_echo")
                .and_then(Value::as_bool)
                .unwrap_or(false)
            {
                tracing::debug!(platform = %platform, sender = %sender_id, "echo event, skipping");
                continue;
            }
            let Some((text, message_type)) = messaging_content(message) else {
                tracing::warn!(platform = %platform, sender = %sender_id, "messaging event without content, skipping");
                continue;
            };

            let sender_name = event
                .get("sender")
                .and_then(|s| s.get("username"))
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string);
            let platform_message_id = message
                .get("mid")
                .and_then(Value::as_str)
                .map(str::to_string);
            let timestamp = event
                .get("timestamp")
                .and_then(Value::as_i64)
                .and_then(unix_millis_to_iso);

            events.push(InboundMessage {
                platform,
                sender_id: sender_id.to_string(),
                sender_name,
                recipient_id: recipient_id.to_string(),
                text,
                message_type,
                platform_message_id,
                timestamp,
            });
        }
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn whatsapp_text_payload() -> Value {
        json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "changes": [{
                    "field": "messages",
                    "value": {
                        "metadata": { "phone_number_id": "1098765" },
                        "messages": [{
                            "from": "15551234567",
                            "id": "wamid.abc123",
                            "timestamp": "1700000000",
                            "type": "text",
                            "text": { "body": "Hi" }
                        }],
                        "contacts": [{
                            "wa_id": "15551234567",
                            "profile": { "name": "Jane" }
                        }]
                    }
                }]
            }]
        })
    }

    #[test]
    fn whatsapp_text_message_normalizes() {
        let events = normalize(Platform::Whatsapp, &whatsapp_text_payload());
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.platform, Platform::Whatsapp);
        assert_eq!(event.sender_id, "15551234567");
        assert_eq!(event.sender_name.as_deref(), Some("Jane"));
        assert_eq!(event.recipient_id, "1098765");
        assert_eq!(event.text, "Hi");
        assert_eq!(event.message_type, MessageKind::Text);
        assert_eq!(event.platform_message_id.as_deref(), Some("wamid.abc123"));
        assert_eq!(
            event.timestamp.as_deref(),
            Some("2023-11-14T22:13:20+00:00")
        );
    }

    #[test]
    fn whatsapp_event_without_timestamp_has_none() {
        let payload = json!({
            "entry": [{ "changes": [{ "value": {
                "messages": [{ "from": "4477001122", "type": "text", "text": { "body": "hey" } }]
            }}]}]
        });
        let events = normalize(Platform::Whatsapp, &payload);
        assert_eq!(events.len(), 1);
        assert!(events[0].timestamp.is_none());
        assert!(events[0].platform_message_id.is_none());
        assert!(events[0].sender_name.is_none());
    }

    #[test]
    fn whatsapp_image_uses_caption() {
        let payload = json!({
            "entry": [{ "changes": [{ "value": {
                "messages": [{
                    "from": "15551234567",
                    "type": "image",
                    "image": { "id": "media-1", "caption": "our storefront" }
                }]
            }}]}]
        });
        let events = normalize(Platform::Whatsapp, &payload);
        assert_eq!(events[0].text, "[Image] our storefront");
        assert_eq!(events[0].message_type, MessageKind::Media);
    }

    #[test]
    fn whatsapp_document_uses_filename() {
        let payload = json!({
            "entry": [{ "changes": [{ "value": {
                "messages": [{
                    "from": "15551234567",
                    "type": "document",
                    "document": { "id": "media-2", "filename": "invoice.pdf" }
                }]
            }}]}]
        });
        let events = normalize(Platform::Whatsapp, &payload);
        assert_eq!(events[0].text, "[Document] invoice.pdf");
        assert_eq!(events[0].message_type, MessageKind::Media);
    }

    #[test]
    fn whatsapp_unknown_type_is_other() {
        let payload = json!({
            "entry": [{ "changes": [{ "value": {
                "messages": [{ "from": "15551234567", "type": "location" }]
            }}]}]
        });
        let events = normalize(Platform::Whatsapp, &payload);
        assert_eq!(events[0].text, "[Location]");
        assert_eq!(events[0].message_type, MessageKind::Other);
    }

    #[test]
    fn whatsapp_malformed_events_are_skipped_not_fatal() {
        let payload = json!({
            "entry": [{ "changes": [{ "value": {
                "messages": [
                    { "type": "text", "text": { "body": "no sender" } },
                    { "from": "15551234567", "type": "text", "text": { "body": "" } },
                    { "from": "15559998877", "type": "text", "text": { "body": "still here" } }
                ]
            }}]}]
        });
        let events = normalize(Platform::Whatsapp, &payload);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].text, "still here");
    }

    #[test]
    fn whatsapp_status_only_delivery_yields_nothing() {
        let payload = json!({
            "entry": [{ "changes": [{ "value": {
                "statuses": [{ "id": "wamid.x", "status": "delivered" }]
            }}]}]
        });
        assert!(normalize(Platform::Whatsapp, &payload).is_empty());
    }

    fn messaging_payload(object: &str) -> Value {
        json!({
            "object": object,
            "entry": [{
                "messaging": [{
                    "sender": { "id": "889900", "username": "jane.doe" },
                    "recipient": { "id": "17841400001" },
                    "timestamp": 1700000000000i64,
                    "message": { "mid": "mid.777", "text": "is this still available?" }
                }]
            }]
        })
    }

    #[test]
    fn instagram_message_normalizes() {
        let events = normalize(Platform::Instagram, &messaging_payload("instagram"));
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.platform, Platform::Instagram);
        assert_eq!(event.sender_id, "889900");
        assert_eq!(event.sender_name.as_deref(), Some("jane.doe"));
        assert_eq!(event.recipient_id, "17841400001");
        assert_eq!(event.platform_message_id.as_deref(), Some("mid.777"));
        assert_eq!(
            event.timestamp.as_deref(),
            Some("2023-11-14T22:13:20+00:00")
        );
    }

    #[test]
    fn facebook_shares_the_messaging_shape() {
        let events = normalize(Platform::Facebook, &messaging_payload("page"));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].platform, Platform::Facebook);
    }

    #[test]
    fn messaging_events_missing_fields_are_skipped() {
        let payload = json!({
            "entry": [{
                "messaging": [
                    { "sender": { "id": "1" }, "recipient": { "id": "2" } },
                    { "recipient": { "id": "2" }, "message": { "text": "no sender" } },
                    { "sender": { "id": "1" }, "message": { "text": "no recipient" } }
                ]
            }]
        });
        assert!(normalize(Platform::Instagram, &payload).is_empty());
    }

    #[test]
    fn messaging_echo_events_are_skipped() {
        let payload = json!({
            "entry": [{
                "messaging": [{
                    "sender": { "id": "17841400001" },
                    "recipient": { "id": "889900" },
                    "message": { "mid": "mid.echo", "text": "our own reply", "is_echo": true }
                }]
            }]
        });
        assert!(normalize(Platform::Facebook, &payload).is_empty());
    }

    #[test]
    fn messaging_attachment_only_message_classifies_as_media() {
        let payload = json!({
            "entry": [{
                "messaging": [{
                    "sender": { "id": "889900" },
                    "recipient": { "id": "17841400001" },
                    "message": {
                        "mid": "mid.att",
                        "attachments": [{ "type": "image", "payload": { "url": "https://cdn.test/i.jpg" } }]
                    }
                }]
            }]
        });
        let events = normalize(Platform::Instagram, &payload);
        assert_eq!(events[0].text, "[Image]");
        assert_eq!(events[0].message_type, MessageKind::Media);
    }

    #[test]
    fn events_keep_array_order() {
        let payload = json!({
            "entry": [{ "changes": [{ "value": {
                "messages": [
                    { "from": "15551234567", "type": "text", "text": { "body": "first" } },
                    { "from": "15551234567", "type": "text", "text": { "body": "second" } }
                ]
            }}]}]
        });
        let events = normalize(Platform::Whatsapp, &payload);
        assert_eq!(events[0].text, "first");
        assert_eq!(events[1].text, "second");
    }

    #[test]
    fn normalize_phone_strips_formatting() {
        assert_eq!(
            normalize_phone("+1 (555) 123-4567").as_deref(),
            Some("15551234567")
        );
        assert_eq!(normalize_phone("no digits"), None);
    }
}
