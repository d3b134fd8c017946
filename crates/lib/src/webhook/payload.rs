//! Provider payload decoding.
//!
//! The root `object` field selects the platform; each entry and each event inside it is
//! decoded on its own so one malformed event cannot sink its siblings. Output is a flat
//! list of platform-neutral [`InboundEvent`]s.

use crate::model::{MessageType, Platform};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("webhook body is not a supported payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("malformed webhook entry: {0}")]
    Entry(String),
}

/// Root of a delivery: `{"object": "page" | "instagram", "entry": [...]}`.
#[derive(Debug, Deserialize)]
#[serde(tag = "object", rename_all = "lowercase")]
enum WebhookPayload {
    Page {
        #[serde(default)]
        entry: Vec<Value>,
    },
    Instagram {
        #[serde(default)]
        entry: Vec<Value>,
    },
}

#[derive(Debug, Deserialize)]
struct Entry {
    #[serde(default)]
    time: Option<Value>,
    /// Messenger-style event list (both platforms).
    #[serde(default)]
    messaging: Vec<Value>,
    /// Instagram field-change style (`{"field": "messages", "value": {...}}`).
    #[serde(default)]
    changes: Vec<Change>,
}

#[derive(Debug, Deserialize)]
struct Change {
    #[serde(default)]
    field: String,
    #[serde(default)]
    value: Value,
}

#[derive(Debug, Deserialize)]
struct MessagingEvent {
    sender: Party,
    recipient: Party,
    #[serde(default)]
    timestamp: Option<Value>,
    #[serde(default)]
    message: Option<RawMessage>,
}

#[derive(Debug, Deserialize)]
struct Party {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    mid: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    attachments: Vec<Attachment>,
    #[serde(default)]
    is_echo: bool,
    #[serde(default)]
    metadata: Option<String>,
    #[serde(default)]
    is_deleted: bool,
    #[serde(default)]
    is_unsupported: bool,
}

#[derive(Debug, Deserialize)]
struct Attachment {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    payload: Option<AttachmentPayload>,
}

#[derive(Debug, Deserialize)]
struct AttachmentPayload {
    #[serde(default)]
    url: Option<String>,
}

/// A provider message reduced to what the canonical model needs.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub platform: Platform,
    /// Platform-scoped id of the customer side of the thread.
    pub counterpart_id: String,
    pub external_message_id: String,
    pub content: String,
    pub media_url: Option<String>,
    pub message_type: MessageType,
    pub sent_at: DateTime<Utc>,
    /// Copy of a message the business side sent.
    pub is_echo: bool,
    /// Correlation id attached at send time, returned on echoes.
    pub correlation_id: Option<String>,
}

/// Outcome of decoding one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Message(InboundEvent),
    /// Well-formed but carries nothing to store (delivery/read receipts, reactions, deletions).
    Ignored(&'static str),
}

/// Decode a webhook body. The outer error means the body as a whole is unusable; inner errors are per event.
pub fn decode_payload(body: &[u8]) -> Result<Vec<Result<Decoded, WebhookError>>, WebhookError> {
    let payload: WebhookPayload = serde_json::from_slice(body)?;
    let (platform, entries) = match payload {
        WebhookPayload::Page { entry } => (Platform::Facebook, entry),
        WebhookPayload::Instagram { entry } => (Platform::Instagram, entry),
    };
    let mut out = Vec::new();
    for raw in entries {
        let entry: Entry = match serde_json::from_value(raw) {
            Ok(e) => e,
            Err(e) => {
                out.push(Err(WebhookError::Entry(e.to_string())));
                continue;
            }
        };
        let entry_time = entry.time.as_ref().and_then(parse_timestamp);
        for event in entry.messaging {
            out.push(decode_event(platform, event, entry_time));
        }
        for change in entry.changes {
            if change.field != "messages" {
                out.push(Ok(Decoded::Ignored("non-message change")));
                continue;
            }
            out.push(decode_event(platform, change.value, entry_time));
        }
    }
    Ok(out)
}

fn decode_event(
    platform: Platform,
    raw: Value,
    entry_time: Option<DateTime<Utc>>,
) -> Result<Decoded, WebhookError> {
    let event: MessagingEvent =
        serde_json::from_value(raw).map_err(|e| WebhookError::Entry(e.to_string()))?;
    let Some(message) = event.message else {
        return Ok(Decoded::Ignored("not a message event"));
    };
    if message.is_deleted {
        return Ok(Decoded::Ignored("message deleted"));
    }
    if message.is_unsupported {
        return Ok(Decoded::Ignored("unsupported message"));
    }
    if message.mid.trim().is_empty() {
        return Err(WebhookError::Entry("message without mid".to_string()));
    }
    let content = message.text.unwrap_or_default();
    let first = message.attachments.first();
    let message_type = first
        .map(|a| MessageType::from_attachment(&a.kind))
        .unwrap_or(MessageType::Text);
    let media_url = first
        .and_then(|a| a.payload.as_ref())
        .and_then(|p| p.url.clone());
    if content.trim().is_empty() && first.is_none() {
        return Ok(Decoded::Ignored("empty message"));
    }
    let counterpart = if message.is_echo {
        event.recipient.id
    } else {
        event.sender.id
    };
    if counterpart.trim().is_empty() {
        return Err(WebhookError::Entry("event without counterpart id".to_string()));
    }
    let sent_at = event
        .timestamp
        .as_ref()
        .and_then(parse_timestamp)
        .or(entry_time)
        .unwrap_or_else(Utc::now);
    Ok(Decoded::Message(InboundEvent {
        platform,
        counterpart_id: counterpart,
        external_message_id: message.mid,
        content,
        media_url,
        message_type,
        sent_at,
        is_echo: message.is_echo,
        correlation_id: message.metadata.filter(|m| !m.is_empty()),
    }))
}

/// Millisecond or second epoch, as a number or a numeric string.
fn parse_timestamp(v: &Value) -> Option<DateTime<Utc>> {
    let n = match v {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    // Anything below 10^11 is a seconds value (year 5138 in ms).
    let ms = if n < 100_000_000_000 { n.checked_mul(1000)? } else { n };
    Utc.timestamp_millis_opt(ms).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn messages(body: Value) -> Vec<InboundEvent> {
        decode_payload(body.to_string().as_bytes())
            .unwrap()
            .into_iter()
            .filter_map(|r| match r {
                Ok(Decoded::Message(m)) => Some(m),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn decodes_messenger_text() {
        let evs = messages(json!({
            "object": "page",
            "entry": [{
                "id": "PAGE", "time": 1700000000000i64,
                "messaging": [{
                    "sender": {"id": "U1"}, "recipient": {"id": "PAGE"},
                    "timestamp": 1700000000123i64,
                    "message": {"mid": "m1", "text": "hi"}
                }]
            }]
        }));
        assert_eq!(evs.len(), 1);
        let e = &evs[0];
        assert_eq!(e.platform, Platform::Facebook);
        assert_eq!(e.counterpart_id, "U1");
        assert_eq!(e.external_message_id, "m1");
        assert_eq!(e.content, "hi");
        assert_eq!(e.sent_at.timestamp_millis(), 1700000000123);
        assert!(!e.is_echo);
    }

    #[test]
    fn decodes_instagram_changes_with_attachment() {
        let evs = messages(json!({
            "object": "instagram",
            "entry": [{
                "id": "IGID", "time": 1700000000,
                "changes": [{
                    "field": "messages",
                    "value": {
                        "sender": {"id": "IGU"}, "recipient": {"id": "IGID"},
                        "timestamp": "1700000001",
                        "message": {"mid": "ig1", "attachments": [
                            {"type": "image", "payload": {"url": "https://cdn/x.jpg"}}
                        ]}
                    }
                }]
            }]
        }));
        assert_eq!(evs.len(), 1);
        assert_eq!(evs[0].platform, Platform::Instagram);
        assert_eq!(evs[0].message_type, MessageType::Image);
        assert_eq!(evs[0].media_url.as_deref(), Some("https://cdn/x.jpg"));
        assert_eq!(evs[0].sent_at.timestamp(), 1700000001);
    }

    #[test]
    fn echo_uses_recipient_and_carries_metadata() {
        let evs = messages(json!({
            "object": "page",
            "entry": [{"messaging": [{
                "sender": {"id": "PAGE"}, "recipient": {"id": "U1"},
                "timestamp": 1700000000000i64,
                "message": {"mid": "m_out", "text": "hello", "is_echo": true, "metadata": "tmp-1"}
            }]}]
        }));
        assert!(evs[0].is_echo);
        assert_eq!(evs[0].counterpart_id, "U1");
        assert_eq!(evs[0].correlation_id.as_deref(), Some("tmp-1"));
    }

    #[test]
    fn bad_event_does_not_hide_siblings() {
        let out = decode_payload(
            json!({
                "object": "page",
                "entry": [
                    "not an object",
                    {"messaging": [
                        {"sender": {"id": "U1"}},
                        {"sender": {"id": "U2"}, "recipient": {"id": "P"}, "message": {"mid": "m2", "text": "ok"}},
                        {"sender": {"id": "U3"}, "recipient": {"id": "P"}, "delivery": {"mids": ["x"]}}
                    ]}
                ]
            })
            .to_string()
            .as_bytes(),
        )
        .unwrap();
        assert_eq!(out.len(), 4);
        assert!(out[0].is_err());
        assert!(out[1].is_err());
        assert!(matches!(out[2], Ok(Decoded::Message(ref m)) if m.external_message_id == "m2"));
        assert!(matches!(out[3], Ok(Decoded::Ignored(_))));
    }

    #[test]
    fn unknown_object_is_rejected() {
        assert!(decode_payload(br#"{"object":"whatsapp_business_account","entry":[]}"#).is_err());
        assert!(decode_payload(b"not json").is_err());
    }

    #[test]
    fn parse_timestamp_handles_seconds_and_millis() {
        assert_eq!(parse_timestamp(&json!(1700000000)).unwrap().timestamp(), 1700000000);
        assert_eq!(parse_timestamp(&json!(1700000000000i64)).unwrap().timestamp(), 1700000000);
        assert!(parse_timestamp(&json!(null)).is_none());
    }
}
