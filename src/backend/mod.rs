mod http;
mod scripted;

pub use http::HttpRoomBackend;
pub use scripted::ScriptedBackend;

use crate::{
    quota::QuotaSignal,
    room::{Message, MessageOrigin, RoomId},
};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Sender name the backend reserves for the room-entry announcement.
pub const WELCOME_SENDER: &str = "SYSTEM_WELCOME";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("backend rejected request: {0}")]
    Rejected(String),
}

impl BackendError {
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderRole {
    Participant,
    Welcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundAttachment {
    Inline {
        base64_data: String,
        mime_type: String,
        filename: String,
    },
    Hosted {
        url: String,
        mime_type: String,
        filename: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub room_id: RoomId,
    pub sender: String,
    pub body: String,
    pub attachment: Option<OutboundAttachment>,
    pub role: SenderRole,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendResponse {
    pub reply: Option<String>,
    pub error: Option<String>,
    pub quota: Option<QuotaSignal>,
}

impl SendResponse {
    pub fn stored() -> Self {
        Self::default()
    }

    pub fn quota_locked(&self) -> bool {
        self.quota.as_ref().is_some_and(|signal| signal.locked)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetUpload {
    pub bytes: Vec<u8>,
    pub filename: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedAsset {
    pub url: String,
}

/// The remote append-only store. Calls are blocking; async callers go through
/// `spawn_blocking`.
pub trait RoomBackend: Send + Sync {
    fn get_history(&self, room_id: &RoomId) -> Result<Vec<Message>, BackendError>;

    fn send_message(&self, request: &SendRequest) -> Result<SendResponse, BackendError>;

    /// Idempotent.
    fn clear_room(&self, room_id: &RoomId) -> Result<(), BackendError>;

    fn import_history(&self, room_id: &RoomId, messages: &[Message]) -> Result<(), BackendError>;

    fn upload_asset(&self, asset: &AssetUpload) -> Result<UploadedAsset, BackendError>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum WireOrigin {
    Human,
    Assistant,
    System,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default, alias = "sender_name")]
    sender: Option<String>,
    #[serde(default, alias = "message")]
    text: Option<String>,
    #[serde(default)]
    is_ai: bool,
    #[serde(default)]
    origin: Option<WireOrigin>,
    #[serde(default)]
    timestamp: Option<Value>,
    #[serde(default)]
    attachment_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireQuota {
    #[serde(default)]
    locked: bool,
    #[serde(default)]
    used: Option<u64>,
    #[serde(default)]
    limit: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct WireSendResponse {
    #[serde(default, alias = "reply")]
    ai_reply: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    quota_locked: Option<bool>,
    #[serde(default)]
    quota: Option<WireQuota>,
}

/// Turns a history response into store-ordered messages. Anything other than an
/// array of well-formed entries is a protocol violation; the caller keeps its
/// previous snapshot in that case.
pub fn parse_history_payload(payload: Value) -> Result<Vec<Message>, BackendError> {
    let items = match payload {
        Value::Array(items) => items,
        Value::Object(map) => {
            let detail = map
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("object payload")
                .to_string();
            return Err(BackendError::Protocol(format!(
                "history payload is not an array: {detail}"
            )));
        }
        other => {
            return Err(BackendError::Protocol(format!(
                "history payload is not an array: {}",
                json_kind(&other)
            )))
        }
    };

    items
        .into_iter()
        .enumerate()
        .map(|(idx, item)| {
            let wire: WireMessage = serde_json::from_value(item).map_err(|err| {
                BackendError::Protocol(format!("history entry {idx} is malformed: {err}"))
            })?;
            let sender = wire.sender.ok_or_else(|| {
                BackendError::Protocol(format!("history entry {idx} has no sender"))
            })?;
            let origin = match wire.origin {
                Some(WireOrigin::Assistant) => MessageOrigin::Assistant,
                Some(WireOrigin::System) => MessageOrigin::System,
                Some(WireOrigin::Human) => MessageOrigin::Human {
                    sender: sender.clone(),
                },
                None if wire.is_ai => MessageOrigin::Assistant,
                None => MessageOrigin::Human {
                    sender: sender.clone(),
                },
            };
            Ok(Message {
                sequence: wire.id.unwrap_or(idx as u64 + 1),
                sender,
                body: wire.text.unwrap_or_default(),
                attachment_ref: wire.attachment_url.filter(|url| !url.trim().is_empty()),
                origin,
                created_at: wire.timestamp.as_ref().and_then(parse_timestamp),
            })
        })
        .collect()
}

pub fn parse_send_payload(payload: Value) -> Result<SendResponse, BackendError> {
    if !payload.is_object() {
        return Err(BackendError::Protocol(format!(
            "send response is not an object: {}",
            json_kind(&payload)
        )));
    }
    let wire: WireSendResponse = serde_json::from_value(payload)
        .map_err(|err| BackendError::Protocol(format!("send response is malformed: {err}")))?;

    let quota = match (wire.quota, wire.quota_locked) {
        (Some(quota), flag) => Some(QuotaSignal {
            locked: quota.locked || flag.unwrap_or(false),
            used: quota.used,
            limit: quota.limit,
        }),
        (None, Some(locked)) => Some(QuotaSignal {
            locked,
            used: None,
            limit: None,
        }),
        (None, None) => None,
    };

    Ok(SendResponse {
        reply: wire.ai_reply.filter(|reply| !reply.trim().is_empty()),
        error: wire.error.filter(|error| !error.trim().is_empty()),
        quota,
    })
}

pub fn send_request_body(request: &SendRequest) -> Value {
    let (sender_name, message) = match request.role {
        SenderRole::Participant => (request.sender.as_str(), request.body.as_str()),
        SenderRole::Welcome => (WELCOME_SENDER, request.sender.as_str()),
    };
    let mut body = json!({
        "room_id": request.room_id.as_str(),
        "sender_name": sender_name,
        "message": message,
        "file_data": Value::Null,
        "file_type": Value::Null,
    });
    match &request.attachment {
        Some(OutboundAttachment::Inline {
            base64_data,
            mime_type,
            filename,
        }) => {
            body["file_data"] = json!(base64_data);
            body["file_type"] = json!(mime_type);
            body["file_name"] = json!(filename);
        }
        Some(OutboundAttachment::Hosted {
            url,
            mime_type,
            filename,
        }) => {
            body["attachment_url"] = json!(url);
            body["file_type"] = json!(mime_type);
            body["file_name"] = json!(filename);
        }
        None => {}
    }
    body
}

/// Wire form accepted by the import endpoint, inverse of `parse_history_payload`.
pub fn wire_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|message| {
            let origin = match message.origin {
                MessageOrigin::Human { .. } => WireOrigin::Human,
                MessageOrigin::Assistant => WireOrigin::Assistant,
                MessageOrigin::System => WireOrigin::System,
            };
            json!({
                "id": message.sequence,
                "sender": message.sender,
                "text": message.body,
                "is_ai": origin == WireOrigin::Assistant,
                "origin": origin,
                "timestamp": message.created_at.map(|ts| ts.to_rfc3339()),
                "attachment_url": message.attachment_ref,
            })
        })
        .collect()
}

pub(crate) fn parse_ack_payload(payload: Value) -> Result<(), BackendError> {
    match payload.get("error").and_then(Value::as_str) {
        Some(error) if !error.trim().is_empty() => Err(BackendError::Rejected(error.to_string())),
        _ => Ok(()),
    }
}

pub(crate) fn parse_upload_payload(payload: Value) -> Result<UploadedAsset, BackendError> {
    if let Some(error) = payload.get("error").and_then(Value::as_str) {
        return Err(BackendError::Rejected(error.to_string()));
    }
    payload
        .get("url")
        .and_then(Value::as_str)
        .filter(|url| !url.trim().is_empty())
        .map(|url| UploadedAsset {
            url: url.to_string(),
        })
        .ok_or_else(|| BackendError::Protocol("upload response has no url".to_string()))
}

/// Accepts RFC 3339, RFC 2822 (HTTP-date), naive `YYYY-MM-DD HH:MM:SS[.f]` as UTC,
/// or a numeric epoch in seconds or milliseconds.
pub fn parse_timestamp(raw: &Value) -> Option<DateTime<Utc>> {
    match raw {
        Value::String(text) => {
            let text = text.trim();
            if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
                return Some(ts.with_timezone(&Utc));
            }
            if let Ok(ts) = DateTime::parse_from_rfc2822(text) {
                return Some(ts.with_timezone(&Utc));
            }
            ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
                .iter()
                .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
                .map(|naive| Utc.from_utc_datetime(&naive))
        }
        Value::Number(number) => {
            let value = number.as_i64()?;
            if value.abs() >= 100_000_000_000 {
                Utc.timestamp_millis_opt(value).single()
            } else {
                Utc.timestamp_opt(value, 0).single()
            }
        }
        _ => None,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_entries_map_origin_without_name_matching() {
        let messages = parse_history_payload(json!([
            {"sender": "Ana", "text": "hi @ai", "is_ai": false, "timestamp": "Tue, 15 Nov 1994 12:45:26 GMT"},
            {"sender": "Renamed Bot", "text": "hello", "is_ai": true},
            {"id": 42, "sender": "ops", "text": "maintenance", "origin": "system"}
        ]))
        .expect("payload should parse");

        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].sequence, 1);
        assert_eq!(
            messages[0].origin,
            MessageOrigin::Human {
                sender: "Ana".to_string()
            }
        );
        assert!(messages[0].created_at.is_some());
        assert_eq!(messages[1].origin, MessageOrigin::Assistant);
        assert_eq!(messages[2].sequence, 42);
        assert_eq!(messages[2].origin, MessageOrigin::System);
    }

    #[test]
    fn non_array_history_is_a_protocol_error() {
        let err = parse_history_payload(json!({"error": "relation does not exist"}))
            .expect_err("object payload must be rejected");
        assert!(matches!(err, BackendError::Protocol(detail) if detail.contains("does not exist")));
        assert!(matches!(
            parse_history_payload(json!("oops")),
            Err(BackendError::Protocol(_))
        ));
        assert!(matches!(
            parse_history_payload(json!([{"text": "no sender"}])),
            Err(BackendError::Protocol(_))
        ));
    }

    #[test]
    fn send_payload_carries_quota_signal() {
        let response = parse_send_payload(json!({"ai_reply": "ok", "quota_locked": true}))
            .expect("payload should parse");
        assert!(response.quota_locked());
        assert_eq!(response.reply.as_deref(), Some("ok"));

        let response = parse_send_payload(json!({
            "status": "Stored",
            "quota": {"locked": false, "used": 4, "limit": 10}
        }))
        .expect("payload should parse");
        assert!(!response.quota_locked());
        assert_eq!(
            response.quota,
            Some(QuotaSignal {
                locked: false,
                used: Some(4),
                limit: Some(10)
            })
        );
        assert!(matches!(
            parse_send_payload(json!([1, 2])),
            Err(BackendError::Protocol(_))
        ));
    }

    #[test]
    fn inline_and_hosted_attachments_use_distinct_fields() {
        let room_id = RoomId::parse("r").expect("room id should parse");
        let mut request = SendRequest {
            room_id,
            sender: "Ana".to_string(),
            body: "see file".to_string(),
            attachment: Some(OutboundAttachment::Inline {
                base64_data: "QUJD".to_string(),
                mime_type: "application/pdf".to_string(),
                filename: "a.pdf".to_string(),
            }),
            role: SenderRole::Participant,
        };
        let inline = send_request_body(&request);
        assert_eq!(inline["file_data"], "QUJD");
        assert!(inline.get("attachment_url").is_none());

        request.attachment = Some(OutboundAttachment::Hosted {
            url: "https://cdn.example.com/a.pdf".to_string(),
            mime_type: "application/pdf".to_string(),
            filename: "a.pdf".to_string(),
        });
        let hosted = send_request_body(&request);
        assert_eq!(hosted["file_data"], Value::Null);
        assert_eq!(hosted["attachment_url"], "https://cdn.example.com/a.pdf");
    }

    #[test]
    fn welcome_request_uses_reserved_sender() {
        let request = SendRequest {
            room_id: RoomId::parse("r").expect("room id should parse"),
            sender: "Ana".to_string(),
            body: String::new(),
            attachment: None,
            role: SenderRole::Welcome,
        };
        let body = send_request_body(&request);
        assert_eq!(body["sender_name"], WELCOME_SENDER);
        assert_eq!(body["message"], "Ana");
    }

    #[test]
    fn wire_messages_survive_reparse() {
        let original = parse_history_payload(json!([
            {"id": 7, "sender": "Ana", "text": "a \"quoted\" line", "timestamp": "2025-01-02T03:04:05Z"},
            {"id": 8, "sender": "Bot", "text": "reply", "is_ai": true, "attachment_url": "https://x/y.png"}
        ]))
        .expect("payload should parse");
        let reparsed = parse_history_payload(Value::Array(wire_messages(&original)))
            .expect("wire form should parse");
        assert_eq!(reparsed, original);
    }

    #[test]
    fn timestamps_accept_naive_and_epoch_forms() {
        assert!(parse_timestamp(&json!("2025-03-01 10:00:00.123")).is_some());
        let seconds = parse_timestamp(&json!(1_700_000_000)).expect("seconds should parse");
        let millis = parse_timestamp(&json!(1_700_000_000_000_i64)).expect("millis should parse");
        assert_eq!(seconds, millis);
        assert_eq!(parse_timestamp(&json!("yesterday")), None);
    }
}
