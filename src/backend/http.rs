use super::{
    parse_ack_payload, parse_history_payload, parse_send_payload, parse_upload_payload,
    send_request_body, wire_messages, AssetUpload, BackendError, RoomBackend, SendRequest,
    SendResponse, UploadedAsset,
};
use crate::room::{Message, RoomId};
use serde_json::{json, Value};
use std::time::Duration;

/// JSON-over-HTTP backend speaking the room server's `/api/chat/*` routes.
pub struct HttpRoomBackend {
    agent: ureq::Agent,
    base_url: String,
}

impl HttpRoomBackend {
    pub fn new(base_url: &str) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(15))
            .timeout_read(Duration::from_secs(30))
            .user_agent(concat!("roomsync/", env!("CARGO_PKG_VERSION")))
            .build();
        Self {
            agent,
            base_url: normalize_base_url(base_url),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl RoomBackend for HttpRoomBackend {
    fn get_history(&self, room_id: &RoomId) -> Result<Vec<Message>, BackendError> {
        let result = self
            .agent
            .get(&self.endpoint("/api/chat/history"))
            .query("room_id", room_id.as_str())
            .call();
        parse_history_payload(read_json(result)?)
    }

    fn send_message(&self, request: &SendRequest) -> Result<SendResponse, BackendError> {
        let result = self
            .agent
            .post(&self.endpoint("/api/chat/send"))
            .send_json(send_request_body(request));
        parse_send_payload(read_json(result)?)
    }

    fn clear_room(&self, room_id: &RoomId) -> Result<(), BackendError> {
        let result = self
            .agent
            .post(&self.endpoint("/api/chat/clear"))
            .send_json(json!({ "room_id": room_id.as_str() }));
        parse_ack_payload(read_json(result)?)
    }

    fn import_history(&self, room_id: &RoomId, messages: &[Message]) -> Result<(), BackendError> {
        let result = self
            .agent
            .post(&self.endpoint("/api/chat/import"))
            .send_json(json!({
                "room_id": room_id.as_str(),
                "messages": wire_messages(messages),
            }));
        parse_ack_payload(read_json(result)?)
    }

    fn upload_asset(&self, asset: &AssetUpload) -> Result<UploadedAsset, BackendError> {
        let result = self
            .agent
            .post(&self.endpoint("/api/upload"))
            .set("Content-Type", &asset.mime_type)
            .set("X-Filename", &asset.filename)
            .send_bytes(&asset.bytes);
        parse_upload_payload(read_json(result)?)
    }
}

/// Error statuses still carry JSON bodies (`{"error": ...}`) worth parsing; a 5xx
/// without one is treated as a transport hiccup, anything else as a protocol fault.
fn read_json(result: Result<ureq::Response, ureq::Error>) -> Result<Value, BackendError> {
    match result {
        Ok(response) => response
            .into_json::<Value>()
            .map_err(|err| BackendError::Protocol(format!("response is not JSON: {err}"))),
        Err(ureq::Error::Status(code, response)) => match response.into_json::<Value>() {
            Ok(body) => Ok(body),
            Err(_) if code >= 500 => Err(BackendError::Transport(format!("HTTP {code}"))),
            Err(_) => Err(BackendError::Protocol(format!(
                "HTTP {code} without a JSON body"
            ))),
        },
        Err(ureq::Error::Transport(err)) => Err(BackendError::Transport(err.to_string())),
    }
}

fn normalize_base_url(input: &str) -> String {
    let trimmed = input.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_gets_scheme_and_loses_trailing_slash() {
        assert_eq!(normalize_base_url("rooms.example.com/"), "https://rooms.example.com");
        assert_eq!(
            normalize_base_url(" http://localhost:5000// "),
            "http://localhost:5000"
        );
    }

    #[test]
    fn unreachable_server_is_a_transport_error() {
        let backend = HttpRoomBackend::new("http://127.0.0.1:9");
        let room_id = RoomId::parse("r").expect("room id should parse");
        let err = backend
            .get_history(&room_id)
            .expect_err("nothing listens on the discard port");
        assert!(err.is_transport());
    }
}
