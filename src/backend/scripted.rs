use super::{
    parse_history_payload, AssetUpload, BackendError, OutboundAttachment, RoomBackend, SenderRole,
    SendRequest, SendResponse, UploadedAsset,
};
use crate::room::{Message, MessageOrigin, RoomId};
use chrono::Utc;
use serde_json::Value;
use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard},
};

#[derive(Debug, Default)]
struct ScriptState {
    rooms: HashMap<RoomId, Vec<Message>>,
    echo_sends: bool,
    next_sequence: u64,
    history_script: VecDeque<Result<Value, BackendError>>,
    send_script: VecDeque<Result<SendResponse, BackendError>>,
    upload_errors: VecDeque<BackendError>,
    sends: Vec<SendRequest>,
    uploads: Vec<AssetUpload>,
    history_calls: usize,
    clear_calls: usize,
}

/// In-process store with scriptable responses. Used by the harness binary's
/// `--scripted` mode and by tests.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    state: Mutex<ScriptState>,
}

impl ScriptedBackend {
    /// Successful sends are appended to the room, like the real store does.
    pub fn echoing() -> Self {
        let backend = Self::default();
        backend.lock().echo_sends = true;
        backend
    }

    /// Sends are acknowledged but never recorded.
    pub fn silent() -> Self {
        Self::default()
    }

    pub fn set_echo(&self, enabled: bool) {
        self.lock().echo_sends = enabled;
    }

    /// Next history call returns this raw payload instead of the stored room.
    pub fn push_history_payload(&self, payload: Value) {
        self.lock().history_script.push_back(Ok(payload));
    }

    pub fn push_history_error(&self, error: BackendError) {
        self.lock().history_script.push_back(Err(error));
    }

    pub fn push_send_outcome(&self, outcome: Result<SendResponse, BackendError>) {
        self.lock().send_script.push_back(outcome);
    }

    /// Next upload fails with this error and is not recorded.
    pub fn push_upload_error(&self, error: BackendError) {
        self.lock().upload_errors.push_back(error);
    }

    /// Appends a message as if another participant (or the assistant) wrote it.
    pub fn append(&self, room_id: &RoomId, sender: &str, body: &str, origin: MessageOrigin) -> Message {
        let mut state = self.lock();
        state.next_sequence += 1;
        let message = Message {
            sequence: state.next_sequence,
            sender: sender.to_string(),
            body: body.to_string(),
            attachment_ref: None,
            origin,
            created_at: Some(Utc::now()),
        };
        state
            .rooms
            .entry(room_id.clone())
            .or_default()
            .push(message.clone());
        message
    }

    pub fn append_human(&self, room_id: &RoomId, sender: &str, body: &str) -> Message {
        self.append(
            room_id,
            sender,
            body,
            MessageOrigin::Human {
                sender: sender.to_string(),
            },
        )
    }

    pub fn messages(&self, room_id: &RoomId) -> Vec<Message> {
        self.lock().rooms.get(room_id).cloned().unwrap_or_default()
    }

    pub fn sends(&self) -> Vec<SendRequest> {
        self.lock().sends.clone()
    }

    pub fn uploads(&self) -> Vec<AssetUpload> {
        self.lock().uploads.clone()
    }

    pub fn history_calls(&self) -> usize {
        self.lock().history_calls
    }

    pub fn clear_calls(&self) -> usize {
        self.lock().clear_calls
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RoomBackend for ScriptedBackend {
    fn get_history(&self, room_id: &RoomId) -> Result<Vec<Message>, BackendError> {
        let mut state = self.lock();
        state.history_calls += 1;
        if let Some(scripted) = state.history_script.pop_front() {
            return parse_history_payload(scripted?);
        }
        Ok(state.rooms.get(room_id).cloned().unwrap_or_default())
    }

    fn send_message(&self, request: &SendRequest) -> Result<SendResponse, BackendError> {
        let mut state = self.lock();
        state.sends.push(request.clone());
        let outcome = state
            .send_script
            .pop_front()
            .unwrap_or_else(|| Ok(SendResponse::stored()));
        if outcome.is_ok() && state.echo_sends && request.role == SenderRole::Participant {
            state.next_sequence += 1;
            let message = Message {
                sequence: state.next_sequence,
                sender: request.sender.clone(),
                body: request.body.clone(),
                attachment_ref: match &request.attachment {
                    Some(OutboundAttachment::Hosted { url, .. }) => Some(url.clone()),
                    Some(OutboundAttachment::Inline { filename, .. }) => Some(filename.clone()),
                    None => None,
                },
                origin: MessageOrigin::Human {
                    sender: request.sender.clone(),
                },
                created_at: Some(Utc::now()),
            };
            tracing::trace!(sequence = message.sequence, "scripted backend stored send");
            state
                .rooms
                .entry(request.room_id.clone())
                .or_default()
                .push(message);
        }
        outcome
    }

    fn clear_room(&self, room_id: &RoomId) -> Result<(), BackendError> {
        let mut state = self.lock();
        state.clear_calls += 1;
        state.rooms.remove(room_id);
        Ok(())
    }

    fn import_history(&self, room_id: &RoomId, messages: &[Message]) -> Result<(), BackendError> {
        let mut state = self.lock();
        let max_sequence = messages.iter().map(|m| m.sequence).max().unwrap_or(0);
        state.next_sequence = state.next_sequence.max(max_sequence);
        state
            .rooms
            .entry(room_id.clone())
            .or_default()
            .extend(messages.iter().cloned());
        Ok(())
    }

    fn upload_asset(&self, asset: &AssetUpload) -> Result<UploadedAsset, BackendError> {
        let mut state = self.lock();
        if let Some(error) = state.upload_errors.pop_front() {
            return Err(error);
        }
        state.uploads.push(asset.clone());
        Ok(UploadedAsset {
            url: format!("memory://assets/{}/{}", state.uploads.len(), asset.filename),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echoing_backend_records_participant_sends_only() {
        let backend = ScriptedBackend::echoing();
        let room_id = RoomId::parse("r").expect("room id should parse");
        let request = SendRequest {
            room_id: room_id.clone(),
            sender: "Ana".to_string(),
            body: "hi".to_string(),
            attachment: None,
            role: SenderRole::Participant,
        };
        backend.send_message(&request).expect("send should succeed");
        backend
            .send_message(&SendRequest {
                role: SenderRole::Welcome,
                ..request
            })
            .expect("welcome should succeed");

        let history = backend.get_history(&room_id).expect("history should load");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].body, "hi");
        assert_eq!(backend.sends().len(), 2);
    }

    #[test]
    fn scripted_history_payload_goes_through_the_parser() {
        let backend = ScriptedBackend::silent();
        let room_id = RoomId::parse("r").expect("room id should parse");
        backend.push_history_payload(serde_json::json!({"error": "boom"}));
        assert!(matches!(
            backend.get_history(&room_id),
            Err(BackendError::Protocol(_))
        ));
        assert_eq!(backend.get_history(&room_id), Ok(Vec::new()));
        assert_eq!(backend.history_calls(), 2);
    }
}
