use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};
use url::Url;

pub const INVITE_PARAM: &str = "join";

static NEXT_ROOM_EPOCH: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Returns `None` for blank identifiers.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who authored an authoritative message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum MessageOrigin {
    Human { sender: String },
    Assistant,
    System,
}

impl MessageOrigin {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Human { .. } => "Human",
            Self::Assistant => "Assistant",
            Self::System => "System",
        }
    }
}

/// A message as recorded by the store. Never mutated after it is received.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub sequence: u64,
    pub sender: String,
    pub body: String,
    pub attachment_ref: Option<String>,
    pub origin: MessageOrigin,
    pub created_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn is_from(&self, sender: &str) -> bool {
        matches!(&self.origin, MessageOrigin::Human { sender: author } if author == sender)
    }
}

/// Explicit per-room context. One is created on room entry and dropped on exit;
/// nothing in the crate holds an implicit "current room".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomContext {
    pub room_id: RoomId,
    pub display_name: String,
    pub guest: bool,
    pub epoch: u64,
    pub entered_at_utc_ms: u64,
}

impl RoomContext {
    pub fn enter(room_id: RoomId, display_name: impl Into<String>, guest: bool) -> Self {
        let display_name = display_name.into();
        let display_name = if display_name.trim().is_empty() {
            "Guest".to_string()
        } else {
            display_name.trim().to_string()
        };
        Self {
            room_id,
            display_name,
            guest,
            epoch: NEXT_ROOM_EPOCH.fetch_add(1, Ordering::Relaxed),
            entered_at_utc_ms: now_utc_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum QuickAction {
    Ideas,
    Risks,
    Plan,
}

impl QuickAction {
    pub fn prompt(self) -> &'static str {
        match self {
            Self::Ideas => "@AI Brainstorm 3 innovative ideas for this project.",
            Self::Risks => "@AI Analyze potential risks and pitfalls.",
            Self::Plan => "@AI Create a step-by-step execution plan.",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InviteError {
    #[error("invalid application origin: {0}")]
    Origin(#[from] url::ParseError),
}

/// Builds `<origin>/?join=<room>`.
pub fn invite_link(app_origin: &str, room_id: &RoomId) -> Result<Url, InviteError> {
    let mut link = Url::parse(app_origin.trim())?;
    link.set_path("/");
    link.set_fragment(None);
    link.query_pairs_mut()
        .clear()
        .append_pair(INVITE_PARAM, room_id.as_str());
    Ok(link)
}

pub fn room_from_invite(link: &str) -> Option<RoomId> {
    let parsed = Url::parse(link.trim()).ok()?;
    parsed
        .query_pairs()
        .find(|(key, _)| key == INVITE_PARAM)
        .and_then(|(_, value)| RoomId::parse(&value))
}

pub(crate) fn now_utc_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invite_link_round_trips_room_id() {
        let room = RoomId::parse("alpha team").expect("room id should parse");
        let link = invite_link("https://rooms.example.com/app?x=1#top", &room)
            .expect("origin should parse");
        assert_eq!(link.as_str(), "https://rooms.example.com/?join=alpha+team");
        assert_eq!(room_from_invite(link.as_str()), Some(room));
    }

    #[test]
    fn invite_without_join_param_is_ignored() {
        assert_eq!(room_from_invite("https://rooms.example.com/?other=1"), None);
        assert_eq!(room_from_invite("https://rooms.example.com/?join=%20"), None);
        assert_eq!(room_from_invite("not a url"), None);
    }

    #[test]
    fn each_room_entry_gets_a_fresh_epoch() {
        let room = RoomId::parse("r1").expect("room id should parse");
        let first = RoomContext::enter(room.clone(), "Ana", false);
        let second = RoomContext::enter(room, "  ", true);
        assert!(second.epoch > first.epoch);
        assert_eq!(second.display_name, "Guest");
    }

    #[test]
    fn human_origin_matches_sender_without_name_heuristics() {
        let message = Message {
            sequence: 1,
            sender: "Ana".to_string(),
            body: "hi".to_string(),
            attachment_ref: None,
            origin: MessageOrigin::Human {
                sender: "Ana".to_string(),
            },
            created_at: None,
        };
        assert!(message.is_from("Ana"));
        let assistant = Message {
            origin: MessageOrigin::Assistant,
            ..message
        };
        assert!(!assistant.is_from("Ana"));
    }
}
