use crate::room::{room_from_invite, RoomId};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

const GUEST_NAME: &str = "Guest";

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct StoredSession {
    pub last_room_id: Option<RoomId>,
    pub display_name: Option<String>,
}

/// How the client enters a room on launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryDecision {
    /// Opened through an invite link; skips normal entry.
    Invite {
        room_id: RoomId,
        display_name: String,
    },
    Resume {
        room_id: RoomId,
        display_name: String,
    },
    /// The user has to pick a room and a name.
    Fresh,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to read session file: {0}")]
    Read(std::io::Error),
    #[error("failed to write session file: {0}")]
    Write(std::io::Error),
    #[error("failed to parse session JSON: {0}")]
    Parse(serde_json::Error),
    #[error("cannot resolve app data directory")]
    AppData,
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new() -> Result<Self, SessionError> {
        let proj_dirs =
            ProjectDirs::from("com", "roomsync", "core").ok_or(SessionError::AppData)?;
        Ok(Self {
            path: proj_dirs.data_dir().join("session.json"),
        })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn load(&self) -> Result<StoredSession, SessionError> {
        if !self.path.exists() {
            return Ok(StoredSession::default());
        }
        let raw = fs::read_to_string(&self.path).map_err(SessionError::Read)?;
        serde_json::from_str(&raw).map_err(SessionError::Parse)
    }

    pub fn remember(&self, room_id: &RoomId, display_name: &str) -> Result<(), SessionError> {
        self.save(&StoredSession {
            last_room_id: Some(room_id.clone()),
            display_name: Some(display_name.to_string()),
        })
    }

    /// Forgets both the room and the display name.
    pub fn forget(&self) -> Result<(), SessionError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(SessionError::Write(err)),
        }
    }

    fn save(&self, session: &StoredSession) -> Result<(), SessionError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(SessionError::Write)?;
        }
        let raw = serde_json::to_string_pretty(session).map_err(SessionError::Parse)?;
        fs::write(&self.path, raw).map_err(SessionError::Write)
    }
}

/// Invite link first, then the stored session, otherwise a fresh entry.
pub fn resolve_entry(invite_link: Option<&str>, stored: &StoredSession) -> EntryDecision {
    let stored_name = stored
        .display_name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty());

    if let Some(room_id) = invite_link.and_then(room_from_invite) {
        return EntryDecision::Invite {
            room_id,
            display_name: stored_name.unwrap_or(GUEST_NAME).to_string(),
        };
    }

    match (&stored.last_room_id, stored_name) {
        (Some(room_id), Some(name)) => EntryDecision::Resume {
            room_id: room_id.clone(),
            display_name: name.to_string(),
        },
        _ => EntryDecision::Fresh,
    }
}
