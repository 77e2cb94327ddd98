use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

pub const API_BASE_URL_ENV: &str = "ROOMSYNC_API_BASE_URL";

const MIN_POLL_INTERVAL_MS: u64 = 2_000;
const MAX_POLL_INTERVAL_MS: u64 = 5_000;
const MIN_SILENCE_TIMEOUT_MS: u64 = 1_000;
const MAX_SILENCE_TIMEOUT_MS: u64 = 15_000;
const MIN_RECONCILE_CYCLES: u32 = 1;
const MAX_RECONCILE_CYCLES: u32 = 20;
const MAX_SCROLL_THRESHOLD_PX: f32 = 400.0;
const MIN_ATTACHMENT_BYTES: u64 = 1024;
const MAX_ATTACHMENT_BYTES: u64 = 25 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentTransport {
    /// Base64 payload travels inside the send request.
    #[default]
    Inline,
    /// Bytes go to the asset endpoint first; the send request carries the URL.
    Hosted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct RoomSyncSettings {
    pub api_base_url: String,
    pub app_origin: String,
    pub poll_interval_ms: u64,
    pub silence_timeout_ms: u64,
    pub reconcile_max_cycles: u32,
    pub reconcile_window_ms: u64,
    pub scroll_threshold_px: f32,
    pub max_attachment_bytes: u64,
    pub attachment_transport: AttachmentTransport,
    pub narration_language: String,
    pub announce_entry: bool,
}

impl Default for RoomSyncSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:5000".to_string(),
            app_origin: "http://localhost:3000".to_string(),
            poll_interval_ms: 3_000,
            silence_timeout_ms: 5_000,
            reconcile_max_cycles: 3,
            reconcile_window_ms: 5 * 60 * 1000,
            scroll_threshold_px: 50.0,
            max_attachment_bytes: 10 * 1024 * 1024,
            attachment_transport: AttachmentTransport::Inline,
            narration_language: "en-US".to_string(),
            announce_entry: true,
        }
    }
}

impl RoomSyncSettings {
    /// Pulls every knob back into its supported range.
    pub fn clamped(mut self) -> Self {
        self.poll_interval_ms = self
            .poll_interval_ms
            .clamp(MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS);
        self.silence_timeout_ms = self
            .silence_timeout_ms
            .clamp(MIN_SILENCE_TIMEOUT_MS, MAX_SILENCE_TIMEOUT_MS);
        self.reconcile_max_cycles = self
            .reconcile_max_cycles
            .clamp(MIN_RECONCILE_CYCLES, MAX_RECONCILE_CYCLES);
        self.scroll_threshold_px = if self.scroll_threshold_px.is_finite() {
            self.scroll_threshold_px.clamp(0.0, MAX_SCROLL_THRESHOLD_PX)
        } else {
            RoomSyncSettings::default().scroll_threshold_px
        };
        self.max_attachment_bytes = self
            .max_attachment_bytes
            .clamp(MIN_ATTACHMENT_BYTES, MAX_ATTACHMENT_BYTES);
        if self.narration_language.trim().is_empty() {
            self.narration_language = RoomSyncSettings::default().narration_language;
        }
        self
    }

    fn with_env_overrides(mut self) -> Self {
        if let Some(url) = std::env::var(API_BASE_URL_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
        {
            self.api_base_url = url.trim().to_string();
        }
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Read(std::io::Error),
    #[error("failed to write settings file: {0}")]
    Write(std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Parse(serde_json::Error),
    #[error("cannot resolve app data directory")]
    AppData,
}

#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new() -> Result<Self, SettingsError> {
        let proj_dirs =
            ProjectDirs::from("com", "roomsync", "core").ok_or(SettingsError::AppData)?;
        let path = proj_dirs.config_dir().join("settings.json");
        Ok(Self { path })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn load(&self) -> Result<RoomSyncSettings, SettingsError> {
        let settings = if self.path.exists() {
            let raw = fs::read_to_string(&self.path).map_err(SettingsError::Read)?;
            serde_json::from_str::<RoomSyncSettings>(&raw).map_err(SettingsError::Parse)?
        } else {
            RoomSyncSettings::default()
        };
        Ok(settings.with_env_overrides().clamped())
    }

    pub fn save(&self, settings: &RoomSyncSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(SettingsError::Write)?;
        }
        let raw = serde_json::to_string_pretty(settings).map_err(SettingsError::Parse)?;
        fs::write(&self.path, raw).map_err(SettingsError::Write)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_settings_path() -> PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock should be valid")
            .as_nanos();
        std::env::temp_dir().join(format!("roomsync-settings-{ts}.json"))
    }

    #[test]
    fn load_returns_default_if_missing() {
        let store = SettingsStore::from_path(temp_settings_path());
        let loaded = store.load().expect("load should succeed");
        assert_eq!(loaded.poll_interval_ms, 3_000);
        assert_eq!(loaded.silence_timeout_ms, 5_000);
        assert_eq!(loaded.attachment_transport, AttachmentTransport::Inline);
    }

    #[test]
    fn save_then_load_clamps_out_of_range_values() {
        let path = temp_settings_path();
        let store = SettingsStore::from_path(path.clone());
        let settings = RoomSyncSettings {
            poll_interval_ms: 250,
            silence_timeout_ms: 60_000,
            reconcile_max_cycles: 0,
            scroll_threshold_px: 900.0,
            attachment_transport: AttachmentTransport::Hosted,
            ..RoomSyncSettings::default()
        };

        store.save(&settings).expect("save should succeed");
        let loaded = store.load().expect("load should succeed");

        assert_eq!(loaded.poll_interval_ms, MIN_POLL_INTERVAL_MS);
        assert_eq!(loaded.silence_timeout_ms, MAX_SILENCE_TIMEOUT_MS);
        assert_eq!(loaded.reconcile_max_cycles, MIN_RECONCILE_CYCLES);
        assert_eq!(loaded.scroll_threshold_px, MAX_SCROLL_THRESHOLD_PX);
        assert_eq!(loaded.attachment_transport, AttachmentTransport::Hosted);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn non_finite_threshold_resets_to_default() {
        let settings = RoomSyncSettings {
            scroll_threshold_px: f32::INFINITY,
            ..RoomSyncSettings::default()
        }
        .clamped();
        assert_eq!(settings.scroll_threshold_px, 50.0);
    }

    #[test]
    fn partial_file_falls_back_to_defaults_per_field() {
        let path = temp_settings_path();
        std::fs::write(&path, r#"{"pollIntervalMs": 4000}"#).expect("write should succeed");
        let loaded = SettingsStore::from_path(path.clone())
            .load()
            .expect("load should succeed");
        assert_eq!(loaded.poll_interval_ms, 4_000);
        assert_eq!(loaded.reconcile_max_cycles, 3);
        let _ = std::fs::remove_file(path);
    }
}
