use crate::{
    room::{now_utc_ms, Message, RoomId},
    timeline::TimelineEntry,
    transcript::transcript_body,
};
use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

const BUNDLE_VERSION: u8 = 1;
const PAGE_WIDTH: usize = 80;
const PAGE_HEIGHT: usize = 60;
const FORM_FEED: char = '\u{000C}';

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Transcript,
    Csv,
    Json,
    Print,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Transcript => "txt",
            Self::Csv => "csv",
            Self::Json => "json",
            Self::Print => "prn",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Transcript => "transcript",
            Self::Csv => "csv",
            Self::Json => "json",
            Self::Print => "print",
        })
    }
}

impl FromStr for ExportFormat {
    type Err = ExportError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "transcript" | "txt" | "text" => Ok(Self::Transcript),
            "csv" => Ok(Self::Csv),
            "json" => Ok(Self::Json),
            "print" | "prn" => Ok(Self::Print),
            other => Err(ExportError::UnknownFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExportResult {
    pub file_path: String,
    pub exported_at_utc_ms: u64,
    pub record_count: usize,
}

/// Full-fidelity room dump that `import_history` accepts back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoomBundle {
    pub version: u8,
    pub room_id: RoomId,
    pub exported_at_utc_ms: u64,
    pub messages: Vec<Message>,
}

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("nothing to export")]
    Empty,
    #[error("unknown export format: {0}")]
    UnknownFormat(String),
    #[error("failed to read export: {0}")]
    Read(std::io::Error),
    #[error("failed to write export: {0}")]
    Write(std::io::Error),
    #[error("failed to parse export JSON: {0}")]
    Parse(serde_json::Error),
    #[error("unsupported bundle version {0}")]
    UnsupportedVersion(u8),
    #[error("cannot resolve app data directory")]
    AppData,
}

pub struct ExportManager {
    export_dir: PathBuf,
}

impl ExportManager {
    pub fn new() -> Result<Self, ExportError> {
        let proj_dirs =
            ProjectDirs::from("com", "roomsync", "core").ok_or(ExportError::AppData)?;
        Ok(Self {
            export_dir: proj_dirs.data_dir().join("exports"),
        })
    }

    pub fn from_dir(export_dir: impl AsRef<Path>) -> Self {
        Self {
            export_dir: export_dir.as_ref().to_path_buf(),
        }
    }

    pub fn export_dir(&self) -> &Path {
        &self.export_dir
    }

    pub fn export(
        &self,
        room_id: &RoomId,
        entries: &[TimelineEntry],
        format: ExportFormat,
    ) -> Result<ExportResult, ExportError> {
        if entries.is_empty() {
            return Err(ExportError::Empty);
        }
        let exported_at = now_utc_ms();
        let generated_at = DateTime::<Utc>::from_timestamp_millis(exported_at as i64)
            .unwrap_or_else(Utc::now);
        let (content, record_count) = match format {
            ExportFormat::Transcript => (
                render_transcript(room_id, entries, generated_at),
                entries.len(),
            ),
            ExportFormat::Csv => (render_csv(entries), entries.len()),
            ExportFormat::Print => (render_print(room_id, entries), entries.len()),
            ExportFormat::Json => {
                let messages = confirmed_messages(entries);
                if messages.is_empty() {
                    return Err(ExportError::Empty);
                }
                let count = messages.len();
                let bundle = RoomBundle {
                    version: BUNDLE_VERSION,
                    room_id: room_id.clone(),
                    exported_at_utc_ms: exported_at,
                    messages,
                };
                (
                    serde_json::to_string_pretty(&bundle).map_err(ExportError::Parse)?,
                    count,
                )
            }
        };

        fs::create_dir_all(&self.export_dir).map_err(ExportError::Write)?;
        let filename = format!(
            "roomsync-{}-{exported_at}.{}",
            file_safe(room_id.as_str()),
            format.extension()
        );
        let file_path = self.export_dir.join(filename);
        fs::write(&file_path, content).map_err(ExportError::Write)?;
        tracing::info!(
            room_id = %room_id,
            %format,
            record_count,
            path = %file_path.display(),
            "room exported"
        );

        Ok(ExportResult {
            file_path: file_path.to_string_lossy().to_string(),
            exported_at_utc_ms: exported_at,
            record_count,
        })
    }

    pub fn load_bundle(&self, path: impl AsRef<Path>) -> Result<RoomBundle, ExportError> {
        let raw = fs::read_to_string(path).map_err(ExportError::Read)?;
        parse_bundle(&raw)
    }
}

pub fn parse_bundle(raw: &str) -> Result<RoomBundle, ExportError> {
    let bundle = serde_json::from_str::<RoomBundle>(raw).map_err(ExportError::Parse)?;
    if bundle.version != BUNDLE_VERSION {
        return Err(ExportError::UnsupportedVersion(bundle.version));
    }
    Ok(bundle)
}

pub fn render_transcript(
    room_id: &RoomId,
    entries: &[TimelineEntry],
    generated_at: DateTime<Utc>,
) -> String {
    let mut out = format!(
        "ROOM TRANSCRIPT\nDATE: {}\nROOM: {room_id}\n-------------------\n\n",
        generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    for entry in entries {
        out.push_str(&format!(
            "[{}]:\n{}\n\n",
            entry.sender(),
            transcript_body(entry.body())
        ));
    }
    out
}

/// Columns `Timestamp, Sender, Type, Content`; every field quoted.
pub fn render_csv(entries: &[TimelineEntry]) -> String {
    let mut rows = vec![csv_row(["Timestamp", "Sender", "Type", "Content"])];
    for entry in entries {
        let (timestamp, kind) = match entry {
            TimelineEntry::Confirmed { message } => (
                message
                    .created_at
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_default(),
                message.origin.label().to_string(),
            ),
            TimelineEntry::Pending { message } => (
                message.created_at.to_rfc3339(),
                format!("Pending ({})", message.state.label()),
            ),
        };
        rows.push(csv_row([
            timestamp.as_str(),
            entry.sender(),
            kind.as_str(),
            entry.body(),
        ]));
    }
    rows.join("\n")
}

/// Fixed 80x60 pages separated by form feeds.
pub fn render_print(room_id: &RoomId, entries: &[TimelineEntry]) -> String {
    let mut lines = Vec::new();
    for entry in entries {
        let heading = match entry {
            TimelineEntry::Confirmed { message } => format!("[{}]", message.sender),
            TimelineEntry::Pending { message } => {
                format!("[{}] ({})", message.sender, message.state.label())
            }
        };
        lines.extend(wrap(&heading, PAGE_WIDTH));
        for paragraph in transcript_body(entry.body()).lines() {
            lines.extend(wrap(paragraph, PAGE_WIDTH));
        }
        lines.push(String::new());
    }

    let body_height = PAGE_HEIGHT - 2;
    let page_count = lines.len().div_ceil(body_height).max(1);
    let mut pages = Vec::with_capacity(page_count);
    for page in 0..page_count {
        let mut text = wrap(&format!("ROOM {room_id}  PAGE {}/{page_count}", page + 1), PAGE_WIDTH)
            .into_iter()
            .next()
            .unwrap_or_default();
        text.push_str("\n\n");
        let start = page * body_height;
        let end = (start + body_height).min(lines.len());
        text.push_str(&lines[start..end].join("\n"));
        pages.push(text);
    }
    pages.join(&format!("\n{FORM_FEED}"))
}

fn confirmed_messages(entries: &[TimelineEntry]) -> Vec<Message> {
    entries
        .iter()
        .filter_map(|entry| match entry {
            TimelineEntry::Confirmed { message } => Some(message.clone()),
            TimelineEntry::Pending { .. } => None,
        })
        .collect()
}

fn csv_row<'a>(fields: impl IntoIterator<Item = &'a str>) -> String {
    fields
        .into_iter()
        .map(|field| format!("\"{}\"", field.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(",")
}

fn wrap(text: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        let mut word = word.to_string();
        while word.chars().count() > width {
            if !current.is_empty() {
                lines.push(std::mem::take(&mut current));
            }
            let split_at = word
                .char_indices()
                .nth(width)
                .map(|(idx, _)| idx)
                .unwrap_or(word.len());
            let rest = word.split_off(split_at);
            lines.push(word);
            word = rest;
        }
        let needed = if current.is_empty() {
            word.chars().count()
        } else {
            current.chars().count() + 1 + word.chars().count()
        };
        if needed > width {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(&word);
    }
    if !current.is_empty() || lines.is_empty() {
        lines.push(current);
    }
    lines
}

fn file_safe(raw: &str) -> String {
    raw.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}
