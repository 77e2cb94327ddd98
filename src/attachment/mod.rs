use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

const DOCUMENT_MIME_TYPES: &[&str] = &[
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.oasis.opendocument.text",
    "application/rtf",
];

/// An encoded file ready to ride along with a send request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub mime_type: String,
    #[serde(skip_serializing)]
    pub base64_data: String,
    pub filename: String,
    pub size_bytes: u64,
}

impl Attachment {
    pub fn decode_bytes(&self) -> Result<Vec<u8>, AttachmentError> {
        STANDARD
            .decode(&self.base64_data)
            .map_err(|err| AttachmentError::Read(format!("payload is not base64: {err}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttachmentError {
    #[error("unsupported attachment type: {0}")]
    UnsupportedType(String),
    #[error("attachment is {size_bytes} bytes; the limit is {max_bytes}")]
    TooLarge { size_bytes: u64, max_bytes: u64 },
    #[error("failed to read attachment: {0}")]
    Read(String),
    #[error("attachment was replaced or discarded before it was ready")]
    Cancelled,
    #[error("no attachment is staged")]
    NothingStaged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentSource {
    pub path: PathBuf,
    /// Caller-declared type; inferred from the extension when absent.
    pub mime_type: Option<String>,
}

impl AttachmentSource {
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            mime_type: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageState {
    Empty,
    Encoding { filename: String },
    Ready(Arc<Attachment>),
    Error { filename: String, error: AttachmentError },
}

impl StageState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Encoding { .. } => "encoding",
            Self::Ready(_) => "ready",
            Self::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone)]
struct StagedFile {
    path: PathBuf,
    mime_type: String,
    filename: String,
}

#[derive(Debug)]
struct Slot {
    generation: u64,
    file: StagedFile,
    state: watch::Sender<StageState>,
    cancel: CancellationToken,
}

#[derive(Debug)]
struct StagerShared {
    max_bytes: u64,
    next_generation: AtomicU64,
    current: Mutex<Option<Slot>>,
    state: watch::Sender<StageState>,
}

impl StagerShared {
    fn lock(&self) -> MutexGuard<'_, Option<Slot>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A staged attachment handed to one submit. Resolves once encoding settles.
#[derive(Debug)]
pub struct AttachmentTicket {
    filename: String,
    state: watch::Receiver<StageState>,
}

impl AttachmentTicket {
    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn is_ready(&self) -> bool {
        matches!(&*self.state.borrow(), StageState::Ready(_))
    }

    pub async fn wait_ready(mut self) -> Result<Arc<Attachment>, AttachmentError> {
        loop {
            match &*self.state.borrow_and_update() {
                StageState::Ready(attachment) => return Ok(Arc::clone(attachment)),
                StageState::Error { error, .. } => return Err(error.clone()),
                StageState::Empty => return Err(AttachmentError::Cancelled),
                StageState::Encoding { .. } => {}
            }
            if self.state.changed().await.is_err() {
                return match &*self.state.borrow() {
                    StageState::Ready(attachment) => Ok(Arc::clone(attachment)),
                    StageState::Error { error, .. } => Err(error.clone()),
                    _ => Err(AttachmentError::Cancelled),
                };
            }
        }
    }
}

/// Holds at most one attachment. Staging a new file replaces the old one.
#[derive(Debug, Clone)]
pub struct AttachmentStager {
    shared: Arc<StagerShared>,
}

impl AttachmentStager {
    pub fn new(max_bytes: u64) -> Self {
        let (state, _) = watch::channel(StageState::Empty);
        Self {
            shared: Arc::new(StagerShared {
                max_bytes,
                next_generation: AtomicU64::new(1),
                current: Mutex::new(None),
                state,
            }),
        }
    }

    pub fn state(&self) -> StageState {
        self.shared.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StageState> {
        self.shared.state.subscribe()
    }

    /// Validates type and size, then encodes in the background. A rejected
    /// file leaves whatever is already staged untouched.
    pub async fn accept(&self, source: AttachmentSource) -> Result<(), AttachmentError> {
        let filename = source
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "attachment".to_string());
        let mime_type = source
            .mime_type
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_ascii_lowercase)
            .or_else(|| infer_mime_type(&source.path).map(str::to_string))
            .ok_or_else(|| AttachmentError::UnsupportedType(filename.clone()))?;
        if !is_allowed_mime_type(&mime_type) {
            return Err(AttachmentError::UnsupportedType(mime_type));
        }

        let metadata = tokio::fs::metadata(&source.path)
            .await
            .map_err(|err| AttachmentError::Read(err.to_string()))?;
        if metadata.len() > self.shared.max_bytes {
            return Err(AttachmentError::TooLarge {
                size_bytes: metadata.len(),
                max_bytes: self.shared.max_bytes,
            });
        }

        self.stage(StagedFile {
            path: source.path,
            mime_type,
            filename,
        });
        Ok(())
    }

    /// Re-reads the file of a slot whose encode failed.
    pub fn retry(&self) -> Result<(), AttachmentError> {
        let file = {
            let current = self.shared.lock();
            match current.as_ref() {
                Some(slot) if matches!(&*slot.state.borrow(), StageState::Error { .. }) => {
                    slot.file.clone()
                }
                _ => return Err(AttachmentError::NothingStaged),
            }
        };
        self.stage(file);
        Ok(())
    }

    pub fn discard(&self) {
        let previous = self.shared.lock().take();
        if let Some(slot) = previous {
            slot.cancel.cancel();
            tracing::debug!(filename = %slot.file.filename, "staged attachment discarded");
        }
        self.shared.state.send_replace(StageState::Empty);
    }

    /// Hands the staged file to the next submit. A slot whose encode already
    /// failed stays staged for `retry` or `discard` and is never attached.
    pub fn take(&self) -> Option<AttachmentTicket> {
        let slot = {
            let mut current = self.shared.lock();
            let failed = current
                .as_ref()
                .is_some_and(|slot| matches!(&*slot.state.borrow(), StageState::Error { .. }));
            if failed {
                return None;
            }
            current.take()?
        };
        self.shared.state.send_replace(StageState::Empty);
        Some(AttachmentTicket {
            filename: slot.file.filename.clone(),
            state: slot.state.subscribe(),
        })
    }

    fn stage(&self, file: StagedFile) {
        let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed);
        let encoding = StageState::Encoding {
            filename: file.filename.clone(),
        };
        let (slot_state, _) = watch::channel(encoding.clone());
        let cancel = CancellationToken::new();
        let slot = Slot {
            generation,
            file: file.clone(),
            state: slot_state.clone(),
            cancel: cancel.clone(),
        };

        let previous = {
            let mut current = self.shared.lock();
            let previous = current.replace(slot);
            self.shared.state.send_replace(encoding);
            previous
        };
        if let Some(previous) = previous {
            previous.cancel.cancel();
            tracing::debug!(
                replaced = %previous.file.filename,
                filename = %file.filename,
                "staged attachment replaced"
            );
        }

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = encode_file(&file) => result,
            };
            let state = match result {
                Ok(attachment) => StageState::Ready(Arc::new(attachment)),
                Err(error) => {
                    tracing::warn!(filename = %file.filename, %error, "attachment encode failed");
                    StageState::Error {
                        filename: file.filename.clone(),
                        error,
                    }
                }
            };
            slot_state.send_replace(state.clone());
            let current = shared.lock();
            if current.as_ref().map(|slot| slot.generation) == Some(generation) {
                shared.state.send_replace(state);
            }
        });
    }
}

async fn encode_file(file: &StagedFile) -> Result<Attachment, AttachmentError> {
    let bytes = tokio::fs::read(&file.path)
        .await
        .map_err(|err| AttachmentError::Read(err.to_string()))?;
    let size_bytes = bytes.len() as u64;
    let base64_data = tokio::task::spawn_blocking(move || STANDARD.encode(bytes))
        .await
        .map_err(|err| AttachmentError::Read(format!("encode task failed: {err}")))?;
    Ok(Attachment {
        mime_type: file.mime_type.clone(),
        base64_data,
        filename: file.filename.clone(),
        size_bytes,
    })
}

pub fn is_allowed_mime_type(mime_type: &str) -> bool {
    let mime_type = mime_type.trim().to_ascii_lowercase();
    (mime_type.starts_with("image/") && mime_type.len() > "image/".len())
        || DOCUMENT_MIME_TYPES.contains(&mime_type.as_str())
}

pub fn infer_mime_type(path: &Path) -> Option<&'static str> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    let mime_type = match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "svg" => "image/svg+xml",
        "heic" => "image/heic",
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "odt" => "application/vnd.oasis.opendocument.text",
        "rtf" => "application/rtf",
        _ => return None,
    };
    Some(mime_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_file(name: &str, bytes: &[u8]) -> PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock should be valid")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("roomsync-attach-{ts}"));
        std::fs::create_dir_all(&dir).expect("temp dir should be created");
        let path = dir.join(name);
        std::fs::write(&path, bytes).expect("temp file should be written");
        path
    }

    #[test]
    fn allow_list_covers_images_and_documents() {
        assert!(is_allowed_mime_type("image/png"));
        assert!(is_allowed_mime_type("application/pdf"));
        assert!(!is_allowed_mime_type("image/"));
        assert!(!is_allowed_mime_type("application/zip"));
        assert_eq!(
            infer_mime_type(Path::new("notes.DOCX")),
            Some("application/vnd.openxmlformats-officedocument.wordprocessingml.document")
        );
        assert_eq!(infer_mime_type(Path::new("archive.tar")), None);
    }

    #[tokio::test]
    async fn ready_ticket_resolves_to_base64_payload() {
        let stager = AttachmentStager::new(1024);
        let path = temp_file("photo.png", b"png-bytes");
        stager
            .accept(AttachmentSource::from_path(&path))
            .await
            .expect("png should be accepted");
        let ticket = stager.take().expect("slot should be staged");
        assert_eq!(stager.state(), StageState::Empty);
        assert_eq!(ticket.filename(), "photo.png");

        let attachment = ticket.wait_ready().await.expect("encode should succeed");
        assert_eq!(attachment.mime_type, "image/png");
        assert_eq!(attachment.size_bytes, 9);
        assert_eq!(
            attachment.decode_bytes().expect("payload should decode"),
            b"png-bytes"
        );
    }

    #[tokio::test]
    async fn rejected_file_keeps_previous_attachment() {
        let stager = AttachmentStager::new(16);
        let good = temp_file("a.pdf", b"pdf");
        let big = temp_file("b.pdf", &[0u8; 64]);
        let zip = temp_file("c.zip", b"zip");

        stager
            .accept(AttachmentSource::from_path(&good))
            .await
            .expect("small pdf should be accepted");
        let too_large = stager.accept(AttachmentSource::from_path(&big)).await;
        assert_eq!(
            too_large,
            Err(AttachmentError::TooLarge {
                size_bytes: 64,
                max_bytes: 16
            })
        );
        assert!(matches!(
            stager.accept(AttachmentSource::from_path(&zip)).await,
            Err(AttachmentError::UnsupportedType(_))
        ));

        let ticket = stager.take().expect("first file should remain staged");
        assert_eq!(ticket.filename(), "a.pdf");
    }

    #[tokio::test]
    async fn missing_file_is_a_read_error() {
        let stager = AttachmentStager::new(16);
        let result = stager
            .accept(AttachmentSource::from_path(
                std::env::temp_dir().join("roomsync-missing-file.png"),
            ))
            .await;
        assert!(matches!(result, Err(AttachmentError::Read(_))));
        assert!(stager.take().is_none());
        assert_eq!(stager.retry(), Err(AttachmentError::NothingStaged));
    }

    #[tokio::test]
    async fn failed_encode_stays_staged_instead_of_riding_along() {
        let stager = AttachmentStager::new(1024 * 1024);
        let path = temp_file("placeholder", b"");
        let unreadable = path.with_file_name("broken.png");
        std::fs::create_dir_all(&unreadable).expect("directory should be created");
        stager
            .accept(AttachmentSource::from_path(&unreadable))
            .await
            .expect("directory passes the metadata check");

        let mut state = stager.subscribe();
        state
            .wait_for(|state| matches!(state, StageState::Error { .. }))
            .await
            .expect("stager should stay alive");

        assert!(stager.take().is_none());
        assert_eq!(stager.state().label(), "error");
        assert_eq!(stager.retry(), Ok(()));
    }

    #[tokio::test]
    async fn discard_empties_the_stager() {
        let stager = AttachmentStager::new(1024);
        let path = temp_file("doc.rtf", b"{rtf}");
        stager
            .accept(AttachmentSource::from_path(&path))
            .await
            .expect("rtf should be accepted");
        stager.discard();
        assert_eq!(stager.state(), StageState::Empty);
        assert!(stager.take().is_none());
    }
}
