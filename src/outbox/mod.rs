use crate::{
    attachment::{Attachment, AttachmentTicket},
    backend::{
        AssetUpload, BackendError, OutboundAttachment, RoomBackend, SendRequest, SendResponse,
        SenderRole,
    },
    quota::QuotaGate,
    room::RoomContext,
    settings::AttachmentTransport,
    sync::SyncTrigger,
    timeline::{MergeError, PendingMessage, PendingState, Settlement, SharedView, ViewChange},
};
use chrono::Utc;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("nothing to send")]
    Empty,
    #[error("usage limit reached; sending is locked")]
    QuotaLocked,
    #[error("no pending message with correlation id {0}")]
    UnknownMessage(u64),
    #[error("message {0} can only be resent after it failed or went unconfirmed")]
    NotResendable(u64),
    #[error("room view rejected the change: {0}")]
    View(MergeError),
}

impl From<MergeError> for SubmitError {
    fn from(value: MergeError) -> Self {
        match value {
            MergeError::UnknownPending(id) => Self::UnknownMessage(id),
            MergeError::NotResendable(id) => Self::NotResendable(id),
            other => Self::View(other),
        }
    }
}

/// How one send attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendSettlement {
    Stored { replied: bool },
    /// Stored, and the backend reported the usage limit as reached.
    QuotaLocked,
    Failed { reason: String },
}

#[derive(Debug)]
pub struct SubmitHandle {
    pub correlation_id: u64,
    task: JoinHandle<SendSettlement>,
}

impl SubmitHandle {
    pub async fn settled(self) -> SendSettlement {
        match self.task.await {
            Ok(settlement) => settlement,
            Err(err) => SendSettlement::Failed {
                reason: format!("send task failed: {err}"),
            },
        }
    }
}

enum PendingAttachment {
    None,
    Ticket(AttachmentTicket),
    Resolved(Arc<Attachment>),
}

/// Local echo plus fire-and-track sends. Submits never wait on each other.
#[derive(Clone)]
pub struct OptimisticOutbox {
    backend: Arc<dyn RoomBackend>,
    view: SharedView,
    quota: Arc<QuotaGate>,
    room: RoomContext,
    transport: AttachmentTransport,
    refresh: Option<SyncTrigger>,
    next_correlation_id: Arc<AtomicU64>,
    resolved: Arc<Mutex<HashMap<u64, Arc<Attachment>>>>,
}

impl OptimisticOutbox {
    pub fn new(
        backend: Arc<dyn RoomBackend>,
        view: SharedView,
        quota: Arc<QuotaGate>,
        room: RoomContext,
        transport: AttachmentTransport,
    ) -> Self {
        Self {
            backend,
            view,
            quota,
            room,
            transport,
            refresh: None,
            next_correlation_id: Arc::new(AtomicU64::new(1)),
            resolved: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Successful sends wake the sync loop so replies show up promptly.
    pub fn with_refresh(mut self, trigger: SyncTrigger) -> Self {
        self.refresh = Some(trigger);
        self
    }

    pub fn submit(
        &self,
        body: &str,
        attachment: Option<AttachmentTicket>,
    ) -> Result<SubmitHandle, SubmitError> {
        let body = body.trim().to_string();
        if body.is_empty() && attachment.is_none() {
            return Err(SubmitError::Empty);
        }
        if self.quota.is_locked() {
            return Err(SubmitError::QuotaLocked);
        }

        let correlation_id = self.next_correlation_id.fetch_add(1, Ordering::Relaxed);
        let pending = PendingMessage {
            correlation_id,
            sender: self.room.display_name.clone(),
            body: body.clone(),
            attachment_ref: attachment.as_ref().map(|t| t.filename().to_string()),
            created_at: Utc::now(),
            state: PendingState::Queued,
        };
        self.view.apply(ViewChange::Submitted(pending))?;
        self.prune_resolved();
        tracing::debug!(
            room_id = %self.room.room_id,
            correlation_id,
            with_attachment = attachment.is_some(),
            "message submitted"
        );

        let attachment = match attachment {
            Some(ticket) => PendingAttachment::Ticket(ticket),
            None => PendingAttachment::None,
        };
        Ok(self.spawn_delivery(correlation_id, body, attachment))
    }

    /// Re-sends a failed or unconfirmed message under the same correlation id.
    pub fn resend(&self, correlation_id: u64) -> Result<SubmitHandle, SubmitError> {
        if self.quota.is_locked() {
            return Err(SubmitError::QuotaLocked);
        }
        let pending = self
            .view
            .pending_by_id(correlation_id)
            .ok_or(SubmitError::UnknownMessage(correlation_id))?;
        let attachment = self.resolved_lock().get(&correlation_id).cloned();
        if pending.body.is_empty() && attachment.is_none() {
            return Err(SubmitError::Empty);
        }
        self.view.apply(ViewChange::Resend { correlation_id })?;
        tracing::info!(room_id = %self.room.room_id, correlation_id, "resending message");

        let attachment = match attachment {
            Some(resolved) => PendingAttachment::Resolved(resolved),
            None => PendingAttachment::None,
        };
        Ok(self.spawn_delivery(correlation_id, pending.body, attachment))
    }

    pub fn abandon(&self, correlation_id: u64) -> Result<(), SubmitError> {
        self.view.apply(ViewChange::Abandon { correlation_id })?;
        self.resolved_lock().remove(&correlation_id);
        Ok(())
    }

    /// Forgets every pending message; used when the room is cleared.
    pub fn reset(&self) {
        self.resolved_lock().clear();
    }

    fn spawn_delivery(
        &self,
        correlation_id: u64,
        body: String,
        attachment: PendingAttachment,
    ) -> SubmitHandle {
        let outbox = self.clone();
        let task = tokio::spawn(async move {
            let settlement = outbox.deliver(correlation_id, body, attachment).await;
            outbox.settle(correlation_id, &settlement);
            settlement
        });
        SubmitHandle {
            correlation_id,
            task,
        }
    }

    async fn deliver(
        &self,
        correlation_id: u64,
        body: String,
        attachment: PendingAttachment,
    ) -> SendSettlement {
        let resolved = match attachment {
            PendingAttachment::None => None,
            PendingAttachment::Resolved(resolved) => Some(resolved),
            PendingAttachment::Ticket(ticket) => match ticket.wait_ready().await {
                Ok(resolved) => {
                    self.resolved_lock()
                        .insert(correlation_id, Arc::clone(&resolved));
                    Some(resolved)
                }
                Err(err) => {
                    tracing::warn!(correlation_id, error = %err, "attachment never became ready");
                    return SendSettlement::Failed {
                        reason: err.to_string(),
                    };
                }
            },
        };

        let outbound = match resolved {
            Some(resolved) => match self.outbound_attachment(&resolved).await {
                Ok(outbound) => Some(outbound),
                Err(err) => {
                    return SendSettlement::Failed {
                        reason: err.to_string(),
                    }
                }
            },
            None => None,
        };

        let request = SendRequest {
            room_id: self.room.room_id.clone(),
            sender: self.room.display_name.clone(),
            body,
            attachment: outbound,
            role: SenderRole::Participant,
        };
        let backend = Arc::clone(&self.backend);
        let result = tokio::task::spawn_blocking(move || backend.send_message(&request))
            .await
            .unwrap_or_else(|err| Err(BackendError::Transport(format!("send task failed: {err}"))));
        self.classify(correlation_id, result)
    }

    async fn outbound_attachment(
        &self,
        attachment: &Attachment,
    ) -> Result<OutboundAttachment, BackendError> {
        match self.transport {
            AttachmentTransport::Inline => Ok(OutboundAttachment::Inline {
                base64_data: attachment.base64_data.clone(),
                mime_type: attachment.mime_type.clone(),
                filename: attachment.filename.clone(),
            }),
            AttachmentTransport::Hosted => {
                let upload = AssetUpload {
                    bytes: attachment
                        .decode_bytes()
                        .map_err(|err| BackendError::Protocol(err.to_string()))?,
                    filename: attachment.filename.clone(),
                    mime_type: attachment.mime_type.clone(),
                };
                let backend = Arc::clone(&self.backend);
                let uploaded = tokio::task::spawn_blocking(move || backend.upload_asset(&upload))
                    .await
                    .map_err(|err| BackendError::Transport(format!("upload task failed: {err}")))??;
                Ok(OutboundAttachment::Hosted {
                    url: uploaded.url,
                    mime_type: attachment.mime_type.clone(),
                    filename: attachment.filename.clone(),
                })
            }
        }
    }

    fn classify(
        &self,
        correlation_id: u64,
        result: Result<SendResponse, BackendError>,
    ) -> SendSettlement {
        let response = match result {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(
                    room_id = %self.room.room_id,
                    correlation_id,
                    error = %err,
                    "send failed"
                );
                return SendSettlement::Failed {
                    reason: err.to_string(),
                };
            }
        };

        if let Some(signal) = &response.quota {
            self.quota.observe(signal);
        }
        if response.quota_locked() {
            self.request_refresh();
            return SendSettlement::QuotaLocked;
        }
        if let Some(reason) = response.error {
            tracing::warn!(correlation_id, %reason, "backend declined message");
            return SendSettlement::Failed { reason };
        }
        self.request_refresh();
        SendSettlement::Stored {
            replied: response.reply.is_some(),
        }
    }

    fn request_refresh(&self) {
        if let Some(trigger) = &self.refresh {
            trigger.fire();
        }
    }

    fn settle(&self, correlation_id: u64, settlement: &SendSettlement) {
        let settlement = match settlement {
            SendSettlement::Stored { .. } | SendSettlement::QuotaLocked => Settlement::Sent,
            SendSettlement::Failed { reason } => Settlement::Failed(reason.clone()),
        };
        if let Err(err) = self.view.apply(ViewChange::SendSettled {
            correlation_id,
            settlement,
        }) {
            tracing::debug!(correlation_id, error = %err, "settlement dropped");
        }
    }

    fn prune_resolved(&self) {
        let live = self
            .view
            .pending()
            .into_iter()
            .map(|pending| pending.correlation_id)
            .collect::<Vec<_>>();
        self.resolved_lock().retain(|id, _| live.contains(id));
    }

    fn resolved_lock(&self) -> MutexGuard<'_, HashMap<u64, Arc<Attachment>>> {
        self.resolved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        attachment::{AttachmentSource, AttachmentStager},
        backend::ScriptedBackend,
        quota::QuotaSignal,
        room::RoomId,
        timeline::{ReconcilePolicy, RoomView},
    };
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use std::{
        path::PathBuf,
        time::{SystemTime, UNIX_EPOCH},
    };

    fn fixture(backend: Arc<ScriptedBackend>) -> (OptimisticOutbox, SharedView, Arc<QuotaGate>) {
        fixture_with(backend, AttachmentTransport::Inline)
    }

    fn fixture_with(
        backend: Arc<ScriptedBackend>,
        transport: AttachmentTransport,
    ) -> (OptimisticOutbox, SharedView, Arc<QuotaGate>) {
        let room = RoomContext::enter(
            RoomId::parse("outbox").expect("room id should parse"),
            "Ana",
            false,
        );
        let view = SharedView::new(RoomView::new(room.epoch, ReconcilePolicy::default()));
        let quota = Arc::new(QuotaGate::new());
        let outbox = OptimisticOutbox::new(
            backend,
            view.clone(),
            Arc::clone(&quota),
            room,
            transport,
        );
        (outbox, view, quota)
    }

    fn scratch_dir() -> PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock should be valid")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("roomsync-outbox-{ts}"));
        std::fs::create_dir_all(&dir).expect("temp dir should be created");
        dir
    }

    async fn staged_ticket(name: &str, bytes: &[u8]) -> AttachmentTicket {
        let path = scratch_dir().join(name);
        std::fs::write(&path, bytes).expect("temp file should be written");
        let stager = AttachmentStager::new(1024);
        stager
            .accept(AttachmentSource::from_path(&path))
            .await
            .expect("file should be accepted");
        stager.take().expect("file should be staged")
    }

    #[tokio::test]
    async fn blank_submission_is_rejected_before_echo() {
        let (outbox, view, _) = fixture(Arc::new(ScriptedBackend::echoing()));
        assert_eq!(outbox.submit("   ", None).err(), Some(SubmitError::Empty));
        assert!(view.entries().is_empty());
    }

    #[tokio::test]
    async fn submit_echoes_locally_then_settles_as_sent() {
        let backend = Arc::new(ScriptedBackend::echoing());
        let (outbox, view, _) = fixture(Arc::clone(&backend));
        let handle = outbox.submit(" hello ", None).expect("submit should succeed");
        assert_eq!(view.entries().len(), 1);
        assert_eq!(view.entries()[0].body(), "hello");

        let id = handle.correlation_id;
        assert_eq!(handle.settled().await, SendSettlement::Stored { replied: false });
        assert_eq!(
            view.pending_by_id(id).map(|p| p.state),
            Some(PendingState::Sent)
        );
        assert_eq!(backend.sends()[0].body, "hello");
    }

    #[tokio::test]
    async fn transport_failure_keeps_message_for_manual_resend() {
        let backend = Arc::new(ScriptedBackend::echoing());
        backend.push_send_outcome(Err(BackendError::Transport("offline".to_string())));
        let (outbox, view, _) = fixture(Arc::clone(&backend));

        let handle = outbox.submit("retry me", None).expect("submit should succeed");
        let id = handle.correlation_id;
        assert!(matches!(handle.settled().await, SendSettlement::Failed { .. }));
        assert!(matches!(
            view.pending_by_id(id).map(|p| p.state),
            Some(PendingState::Failed { .. })
        ));
        assert_eq!(backend.sends().len(), 1);

        let handle = outbox.resend(id).expect("failed message should resend");
        assert_eq!(handle.correlation_id, id);
        assert_eq!(handle.settled().await, SendSettlement::Stored { replied: false });
        assert_eq!(backend.sends().len(), 2);
        assert_eq!(view.pending().len(), 1);
    }

    #[tokio::test]
    async fn quota_lock_blocks_later_submits_but_keeps_the_trigger() {
        let backend = Arc::new(ScriptedBackend::echoing());
        backend.push_send_outcome(Ok(SendResponse {
            quota: Some(QuotaSignal {
                locked: true,
                used: Some(20),
                limit: Some(20),
            }),
            ..SendResponse::default()
        }));
        let (outbox, view, quota) = fixture(backend);

        let handle = outbox.submit("last one", None).expect("submit should succeed");
        assert_eq!(handle.settled().await, SendSettlement::QuotaLocked);
        assert!(quota.is_locked());
        assert_eq!(view.entries().len(), 1);
        assert_eq!(outbox.submit("blocked", None).err(), Some(SubmitError::QuotaLocked));
    }

    #[tokio::test]
    async fn backend_error_body_marks_failure_with_reason() {
        let backend = Arc::new(ScriptedBackend::silent());
        backend.push_send_outcome(Ok(SendResponse {
            error: Some("room is archived".to_string()),
            ..SendResponse::default()
        }));
        let (outbox, view, _) = fixture(backend);
        let handle = outbox.submit("hi", None).expect("submit should succeed");
        let id = handle.correlation_id;
        handle.settled().await;
        assert_eq!(
            view.pending_by_id(id).map(|p| p.state),
            Some(PendingState::Failed {
                reason: "room is archived".to_string()
            })
        );
        outbox.abandon(id).expect("failed message can be abandoned");
        assert!(view.entries().is_empty());
    }

    #[tokio::test]
    async fn resend_of_in_flight_message_is_refused() {
        let (outbox, _, _) = fixture(Arc::new(ScriptedBackend::silent()));
        let handle = outbox.submit("hi", None).expect("submit should succeed");
        let id = handle.correlation_id;
        handle.settled().await;
        assert_eq!(outbox.resend(id).err(), Some(SubmitError::NotResendable(id)));
        assert_eq!(outbox.resend(404).err(), Some(SubmitError::UnknownMessage(404)));
    }

    #[tokio::test]
    async fn inline_send_waits_for_the_encode_and_carries_the_payload() {
        let backend = Arc::new(ScriptedBackend::echoing());
        let (outbox, view, _) = fixture(Arc::clone(&backend));
        let ticket = staged_ticket("chart.png", b"chart-bytes").await;

        let handle = outbox
            .submit("see chart", Some(ticket))
            .expect("submit should succeed");
        let id = handle.correlation_id;
        assert_eq!(
            view.pending_by_id(id).and_then(|p| p.attachment_ref),
            Some("chart.png".to_string())
        );
        assert_eq!(handle.settled().await, SendSettlement::Stored { replied: false });

        let sends = backend.sends();
        assert_eq!(sends.len(), 1);
        assert_eq!(
            sends[0].attachment,
            Some(OutboundAttachment::Inline {
                base64_data: STANDARD.encode(b"chart-bytes"),
                mime_type: "image/png".to_string(),
                filename: "chart.png".to_string(),
            })
        );
        assert!(backend.uploads().is_empty());
    }

    #[tokio::test]
    async fn hosted_transport_uploads_then_sends_the_url() {
        let backend = Arc::new(ScriptedBackend::echoing());
        let (outbox, _, _) = fixture_with(Arc::clone(&backend), AttachmentTransport::Hosted);
        let ticket = staged_ticket("scan.pdf", b"%PDF-1.7").await;

        let handle = outbox
            .submit("", Some(ticket))
            .expect("attachment alone is a valid submit");
        assert_eq!(handle.settled().await, SendSettlement::Stored { replied: false });

        let uploads = backend.uploads();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].bytes, b"%PDF-1.7".to_vec());
        assert_eq!(uploads[0].mime_type, "application/pdf");
        assert_eq!(
            backend.sends()[0].attachment,
            Some(OutboundAttachment::Hosted {
                url: "memory://assets/1/scan.pdf".to_string(),
                mime_type: "application/pdf".to_string(),
                filename: "scan.pdf".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn failed_upload_settles_as_failed_without_sending() {
        let backend = Arc::new(ScriptedBackend::echoing());
        backend.push_upload_error(BackendError::Transport("asset store down".to_string()));
        let (outbox, view, _) = fixture_with(Arc::clone(&backend), AttachmentTransport::Hosted);
        let ticket = staged_ticket("photo.jpg", b"jpeg").await;

        let handle = outbox
            .submit("with photo", Some(ticket))
            .expect("submit should succeed");
        let id = handle.correlation_id;
        assert!(matches!(
            handle.settled().await,
            SendSettlement::Failed { reason } if reason.contains("asset store down")
        ));
        assert!(backend.sends().is_empty());
        assert!(matches!(
            view.pending_by_id(id).map(|p| p.state),
            Some(PendingState::Failed { .. })
        ));

        let handle = outbox.resend(id).expect("failed message should resend");
        assert_eq!(handle.settled().await, SendSettlement::Stored { replied: false });
        assert_eq!(backend.uploads().len(), 1);
        assert_eq!(backend.sends().len(), 1);
    }

    #[tokio::test]
    async fn encode_failure_only_fails_its_own_message() {
        let backend = Arc::new(ScriptedBackend::echoing());
        let (outbox, view, _) = fixture(Arc::clone(&backend));
        let unreadable = scratch_dir().join("broken.png");
        std::fs::create_dir_all(&unreadable).expect("directory should be created");
        let stager = AttachmentStager::new(1024);
        stager
            .accept(AttachmentSource::from_path(&unreadable))
            .await
            .expect("directory passes the metadata check");
        let ticket = stager.take().expect("slot is still encoding");

        let with_file = outbox
            .submit("look at this", Some(ticket))
            .expect("submit should succeed");
        let text_only = outbox
            .submit("and an unrelated note", None)
            .expect("text submit should not wait on the file");
        let failed_id = with_file.correlation_id;

        assert_eq!(
            text_only.settled().await,
            SendSettlement::Stored { replied: false }
        );
        assert!(matches!(
            with_file.settled().await,
            SendSettlement::Failed { .. }
        ));
        let sends = backend.sends();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].body, "and an unrelated note");
        assert!(sends[0].attachment.is_none());
        assert!(matches!(
            view.pending_by_id(failed_id).map(|p| p.state),
            Some(PendingState::Failed { .. })
        ));
    }
}
