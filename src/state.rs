use crate::{
    attachment::{AttachmentError, AttachmentSource, AttachmentStager, StageState},
    backend::{BackendError, RoomBackend, SendRequest, SenderRole},
    capabilities::{CapabilityManager, CapabilitySnapshot},
    dictation::{
        DictationCommit, DictationController, DictationError, DictationSnapshot,
        SpeechRecognizer,
    },
    export::{ExportError, ExportFormat, ExportManager, ExportResult},
    narration::{NarrationController, NarrationError, NarrationOutcome, SpeechSynthesizer},
    outbox::{OptimisticOutbox, SubmitError, SubmitHandle},
    quota::{QuotaGate, QuotaSnapshot, UnlockEvent},
    room::{invite_link, InviteError, QuickAction, RoomContext, RoomId},
    scroll::ScrollSentinel,
    session::{resolve_entry, EntryDecision, SessionError, SessionStore},
    settings::{RoomSyncSettings, SettingsError, SettingsStore},
    sync::{RoomSyncLoop, SyncHealth, SyncTrigger},
    timeline::{ReconcilePolicy, RoomView, SharedView, TimelineEntry, ViewChange, ViewDelta},
};
use std::{path::Path, sync::Arc, time::Duration};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use url::Url;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Everything a UI layer needs to follow the room.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    Entered {
        room_id: RoomId,
        display_name: String,
        guest: bool,
        invite_link: Option<String>,
    },
    Exited {
        room_id: RoomId,
    },
    Timeline {
        entries: Arc<Vec<TimelineEntry>>,
        delta: ViewDelta,
        autoscroll: bool,
    },
    Sync(SyncHealth),
    Quota(QuotaSnapshot),
    Dictation(DictationSnapshot),
    Capabilities(CapabilitySnapshot),
    /// Text for the compose box: a quick action, a stopped dictation, or a
    /// dictation commit that could not be sent.
    DraftPrefilled(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("no room is active")]
    NoActiveRoom,
    #[error("room id must not be blank")]
    InvalidRoomId,
    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),
    #[error("session error: {0}")]
    Session(#[from] SessionError),
    #[error("export error: {0}")]
    Export(#[from] ExportError),
    #[error("submit error: {0}")]
    Submit(#[from] SubmitError),
    #[error("attachment error: {0}")]
    Attachment(#[from] AttachmentError),
    #[error("dictation error: {0}")]
    Dictation(#[from] DictationError),
    #[error("narration error: {0}")]
    Narration(#[from] NarrationError),
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("invite error: {0}")]
    Invite(#[from] InviteError),
    #[error("{0}")]
    Runtime(String),
}

/// Collaborators handed to the controller. Stores are injected so tests can
/// point them at temp paths.
pub struct ControllerParts {
    pub backend: Arc<dyn RoomBackend>,
    pub settings: RoomSyncSettings,
    pub settings_store: Option<SettingsStore>,
    pub session_store: SessionStore,
    pub exports: ExportManager,
    pub recognizer: Option<Arc<dyn SpeechRecognizer>>,
    pub synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
}

impl ControllerParts {
    /// Settings, session and exports under the platform app directories. The
    /// backend is built from the loaded settings.
    pub fn with_default_stores(
        make_backend: impl FnOnce(&RoomSyncSettings) -> Arc<dyn RoomBackend>,
    ) -> Result<Self, ControllerError> {
        let settings_store = SettingsStore::new()?;
        let settings = settings_store.load()?;
        Ok(Self {
            backend: make_backend(&settings),
            settings,
            settings_store: Some(settings_store),
            session_store: SessionStore::new()?,
            exports: ExportManager::new()?,
            recognizer: None,
            synthesizer: None,
        })
    }
}

struct ActiveRoom {
    context: RoomContext,
    view: SharedView,
    sync: RoomSyncLoop,
    outbox: OptimisticOutbox,
    forwarders: CancellationToken,
}

pub struct RoomController {
    backend: Arc<dyn RoomBackend>,
    settings_store: Option<SettingsStore>,
    settings: Mutex<RoomSyncSettings>,
    session_store: SessionStore,
    exports: ExportManager,
    quota: Arc<QuotaGate>,
    stager: AttachmentStager,
    dictation: DictationController,
    narration: NarrationController,
    capabilities: Arc<std::sync::Mutex<CapabilityManager>>,
    scroll: Arc<std::sync::Mutex<ScrollSentinel>>,
    active: Arc<Mutex<Option<ActiveRoom>>>,
    events: broadcast::Sender<RoomEvent>,
    background: CancellationToken,
}

impl RoomController {
    /// Must be called inside a tokio runtime; background pumps start here.
    pub fn new(parts: ControllerParts) -> Self {
        let settings = parts.settings.clamped();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (dictation, commits) = DictationController::new(
            parts.recognizer.clone(),
            Duration::from_millis(settings.silence_timeout_ms),
        );
        let capabilities = Arc::new(std::sync::Mutex::new(CapabilityManager::new(
            parts.recognizer.is_some(),
            parts.synthesizer.is_some(),
        )));
        let controller = Self {
            backend: parts.backend,
            settings_store: parts.settings_store,
            session_store: parts.session_store,
            exports: parts.exports,
            quota: Arc::new(QuotaGate::new()),
            stager: AttachmentStager::new(settings.max_attachment_bytes),
            dictation,
            narration: NarrationController::new(parts.synthesizer, &settings.narration_language),
            capabilities,
            scroll: Arc::new(std::sync::Mutex::new(ScrollSentinel::new(
                settings.scroll_threshold_px,
            ))),
            active: Arc::new(Mutex::new(None)),
            events,
            background: CancellationToken::new(),
            settings: Mutex::new(settings),
        };
        controller.spawn_commit_pump(commits);
        controller.spawn_status_forwarders();
        controller
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.events.subscribe()
    }

    pub async fn load_settings(&self) -> RoomSyncSettings {
        self.settings.lock().await.clone()
    }

    /// Applies to the next room entry; the running room keeps its loop.
    pub async fn update_settings(
        &self,
        settings: RoomSyncSettings,
    ) -> Result<RoomSyncSettings, ControllerError> {
        let settings = settings.clamped();
        if let Some(store) = &self.settings_store {
            store.save(&settings)?;
        }
        *self.settings.lock().await = settings.clone();
        Ok(settings)
    }

    pub fn resolve_entry(&self, invite: Option<&str>) -> Result<EntryDecision, ControllerError> {
        let stored = self.session_store.load()?;
        Ok(resolve_entry(invite, &stored))
    }

    /// Tears down any current room, then builds view, sync loop and outbox
    /// for the new one and starts polling.
    pub async fn enter_room(
        &self,
        room_id: &str,
        display_name: &str,
        guest: bool,
    ) -> Result<RoomContext, ControllerError> {
        let room_id = RoomId::parse(room_id).ok_or(ControllerError::InvalidRoomId)?;
        self.exit_room().await;

        let settings = self.load_settings().await;
        let context = RoomContext::enter(room_id, display_name, guest);
        let view = SharedView::new(RoomView::new(
            context.epoch,
            ReconcilePolicy {
                max_cycles: settings.reconcile_max_cycles,
                window_ms: settings.reconcile_window_ms,
            },
        ));
        let sync = RoomSyncLoop::new(
            Arc::clone(&self.backend),
            view.clone(),
            &context,
            Duration::from_millis(settings.poll_interval_ms),
        );
        let outbox = OptimisticOutbox::new(
            Arc::clone(&self.backend),
            view.clone(),
            Arc::clone(&self.quota),
            context.clone(),
            settings.attachment_transport,
        )
        .with_refresh(sync.trigger());

        let forwarders = self.background.child_token();
        self.spawn_room_forwarder(&view, &sync, forwarders.clone());
        sync.start();

        if !guest {
            if let Err(err) = self
                .session_store
                .remember(&context.room_id, &context.display_name)
            {
                tracing::warn!(error = %err, "failed to persist session");
            }
        }
        if settings.announce_entry {
            self.announce_entry(&context, sync.trigger());
        }

        let link = invite_link(&settings.app_origin, &context.room_id)
            .ok()
            .map(|url| url.to_string());
        tracing::info!(
            room_id = %context.room_id,
            epoch = context.epoch,
            guest,
            "entered room"
        );
        let _ = self.events.send(RoomEvent::Entered {
            room_id: context.room_id.clone(),
            display_name: context.display_name.clone(),
            guest,
            invite_link: link,
        });

        *self.active.lock().await = Some(ActiveRoom {
            context: context.clone(),
            view,
            sync,
            outbox,
            forwarders,
        });
        Ok(context)
    }

    pub async fn enter_resolved(
        &self,
        decision: &EntryDecision,
    ) -> Result<Option<RoomContext>, ControllerError> {
        match decision {
            EntryDecision::Invite {
                room_id,
                display_name,
            } => self
                .enter_room(room_id.as_str(), display_name, true)
                .await
                .map(Some),
            EntryDecision::Resume {
                room_id,
                display_name,
            } => self
                .enter_room(room_id.as_str(), display_name, false)
                .await
                .map(Some),
            EntryDecision::Fresh => Ok(None),
        }
    }

    /// Stops the sync loop before anything else so no fetch for the old room
    /// can land afterwards.
    pub async fn exit_room(&self) {
        let Some(room) = self.active.lock().await.take() else {
            return;
        };
        room.sync.stop();
        room.forwarders.cancel();
        let _ = self.dictation.stop();
        let _ = self.dictation.take_draft();
        self.stager.discard();
        self.narration.cancel();
        tracing::info!(room_id = %room.context.room_id, "left room");
        let _ = self.events.send(RoomEvent::Exited {
            room_id: room.context.room_id,
        });
    }

    /// Leaves the room and forgets the stored session.
    pub async fn sign_out(&self) -> Result<(), ControllerError> {
        self.exit_room().await;
        self.session_store.forget()?;
        Ok(())
    }

    pub async fn active_room(&self) -> Option<RoomContext> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|room| room.context.clone())
    }

    pub async fn entries(&self) -> Result<Arc<Vec<TimelineEntry>>, ControllerError> {
        let active = self.active.lock().await;
        let room = active.as_ref().ok_or(ControllerError::NoActiveRoom)?;
        Ok(room.view.entries())
    }

    pub async fn sync_health(&self) -> Option<SyncHealth> {
        self.active.lock().await.as_ref().map(|room| room.sync.health())
    }

    /// Sends the draft along with whatever attachment is staged.
    pub async fn submit(&self, body: &str) -> Result<SubmitHandle, ControllerError> {
        let active = self.active.lock().await;
        let room = active.as_ref().ok_or(ControllerError::NoActiveRoom)?;
        let staged = matches!(
            self.stager.state(),
            StageState::Encoding { .. } | StageState::Ready(_)
        );
        if body.trim().is_empty() && !staged {
            return Err(SubmitError::Empty.into());
        }
        if self.quota.is_locked() {
            return Err(SubmitError::QuotaLocked.into());
        }
        let ticket = self.stager.take();
        Ok(room.outbox.submit(body, ticket)?)
    }

    pub async fn resend(&self, correlation_id: u64) -> Result<SubmitHandle, ControllerError> {
        let active = self.active.lock().await;
        let room = active.as_ref().ok_or(ControllerError::NoActiveRoom)?;
        Ok(room.outbox.resend(correlation_id)?)
    }

    pub async fn abandon(&self, correlation_id: u64) -> Result<(), ControllerError> {
        let active = self.active.lock().await;
        let room = active.as_ref().ok_or(ControllerError::NoActiveRoom)?;
        Ok(room.outbox.abandon(correlation_id)?)
    }

    pub async fn refresh_now(&self) -> Result<(), ControllerError> {
        let active = self.active.lock().await;
        let room = active.as_ref().ok_or(ControllerError::NoActiveRoom)?;
        room.sync.refresh_now();
        Ok(())
    }

    pub async fn stage_attachment(&self, source: AttachmentSource) -> Result<(), ControllerError> {
        Ok(self.stager.accept(source).await?)
    }

    pub fn retry_attachment(&self) -> Result<(), ControllerError> {
        Ok(self.stager.retry()?)
    }

    pub fn discard_attachment(&self) {
        self.stager.discard();
    }

    pub fn attachment_state(&self) -> StageState {
        self.stager.state()
    }

    /// Clears the room on the backend, then resets the local view and the
    /// outbox ledger.
    pub async fn clear_room(&self) -> Result<(), ControllerError> {
        let (room_id, view, outbox) = {
            let active = self.active.lock().await;
            let room = active.as_ref().ok_or(ControllerError::NoActiveRoom)?;
            (
                room.context.room_id.clone(),
                room.view.clone(),
                room.outbox.clone(),
            )
        };
        let backend = Arc::clone(&self.backend);
        let clear_id = room_id.clone();
        tokio::task::spawn_blocking(move || backend.clear_room(&clear_id))
            .await
            .map_err(|err| ControllerError::Runtime(format!("clear task failed: {err}")))??;
        view.apply(ViewChange::Cleared)
            .map_err(|err| ControllerError::Runtime(err.to_string()))?;
        outbox.reset();
        tracing::info!(room_id = %room_id, "room cleared");
        Ok(())
    }

    pub async fn export(&self, format: ExportFormat) -> Result<ExportResult, ControllerError> {
        let (room_id, entries) = {
            let active = self.active.lock().await;
            let room = active.as_ref().ok_or(ControllerError::NoActiveRoom)?;
            (room.context.room_id.clone(), room.view.entries())
        };
        Ok(self.exports.export(&room_id, &entries, format)?)
    }

    /// Restores a JSON bundle into the active room. Returns the message count.
    pub async fn import_bundle(&self, path: impl AsRef<Path>) -> Result<usize, ControllerError> {
        let bundle = self.exports.load_bundle(path)?;
        let (room_id, sync_trigger) = {
            let active = self.active.lock().await;
            let room = active.as_ref().ok_or(ControllerError::NoActiveRoom)?;
            (room.context.room_id.clone(), room.sync.trigger())
        };
        let count = bundle.messages.len();
        let backend = Arc::clone(&self.backend);
        let import_id = room_id.clone();
        tokio::task::spawn_blocking(move || backend.import_history(&import_id, &bundle.messages))
            .await
            .map_err(|err| ControllerError::Runtime(format!("import task failed: {err}")))??;
        sync_trigger.fire();
        tracing::info!(room_id = %room_id, count, "history imported");
        Ok(count)
    }

    pub async fn invite_link(&self) -> Result<Url, ControllerError> {
        let room_id = self
            .active_room()
            .await
            .ok_or(ControllerError::NoActiveRoom)?
            .room_id;
        let origin = self.settings.lock().await.app_origin.clone();
        Ok(invite_link(&origin, &room_id)?)
    }

    /// Prefills the draft; never sends by itself.
    pub fn quick_action(&self, action: QuickAction) -> String {
        let prompt = action.prompt().to_string();
        let _ = self.events.send(RoomEvent::DraftPrefilled(prompt.clone()));
        prompt
    }

    pub fn quota_snapshot(&self) -> QuotaSnapshot {
        self.quota.snapshot()
    }

    pub fn unlock_quota(&self, event: UnlockEvent) -> QuotaSnapshot {
        self.quota.unlock(event)
    }

    pub fn start_dictation(&self) -> Result<(), ControllerError> {
        match self.dictation.start() {
            Ok(()) => {
                let snapshot = self.lock_capabilities().record_listening();
                let _ = self.events.send(RoomEvent::Capabilities(snapshot));
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Stops without committing and hands the heard text back as a draft.
    pub fn stop_dictation(&self) -> String {
        let _ = self.dictation.stop();
        let draft = self.dictation.take_draft();
        if !draft.is_empty() {
            let _ = self.events.send(RoomEvent::DraftPrefilled(draft.clone()));
        }
        draft
    }

    pub fn dictation_snapshot(&self) -> DictationSnapshot {
        self.dictation.snapshot()
    }

    pub fn narrate(&self, text: &str) -> Result<NarrationOutcome, ControllerError> {
        Ok(self.narration.speak(text)?)
    }

    pub fn cancel_narration(&self) {
        self.narration.cancel();
    }

    pub fn capabilities(&self) -> CapabilitySnapshot {
        self.lock_capabilities().snapshot()
    }

    pub fn observe_scroll(&self, distance_from_bottom_px: f32) {
        self.scroll
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .observe_scroll(distance_from_bottom_px);
    }

    fn lock_capabilities(&self) -> std::sync::MutexGuard<'_, CapabilityManager> {
        self.capabilities
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The welcome request bypasses the outbox: it is not stored, only the
    /// assistant's greeting is.
    fn announce_entry(&self, context: &RoomContext, trigger: SyncTrigger) {
        let backend = Arc::clone(&self.backend);
        let request = SendRequest {
            room_id: context.room_id.clone(),
            sender: context.display_name.clone(),
            body: String::new(),
            attachment: None,
            role: SenderRole::Welcome,
        };
        tokio::spawn(async move {
            let room_id = request.room_id.clone();
            match tokio::task::spawn_blocking(move || backend.send_message(&request)).await {
                Ok(Ok(response)) => {
                    if response.reply.is_some() {
                        trigger.fire();
                    }
                }
                Ok(Err(err)) => {
                    tracing::warn!(room_id = %room_id, error = %err, "entry announcement failed")
                }
                Err(err) => {
                    tracing::warn!(room_id = %room_id, error = %err, "entry announcement task failed")
                }
            }
        });
    }

    fn spawn_room_forwarder(
        &self,
        view: &SharedView,
        sync: &RoomSyncLoop,
        token: CancellationToken,
    ) {
        let mut updates = view.subscribe();
        let mut health = sync.subscribe_health();
        let events = self.events.clone();
        let scroll = Arc::clone(&self.scroll);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    update = updates.recv() => match update {
                        Ok(update) => {
                            let autoscroll = scroll
                                .lock()
                                .unwrap_or_else(|poisoned| poisoned.into_inner())
                                .should_autoscroll(&update.delta);
                            let _ = events.send(RoomEvent::Timeline {
                                entries: update.entries,
                                delta: update.delta,
                                autoscroll,
                            });
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::debug!(skipped, "timeline forwarder lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    changed = health.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let snapshot = health.borrow_and_update().clone();
                        let _ = events.send(RoomEvent::Sync(snapshot));
                    }
                }
            }
        });
    }

    fn spawn_commit_pump(&self, mut commits: mpsc::UnboundedReceiver<DictationCommit>) {
        let active = Arc::clone(&self.active);
        let events = self.events.clone();
        let token = self.background.clone();
        tokio::spawn(async move {
            loop {
                let commit = tokio::select! {
                    _ = token.cancelled() => break,
                    commit = commits.recv() => match commit {
                        Some(commit) => commit,
                        None => break,
                    },
                };
                let submitted = {
                    let active = active.lock().await;
                    match active.as_ref() {
                        Some(room) => room.outbox.submit(&commit.text, None).map(|_| ()),
                        None => Err(SubmitError::Empty),
                    }
                };
                if let Err(err) = submitted {
                    tracing::warn!(
                        session_id = commit.session_id,
                        error = %err,
                        "dictation commit returned to draft"
                    );
                    let _ = events.send(RoomEvent::DraftPrefilled(commit.text));
                }
            }
        });
    }

    fn spawn_status_forwarders(&self) {
        let mut quota = self.quota.subscribe();
        let mut dictation = self.dictation.subscribe();
        let capabilities = Arc::clone(&self.capabilities);
        let events = self.events.clone();
        let token = self.background.clone();
        tokio::spawn(async move {
            let mut last_end = dictation.borrow().last_end.clone();
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = quota.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let snapshot = quota.borrow_and_update().clone();
                        let _ = events.send(RoomEvent::Quota(snapshot));
                    }
                    changed = dictation.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let snapshot = dictation.borrow_and_update().clone();
                        if snapshot.last_end != last_end {
                            last_end = snapshot.last_end.clone();
                            if let Some(reason) = &last_end {
                                let caps = capabilities
                                    .lock()
                                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                                    .record_dictation(reason);
                                let _ = events.send(RoomEvent::Capabilities(caps));
                            }
                        }
                        let _ = events.send(RoomEvent::Dictation(snapshot));
                    }
                }
            }
        });
    }
}

impl Drop for RoomController {
    fn drop(&mut self) {
        self.background.cancel();
    }
}
