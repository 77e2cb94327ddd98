use crate::transcript::{join_fragments, sanitize_speech_fragment};
use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DictationError {
    #[error("speech recognition is not supported here")]
    Unsupported,
    #[error("microphone permission was denied")]
    PermissionDenied,
    #[error("capture failed: {0}")]
    Capture(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DictationState {
    Idle,
    Listening,
    AutoCommitting,
}

/// Why the last session returned to `Idle`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DictationEndReason {
    AutoCommitted,
    UserStopped,
    /// The engine closed the session by itself.
    CaptureEnded,
    CaptureFailed(DictationError),
    Unavailable(DictationError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeechEvent {
    Fragment { text: String, is_final: bool },
    Error(DictationError),
    Ended,
}

/// A platform speech engine. Events for one session go to `events`.
pub trait SpeechRecognizer: Send + Sync {
    fn start(
        &self,
        events: mpsc::UnboundedSender<SpeechEvent>,
    ) -> Result<Box<dyn CaptureSession>, DictationError>;
}

pub trait CaptureSession: Send {
    fn stop(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DictationCommit {
    pub session_id: u64,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DictationSnapshot {
    pub state: DictationState,
    pub session_id: u64,
    pub text: String,
    pub last_end: Option<DictationEndReason>,
}

struct Machine {
    state: DictationState,
    session_id: u64,
    finals: String,
    interim: String,
    capture: Option<Box<dyn CaptureSession>>,
    cancel: Option<CancellationToken>,
    last_end: Option<DictationEndReason>,
}

impl Machine {
    fn text(&self) -> String {
        join_fragments(&self.finals, &self.interim)
    }

    fn snapshot(&self) -> DictationSnapshot {
        DictationSnapshot {
            state: self.state,
            session_id: self.session_id,
            text: self.text(),
            last_end: self.last_end.clone(),
        }
    }

    /// Leaves `Listening`: the capture session and the silence timer go
    /// together.
    fn end_session(&mut self, reason: DictationEndReason) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        self.state = DictationState::Idle;
        self.last_end = Some(reason);
    }
}

struct DictationShared {
    machine: Mutex<Machine>,
    snapshot: watch::Sender<DictationSnapshot>,
    commits: mpsc::UnboundedSender<DictationCommit>,
}

impl DictationShared {
    fn lock(&self) -> MutexGuard<'_, Machine> {
        self.machine
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn apply_fragment(&self, session_id: u64, text: &str, is_final: bool) -> bool {
        let mut machine = self.lock();
        if machine.session_id != session_id || machine.state != DictationState::Listening {
            return false;
        }
        let cleaned = sanitize_speech_fragment(text);
        if is_final {
            machine.finals = join_fragments(&machine.finals, &cleaned);
            machine.interim.clear();
        } else {
            machine.interim = cleaned;
        }
        self.snapshot.send_replace(machine.snapshot());
        true
    }

    /// Returns `false` when there was nothing to commit and listening goes on.
    fn silence_elapsed(&self, session_id: u64) -> bool {
        let mut machine = self.lock();
        if machine.session_id != session_id || machine.state != DictationState::Listening {
            return true;
        }
        let text = machine.text();
        if text.is_empty() {
            return false;
        }

        machine.state = DictationState::AutoCommitting;
        self.snapshot.send_replace(machine.snapshot());
        machine.end_session(DictationEndReason::AutoCommitted);
        machine.finals.clear();
        machine.interim.clear();
        if self
            .commits
            .send(DictationCommit { session_id, text })
            .is_err()
        {
            tracing::warn!(session_id, "dictation commit dropped; no receiver");
        } else {
            tracing::info!(session_id, "dictation auto-committed after silence");
        }
        self.snapshot.send_replace(machine.snapshot());
        true
    }

    fn finish(&self, session_id: u64, reason: DictationEndReason) {
        let mut machine = self.lock();
        if machine.session_id != session_id || machine.state != DictationState::Listening {
            return;
        }
        if let DictationEndReason::CaptureFailed(err) = &reason {
            tracing::warn!(session_id, error = %err, "dictation capture failed");
        }
        machine.end_session(reason);
        self.snapshot.send_replace(machine.snapshot());
    }
}

/// Continuous dictation with a silence deadline that every fragment rearms.
pub struct DictationController {
    recognizer: Option<Arc<dyn SpeechRecognizer>>,
    silence_timeout: Duration,
    shared: Arc<DictationShared>,
}

impl DictationController {
    /// Commits arrive on the returned receiver.
    pub fn new(
        recognizer: Option<Arc<dyn SpeechRecognizer>>,
        silence_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<DictationCommit>) {
        let (commits, commit_rx) = mpsc::unbounded_channel();
        let machine = Machine {
            state: DictationState::Idle,
            session_id: 0,
            finals: String::new(),
            interim: String::new(),
            capture: None,
            cancel: None,
            last_end: None,
        };
        let (snapshot, _) = watch::channel(machine.snapshot());
        let controller = Self {
            recognizer,
            silence_timeout,
            shared: Arc::new(DictationShared {
                machine: Mutex::new(machine),
                snapshot,
                commits,
            }),
        };
        (controller, commit_rx)
    }

    pub fn is_available(&self) -> bool {
        self.recognizer.is_some()
    }

    pub fn snapshot(&self) -> DictationSnapshot {
        self.shared.lock().snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<DictationSnapshot> {
        self.shared.snapshot.subscribe()
    }

    pub fn start(&self) -> Result<(), DictationError> {
        let mut machine = self.shared.lock();
        if machine.state != DictationState::Idle {
            return Ok(());
        }
        let Some(recognizer) = self.recognizer.as_ref() else {
            machine.last_end = Some(DictationEndReason::Unavailable(DictationError::Unsupported));
            self.shared.snapshot.send_replace(machine.snapshot());
            return Err(DictationError::Unsupported);
        };

        let (events, event_rx) = mpsc::unbounded_channel();
        let capture = match recognizer.start(events) {
            Ok(capture) => capture,
            Err(err) => {
                tracing::warn!(error = %err, "dictation unavailable");
                machine.last_end = Some(DictationEndReason::Unavailable(err.clone()));
                self.shared.snapshot.send_replace(machine.snapshot());
                return Err(err);
            }
        };

        machine.session_id += 1;
        let session_id = machine.session_id;
        let cancel = CancellationToken::new();
        machine.state = DictationState::Listening;
        machine.finals.clear();
        machine.interim.clear();
        machine.capture = Some(capture);
        machine.cancel = Some(cancel.clone());
        self.shared.snapshot.send_replace(machine.snapshot());
        drop(machine);

        tracing::info!(session_id, "dictation listening");
        tokio::spawn(drive_session(
            Arc::clone(&self.shared),
            session_id,
            event_rx,
            cancel,
            self.silence_timeout,
        ));
        Ok(())
    }

    /// Cancels capture and the silence timer without committing. Returns the
    /// text heard so far for manual review.
    pub fn stop(&self) -> String {
        let mut machine = self.shared.lock();
        if machine.state == DictationState::Listening {
            machine.end_session(DictationEndReason::UserStopped);
            tracing::info!(session_id = machine.session_id, "dictation stopped by user");
            self.shared.snapshot.send_replace(machine.snapshot());
        }
        machine.text()
    }

    /// Clears the draft left behind by `stop`.
    pub fn take_draft(&self) -> String {
        let mut machine = self.shared.lock();
        if machine.state != DictationState::Idle {
            return String::new();
        }
        let text = machine.text();
        machine.finals.clear();
        machine.interim.clear();
        self.shared.snapshot.send_replace(machine.snapshot());
        text
    }
}

impl Drop for DictationController {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn drive_session(
    shared: Arc<DictationShared>,
    session_id: u64,
    mut events: mpsc::UnboundedReceiver<SpeechEvent>,
    cancel: CancellationToken,
    silence_timeout: Duration,
) {
    let mut deadline: Option<Instant> = None;
    let mut events_open = true;
    loop {
        let silence = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.recv(), if events_open => match event {
                Some(SpeechEvent::Fragment { text, is_final }) => {
                    if shared.apply_fragment(session_id, &text, is_final) {
                        deadline = Some(Instant::now() + silence_timeout);
                    }
                }
                Some(SpeechEvent::Error(err)) => {
                    shared.finish(session_id, DictationEndReason::CaptureFailed(err));
                    return;
                }
                Some(SpeechEvent::Ended) | None => {
                    events_open = false;
                    if deadline.is_none() {
                        shared.finish(session_id, DictationEndReason::CaptureEnded);
                        return;
                    }
                }
            },
            _ = silence => {
                if shared.silence_elapsed(session_id) {
                    return;
                }
                deadline = None;
                if !events_open {
                    shared.finish(session_id, DictationEndReason::CaptureEnded);
                    return;
                }
            }
        }
    }
}

#[derive(Default)]
struct ScriptedRecognizerState {
    events: Option<mpsc::UnboundedSender<SpeechEvent>>,
    starts: usize,
    stops: usize,
    fail_with: Option<DictationError>,
}

/// In-process recognizer whose fragments are pushed by hand. Used by the
/// harness binary and by tests.
#[derive(Clone, Default)]
pub struct ScriptedRecognizer {
    state: Arc<Mutex<ScriptedRecognizerState>>,
}

impl ScriptedRecognizer {
    pub fn failing(error: DictationError) -> Self {
        let recognizer = Self::default();
        recognizer.lock().fail_with = Some(error);
        recognizer
    }

    /// Returns `false` when no session is listening.
    pub fn emit(&self, event: SpeechEvent) -> bool {
        self.lock()
            .events
            .as_ref()
            .is_some_and(|events| events.send(event).is_ok())
    }

    pub fn fragment(&self, text: &str, is_final: bool) -> bool {
        self.emit(SpeechEvent::Fragment {
            text: text.to_string(),
            is_final,
        })
    }

    pub fn starts(&self) -> usize {
        self.lock().starts
    }

    pub fn stops(&self) -> usize {
        self.lock().stops
    }

    fn lock(&self) -> MutexGuard<'_, ScriptedRecognizerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct ScriptedCapture {
    state: Arc<Mutex<ScriptedRecognizerState>>,
}

impl CaptureSession for ScriptedCapture {
    fn stop(&mut self) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.stops += 1;
        state.events = None;
    }
}

impl SpeechRecognizer for ScriptedRecognizer {
    fn start(
        &self,
        events: mpsc::UnboundedSender<SpeechEvent>,
    ) -> Result<Box<dyn CaptureSession>, DictationError> {
        let mut state = self.lock();
        if let Some(error) = state.fail_with.clone() {
            return Err(error);
        }
        state.starts += 1;
        state.events = Some(events);
        Ok(Box::new(ScriptedCapture {
            state: Arc::clone(&self.state),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(
        recognizer: &ScriptedRecognizer,
    ) -> (DictationController, mpsc::UnboundedReceiver<DictationCommit>) {
        DictationController::new(
            Some(Arc::new(recognizer.clone()) as Arc<dyn SpeechRecognizer>),
            Duration::from_secs(5),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn interim_fragments_replace_and_finals_append() {
        let recognizer = ScriptedRecognizer::default();
        let (dictation, _commits) = controller(&recognizer);
        dictation.start().expect("start should succeed");

        recognizer.fragment("hel", false);
        recognizer.fragment("hello", false);
        recognizer.fragment("hello there", true);
        recognizer.fragment("general [BLANK_AUDIO]", false);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(dictation.snapshot().text, "hello there general");
        assert_eq!(dictation.stop(), "hello there general");
        assert_eq!(recognizer.stops(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn start_while_listening_is_a_no_op() {
        let recognizer = ScriptedRecognizer::default();
        let (dictation, _commits) = controller(&recognizer);
        dictation.start().expect("start should succeed");
        dictation.start().expect("second start should be ignored");
        assert_eq!(recognizer.starts(), 1);
        assert_eq!(dictation.snapshot().session_id, 1);
    }

    #[tokio::test]
    async fn missing_recognizer_reports_unavailable() {
        let (dictation, _commits) = DictationController::new(None, Duration::from_secs(5));
        assert_eq!(dictation.start(), Err(DictationError::Unsupported));
        let snapshot = dictation.snapshot();
        assert_eq!(snapshot.state, DictationState::Idle);
        assert_eq!(
            snapshot.last_end,
            Some(DictationEndReason::Unavailable(DictationError::Unsupported))
        );
    }

    #[tokio::test]
    async fn permission_denied_is_unavailable_not_a_capture_failure() {
        let recognizer = ScriptedRecognizer::failing(DictationError::PermissionDenied);
        let (dictation, _commits) = controller(&recognizer);
        assert_eq!(dictation.start(), Err(DictationError::PermissionDenied));
        assert_eq!(
            dictation.snapshot().last_end,
            Some(DictationEndReason::Unavailable(
                DictationError::PermissionDenied
            ))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn capture_error_forces_idle() {
        let recognizer = ScriptedRecognizer::default();
        let (dictation, mut commits) = controller(&recognizer);
        dictation.start().expect("start should succeed");
        recognizer.fragment("partial", false);
        recognizer.emit(SpeechEvent::Error(DictationError::Capture(
            "device unplugged".to_string(),
        )));
        tokio::time::sleep(Duration::from_secs(10)).await;

        let snapshot = dictation.snapshot();
        assert_eq!(snapshot.state, DictationState::Idle);
        assert_eq!(
            snapshot.last_end,
            Some(DictationEndReason::CaptureFailed(DictationError::Capture(
                "device unplugged".to_string()
            )))
        );
        assert!(commits.try_recv().is_err());
        assert_eq!(snapshot.text, "partial");
    }

    #[tokio::test(start_paused = true)]
    async fn silence_without_text_keeps_listening() {
        let recognizer = ScriptedRecognizer::default();
        let (dictation, mut commits) = controller(&recognizer);
        dictation.start().expect("start should succeed");
        recognizer.fragment("[NOISE]", false);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(dictation.snapshot().state, DictationState::Listening);
        assert!(commits.try_recv().is_err());
    }
}
