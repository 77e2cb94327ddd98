use roomsync_core_lib::dictation::{
    DictationCommit, DictationController, DictationEndReason, DictationState, ScriptedRecognizer,
    SpeechRecognizer,
};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::mpsc::{error::TryRecvError, UnboundedReceiver},
    time::Instant,
};

fn dictation(
    recognizer: &ScriptedRecognizer,
) -> (DictationController, UnboundedReceiver<DictationCommit>) {
    DictationController::new(
        Some(Arc::new(recognizer.clone()) as Arc<dyn SpeechRecognizer>),
        Duration::from_secs(5),
    )
}

async fn sleep_until_offset(start: Instant, offset_ms: u64) {
    tokio::time::sleep_until(start + Duration::from_millis(offset_ms)).await;
}

#[tokio::test(start_paused = true)]
async fn silence_commits_five_seconds_after_the_last_fragment() {
    let recognizer = ScriptedRecognizer::default();
    let (dictation, mut commits) = dictation(&recognizer);
    let start = Instant::now();
    dictation.start().expect("dictation should start");

    recognizer.fragment("we should", true);
    sleep_until_offset(start, 1_000).await;
    recognizer.fragment("move the demo", true);
    sleep_until_offset(start, 2_000).await;
    recognizer.fragment("to thursday", true);

    sleep_until_offset(start, 6_900).await;
    assert_eq!(commits.try_recv(), Err(TryRecvError::Empty));
    assert_eq!(dictation.snapshot().state, DictationState::Listening);

    sleep_until_offset(start, 7_100).await;
    let commit = commits.try_recv().expect("silence should have committed");
    assert_eq!(commit.text, "we should move the demo to thursday");
    let snapshot = dictation.snapshot();
    assert_eq!(snapshot.state, DictationState::Idle);
    assert_eq!(snapshot.last_end, Some(DictationEndReason::AutoCommitted));
    assert_eq!(recognizer.stops(), 1);
}

#[tokio::test(start_paused = true)]
async fn manual_stop_cancels_the_pending_commit() {
    let recognizer = ScriptedRecognizer::default();
    let (dictation, mut commits) = dictation(&recognizer);
    let start = Instant::now();
    dictation.start().expect("dictation should start");

    recognizer.fragment("first", true);
    sleep_until_offset(start, 1_000).await;
    recognizer.fragment("second", true);
    sleep_until_offset(start, 2_000).await;
    recognizer.fragment("third", true);

    sleep_until_offset(start, 4_000).await;
    assert_eq!(dictation.stop(), "first second third");

    sleep_until_offset(start, 12_000).await;
    assert_eq!(commits.try_recv(), Err(TryRecvError::Empty));
    assert_eq!(
        dictation.snapshot().last_end,
        Some(DictationEndReason::UserStopped)
    );
    assert_eq!(dictation.take_draft(), "first second third");
}

#[tokio::test(start_paused = true)]
async fn a_new_session_ignores_the_old_silence_timer() {
    let recognizer = ScriptedRecognizer::default();
    let (dictation, mut commits) = dictation(&recognizer);
    let start = Instant::now();

    dictation.start().expect("dictation should start");
    recognizer.fragment("stale words", true);
    sleep_until_offset(start, 3_000).await;
    dictation.stop();
    let _ = dictation.take_draft();

    dictation.start().expect("restart should succeed");
    recognizer.fragment("fresh words", true);
    sleep_until_offset(start, 6_000).await;
    assert_eq!(commits.try_recv(), Err(TryRecvError::Empty));

    sleep_until_offset(start, 8_100).await;
    let commit = commits.try_recv().expect("second session should commit");
    assert_eq!(commit.text, "fresh words");
    assert_eq!(recognizer.starts(), 2);
}
