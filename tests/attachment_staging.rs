use roomsync_core_lib::attachment::{AttachmentSource, AttachmentStager, StageState};
use std::{
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

fn temp_file(name: &str, bytes: &[u8]) -> PathBuf {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock should be valid")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("roomsync-staging-{ts}"));
    std::fs::create_dir_all(&dir).expect("temp dir should be created");
    let path = dir.join(name);
    std::fs::write(&path, bytes).expect("temp file should be written");
    path
}

#[tokio::test]
async fn second_file_replaces_the_first() {
    let stager = AttachmentStager::new(1024 * 1024);
    let first = temp_file("first.png", b"first");
    let second = temp_file("second.jpg", b"second");

    stager
        .accept(AttachmentSource::from_path(&first))
        .await
        .expect("png should be accepted");
    stager
        .accept(AttachmentSource::from_path(&second))
        .await
        .expect("jpg should be accepted");

    let ticket = stager.take().expect("one file should be staged");
    assert_eq!(ticket.filename(), "second.jpg");
    assert!(stager.take().is_none());

    let attachment = ticket.wait_ready().await.expect("encode should succeed");
    assert_eq!(attachment.mime_type, "image/jpeg");
    assert_eq!(
        attachment.decode_bytes().expect("payload should decode"),
        b"second"
    );
}

#[tokio::test]
async fn staged_file_reaches_ready_state() {
    let stager = AttachmentStager::new(1024 * 1024);
    let mut states = stager.subscribe();
    let path = temp_file("notes.pdf", b"meeting notes");

    stager
        .accept(AttachmentSource::from_path(&path))
        .await
        .expect("pdf should be accepted");
    let ready = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        loop {
            if let StageState::Ready(attachment) = states.borrow_and_update().clone() {
                return attachment;
            }
            states.changed().await.expect("stager should stay alive");
        }
    })
    .await
    .expect("encode should finish");
    assert_eq!(ready.filename, "notes.pdf");
    assert_eq!(ready.size_bytes, 13);
}
