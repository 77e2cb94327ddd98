pub mod attachment;
pub mod backend;
pub mod capabilities;
pub mod dictation;
pub mod export;
pub mod narration;
pub mod outbox;
pub mod quota;
pub mod room;
pub mod scroll;
pub mod session;
pub mod settings;
pub mod state;
pub mod sync;
pub mod timeline;
pub mod transcript;
