use crate::dictation::{DictationEndReason, DictationError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum VoiceCapability {
    Available,
    Denied,
    Unsupported,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitySnapshot {
    pub dictation: VoiceCapability,
    pub narration: VoiceCapability,
    pub message: Option<String>,
}

/// Tracks which voice affordances the client can offer. Failures here only
/// disable the affected affordance.
#[derive(Debug, Clone)]
pub struct CapabilityManager {
    snapshot: CapabilitySnapshot,
}

impl CapabilityManager {
    pub fn new(has_recognizer: bool, has_synthesizer: bool) -> Self {
        let dictation = if has_recognizer {
            VoiceCapability::Unknown
        } else {
            VoiceCapability::Unsupported
        };
        let narration = if has_synthesizer {
            VoiceCapability::Available
        } else {
            VoiceCapability::Unsupported
        };
        let message = (!has_recognizer)
            .then(|| "Voice input is not supported on this device.".to_string());
        Self {
            snapshot: CapabilitySnapshot {
                dictation,
                narration,
                message,
            },
        }
    }

    pub fn snapshot(&self) -> CapabilitySnapshot {
        self.snapshot.clone()
    }

    /// Folds the outcome of a dictation session into the snapshot.
    pub fn record_dictation(&mut self, reason: &DictationEndReason) -> CapabilitySnapshot {
        let (capability, message) = match reason {
            DictationEndReason::AutoCommitted
            | DictationEndReason::UserStopped
            | DictationEndReason::CaptureEnded => (VoiceCapability::Available, None),
            DictationEndReason::Unavailable(err) | DictationEndReason::CaptureFailed(err) => {
                classify(err)
            }
        };
        self.snapshot.dictation = capability;
        self.snapshot.message = message;
        self.snapshot()
    }

    pub fn record_listening(&mut self) -> CapabilitySnapshot {
        self.snapshot.dictation = VoiceCapability::Available;
        self.snapshot.message = None;
        self.snapshot()
    }
}

fn classify(err: &DictationError) -> (VoiceCapability, Option<String>) {
    match err {
        DictationError::Unsupported => (
            VoiceCapability::Unsupported,
            Some("Voice input is not supported on this device.".to_string()),
        ),
        DictationError::PermissionDenied => (
            VoiceCapability::Denied,
            Some("Microphone access was denied. Allow it in system settings and retry.".to_string()),
        ),
        DictationError::Capture(detail) => (
            VoiceCapability::Unknown,
            Some(format!("Voice input stopped: {detail}")),
        ),
    }
}
