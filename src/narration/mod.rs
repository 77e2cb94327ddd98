use crate::transcript::strip_markup;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Voice {
    pub id: String,
    pub name: String,
    /// BCP 47 tag such as `en-US`.
    pub language: String,
    pub is_default: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NarrationError {
    #[error("speech synthesis failed: {0}")]
    Synthesis(String),
}

/// Platform text-to-speech. `speak` starts an utterance and returns.
pub trait SpeechSynthesizer: Send + Sync {
    fn voices(&self) -> Vec<Voice>;
    fn speak(&self, text: &str, voice: Option<&Voice>) -> Result<(), NarrationError>;
    fn cancel(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NarrationOutcome {
    Speaking { voice_id: Option<String> },
    /// Nothing left to say once formatting was removed.
    NothingToSay,
    Unsupported,
}

pub struct NarrationController {
    synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
    language: String,
}

impl NarrationController {
    pub fn new(synthesizer: Option<Arc<dyn SpeechSynthesizer>>, language: &str) -> Self {
        Self {
            synthesizer,
            language: language.trim().to_string(),
        }
    }

    pub fn is_supported(&self) -> bool {
        self.synthesizer.is_some()
    }

    /// Single-flight: any utterance in progress is cancelled first.
    pub fn speak(&self, text: &str) -> Result<NarrationOutcome, NarrationError> {
        let Some(synthesizer) = self.synthesizer.as_ref() else {
            tracing::debug!("narration requested without a synthesizer");
            return Ok(NarrationOutcome::Unsupported);
        };
        synthesizer.cancel();

        let spoken = strip_markup(text);
        if spoken.is_empty() {
            return Ok(NarrationOutcome::NothingToSay);
        }
        let voices = synthesizer.voices();
        let voice = select_voice(&voices, &self.language);
        synthesizer.speak(&spoken, voice)?;
        tracing::debug!(
            voice = voice.map(|v| v.id.as_str()).unwrap_or("platform-default"),
            chars = spoken.chars().count(),
            "narration started"
        );
        Ok(NarrationOutcome::Speaking {
            voice_id: voice.map(|v| v.id.clone()),
        })
    }

    pub fn cancel(&self) {
        if let Some(synthesizer) = self.synthesizer.as_ref() {
            synthesizer.cancel();
        }
    }
}

/// Exact tag, then primary subtag, then the default voice, then any voice.
pub fn select_voice<'a>(voices: &'a [Voice], language: &str) -> Option<&'a Voice> {
    let wanted = language.trim();
    let primary = wanted.split(['-', '_']).next().unwrap_or(wanted);
    voices
        .iter()
        .find(|voice| voice.language.eq_ignore_ascii_case(wanted))
        .or_else(|| {
            voices.iter().find(|voice| {
                voice
                    .language
                    .split(['-', '_'])
                    .next()
                    .is_some_and(|tag| !primary.is_empty() && tag.eq_ignore_ascii_case(primary))
            })
        })
        .or_else(|| voices.iter().find(|voice| voice.is_default))
        .or_else(|| voices.first())
}

#[derive(Debug, Default)]
struct ScriptedSynthesizerState {
    voices: Vec<Voice>,
    spoken: Vec<(String, Option<String>)>,
    cancels: usize,
}

/// Records utterances instead of playing them.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSynthesizer {
    state: Arc<Mutex<ScriptedSynthesizerState>>,
}

impl ScriptedSynthesizer {
    pub fn with_voices(voices: Vec<Voice>) -> Self {
        let synthesizer = Self::default();
        synthesizer.lock().voices = voices;
        synthesizer
    }

    /// `(text, voice id)` pairs in the order they were spoken.
    pub fn spoken(&self) -> Vec<(String, Option<String>)> {
        self.lock().spoken.clone()
    }

    pub fn cancels(&self) -> usize {
        self.lock().cancels
    }

    fn lock(&self) -> MutexGuard<'_, ScriptedSynthesizerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SpeechSynthesizer for ScriptedSynthesizer {
    fn voices(&self) -> Vec<Voice> {
        self.lock().voices.clone()
    }

    fn speak(&self, text: &str, voice: Option<&Voice>) -> Result<(), NarrationError> {
        self.lock()
            .spoken
            .push((text.to_string(), voice.map(|v| v.id.clone())));
        Ok(())
    }

    fn cancel(&self) {
        self.lock().cancels += 1;
    }
}
