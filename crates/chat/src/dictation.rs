/// Configuration handed to the speech recognizer on the presentation side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DictationConfig {
    pub language: String,
    pub interim_results: bool,
}

impl Default for DictationConfig {
    fn default() -> Self {
        Self {
            language: "ru-RU".to_string(),
            interim_results: true,
        }
    }
}

/// One recognized fragment. Interim segments are surfaced by the recognizer
/// but only final ones are committed to the draft.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptSegment {
    pub text: String,
    pub is_final: bool,
}

/// Events crossing the speech-to-text boundary into the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DictationEvent {
    Started,
    Ended,
    Error(String),
    Result(Vec<TranscriptSegment>),
}

/// Concatenation of the final segments of one result batch.
pub fn final_transcript(segments: &[TranscriptSegment]) -> String {
    segments
        .iter()
        .filter(|segment| segment.is_final)
        .map(|segment| segment.text.as_str())
        .collect()
}
