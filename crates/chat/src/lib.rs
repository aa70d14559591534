pub mod attachment;
pub mod controller;
pub mod dictation;
pub mod export;
pub mod thread;
pub mod title;

pub use attachment::{AttachmentError, AttachmentResult, MAX_IMAGE_SIZE_BYTES};
pub use controller::{
    APOLOGY_MESSAGE, ActiveGeneration, ActiveSelection, ChatController, ControllerState,
    EditInProgress, Notice, NoticeKind, UiEvent,
};
pub use dictation::{DictationConfig, DictationEvent, TranscriptSegment, final_transcript};
pub use export::{ExportedThread, export_file_name, render_thread};
pub use thread::{
    GenPhase, GenerationId, GenerationTarget, ImageRef, Message, Part, PhaseRejection,
    PhaseTransition, PhaseTransitionResult, Role, Thread, ThreadId,
};
pub use title::{DEFAULT_THREAD_TITLE, FALLBACK_TITLE, build_title_prompt, sanitize_title};
