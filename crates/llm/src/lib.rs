pub mod gemini;
pub mod session;
pub mod sse;

pub use gemini::{GeminiSession, GeminiSessionFactory};
pub use session::{
    BoxFuture, CancelHandle, DEFAULT_GEMINI_BASE_URL, DEFAULT_GEMINI_MODEL, ModelSession,
    RequestPart, SessionConfig, SessionError, SessionEvent, SessionEventStream, SessionFactory,
    SessionResult, SessionStreamHandle, SessionWorker, Turn, TurnRole, make_event_stream,
};
