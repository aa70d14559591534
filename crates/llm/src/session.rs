use std::future::Future;
use std::pin::Pin;

use snafu::{OptionExt, Snafu};
use tokio::sync::{mpsc, oneshot};

pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Connection settings for one generation endpoint.
///
/// The credential is supplied out-of-band and is never persisted or logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub api_key: String,
    pub base_url: String,
    pub model_id: String,
}

impl SessionConfig {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model_id: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into().trim().to_string(),
            base_url: base_url.into().trim().trim_end_matches('/').to_string(),
            model_id: model_id.into().trim().to_string(),
        }
    }

    /// Reads the endpoint credential and optional overrides from the environment.
    pub fn from_env() -> SessionResult<Self> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .context(MissingApiKeySnafu {
                stage: "config-from-env",
            })?;

        let base_url = std::env::var("GEMINI_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_GEMINI_BASE_URL.to_string());
        let model_id =
            std::env::var("GEMINI_MODEL").unwrap_or_else(|_| DEFAULT_GEMINI_MODEL.to_string());

        Ok(Self::new(api_key, base_url, model_id))
    }
}

/// One atomic piece of a request in the adapter's transport representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestPart {
    Text(String),
    /// Inline image bytes, already base64-encoded for transport.
    InlineImage { mime_type: String, data: String },
}

/// Speaker role of one replay history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnRole {
    User,
    Model,
}

/// One entry of the replay history a session handle is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: TurnRole,
    pub parts: Vec<RequestPart>,
}

impl Turn {
    pub fn new(role: TurnRole, parts: Vec<RequestPart>) -> Self {
        Self { role, parts }
    }

    pub fn user(parts: Vec<RequestPart>) -> Self {
        Self::new(TurnRole::User, parts)
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self::new(TurnRole::Model, vec![RequestPart::Text(text.into())])
    }
}

/// One event of a streaming generation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Incremental text fragment. Concatenation in order yields the full response.
    Delta(String),
    /// The stream terminated normally.
    Done,
    /// The cancellation token fired before completion; nothing follows.
    Cancelled,
    /// The stream failed mid-flight; nothing follows.
    Error(String),
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type SessionWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SessionError {
    #[snafu(display("missing API key for the generation endpoint"))]
    MissingApiKey { stage: &'static str },
    #[snafu(display("generation request for model '{model_id}' has no parts"))]
    EmptyParts {
        stage: &'static str,
        model_id: String,
    },
    #[snafu(display("failed to build HTTP client on `{stage}`: {source}"))]
    BuildClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("generation request failed on `{stage}`: {source}"))]
    HttpRequest {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("generation endpoint returned status {status}: {body}"))]
    EndpointStatus {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("generation stream failed on `{stage}`: {source}"))]
    StreamChunk {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("failed to parse endpoint payload: {details}"))]
    PayloadParse {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("generation endpoint returned no text"))]
    EmptyResponse { stage: &'static str },
}

impl SessionError {
    /// True when the failure happened while constructing a session handle,
    /// before any request could be issued.
    pub fn is_init(&self) -> bool {
        matches!(self, Self::MissingApiKey { .. } | Self::BuildClient { .. })
    }
}

/// Receiving half of one streaming generation call.
pub struct SessionEventStream {
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl SessionEventStream {
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.events.try_recv().ok()
    }
}

/// Cancellation trigger for one streaming generation call.
///
/// Held by the caller while the event stream moves into its reader task.
/// Firing it is idempotent; dropping it without firing leaves the call running.
pub struct CancelHandle {
    trigger: Option<oneshot::Sender<()>>,
}

impl CancelHandle {
    pub fn cancel(&mut self) -> bool {
        self.trigger
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

/// Everything one `send` call hands back: the event stream, the cancellation
/// trigger, and the worker future that drives the network IO. The caller must
/// spawn the worker; nothing happens until it is polled.
pub struct SessionStreamHandle {
    pub stream: SessionEventStream,
    pub cancel: CancelHandle,
    pub worker: SessionWorker,
}

/// Builds the channel plumbing for one streaming call.
///
/// Returns the sender the worker writes events into, the caller-facing stream
/// and cancel handle, and the receiver the worker selects on for cancellation.
pub fn make_event_stream() -> (
    mpsc::UnboundedSender<SessionEvent>,
    SessionEventStream,
    CancelHandle,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        SessionEventStream { events: event_rx },
        CancelHandle {
            trigger: Some(cancel_tx),
        },
        cancel_rx,
    )
}

/// One live connection to the generation endpoint, bound to a replay history
/// and a system instruction.
///
/// A handle accepts at most one outstanding `send` at a time; upholding that
/// is the caller's contract, not enforced here.
pub trait ModelSession: Send {
    /// Issues one streaming generation call for `parts` on top of the replay
    /// history. The returned worker must be spawned by the caller.
    fn send(&mut self, parts: Vec<RequestPart>) -> SessionResult<SessionStreamHandle>;

    /// One-shot, non-streaming call. Used for auxiliary requests (titles)
    /// with no conversational role; it ignores the replay history.
    fn generate(&self, prompt: String) -> BoxFuture<'static, SessionResult<String>>;

    /// Records a completed exchange so the handle's replay history matches
    /// the transcript it was constructed from.
    fn commit_exchange(&mut self, user: Turn, model_text: String);

    /// Number of replay entries the handle currently carries.
    fn replay_len(&self) -> usize;
}

/// Constructs session handles. The seam between the controller and the
/// concrete endpoint, and the injection point for scripted test sessions.
pub trait SessionFactory: Send + Sync {
    fn create(
        &self,
        history: Vec<Turn>,
        system_instruction: &str,
    ) -> SessionResult<Box<dyn ModelSession>>;
}
