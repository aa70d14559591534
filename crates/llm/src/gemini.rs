use futures::StreamExt;
use serde::{Deserialize, Serialize};
use snafu::{IntoError, ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};

use crate::session::{
    BoxFuture, BuildClientSnafu, EmptyPartsSnafu, EmptyResponseSnafu, EndpointStatusSnafu,
    HttpRequestSnafu, MissingApiKeySnafu, ModelSession, RequestPart, SessionConfig, SessionError,
    SessionEvent, SessionFactory, SessionResult, SessionStreamHandle, SessionWorker,
    StreamChunkSnafu, Turn, TurnRole, make_event_stream,
};
use crate::sse::SseParser;

/// Safety thresholds sent with every generation request. The endpoint's
/// defaults block benign chat content, so every category is set permissive.
const SAFETY_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];
const SAFETY_THRESHOLD: &str = "BLOCK_NONE";

/// Builds [`GeminiSession`] handles from one shared endpoint config.
#[derive(Debug, Clone)]
pub struct GeminiSessionFactory {
    config: SessionConfig,
}

impl GeminiSessionFactory {
    pub fn new(config: SessionConfig) -> SessionResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "factory-new",
            }
        );
        Ok(Self { config })
    }

    pub fn from_env() -> SessionResult<Self> {
        Self::new(SessionConfig::from_env()?)
    }
}

impl SessionFactory for GeminiSessionFactory {
    fn create(
        &self,
        history: Vec<Turn>,
        system_instruction: &str,
    ) -> SessionResult<Box<dyn ModelSession>> {
        let session = GeminiSession::new(self.config.clone(), history, system_instruction)?;
        Ok(Box::new(session))
    }
}

/// One connection to the generation endpoint, carrying the replay history and
/// system instruction it was constructed with.
pub struct GeminiSession {
    config: SessionConfig,
    client: reqwest::Client,
    system_instruction: String,
    history: Vec<Turn>,
}

impl GeminiSession {
    pub fn new(
        config: SessionConfig,
        history: Vec<Turn>,
        system_instruction: &str,
    ) -> SessionResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "session-new",
            }
        );
        let client = reqwest::Client::builder()
            .build()
            .context(BuildClientSnafu {
                stage: "session-new",
            })?;

        Ok(Self {
            config,
            client,
            system_instruction: system_instruction.trim().to_string(),
            history,
        })
    }

    fn stream_url(config: &SessionConfig) -> String {
        format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            config.base_url, config.model_id
        )
    }

    fn generate_url(config: &SessionConfig) -> String {
        format!(
            "{}/models/{}:generateContent",
            config.base_url, config.model_id
        )
    }

    fn build_stream_body(&self, user_parts: &[RequestPart]) -> WireRequest {
        let mut contents: Vec<WireContent> = self.history.iter().map(WireContent::from).collect();
        contents.push(WireContent {
            role: Some("user".to_string()),
            parts: user_parts.iter().map(WirePart::from).collect(),
        });

        WireRequest {
            contents,
            system_instruction: if self.system_instruction.is_empty() {
                None
            } else {
                Some(WireContent {
                    role: None,
                    parts: vec![WirePart::Text {
                        text: self.system_instruction.clone(),
                    }],
                })
            },
            safety_settings: Some(permissive_safety_settings()),
        }
    }

    fn build_generate_body(prompt: String) -> WireRequest {
        WireRequest {
            contents: vec![WireContent {
                role: Some("user".to_string()),
                parts: vec![WirePart::Text { text: prompt }],
            }],
            system_instruction: None,
            safety_settings: Some(permissive_safety_settings()),
        }
    }

    fn emit(event_tx: &mpsc::UnboundedSender<SessionEvent>, event: SessionEvent) {
        let _ = event_tx.send(event);
    }

    fn emit_error(event_tx: &mpsc::UnboundedSender<SessionEvent>, error: SessionError) {
        Self::emit(event_tx, SessionEvent::Error(error.to_string()));
    }

    async fn open_stream(
        client: &reqwest::Client,
        config: &SessionConfig,
        body: &WireRequest,
    ) -> SessionResult<reqwest::Response> {
        let response = client
            .post(Self::stream_url(config))
            .header("x-goog-api-key", &config.api_key)
            .header("Accept", "text/event-stream")
            .json(body)
            .send()
            .await
            .context(HttpRequestSnafu {
                stage: "open-stream",
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|error| format!("<failed to read body: {error}>"));
            return EndpointStatusSnafu {
                stage: "open-stream-status",
                status: status.as_u16(),
                body,
            }
            .fail();
        }

        Ok(response)
    }

    async fn run_stream_worker(
        client: reqwest::Client,
        config: SessionConfig,
        body: WireRequest,
        event_tx: mpsc::UnboundedSender<SessionEvent>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let response = match Self::open_stream(&client, &config, &body).await {
            Ok(response) => response,
            Err(error) => {
                tracing::error!(
                    model_id = %config.model_id,
                    error = %error,
                    "failed to open generation stream"
                );
                Self::emit_error(&event_tx, error);
                return;
            }
        };

        let mut bytes = response.bytes_stream();
        let mut decoder = Utf8Accumulator::default();
        let mut parser = SseParser::new();

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    tracing::debug!(model_id = %config.model_id, "generation stream cancelled");
                    Self::emit(&event_tx, SessionEvent::Cancelled);
                    return;
                }
                chunk = bytes.next() => {
                    match chunk {
                        Some(Ok(chunk)) => {
                            let text = decoder.push(&chunk);
                            for payload in parser.feed(&text) {
                                if !Self::forward_payload(&event_tx, &payload) {
                                    return;
                                }
                            }
                        }
                        Some(Err(source)) => {
                            tracing::warn!(
                                model_id = %config.model_id,
                                error = %source,
                                "generation stream emitted an error chunk"
                            );
                            let error =
                                StreamChunkSnafu { stage: "stream-chunk" }.into_error(source);
                            Self::emit_error(&event_tx, error);
                            return;
                        }
                        None => {
                            if let Some(payload) = parser.flush()
                                && !Self::forward_payload(&event_tx, &payload)
                            {
                                return;
                            }
                            Self::emit(&event_tx, SessionEvent::Done);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Parses one SSE payload and forwards its text fragments as deltas.
    /// Returns false when the stream must stop (parse failure or the
    /// receiving side went away).
    fn forward_payload(event_tx: &mpsc::UnboundedSender<SessionEvent>, payload: &str) -> bool {
        match parse_stream_deltas(payload) {
            Ok(deltas) => {
                for delta in deltas {
                    if event_tx.send(SessionEvent::Delta(delta)).is_err() {
                        return false;
                    }
                }
                true
            }
            Err(error) => {
                tracing::warn!(error = %error, "failed to parse generation stream payload");
                Self::emit_error(event_tx, error);
                false
            }
        }
    }
}

impl ModelSession for GeminiSession {
    fn send(&mut self, parts: Vec<RequestPart>) -> SessionResult<SessionStreamHandle> {
        ensure!(
            !parts.is_empty(),
            EmptyPartsSnafu {
                stage: "session-send",
                model_id: self.config.model_id.clone(),
            }
        );

        let body = self.build_stream_body(&parts);
        let (event_tx, stream, cancel, cancel_rx) = make_event_stream();
        let worker: SessionWorker = Box::pin(Self::run_stream_worker(
            self.client.clone(),
            self.config.clone(),
            body,
            event_tx,
            cancel_rx,
        ));

        Ok(SessionStreamHandle {
            stream,
            cancel,
            worker,
        })
    }

    fn generate(&self, prompt: String) -> BoxFuture<'static, SessionResult<String>> {
        let client = self.client.clone();
        let config = self.config.clone();

        Box::pin(async move {
            let body = Self::build_generate_body(prompt);
            let response = client
                .post(Self::generate_url(&config))
                .header("x-goog-api-key", &config.api_key)
                .json(&body)
                .send()
                .await
                .context(HttpRequestSnafu { stage: "generate" })?;

            let status = response.status();
            if !status.is_success() {
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|error| format!("<failed to read body: {error}>"));
                return EndpointStatusSnafu {
                    stage: "generate-status",
                    status: status.as_u16(),
                    body,
                }
                .fail();
            }

            let payload: WireResponse = response.json().await.context(HttpRequestSnafu {
                stage: "generate-decode",
            })?;

            let text = collect_candidate_text(&payload);
            ensure!(!text.is_empty(), EmptyResponseSnafu { stage: "generate" });
            Ok(text)
        })
    }

    fn commit_exchange(&mut self, user: Turn, model_text: String) {
        self.history.push(user);
        self.history.push(Turn::model(model_text));
    }

    fn replay_len(&self) -> usize {
        self.history.len()
    }
}

fn permissive_safety_settings() -> Vec<WireSafetySetting> {
    SAFETY_CATEGORIES
        .iter()
        .map(|category| WireSafetySetting {
            category,
            threshold: SAFETY_THRESHOLD,
        })
        .collect()
}

fn parse_stream_deltas(payload: &str) -> SessionResult<Vec<String>> {
    let response: WireResponse =
        serde_json::from_str(payload).map_err(|error| SessionError::PayloadParse {
            stage: "parse-stream-payload",
            details: error.to_string(),
        })?;

    let mut deltas = Vec::new();
    for candidate in response.candidates.unwrap_or_default() {
        let Some(content) = candidate.content else {
            continue;
        };
        for part in content.parts {
            if let WirePart::Text { text } = part
                && !text.is_empty()
            {
                deltas.push(text);
            }
        }
    }
    Ok(deltas)
}

fn collect_candidate_text(response: &WireResponse) -> String {
    let mut text = String::new();
    for candidate in response.candidates.iter().flatten() {
        let Some(content) = &candidate.content else {
            continue;
        };
        for part in &content.parts {
            if let WirePart::Text { text: fragment } = part {
                text.push_str(fragment);
            }
        }
    }
    text
}

/// Reassembles UTF-8 text from a byte stream whose chunk boundaries may split
/// multi-byte sequences. Invalid bytes are replaced rather than failing the
/// stream.
#[derive(Debug, Default)]
struct Utf8Accumulator {
    pending: Vec<u8>,
}

impl Utf8Accumulator {
    fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                let text = text.to_string();
                self.pending.clear();
                text
            }
            Err(error) if error.error_len().is_none() => {
                // Incomplete trailing sequence; keep it for the next chunk.
                let rest = self.pending.split_off(error.valid_up_to());
                let head = std::mem::replace(&mut self.pending, rest);
                String::from_utf8(head).unwrap_or_default()
            }
            Err(_) => {
                let text = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                text
            }
        }
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest {
    contents: Vec<WireContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<WireContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    safety_settings: Option<Vec<WireSafetySetting>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<WirePart>,
}

impl From<&Turn> for WireContent {
    fn from(turn: &Turn) -> Self {
        Self {
            role: Some(
                match turn.role {
                    TurnRole::User => "user",
                    TurnRole::Model => "model",
                }
                .to_string(),
            ),
            parts: turn.parts.iter().map(WirePart::from).collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum WirePart {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: WireBlob,
    },
}

impl From<&RequestPart> for WirePart {
    fn from(part: &RequestPart) -> Self {
        match part {
            RequestPart::Text(text) => Self::Text { text: text.clone() },
            RequestPart::InlineImage { mime_type, data } => Self::InlineData {
                inline_data: WireBlob {
                    mime_type: mime_type.clone(),
                    data: data.clone(),
                },
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireBlob {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
struct WireSafetySetting {
    category: &'static str,
    threshold: &'static str,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    candidates: Option<Vec<WireCandidate>>,
}

#[derive(Debug, Deserialize)]
struct WireCandidate {
    #[serde(default)]
    content: Option<WireContent>,
}
