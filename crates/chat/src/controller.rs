use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use mica_llm::{
    CancelHandle, RequestPart, SessionEvent, SessionEventStream, SessionFactory, Turn, TurnRole,
};
use mica_store::{BlobStore, StoreResult, ThreadRecord, load_threads, save_threads};

use crate::attachment;
use crate::dictation::{DictationEvent, final_transcript};
use crate::export::{self, ExportedThread};
use crate::thread::{
    GenPhase, GenerationId, GenerationTarget, ImageRef, Message, Part, PhaseTransition, Role,
    Thread, ThreadId,
};
use crate::title;

/// Placeholder text shown when a generation fails mid-flight.
pub const APOLOGY_MESSAGE: &str = "Sorry, an error occurred while generating the response.";

/// Severity of a user-facing notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Info,
    Success,
    Error,
}

/// One transient user-facing notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub text: String,
}

/// Events crossing the presentation boundary. `StateChanged` asks the view
/// to re-read the controller state; notices are transient toasts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    StateChanged,
    Notice(Notice),
}

/// One user-message edit in progress. At most one exists process-wide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditInProgress {
    pub thread_id: ThreadId,
    pub message_index: usize,
    pub draft: String,
}

/// Input-surface state tied to the current selection.
#[derive(Debug, Default)]
pub struct ActiveSelection {
    pub active_thread: Option<ThreadId>,
    pub draft: String,
    pub pending_image: Option<ImageRef>,
    pub editing: Option<EditInProgress>,
    pub dictating: bool,
}

/// Bookkeeping for one in-flight generation.
pub struct ActiveGeneration {
    pub target: GenerationTarget,
    pub cancel: CancelHandle,
}

/// The single explicit state root. Owned by [`ChatController`] behind a
/// mutex; lock scopes never span an await point.
pub struct ControllerState {
    pub threads: Vec<Thread>,
    pub selection: ActiveSelection,
    pub generations: HashMap<ThreadId, ActiveGeneration>,
    next_generation: u64,
    last_thread_id: u64,
}

impl ControllerState {
    fn new(threads: Vec<Thread>) -> Self {
        let last_thread_id = threads.iter().map(|thread| thread.id.0).max().unwrap_or(0);
        Self {
            threads,
            selection: ActiveSelection::default(),
            generations: HashMap::new(),
            next_generation: 1,
            last_thread_id,
        }
    }

    pub fn thread(&self, thread_id: ThreadId) -> Option<&Thread> {
        self.threads.iter().find(|thread| thread.id == thread_id)
    }

    fn thread_index(&self, thread_id: ThreadId) -> Option<usize> {
        self.threads.iter().position(|thread| thread.id == thread_id)
    }

    /// Creation-time id, bumped past the previous allocation on collision so
    /// two threads created within one millisecond stay distinct.
    fn alloc_thread_id(&mut self) -> ThreadId {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0);
        let raw = if now <= self.last_thread_id {
            self.last_thread_id + 1
        } else {
            now
        };
        self.last_thread_id = raw;
        ThreadId::new(raw)
    }

    /// Reserves the next generation target so follow-up sends never reuse one.
    fn alloc_generation(&mut self, thread_id: ThreadId) -> GenerationTarget {
        let generation = GenerationId::new(self.next_generation);
        self.next_generation = self.next_generation.saturating_add(1);
        GenerationTarget::new(thread_id, generation)
    }
}

/// Terminal outcome of one generation stream.
enum StreamOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

/// Shared handles cloned into worker and reader tasks.
#[derive(Clone)]
struct Shared {
    state: Arc<Mutex<ControllerState>>,
    factory: Arc<dyn SessionFactory>,
    store: Arc<dyn BlobStore>,
    events: mpsc::UnboundedSender<UiEvent>,
}

/// Orchestrates threads, streaming generations, editing, and persistence.
///
/// All methods are synchronous and lock-scoped; network IO runs in spawned
/// tasks, so the controller must be used inside a tokio runtime.
pub struct ChatController {
    shared: Shared,
}

impl ChatController {
    /// Reads the persisted thread set and reconstructs a live session per
    /// thread. A failed session construction leaves the thread readable with
    /// `session: None`; the next send retries construction.
    pub fn load(
        factory: Arc<dyn SessionFactory>,
        store: Arc<dyn BlobStore>,
    ) -> StoreResult<(Self, mpsc::UnboundedReceiver<UiEvent>)> {
        let records = load_threads(store.as_ref())?;

        let mut threads = Vec::with_capacity(records.len());
        for record in &records {
            let history: Vec<Message> = record.history.iter().map(Message::from_record).collect();
            let session =
                match factory.create(turns_from_history(&history), &record.system_instruction) {
                    Ok(session) => Some(session),
                    Err(error) => {
                        tracing::warn!(
                            thread_id = record.id,
                            error = %error,
                            "failed to reconstruct model session; thread stays readable"
                        );
                        None
                    }
                };

            threads.push(Thread {
                id: ThreadId::new(record.id),
                title: record.title.clone(),
                system_instruction: record.system_instruction.clone(),
                history,
                session,
                phase: GenPhase::Idle,
            });
        }

        let (events, receiver) = mpsc::unbounded_channel();
        let shared = Shared {
            state: Arc::new(Mutex::new(ControllerState::new(threads))),
            factory,
            store,
            events,
        };
        Ok((Self { shared }, receiver))
    }

    /// Direct read access to the state root, for views and tests.
    pub fn inspect(&self) -> MutexGuard<'_, ControllerState> {
        self.shared.lock()
    }

    /// Creates a fresh thread with a fresh session and selects it. Returns
    /// `None` when session construction fails; nothing is created then.
    pub fn create_thread(&self) -> Option<ThreadId> {
        let mut state = self.shared.lock();
        let thread_id = self.shared.create_thread_locked(&mut state)?;
        self.shared.persist(&state);
        drop(state);
        self.shared.state_changed();
        Some(thread_id)
    }

    pub fn select_thread(&self, thread_id: ThreadId) -> bool {
        let mut state = self.shared.lock();
        if state.thread(thread_id).is_none() {
            return false;
        }
        state.selection.active_thread = Some(thread_id);
        drop(state);
        self.shared.state_changed();
        true
    }

    /// Removes a thread. An in-flight generation is cancelled first so no
    /// event can ever be applied to a deleted thread.
    pub fn delete_thread(&self, thread_id: ThreadId) -> bool {
        let mut state = self.shared.lock();
        let Some(index) = state.thread_index(thread_id) else {
            return false;
        };

        if let Some(mut generation) = state.generations.remove(&thread_id) {
            generation.cancel.cancel();
        }
        state.threads.remove(index);

        if state.selection.active_thread == Some(thread_id) {
            state.selection.active_thread = None;
        }
        if state
            .selection
            .editing
            .as_ref()
            .is_some_and(|edit| edit.thread_id == thread_id)
        {
            state.selection.editing = None;
        }

        self.shared.persist(&state);
        drop(state);
        self.shared.state_changed();
        true
    }

    /// Replaces the thread's system instruction and rebuilds its session from
    /// the full replay. Any in-flight generation is cancelled first so no
    /// delta lands under the stale instruction.
    pub fn set_system_instruction(
        &self,
        thread_id: ThreadId,
        instruction: impl Into<String>,
    ) -> bool {
        let instruction = instruction.into();
        let mut state = self.shared.lock();
        let Some(index) = state.thread_index(thread_id) else {
            return false;
        };

        if let GenPhase::Sending(target) = state.threads[index].phase {
            let _ = state.threads[index]
                .apply_phase_transition(PhaseTransition::RequestCancel(target));
            if let Some(generation) = state.generations.get_mut(&thread_id) {
                generation.cancel.cancel();
            }
        }

        state.threads[index].system_instruction = instruction.clone();
        let turns = turns_from_history(&state.threads[index].history);
        match self.shared.factory.create(turns, &instruction) {
            Ok(session) => state.threads[index].session = Some(session),
            Err(error) => {
                tracing::warn!(
                    thread_id = thread_id.0,
                    error = %error,
                    "failed to rebuild session after instruction change"
                );
                state.threads[index].session = None;
            }
        }

        self.shared.persist(&state);
        drop(state);
        self.shared.state_changed();
        true
    }

    pub fn set_draft(&self, text: impl Into<String>) {
        let mut state = self.shared.lock();
        state.selection.draft = text.into();
    }

    /// Validates and stages one image for the next send.
    pub fn attach_image(&self, mime_type: impl Into<String>, bytes: Vec<u8>) -> bool {
        let mime_type = mime_type.into();
        if let Err(error) = attachment::validate_image(&mime_type, bytes.len()) {
            self.shared.notice(NoticeKind::Error, error.to_string());
            return false;
        }

        let mut state = self.shared.lock();
        state.selection.pending_image = Some(ImageRef { mime_type, bytes });
        drop(state);
        self.shared.state_changed();
        true
    }

    pub fn clear_image(&self) {
        let mut state = self.shared.lock();
        state.selection.pending_image = None;
        drop(state);
        self.shared.state_changed();
    }

    /// Sends the current draft (and staged image) to the active thread,
    /// creating and selecting a fresh thread when none is active.
    pub fn send_message(&self) -> bool {
        let (text, image) = {
            let state = self.shared.lock();
            (
                state.selection.draft.clone(),
                state.selection.pending_image.clone(),
            )
        };
        self.start_send(None, text, image, true, None)
    }

    /// Moves the thread to `Cancelling` and fires the cancellation token.
    /// The transcript is settled when the stream's terminal event arrives.
    pub fn cancel_generation(&self, thread_id: ThreadId) -> bool {
        let mut state = self.shared.lock();
        let Some(index) = state.thread_index(thread_id) else {
            return false;
        };
        let GenPhase::Sending(target) = state.threads[index].phase else {
            return false;
        };

        if state.threads[index]
            .apply_phase_transition(PhaseTransition::RequestCancel(target))
            .is_err()
        {
            return false;
        }
        if let Some(generation) = state.generations.get_mut(&thread_id) {
            generation.cancel.cancel();
        }

        drop(state);
        self.shared.state_changed();
        true
    }

    /// Begins editing one of the user's own messages. Exactly one edit may be
    /// in progress process-wide.
    pub fn begin_edit(&self, thread_id: ThreadId, message_index: usize) -> bool {
        let mut state = self.shared.lock();
        if state.selection.editing.is_some() {
            self.shared
                .notice(NoticeKind::Error, "Another edit is already in progress.");
            return false;
        }

        let Some(thread) = state.thread(thread_id) else {
            return false;
        };
        let Some(message) = thread.history.get(message_index) else {
            return false;
        };
        if message.role != Role::User {
            return false;
        }

        let draft = message.text().to_string();
        state.selection.editing = Some(EditInProgress {
            thread_id,
            message_index,
            draft,
        });
        drop(state);
        self.shared.state_changed();
        true
    }

    pub fn update_edit_draft(&self, text: impl Into<String>) {
        let mut state = self.shared.lock();
        if let Some(edit) = state.selection.editing.as_mut() {
            edit.draft = text.into();
        }
    }

    pub fn cancel_edit(&self) {
        let mut state = self.shared.lock();
        state.selection.editing = None;
        drop(state);
        self.shared.state_changed();
    }

    /// Commits the edit: re-sends the edited text on top of the history
    /// truncated to just before the edited message. The truncation is applied
    /// inside the send sequence only once the send is accepted, so an aborted
    /// send leaves the transcript untouched and the edit still in progress.
    pub fn save_edit(&self) -> bool {
        let (thread_id, message_index, text) = {
            let state = self.shared.lock();
            let Some(edit) = state.selection.editing.clone() else {
                return false;
            };
            (edit.thread_id, edit.message_index, edit.draft)
        };

        if text.trim().is_empty() {
            self.shared
                .notice(NoticeKind::Error, "The edited message cannot be empty.");
            return false;
        }

        let accepted = self.start_send(Some(thread_id), text, None, false, Some(message_index));
        if accepted {
            let mut state = self.shared.lock();
            state.selection.editing = None;
            state.selection.active_thread = Some(thread_id);
            drop(state);
            self.shared.state_changed();
        }
        accepted
    }

    /// Renders the thread as a flat text document for download.
    pub fn export_thread(&self, thread_id: ThreadId) -> Option<ExportedThread> {
        let exported = {
            let state = self.shared.lock();
            let Some(thread) = state.thread(thread_id) else {
                self.shared
                    .notice(NoticeKind::Error, "Select a thread to export.");
                return None;
            };
            export::render_thread(thread)
        };
        self.shared.notice(NoticeKind::Success, "Thread exported.");
        Some(exported)
    }

    /// Applies one event from the speech-to-text boundary. Only final
    /// transcript segments are committed to the draft.
    pub fn apply_dictation_event(&self, event: DictationEvent) {
        let mut state = self.shared.lock();
        match event {
            DictationEvent::Started => state.selection.dictating = true,
            DictationEvent::Ended => state.selection.dictating = false,
            DictationEvent::Error(details) => {
                state.selection.dictating = false;
                tracing::warn!(error = %details, "speech recognition failed");
                self.shared.notice(NoticeKind::Error, "Voice input error.");
            }
            DictationEvent::Result(segments) => {
                let transcript = final_transcript(&segments);
                if !transcript.is_empty() {
                    state.selection.draft.push_str(&transcript);
                }
            }
        }
        drop(state);
        self.shared.state_changed();
    }

    /// The full send sequence. `explicit_thread` pins the target thread
    /// (edit-and-resend); otherwise the active selection is used, creating a
    /// fresh thread when nothing is selected. `from_selection` clears the
    /// draft and staged image once the messages are visible. `truncate_to`
    /// sends on top of the history cut to that length instead of the full
    /// transcript; the cut is only installed once the send is accepted.
    fn start_send(
        &self,
        explicit_thread: Option<ThreadId>,
        text: String,
        image: Option<ImageRef>,
        from_selection: bool,
        truncate_to: Option<usize>,
    ) -> bool {
        let shared = &self.shared;
        let mut state = shared.lock();

        let trimmed = text.trim().to_string();
        if trimmed.is_empty() && image.is_none() {
            return false;
        }

        let thread_id = match explicit_thread.or(state.selection.active_thread) {
            Some(thread_id) => thread_id,
            None => match shared.create_thread_locked(&mut state) {
                Some(thread_id) => thread_id,
                // The notice is emitted inside; nothing was mutated.
                None => return false,
            },
        };
        let Some(index) = state.thread_index(thread_id) else {
            return false;
        };

        if state.threads[index].phase.is_busy() {
            shared.notice(
                NoticeKind::Error,
                "A response is already being generated in this thread.",
            );
            return false;
        }

        if let Some(cut) = truncate_to {
            // A truncated resend replays from the shortened baseline, so the
            // session is rebuilt first; a construction failure aborts the
            // whole send with the transcript untouched.
            let cut = cut.min(state.threads[index].history.len());
            let baseline: Vec<Message> = state.threads[index].history[..cut].to_vec();
            let turns = turns_from_history(&baseline);
            let instruction = state.threads[index].system_instruction.clone();
            match shared.factory.create(turns, &instruction) {
                Ok(session) => {
                    let thread = &mut state.threads[index];
                    thread.session = Some(session);
                    thread.history = baseline;
                }
                Err(error) => {
                    tracing::error!(
                        thread_id = thread_id.0,
                        error = %error,
                        "failed to construct model session"
                    );
                    shared.notice(
                        NoticeKind::Error,
                        format!("Session error: {error}. Try creating a new thread."),
                    );
                    return false;
                }
            }
        } else if state.threads[index].session.is_none() {
            // Lazy session retry after a failed reconstruction.
            let turns = turns_from_history(&state.threads[index].history);
            let instruction = state.threads[index].system_instruction.clone();
            match shared.factory.create(turns, &instruction) {
                Ok(session) => state.threads[index].session = Some(session),
                Err(error) => {
                    tracing::error!(
                        thread_id = thread_id.0,
                        error = %error,
                        "failed to construct model session"
                    );
                    shared.notice(
                        NoticeKind::Error,
                        format!("Session error: {error}. Try creating a new thread."),
                    );
                    return false;
                }
            }
        }

        // Request parts carry the image first, then the text.
        let mut request_parts = Vec::new();
        let mut encode_error = None;
        if let Some(image) = &image {
            match attachment::encode_image(image) {
                Ok(part) => request_parts.push(part),
                Err(error) => encode_error = Some(error.to_string()),
            }
        }
        if !trimmed.is_empty() {
            request_parts.push(RequestPart::Text(trimmed.clone()));
        }
        if request_parts.is_empty() && encode_error.is_none() {
            encode_error = Some("message has no sendable content".to_string());
        }

        let prior_was_empty = state.threads[index].history.is_empty();
        let target = state.alloc_generation(thread_id);

        let mut message_parts = Vec::new();
        if let Some(image) = image {
            message_parts.push(Part::Image(image));
        }
        if !trimmed.is_empty() {
            message_parts.push(Part::Text(trimmed.clone()));
        }

        {
            let thread = &mut state.threads[index];
            thread.history.push(Message::new(Role::User, message_parts));
            thread.history.push(Message::model_placeholder());
            let _ = thread.apply_phase_transition(PhaseTransition::Start(target));
        }

        if from_selection {
            state.selection.draft.clear();
            state.selection.pending_image = None;
        }

        shared.persist(&state);
        shared.state_changed();

        // An unencodable attachment fails the already-visible exchange.
        if let Some(details) = encode_error {
            shared.finalize_generation(
                &mut state,
                target,
                StreamOutcome::Failed(details),
                "",
                Turn::user(Vec::new()),
            );
            return false;
        }

        let user_turn = Turn::user(request_parts.clone());
        let handle = {
            let thread = &mut state.threads[index];
            let Some(session) = thread.session.as_mut() else {
                return false;
            };
            match session.send(request_parts) {
                Ok(handle) => handle,
                Err(error) => {
                    tracing::error!(
                        thread_id = thread_id.0,
                        error = %error,
                        "failed to open generation stream"
                    );
                    shared.finalize_generation(
                        &mut state,
                        target,
                        StreamOutcome::Failed(error.to_string()),
                        "",
                        user_turn,
                    );
                    return false;
                }
            }
        };

        state.generations.insert(
            thread_id,
            ActiveGeneration {
                target,
                cancel: handle.cancel,
            },
        );
        drop(state);

        tokio::spawn(handle.worker);
        tokio::spawn(run_stream_reader(
            shared.clone(),
            target,
            handle.stream,
            user_turn,
            trimmed,
            prior_was_empty,
        ));
        true
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notice(&self, kind: NoticeKind, text: impl Into<String>) {
        let _ = self.events.send(UiEvent::Notice(Notice {
            kind,
            text: text.into(),
        }));
    }

    fn state_changed(&self) {
        let _ = self.events.send(UiEvent::StateChanged);
    }

    /// Creates, prepends, and selects a fresh thread. Emits a notice and
    /// leaves the state untouched when session construction fails.
    fn create_thread_locked(&self, state: &mut ControllerState) -> Option<ThreadId> {
        let session = match self.factory.create(Vec::new(), "") {
            Ok(session) => session,
            Err(error) => {
                tracing::error!(error = %error, "failed to construct model session");
                self.notice(
                    NoticeKind::Error,
                    format!("Session error: {error}. Check the endpoint configuration."),
                );
                return None;
            }
        };

        let thread_id = state.alloc_thread_id();
        let mut thread = Thread::new(thread_id, title::DEFAULT_THREAD_TITLE);
        thread.session = Some(session);
        state.threads.insert(0, thread);
        state.selection.active_thread = Some(thread_id);
        Some(thread_id)
    }

    fn persist(&self, state: &ControllerState) {
        let records: Vec<ThreadRecord> = state
            .threads
            .iter()
            .map(|thread| ThreadRecord {
                id: thread.id.0,
                title: thread.title.clone(),
                system_instruction: thread.system_instruction.clone(),
                history: thread.history.iter().map(Message::to_record).collect(),
            })
            .collect();

        if let Err(error) = save_threads(self.store.as_ref(), &records) {
            tracing::error!(error = %error, "failed to persist threads");
            self.notice(NoticeKind::Error, "Failed to save chat history.");
        }
    }

    /// Replaces the placeholder's text with the full running prefix. Dropped
    /// when the target is stale or cancellation is pending.
    fn apply_delta(&self, target: GenerationTarget, running: &str) {
        let mut state = self.lock();
        let Some(index) = state.thread_index(target.thread_id) else {
            return;
        };
        if !state.threads[index].phase.accepts_delta(target) {
            return;
        }

        if let Some(last) = state.threads[index].history.last_mut()
            && last.role == Role::Model
        {
            last.set_text(running.to_string());
        }
        drop(state);
        self.state_changed();
    }

    /// Settles one generation. Returns true only for the completed outcome,
    /// which is what gates the title subflow. While the phase is
    /// `Cancelling`, every terminal resolves as cancelled: the user's cancel
    /// wins any race with a late `Done` or `Error`.
    fn finalize_generation(
        &self,
        state: &mut ControllerState,
        target: GenerationTarget,
        outcome: StreamOutcome,
        full_text: &str,
        user_turn: Turn,
    ) -> bool {
        let Some(index) = state.thread_index(target.thread_id) else {
            state.generations.remove(&target.thread_id);
            return false;
        };
        if state.threads[index].phase.active_target() != Some(target) {
            return false;
        }

        let outcome = if matches!(state.threads[index].phase, GenPhase::Cancelling(_)) {
            StreamOutcome::Cancelled
        } else {
            outcome
        };

        let mut completed = false;
        match outcome {
            StreamOutcome::Completed => {
                let thread = &mut state.threads[index];
                if let Some(last) = thread.history.last_mut()
                    && last.role == Role::Model
                {
                    last.set_text(full_text.to_string());
                }
                let _ = thread.apply_phase_transition(PhaseTransition::Complete(target));
                if let Some(session) = thread.session.as_mut() {
                    session.commit_exchange(user_turn, full_text.to_string());
                }
                completed = true;
            }
            StreamOutcome::Cancelled => {
                let thread = &mut state.threads[index];
                if thread
                    .history
                    .last()
                    .is_some_and(|message| message.role == Role::Model)
                {
                    thread.history.pop();
                }
                let _ = thread.apply_phase_transition(PhaseTransition::ObserveCancelled(target));
                self.notice(NoticeKind::Success, "Generation cancelled.");
            }
            StreamOutcome::Failed(details) => {
                tracing::error!(
                    thread_id = target.thread_id.0,
                    error = %details,
                    "generation failed"
                );
                let thread = &mut state.threads[index];
                if let Some(last) = thread.history.last_mut()
                    && last.role == Role::Model
                {
                    last.set_text(APOLOGY_MESSAGE.to_string());
                } else {
                    thread.history.push(Message::new(
                        Role::Model,
                        vec![Part::Text(APOLOGY_MESSAGE.to_string())],
                    ));
                }
                let _ = thread.apply_phase_transition(PhaseTransition::Fail(target));
                self.notice(
                    NoticeKind::Error,
                    "An error occurred while sending the message.",
                );
            }
        }

        state.generations.remove(&target.thread_id);
        self.persist(state);
        self.state_changed();
        completed
    }

    /// Names a thread after its first completed exchange. Failures fall back
    /// to a fixed title and never surface as errors.
    async fn run_title_flow(&self, thread_id: ThreadId, user_text: String, model_text: String) {
        let prompt = title::build_title_prompt(&user_text, &model_text);
        let generated = match self.factory.create(Vec::new(), title::TITLE_INSTRUCTION) {
            Ok(session) => match session.generate(prompt).await {
                Ok(raw) => title::sanitize_title(&raw),
                Err(error) => {
                    tracing::warn!(
                        thread_id = thread_id.0,
                        error = %error,
                        "title generation failed"
                    );
                    title::FALLBACK_TITLE.to_string()
                }
            },
            Err(error) => {
                tracing::warn!(
                    thread_id = thread_id.0,
                    error = %error,
                    "title session construction failed"
                );
                title::FALLBACK_TITLE.to_string()
            }
        };

        let mut state = self.lock();
        let Some(index) = state.thread_index(thread_id) else {
            return;
        };
        state.threads[index].title = generated;
        self.persist(&state);
        drop(state);
        self.state_changed();
    }
}

/// Drains one generation stream, applying each delta as the full running
/// prefix so redraws stay idempotent. A stream that closes without a terminal
/// event is settled as a failure.
async fn run_stream_reader(
    shared: Shared,
    target: GenerationTarget,
    mut stream: SessionEventStream,
    user_turn: Turn,
    user_text: String,
    prior_was_empty: bool,
) {
    let mut running = String::new();
    let mut outcome = None;

    while let Some(event) = stream.recv().await {
        match event {
            SessionEvent::Delta(chunk) => {
                running.push_str(&chunk);
                shared.apply_delta(target, &running);
            }
            SessionEvent::Done => {
                outcome = Some(StreamOutcome::Completed);
                break;
            }
            SessionEvent::Cancelled => {
                outcome = Some(StreamOutcome::Cancelled);
                break;
            }
            SessionEvent::Error(details) => {
                outcome = Some(StreamOutcome::Failed(details));
                break;
            }
        }
    }

    let outcome = outcome.unwrap_or_else(|| {
        StreamOutcome::Failed("generation stream ended before a terminal event".to_string())
    });

    let completed = {
        let mut state = shared.lock();
        shared.finalize_generation(&mut state, target, outcome, &running, user_turn)
    };

    if completed && prior_was_empty {
        shared.run_title_flow(target.thread_id, user_text, running).await;
    }
}

/// Converts one message into its transport parts. Empty text parts are
/// skipped; an image that no longer encodes is dropped with a warning.
fn request_parts(message: &Message) -> Vec<RequestPart> {
    let mut parts = Vec::new();
    for part in &message.parts {
        match part {
            Part::Text(text) if !text.is_empty() => parts.push(RequestPart::Text(text.clone())),
            Part::Text(_) => {}
            Part::Image(image) => match attachment::encode_image(image) {
                Ok(part) => parts.push(part),
                Err(error) => {
                    tracing::warn!(error = %error, "skipping unencodable image part");
                }
            },
        }
    }
    parts
}

/// Replay history for session construction. Messages with no transportable
/// content (the streaming placeholder included) are skipped.
fn turns_from_history(history: &[Message]) -> Vec<Turn> {
    history
        .iter()
        .filter_map(|message| {
            let parts = request_parts(message);
            if parts.is_empty() {
                return None;
            }
            let role = match message.role {
                Role::User => TurnRole::User,
                Role::Model => TurnRole::Model,
            };
            Some(Turn::new(role, parts))
        })
        .collect()
}
