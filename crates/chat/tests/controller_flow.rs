use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use mica_chat::controller::{APOLOGY_MESSAGE, ChatController, NoticeKind, UiEvent};
use mica_chat::dictation::{DictationEvent, TranscriptSegment};
use mica_chat::thread::{GenPhase, Part, Role, ThreadId};
use mica_llm::{
    BoxFuture, ModelSession, RequestPart, SessionError, SessionEvent, SessionFactory,
    SessionResult, SessionStreamHandle, Turn, make_event_stream,
};
use mica_store::{BlobStore, MemoryBlobStore, load_threads};

/// One scripted generation stream, consumed per `send` in order.
#[derive(Debug, Clone)]
enum Script {
    /// Deltas followed by a normal terminal.
    Deltas(Vec<&'static str>),
    /// A partial delta followed by a stream error.
    Error(&'static str),
    /// A delta, then the stream closes without any terminal event.
    Silent,
    /// Deltas, then the stream parks until the cancel token fires.
    Hang(Vec<&'static str>),
}

struct FactoryCore {
    scripts: Mutex<VecDeque<Script>>,
    generate_prompts: Mutex<Vec<String>>,
    create_replay_lens: Mutex<Vec<usize>>,
    sent_parts: Mutex<Vec<Vec<RequestPart>>>,
    title_response: String,
    fail_create: AtomicBool,
}

struct ScriptedFactory {
    core: Arc<FactoryCore>,
}

impl ScriptedFactory {
    fn new(scripts: Vec<Script>, title_response: &str) -> Self {
        Self {
            core: Arc::new(FactoryCore {
                scripts: Mutex::new(scripts.into()),
                generate_prompts: Mutex::new(Vec::new()),
                create_replay_lens: Mutex::new(Vec::new()),
                sent_parts: Mutex::new(Vec::new()),
                title_response: title_response.to_string(),
                fail_create: AtomicBool::new(false),
            }),
        }
    }
}

impl SessionFactory for ScriptedFactory {
    fn create(
        &self,
        history: Vec<Turn>,
        _system_instruction: &str,
    ) -> SessionResult<Box<dyn ModelSession>> {
        if self.core.fail_create.load(Ordering::SeqCst) {
            return Err(SessionError::MissingApiKey {
                stage: "scripted-create",
            });
        }
        self.core
            .create_replay_lens
            .lock()
            .unwrap()
            .push(history.len());
        Ok(Box::new(ScriptedSession {
            core: self.core.clone(),
            replay: history.len(),
        }))
    }
}

struct ScriptedSession {
    core: Arc<FactoryCore>,
    replay: usize,
}

impl ModelSession for ScriptedSession {
    fn send(&mut self, parts: Vec<RequestPart>) -> SessionResult<SessionStreamHandle> {
        self.core.sent_parts.lock().unwrap().push(parts);
        let script = self
            .core
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Deltas(vec!["ok"]));

        let (event_tx, stream, cancel, cancel_rx) = make_event_stream();
        let worker = Box::pin(async move {
            match script {
                Script::Deltas(chunks) => {
                    for chunk in chunks {
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        if event_tx.send(SessionEvent::Delta(chunk.to_string())).is_err() {
                            return;
                        }
                    }
                    let _ = event_tx.send(SessionEvent::Done);
                }
                Script::Error(details) => {
                    let _ = event_tx.send(SessionEvent::Delta("par".to_string()));
                    let _ = event_tx.send(SessionEvent::Error(details.to_string()));
                }
                Script::Silent => {
                    let _ = event_tx.send(SessionEvent::Delta("lost".to_string()));
                    // Dropping the sender closes the stream with no terminal.
                }
                Script::Hang(chunks) => {
                    for chunk in chunks {
                        let _ = event_tx.send(SessionEvent::Delta(chunk.to_string()));
                    }
                    let _ = cancel_rx.await;
                    let _ = event_tx.send(SessionEvent::Cancelled);
                }
            }
        });

        Ok(SessionStreamHandle {
            stream,
            cancel,
            worker,
        })
    }

    fn generate(&self, prompt: String) -> BoxFuture<'static, SessionResult<String>> {
        let core = self.core.clone();
        Box::pin(async move {
            core.generate_prompts.lock().unwrap().push(prompt);
            Ok(core.title_response.clone())
        })
    }

    fn commit_exchange(&mut self, _user: Turn, _model_text: String) {
        self.replay += 2;
    }

    fn replay_len(&self) -> usize {
        self.replay
    }
}

struct Fixture {
    controller: ChatController,
    core: Arc<FactoryCore>,
    store: Arc<MemoryBlobStore>,
    events: mpsc::UnboundedReceiver<UiEvent>,
}

fn setup(scripts: Vec<Script>) -> Fixture {
    let factory = ScriptedFactory::new(scripts, "\"Scripted Title.\"");
    let core = factory.core.clone();
    let store = Arc::new(MemoryBlobStore::new());
    let (controller, events) =
        ChatController::load(Arc::new(factory), store.clone()).expect("load controller");
    Fixture {
        controller,
        core,
        store,
        events,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition was not met within the polling window");
}

async fn wait_for_idle(controller: &ChatController, thread_id: ThreadId) {
    wait_until(|| {
        let state = controller.inspect();
        state
            .thread(thread_id)
            .is_some_and(|thread| thread.phase == GenPhase::Idle)
    })
    .await;
}

fn active_thread(controller: &ChatController) -> ThreadId {
    controller
        .inspect()
        .selection
        .active_thread
        .expect("a thread should be selected")
}

fn drain_notices(events: &mut mpsc::UnboundedReceiver<UiEvent>) -> Vec<(NoticeKind, String)> {
    let mut notices = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let UiEvent::Notice(notice) = event {
            notices.push((notice.kind, notice.text));
        }
    }
    notices
}

#[tokio::test]
async fn first_send_creates_thread_and_streams_response() {
    let fixture = setup(vec![Script::Deltas(vec!["Hel", "lo"])]);
    let controller = &fixture.controller;

    controller.set_draft("say hello");
    assert!(controller.send_message());

    let thread_id = active_thread(controller);
    {
        let state = controller.inspect();
        let thread = state.thread(thread_id).unwrap();
        // The user message and the placeholder appear in one mutation.
        assert_eq!(thread.history.len(), 2);
        assert_eq!(thread.history[0].role, Role::User);
        assert_eq!(thread.history[0].text(), "say hello");
        assert!(thread.history[1].is_empty_placeholder());
        assert!(state.selection.draft.is_empty());
    }

    wait_for_idle(controller, thread_id).await;

    let state = controller.inspect();
    let thread = state.thread(thread_id).unwrap();
    assert_eq!(thread.history.len(), 2);
    assert_eq!(thread.history[1].text(), "Hello");
}

#[tokio::test]
async fn title_is_generated_once_from_the_first_exchange() {
    let fixture = setup(vec![
        Script::Deltas(vec!["first reply"]),
        Script::Deltas(vec!["second reply"]),
    ]);
    let controller = &fixture.controller;

    controller.set_draft("opening question");
    assert!(controller.send_message());
    let thread_id = active_thread(controller);
    wait_for_idle(controller, thread_id).await;

    wait_until(|| {
        controller
            .inspect()
            .thread(thread_id)
            .is_some_and(|thread| thread.title == "Scripted Title")
    })
    .await;

    controller.set_draft("follow-up");
    assert!(controller.send_message());
    wait_for_idle(controller, thread_id).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let prompts = fixture.core.generate_prompts.lock().unwrap();
    assert_eq!(prompts.len(), 1, "only the first exchange names the thread");
    assert!(prompts[0].contains("User: \"opening question\""));
    assert!(prompts[0].contains("Model: \"first reply\""));
}

#[tokio::test]
async fn deltas_replace_the_placeholder_with_the_full_prefix() {
    let fixture = setup(vec![Script::Hang(vec!["Hel", "lo"])]);
    let controller = &fixture.controller;

    controller.set_draft("stream to me");
    assert!(controller.send_message());
    let thread_id = active_thread(controller);

    wait_until(|| {
        controller
            .inspect()
            .thread(thread_id)
            .is_some_and(|thread| thread.history[1].text() == "Hello")
    })
    .await;

    // Each delta lands as the full running prefix in a single text part.
    {
        let state = controller.inspect();
        let thread = state.thread(thread_id).unwrap();
        assert_eq!(thread.history[1].parts.len(), 1);
    }

    assert!(controller.cancel_generation(thread_id));
    wait_for_idle(controller, thread_id).await;
}

#[tokio::test]
async fn cancel_drops_the_placeholder_and_keeps_the_user_message() {
    let mut fixture = setup(vec![
        Script::Hang(vec!["partial"]),
        Script::Deltas(vec!["after cancel"]),
    ]);
    let controller = &fixture.controller;

    controller.set_draft("long question");
    assert!(controller.send_message());
    let thread_id = active_thread(controller);

    wait_until(|| {
        controller
            .inspect()
            .thread(thread_id)
            .is_some_and(|thread| thread.history[1].text() == "partial")
    })
    .await;

    assert!(controller.cancel_generation(thread_id));
    wait_for_idle(controller, thread_id).await;

    {
        let state = controller.inspect();
        let thread = state.thread(thread_id).unwrap();
        assert_eq!(thread.history.len(), 1);
        assert_eq!(thread.history[0].role, Role::User);
        assert_eq!(thread.history[0].text(), "long question");
    }

    let notices = drain_notices(&mut fixture.events);
    assert!(
        notices
            .iter()
            .any(|(kind, _)| *kind == NoticeKind::Success),
        "cancellation surfaces as a success notice"
    );

    // The thread is immediately usable again.
    controller.set_draft("try again");
    assert!(controller.send_message());
    wait_for_idle(controller, thread_id).await;

    let state = controller.inspect();
    let thread = state.thread(thread_id).unwrap();
    assert_eq!(thread.history.len(), 3);
    assert_eq!(thread.history[2].text(), "after cancel");
}

#[tokio::test]
async fn stream_error_replaces_the_placeholder_with_an_apology() {
    let mut fixture = setup(vec![Script::Error("endpoint exploded")]);
    let controller = &fixture.controller;

    controller.set_draft("doomed question");
    assert!(controller.send_message());
    let thread_id = active_thread(controller);
    wait_for_idle(controller, thread_id).await;

    let state = controller.inspect();
    let thread = state.thread(thread_id).unwrap();
    assert_eq!(thread.history.len(), 2);
    assert_eq!(thread.history[1].text(), APOLOGY_MESSAGE);
    drop(state);

    let notices = drain_notices(&mut fixture.events);
    assert!(notices.iter().any(|(kind, _)| *kind == NoticeKind::Error));
}

#[tokio::test]
async fn stream_closing_without_a_terminal_event_is_a_failure() {
    let fixture = setup(vec![Script::Silent]);
    let controller = &fixture.controller;

    controller.set_draft("vanishing stream");
    assert!(controller.send_message());
    let thread_id = active_thread(controller);
    wait_for_idle(controller, thread_id).await;

    let state = controller.inspect();
    let thread = state.thread(thread_id).unwrap();
    assert_eq!(thread.history[1].text(), APOLOGY_MESSAGE);
}

#[tokio::test]
async fn sends_are_rejected_while_a_generation_is_active() {
    let fixture = setup(vec![Script::Hang(vec![])]);
    let controller = &fixture.controller;

    controller.set_draft("first");
    assert!(controller.send_message());
    let thread_id = active_thread(controller);

    controller.set_draft("second");
    assert!(!controller.send_message());

    {
        let state = controller.inspect();
        let thread = state.thread(thread_id).unwrap();
        assert_eq!(thread.history.len(), 2, "the rejected send mutated nothing");
    }

    assert!(controller.cancel_generation(thread_id));
    wait_for_idle(controller, thread_id).await;
}

#[tokio::test]
async fn session_construction_failure_mutates_nothing() {
    let fixture = setup(Vec::new());
    fixture.core.fail_create.store(true, Ordering::SeqCst);
    let controller = &fixture.controller;

    controller.set_draft("hello?");
    assert!(!controller.send_message());

    let state = controller.inspect();
    assert!(state.threads.is_empty());
    assert!(state.selection.active_thread.is_none());
    drop(state);

    let records = load_threads(fixture.store.as_ref() as &dyn BlobStore).unwrap();
    assert!(records.is_empty());
}

#[tokio::test]
async fn edit_and_resend_truncates_then_regenerates() {
    let fixture = setup(vec![
        Script::Deltas(vec!["original answer"]),
        Script::Deltas(vec!["revised answer"]),
    ]);
    let controller = &fixture.controller;

    controller.set_draft("original question");
    assert!(controller.send_message());
    let thread_id = active_thread(controller);
    wait_for_idle(controller, thread_id).await;
    wait_until(|| fixture.core.generate_prompts.lock().unwrap().len() == 1).await;

    assert!(controller.begin_edit(thread_id, 0));
    controller.update_edit_draft("better question");
    assert!(controller.save_edit());
    wait_for_idle(controller, thread_id).await;

    {
        let state = controller.inspect();
        let thread = state.thread(thread_id).unwrap();
        assert_eq!(thread.history.len(), 2);
        assert_eq!(thread.history[0].text(), "better question");
        assert_eq!(thread.history[1].text(), "revised answer");
        assert!(state.selection.editing.is_none());
    }

    // Editing the first message makes it the first exchange again, so the
    // title is regenerated from the new content.
    wait_until(|| fixture.core.generate_prompts.lock().unwrap().len() == 2).await;
    let prompts = fixture.core.generate_prompts.lock().unwrap();
    assert!(prompts[1].contains("User: \"better question\""));

    // The session was rebuilt from the truncated (empty) baseline.
    let replay_lens = fixture.core.create_replay_lens.lock().unwrap();
    assert!(replay_lens.contains(&0));
}

#[tokio::test]
async fn aborted_edit_resend_leaves_history_intact() {
    let fixture = setup(vec![
        Script::Deltas(vec!["first answer"]),
        Script::Deltas(vec!["second answer"]),
        Script::Deltas(vec!["revised answer"]),
    ]);
    let controller = &fixture.controller;

    controller.set_draft("first question");
    assert!(controller.send_message());
    let thread_id = active_thread(controller);
    wait_for_idle(controller, thread_id).await;

    controller.set_draft("second question");
    assert!(controller.send_message());
    wait_for_idle(controller, thread_id).await;

    assert!(controller.begin_edit(thread_id, 2));
    controller.update_edit_draft("reworded second question");

    // Session construction fails while committing the edit: the resend is
    // rejected and the transcript keeps all four messages.
    fixture.core.fail_create.store(true, Ordering::SeqCst);
    assert!(!controller.save_edit());

    {
        let state = controller.inspect();
        let thread = state.thread(thread_id).unwrap();
        assert_eq!(thread.history.len(), 4);
        assert_eq!(thread.history[2].text(), "second question");
        assert_eq!(thread.history[3].text(), "second answer");
        assert!(!thread.phase.is_busy());
        assert!(state.selection.editing.is_some());
    }

    // Once sessions construct again the pending edit commits normally.
    fixture.core.fail_create.store(false, Ordering::SeqCst);
    assert!(controller.save_edit());
    wait_for_idle(controller, thread_id).await;

    let state = controller.inspect();
    let thread = state.thread(thread_id).unwrap();
    assert_eq!(thread.history.len(), 4);
    assert_eq!(thread.history[2].text(), "reworded second question");
    assert_eq!(thread.history[3].text(), "revised answer");
    assert!(state.selection.editing.is_none());
}

#[tokio::test]
async fn editing_a_model_message_is_rejected() {
    let fixture = setup(vec![Script::Deltas(vec!["reply"])]);
    let controller = &fixture.controller;

    controller.set_draft("question");
    assert!(controller.send_message());
    let thread_id = active_thread(controller);
    wait_for_idle(controller, thread_id).await;

    assert!(!controller.begin_edit(thread_id, 1));
    assert!(controller.inspect().selection.editing.is_none());
}

#[tokio::test]
async fn attached_image_is_sent_before_the_text() {
    let fixture = setup(vec![Script::Deltas(vec!["nice picture"])]);
    let controller = &fixture.controller;

    assert!(!controller.attach_image("text/plain", vec![1, 2, 3]));
    assert!(controller.inspect().selection.pending_image.is_none());

    assert!(controller.attach_image("image/png", vec![9, 8, 7]));
    controller.set_draft("what is this");
    assert!(controller.send_message());
    let thread_id = active_thread(controller);
    wait_for_idle(controller, thread_id).await;

    {
        let state = controller.inspect();
        let thread = state.thread(thread_id).unwrap();
        assert!(matches!(thread.history[0].parts[0], Part::Image(_)));
        assert!(matches!(thread.history[0].parts[1], Part::Text(_)));
        assert!(state.selection.pending_image.is_none());
    }

    let sent = fixture.core.sent_parts.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert!(matches!(sent[0][0], RequestPart::InlineImage { .. }));
    assert!(matches!(sent[0][1], RequestPart::Text(_)));
}

#[tokio::test]
async fn delete_thread_cancels_its_generation() {
    let fixture = setup(vec![Script::Hang(vec!["part"])]);
    let controller = &fixture.controller;

    controller.set_draft("to be deleted");
    assert!(controller.send_message());
    let thread_id = active_thread(controller);

    assert!(controller.delete_thread(thread_id));

    let state = controller.inspect();
    assert!(state.thread(thread_id).is_none());
    assert!(state.selection.active_thread.is_none());
    drop(state);

    // The reader settles without touching the deleted thread.
    tokio::time::sleep(Duration::from_millis(30)).await;
    let records = load_threads(fixture.store.as_ref() as &dyn BlobStore).unwrap();
    assert!(records.is_empty());
}

#[tokio::test]
async fn completed_exchanges_survive_a_reload() {
    let fixture = setup(vec![Script::Deltas(vec!["persisted reply"])]);
    let controller = &fixture.controller;

    controller.set_draft("persist me");
    assert!(controller.send_message());
    let thread_id = active_thread(controller);
    wait_for_idle(controller, thread_id).await;
    wait_until(|| {
        controller
            .inspect()
            .thread(thread_id)
            .is_some_and(|thread| thread.title == "Scripted Title")
    })
    .await;

    let factory = ScriptedFactory::new(Vec::new(), "unused");
    let replay_core = factory.core.clone();
    let (reloaded, _events) =
        ChatController::load(Arc::new(factory), fixture.store.clone()).expect("reload");

    let state = reloaded.inspect();
    let thread = state.thread(thread_id).expect("thread survives reload");
    assert_eq!(thread.title, "Scripted Title");
    assert_eq!(thread.history.len(), 2);
    assert_eq!(thread.history[0].text(), "persist me");
    assert_eq!(thread.history[1].text(), "persisted reply");
    assert!(thread.session.is_some());

    // The rebuilt session was given the full replay, placeholder-free.
    let replay_lens = replay_core.create_replay_lens.lock().unwrap();
    assert_eq!(replay_lens.as_slice(), &[2]);
}

#[tokio::test]
async fn dictation_commits_only_final_segments() {
    let mut fixture = setup(Vec::new());
    let controller = &fixture.controller;

    controller.set_draft("note: ");
    controller.apply_dictation_event(DictationEvent::Started);
    assert!(controller.inspect().selection.dictating);

    controller.apply_dictation_event(DictationEvent::Result(vec![
        TranscriptSegment {
            text: "прив".to_string(),
            is_final: false,
        },
        TranscriptSegment {
            text: "привет".to_string(),
            is_final: true,
        },
    ]));
    assert_eq!(controller.inspect().selection.draft, "note: привет");

    controller.apply_dictation_event(DictationEvent::Error("no-speech".to_string()));
    assert!(!controller.inspect().selection.dictating);
    let notices = drain_notices(&mut fixture.events);
    assert!(notices.iter().any(|(kind, _)| *kind == NoticeKind::Error));
}

#[tokio::test]
async fn instruction_change_rebuilds_the_session() {
    let fixture = setup(vec![Script::Deltas(vec!["ok"])]);
    let controller = &fixture.controller;

    controller.set_draft("seed");
    assert!(controller.send_message());
    let thread_id = active_thread(controller);
    wait_for_idle(controller, thread_id).await;

    let creates_before = fixture.core.create_replay_lens.lock().unwrap().len();
    assert!(controller.set_system_instruction(thread_id, "Answer like a pirate."));

    let state = controller.inspect();
    let thread = state.thread(thread_id).unwrap();
    assert_eq!(thread.system_instruction, "Answer like a pirate.");
    assert!(thread.session.is_some());
    drop(state);

    let creates_after = fixture.core.create_replay_lens.lock().unwrap().len();
    assert_eq!(creates_after, creates_before + 1);

    let records = load_threads(fixture.store.as_ref() as &dyn BlobStore).unwrap();
    assert_eq!(records[0].system_instruction, "Answer like a pirate.");
}
