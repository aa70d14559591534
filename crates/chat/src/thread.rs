use mica_llm::ModelSession;
use mica_store::{ImageRecord, MessageRecord, PartRecord, RoleRecord};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

/// Stable identifier for one thread. Allocated from the creation timestamp
/// and bumped past the previous allocation on collision, so ids are unique
/// for the lifetime of the store and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u64);

impl ThreadId {
    /// Creates a typed thread identifier.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Identifier for one streaming generation.
///
/// This must change on every send so stale events can be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GenerationId(pub u64);

impl GenerationId {
    /// Creates a typed generation identifier.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Routing key used for stale-event rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GenerationTarget {
    pub thread_id: ThreadId,
    pub generation: GenerationId,
}

impl GenerationTarget {
    /// Builds a full generation target from thread and generation IDs.
    pub const fn new(thread_id: ThreadId, generation: GenerationId) -> Self {
        Self {
            thread_id,
            generation,
        }
    }
}

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Model,
}

/// Opaque image attachment. Transport encoding happens at request-build and
/// persistence time, never here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// One atomic piece of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Part {
    Text(String),
    Image(ImageRef),
}

impl Part {
    /// First-class text content, if this part carries any.
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Image(_) => None,
        }
    }
}

/// Core message model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Message {
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self { role, parts }
    }

    /// Creates a model placeholder that streaming mutates in place.
    pub fn model_placeholder() -> Self {
        Self::new(Role::Model, vec![Part::Text(String::new())])
    }

    /// True for a model message whose only content is an empty text part.
    pub fn is_empty_placeholder(&self) -> bool {
        self.role == Role::Model
            && self
                .parts
                .iter()
                .all(|part| matches!(part, Part::Text(text) if text.is_empty()))
    }

    /// Replaces the text content with `text`, keeping non-text parts.
    pub fn set_text(&mut self, text: String) {
        if let Some(slot) = self
            .parts
            .iter_mut()
            .find(|part| matches!(part, Part::Text(_)))
        {
            *slot = Part::Text(text);
        } else {
            self.parts.insert(0, Part::Text(text));
        }
    }

    /// First text part, or the empty string.
    pub fn text(&self) -> &str {
        self.parts
            .iter()
            .find_map(|part| part.text())
            .unwrap_or_default()
    }

    pub fn to_record(&self) -> MessageRecord {
        MessageRecord {
            role: match self.role {
                Role::User => RoleRecord::User,
                Role::Model => RoleRecord::Model,
            },
            parts: self
                .parts
                .iter()
                .map(|part| match part {
                    Part::Text(text) => PartRecord::Text(text.clone()),
                    Part::Image(image) => PartRecord::Image(ImageRecord {
                        mime_type: image.mime_type.clone(),
                        data: BASE64.encode(&image.bytes),
                    }),
                })
                .collect(),
        }
    }

    /// Rebuilds a message from its persisted record. An image part whose
    /// base64 payload no longer decodes is dropped with a warning rather than
    /// poisoning the whole thread.
    pub fn from_record(record: &MessageRecord) -> Self {
        let role = match record.role {
            RoleRecord::User => Role::User,
            RoleRecord::Model => Role::Model,
        };
        let parts = record
            .parts
            .iter()
            .filter_map(|part| match part {
                PartRecord::Text(text) => Some(Part::Text(text.clone())),
                PartRecord::Image(image) => match BASE64.decode(&image.data) {
                    Ok(bytes) => Some(Part::Image(ImageRef {
                        mime_type: image.mime_type.clone(),
                        bytes,
                    })),
                    Err(error) => {
                        tracing::warn!(
                            mime_type = %image.mime_type,
                            error = %error,
                            "dropping image part with undecodable payload"
                        );
                        None
                    }
                },
            })
            .collect();
        Self { role, parts }
    }
}

/// One conversation thread. The live session handle is rebuilt from history
/// on load and is never persisted; `None` means construction failed and will
/// be retried lazily on the next send.
pub struct Thread {
    pub id: ThreadId,
    pub title: String,
    pub system_instruction: String,
    pub history: Vec<Message>,
    pub session: Option<Box<dyn ModelSession>>,
    pub phase: GenPhase,
}

impl Thread {
    pub fn new(id: ThreadId, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            system_instruction: String::new(),
            history: Vec::new(),
            session: None,
            phase: GenPhase::Idle,
        }
    }

    /// Applies a deterministic phase transition.
    pub fn apply_phase_transition(&mut self, transition: PhaseTransition) -> PhaseTransitionResult {
        let next = self.phase.apply(transition)?;
        self.phase = next;
        Ok(next)
    }
}

/// Generation phase boundary for thread orchestration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GenPhase {
    #[default]
    Idle,
    Sending(GenerationTarget),
    Cancelling(GenerationTarget),
}

/// State transition input for the generation lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseTransition {
    Start(GenerationTarget),
    Complete(GenerationTarget),
    Fail(GenerationTarget),
    RequestCancel(GenerationTarget),
    ObserveCancelled(GenerationTarget),
}

/// Rejection reason for illegal phase transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseRejection {
    Busy {
        active: GenerationTarget,
        attempted: GenerationTarget,
    },
    NoActiveGeneration,
    TargetMismatch {
        active: GenerationTarget,
        attempted: GenerationTarget,
    },
}

pub type PhaseTransitionResult = Result<GenPhase, PhaseRejection>;

impl GenPhase {
    /// True while a generation occupies this thread in either direction.
    pub fn is_busy(&self) -> bool {
        !matches!(self, Self::Idle)
    }

    /// Returns the occupying target, if any.
    pub fn active_target(&self) -> Option<GenerationTarget> {
        match self {
            Self::Idle => None,
            Self::Sending(target) | Self::Cancelling(target) => Some(*target),
        }
    }

    /// True when an incoming delta for `target` may be applied. Deltas are
    /// dropped while cancellation is pending so the transcript never grows
    /// past the point the user cut it.
    pub fn accepts_delta(&self, target: GenerationTarget) -> bool {
        matches!(self, Self::Sending(active) if *active == target)
    }

    /// Applies one transition deterministically.
    ///
    /// `Start` is legal only from `Idle`. Terminal transitions must match the
    /// occupying target exactly and always return to `Idle`.
    pub fn apply(&self, transition: PhaseTransition) -> PhaseTransitionResult {
        match transition {
            PhaseTransition::Start(target) => self.apply_start(target),
            PhaseTransition::Complete(target) | PhaseTransition::Fail(target) => {
                self.apply_terminal(target)
            }
            PhaseTransition::RequestCancel(target) => self.apply_request_cancel(target),
            PhaseTransition::ObserveCancelled(target) => self.apply_terminal(target),
        }
    }

    fn apply_start(&self, target: GenerationTarget) -> PhaseTransitionResult {
        match self {
            Self::Idle => Ok(Self::Sending(target)),
            Self::Sending(active) | Self::Cancelling(active) => Err(PhaseRejection::Busy {
                active: *active,
                attempted: target,
            }),
        }
    }

    fn apply_terminal(&self, target: GenerationTarget) -> PhaseTransitionResult {
        match self {
            Self::Sending(active) | Self::Cancelling(active) if *active == target => Ok(Self::Idle),
            Self::Sending(active) | Self::Cancelling(active) => {
                Err(PhaseRejection::TargetMismatch {
                    active: *active,
                    attempted: target,
                })
            }
            Self::Idle => Err(PhaseRejection::NoActiveGeneration),
        }
    }

    fn apply_request_cancel(&self, target: GenerationTarget) -> PhaseTransitionResult {
        match self {
            Self::Sending(active) if *active == target => Ok(Self::Cancelling(target)),
            Self::Sending(active) | Self::Cancelling(active) => {
                Err(PhaseRejection::TargetMismatch {
                    active: *active,
                    attempted: target,
                })
            }
            Self::Idle => Err(PhaseRejection::NoActiveGeneration),
        }
    }
}
