//! Explicit per-session handle.
//!
//! A [`SessionHandle`] owns one conversation's tracker and serializes turns
//! through an async mutex. Arrival order is fixed when a message is
//! admitted, before any turn waits on that mutex, and user messages reach
//! history in that order whichever turn gets the lock first. Submitting a
//! new message cancels the run still in flight; the cancelled run's result
//! is discarded but its message is kept in history.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use intentflow_options::{ParsedReply, parse_options};
use intentflow_shared::{
    ConversationMessage, ConversationState, DocumentView, IntentResult, IntentflowError,
    PipelineContext, Result, Role, SessionId, WorkspaceEntity,
};

use crate::pipeline::Orchestrator;
use crate::tracker::ConversationTracker;

struct SessionState {
    tracker: ConversationTracker,
    entities: Vec<WorkspaceEntity>,
    document: DocumentView,
}

/// Admitted messages not yet in history, plus the live run's token.
struct Intake {
    token: CancellationToken,
    next_seq: u64,
    arrivals: VecDeque<(u64, String)>,
}

/// One conversation. Share it behind an `Arc` across tasks.
pub struct SessionHandle {
    id: SessionId,
    orchestrator: Arc<Orchestrator>,
    state: tokio::sync::Mutex<SessionState>,
    intake: Mutex<Intake>,
}

impl SessionHandle {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self::with_id(SessionId::new(), orchestrator)
    }

    pub fn with_id(id: SessionId, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            id,
            orchestrator,
            state: tokio::sync::Mutex::new(SessionState {
                tracker: ConversationTracker::new(),
                entities: Vec::new(),
                document: DocumentView::default(),
            }),
            intake: Mutex::new(Intake {
                token: CancellationToken::new(),
                next_seq: 0,
                arrivals: VecDeque::new(),
            }),
        }
    }

    /// Rehydrate from stored history.
    pub async fn restore(&self, history: &[ConversationMessage], state: ConversationState) {
        let mut session = self.state.lock().await;
        session.tracker.initialize_from_history(history);
        session.tracker.set_state(state);
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub async fn set_entities(&self, entities: Vec<WorkspaceEntity>) {
        self.state.lock().await.entities = entities;
    }

    pub async fn set_document(&self, document: DocumentView) {
        self.state.lock().await.document = document;
    }

    pub async fn state(&self) -> ConversationState {
        self.state.lock().await.tracker.state().clone()
    }

    pub async fn history(&self) -> Vec<ConversationMessage> {
        self.state.lock().await.tracker.snapshot()
    }

    /// Run a turn for `message`.
    ///
    /// Returns [`intentflow_shared::IntentflowError::Cancelled`] when a newer
    /// submission superseded this one; no other error is returned.
    #[instrument(skip_all, fields(session = %self.id))]
    pub async fn submit(&self, message: &str) -> Result<IntentResult> {
        let (seq, cancel) = self.admit(message);
        self.run_admitted(seq, message, &cancel).await
    }

    async fn run_admitted(
        &self,
        seq: u64,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<IntentResult> {
        let mut session = self.state.lock().await;
        self.flush_arrivals(&mut session.tracker, seq);

        if cancel.is_cancelled() {
            self.flush_arrivals(&mut session.tracker, seq + 1);
            debug!(seq, "superseded before it ran");
            return Err(IntentflowError::Cancelled);
        }

        let context = PipelineContext::new(session.tracker.snapshot(), session.entities.clone())
            .with_document(session.document.clone())
            .with_state(session.tracker.state().clone());

        let outcome = self
            .orchestrator
            .run_turn(message, &context, cancel)
            .await;
        self.flush_arrivals(&mut session.tracker, seq + 1);

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!(error = %e, "turn discarded");
                return Err(e);
            }
        };

        let next = match (&outcome.result.clarification_needed, &outcome.context) {
            (Some(question), _) => ConversationState::AwaitingClarification {
                question: question.clone(),
                options: Vec::new(),
            },
            (
                None,
                PipelineContext {
                    is_follow_up: Some(true),
                    original_request: Some(original),
                    ..
                },
            ) => ConversationState::FollowUp {
                original_request: original.clone(),
            },
            _ => ConversationState::Initial,
        };
        session.tracker.set_state(next);

        info!(intent = %outcome.result.intent_kind, "session advanced");
        Ok(outcome.result)
    }

    /// Record the assistant's reply. A numbered list in it becomes the
    /// pending set of options.
    pub async fn record_reply(&self, text: &str) -> ParsedReply {
        let mut session = self.state.lock().await;
        session.tracker.add_message(text, Role::Assistant);

        let parsed = parse_options(text);
        if let ParsedReply::Options(list) = &parsed {
            session
                .tracker
                .set_state(ConversationState::AwaitingClarification {
                    question: list.preamble.clone(),
                    options: parsed.titles(),
                });
        }
        parsed
    }

    /// Fix `message`'s place in arrival order, cancel whatever is running
    /// and hand out a fresh token.
    fn admit(&self, message: &str) -> (u64, CancellationToken) {
        let mut intake = self.intake();
        intake.token.cancel();
        intake.token = CancellationToken::new();

        let seq = intake.next_seq;
        intake.next_seq += 1;
        intake.arrivals.push_back((seq, message.to_string()));
        (seq, intake.token.clone())
    }

    /// Append admitted messages with a sequence number below `before`.
    fn flush_arrivals(&self, tracker: &mut ConversationTracker, before: u64) {
        let mut intake = self.intake();
        while intake.arrivals.front().is_some_and(|(seq, _)| *seq < before) {
            if let Some((_, message)) = intake.arrivals.pop_front() {
                tracker.add_message(message, Role::User);
            }
        }
    }

    fn intake(&self) -> MutexGuard<'_, Intake> {
        match self.intake.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
