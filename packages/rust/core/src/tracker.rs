//! Per-session conversation memory.
//!
//! [`ConversationTracker`] keeps the last [`MAX_HISTORY`] messages and the
//! single active [`ConversationState`], and answers "is this message a reply
//! to the question we just asked?". It does no locking of its own; callers
//! serialize access per session (see [`crate::session`]).

use std::collections::VecDeque;
use std::sync::{Arc, LazyLock};

use regex::Regex;

use intentflow_shared::{ConversationMessage, ConversationState, MAX_HISTORY, Role};

/// Messages inspected by [`ConversationTracker::original_request`], counting
/// the most recent one (which is skipped).
const ORIGINAL_REQUEST_LOOKBACK: usize = 4;

// ---------------------------------------------------------------------------
// Follow-up classification
// ---------------------------------------------------------------------------

/// Decides whether a message reads as a reply to a pending question.
///
/// Swappable so a model-backed classifier can replace the lexical one.
pub trait FollowUpClassifier: Send + Sync {
    fn classify(&self, text: &str) -> bool;
}

/// Affirmative, negative, selection and section-reference replies, tried in order.
static FOLLOW_UP_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^(yes|yeah|yep|yup|sure|ok|okay|correct|right|exactly|absolutely|definitely|please do|go ahead)\b",
        r"^(no|nope|nah|not really|neither|none)\b",
        r"^(the )?(first|second|third|fourth|fifth|last|option \d+|number \d+|\d+)(st|nd|rd|th)?\b",
        r"^(chapter|scene|act|section|part)\s+(\d+|[ivxlc]+|one|two|three|four|five)\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("follow-up regex"))
    .collect()
});

/// Fixed-pattern lexical classifier. Paraphrased replies ("that sounds
/// great, go with it") are expected false negatives.
#[derive(Debug, Clone, Copy, Default)]
pub struct LexicalFollowUp;

impl FollowUpClassifier for LexicalFollowUp {
    fn classify(&self, text: &str) -> bool {
        let normalized = text.trim().to_lowercase();
        FOLLOW_UP_PATTERNS.iter().any(|re| re.is_match(&normalized))
    }
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Bounded rolling history plus the current conversational state.
#[derive(Clone)]
pub struct ConversationTracker {
    history: VecDeque<ConversationMessage>,
    state: ConversationState,
    follow_up: Arc<dyn FollowUpClassifier>,
}

impl std::fmt::Debug for ConversationTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationTracker")
            .field("history", &self.history.len())
            .field("state", &self.state)
            .finish()
    }
}

impl Default for ConversationTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationTracker {
    pub fn new() -> Self {
        Self::with_classifier(Arc::new(LexicalFollowUp))
    }

    pub fn with_classifier(follow_up: Arc<dyn FollowUpClassifier>) -> Self {
        Self {
            history: VecDeque::with_capacity(MAX_HISTORY + 1),
            state: ConversationState::Initial,
            follow_up,
        }
    }

    /// Append a message, evicting the oldest once the history is full.
    pub fn add_message(&mut self, content: impl Into<String>, role: Role) {
        self.push(ConversationMessage::new(role, content));
    }

    fn push(&mut self, message: ConversationMessage) {
        self.history.push_back(message);
        while self.history.len() > MAX_HISTORY {
            self.history.pop_front();
        }
    }

    /// Replace the state. Transitions are not validated here.
    pub fn set_state(&mut self, state: ConversationState) {
        self.state = state;
    }

    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    /// Whether `message` answers a pending question. Always false in the
    /// initial state.
    pub fn is_follow_up_response(&self, message: &str) -> bool {
        if self.state.is_initial() {
            return false;
        }
        self.follow_up.classify(message)
    }

    /// Best-effort guess at the request a follow-up refers to: the oldest
    /// user message among the three that precede the most recent one.
    pub fn original_request(&self) -> Option<&str> {
        let len = self.history.len();
        if len < 2 {
            return None;
        }
        let start = len.saturating_sub(ORIGINAL_REQUEST_LOOKBACK);
        self.history
            .range(start..len - 1)
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }

    /// Replace the history with the most recent [`MAX_HISTORY`] entries of `history`.
    pub fn initialize_from_history(&mut self, history: &[ConversationMessage]) {
        self.history.clear();
        let keep_from = history.len().saturating_sub(MAX_HISTORY);
        self.history.extend(history[keep_from..].iter().cloned());
    }

    pub fn history(&self) -> impl ExactSizeIterator<Item = &ConversationMessage> {
        self.history.iter()
    }

    /// Owned copy of the history, oldest first.
    pub fn snapshot(&self) -> Vec<ConversationMessage> {
        self.history.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
