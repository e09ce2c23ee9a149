//! Core domain types for IntentFlow conversations and intent results.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum number of messages a conversation history retains.
pub const MAX_HISTORY: usize = 10;

// ---------------------------------------------------------------------------
// SessionId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for conversation session identifiers (time-sortable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Generate a new time-sortable session identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// Author of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A single chat message. Never mutated after it is appended to a history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    /// Who wrote the message.
    pub role: Role,
    /// Message text as typed or generated.
    pub content: String,
    /// When the message was appended. Defaults to now when absent on input.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ConversationMessage {
    /// Create a message stamped with the current time.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Coarse conversational state. Exactly one is active per session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConversationState {
    /// No outstanding question; the next message is a fresh request.
    #[default]
    Initial,
    /// The assistant asked something and is waiting for the answer.
    AwaitingClarification {
        question: String,
        #[serde(default)]
        options: Vec<String>,
    },
    /// The last turn answered an earlier question about `original_request`.
    FollowUp { original_request: String },
}

impl ConversationState {
    pub fn is_initial(&self) -> bool {
        matches!(self, Self::Initial)
    }
}

// ---------------------------------------------------------------------------
// Workspace
// ---------------------------------------------------------------------------

/// A canvas/document object a message may refer to by name. Owned externally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceEntity {
    /// Caller-assigned identifier, echoed back as `target_id`.
    pub id: String,
    /// Display name, matched against message text.
    pub label: String,
    /// Entity kind (e.g. `"novel"`, `"character"`).
    pub category: String,
}

impl WorkspaceEntity {
    pub fn new(
        id: impl Into<String>,
        label: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            category: category.into(),
        }
    }
}

/// A workspace entity together with its match score against a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoredEntity {
    pub entity: WorkspaceEntity,
    /// Sum of the label, category, shared-word and prefix points. Always > 0.
    pub score: u32,
}

/// The section currently selected in the document panel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSection {
    /// Section identifier within the document.
    pub id: String,
    /// Human-readable heading.
    pub name: String,
}

/// What the user is looking at when the message is sent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentView {
    /// Whether the document panel is open (as opposed to the canvas view).
    #[serde(default)]
    pub document_open: bool,
    /// Format of the open document (novel, screenplay, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_format: Option<String>,
    /// Currently selected section, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_section: Option<ActiveSection>,
}

// ---------------------------------------------------------------------------
// Confidence
// ---------------------------------------------------------------------------

/// A score in `[0, 1]`. Out-of-range values are clamped, NaN becomes 0.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(from = "f32", into = "f32")]
pub struct Confidence(f32);

impl Confidence {
    pub const MIN: Confidence = Confidence(0.0);
    pub const MAX: Confidence = Confidence(1.0);

    pub fn new(value: f32) -> Self {
        if value.is_nan() {
            Self::MIN
        } else {
            Self(value.clamp(0.0, 1.0))
        }
    }

    pub fn value(self) -> f32 {
        self.0
    }

    /// The lower of the two scores.
    pub fn min(self, other: Confidence) -> Confidence {
        if other.0 < self.0 { other } else { self }
    }
}

impl Default for Confidence {
    fn default() -> Self {
        Self::MAX
    }
}

impl From<f32> for Confidence {
    fn from(value: f32) -> Self {
        Self::new(value)
    }
}

impl From<Confidence> for f32 {
    fn from(value: Confidence) -> Self {
        value.0
    }
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Model tiers
// ---------------------------------------------------------------------------

/// Computational tier a request is routed to, ordered by capability.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Fast,
    Smart,
    Reasoning,
}

impl ModelTier {
    pub const ALL: [ModelTier; 3] = [ModelTier::Fast, ModelTier::Smart, ModelTier::Reasoning];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Smart => "smart",
            Self::Reasoning => "reasoning",
        }
    }
}

impl std::fmt::Display for ModelTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Intents
// ---------------------------------------------------------------------------

/// Every intent the pipeline can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    CreateStructure,
    ModifyStructure,
    WriteContent,
    ImproveContent,
    RewriteWithCoherence,
    NavigateSection,
    OpenAndWrite,
    DeleteNode,
    AnswerQuestion,
    GeneralChat,
    ClarificationNeeded,
}

impl IntentKind {
    pub const ALL: [IntentKind; 11] = [
        IntentKind::CreateStructure,
        IntentKind::ModifyStructure,
        IntentKind::WriteContent,
        IntentKind::ImproveContent,
        IntentKind::RewriteWithCoherence,
        IntentKind::NavigateSection,
        IntentKind::OpenAndWrite,
        IntentKind::DeleteNode,
        IntentKind::AnswerQuestion,
        IntentKind::GeneralChat,
        IntentKind::ClarificationNeeded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateStructure => "create_structure",
            Self::ModifyStructure => "modify_structure",
            Self::WriteContent => "write_content",
            Self::ImproveContent => "improve_content",
            Self::RewriteWithCoherence => "rewrite_with_coherence",
            Self::NavigateSection => "navigate_section",
            Self::OpenAndWrite => "open_and_write",
            Self::DeleteNode => "delete_node",
            Self::AnswerQuestion => "answer_question",
            Self::GeneralChat => "general_chat",
            Self::ClarificationNeeded => "clarification_needed",
        }
    }

    /// Intents that act on an existing canvas node or document section.
    pub fn targets_existing(&self) -> bool {
        matches!(
            self,
            Self::WriteContent
                | Self::ImproveContent
                | Self::RewriteWithCoherence
                | Self::OpenAndWrite
                | Self::DeleteNode
        )
    }
}

impl std::fmt::Display for IntentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IntentKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let needle = s.trim().to_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == needle)
            .ok_or_else(|| format!("unknown intent: {s}"))
    }
}

// ---------------------------------------------------------------------------
// PipelineContext
// ---------------------------------------------------------------------------

/// Per-turn context threaded through the pipeline. Built fresh for every
/// message and discarded once the result is returned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineContext {
    /// Recent messages, oldest first, excluding the message being analyzed.
    #[serde(default)]
    pub conversation_history: Vec<ConversationMessage>,
    /// Entities visible on the canvas.
    #[serde(default)]
    pub workspace_entities: Vec<WorkspaceEntity>,
    /// Document panel state.
    #[serde(default)]
    pub document: DocumentView,
    /// Ambiguous token → referent, e.g. `"it" → "Chapter 3"`.
    #[serde(default)]
    pub resolved_references: BTreeMap<String, String>,
    /// At most three entities, by non-increasing score.
    #[serde(default)]
    pub matched_entities: Vec<ScoredEntity>,
    /// Session state at the start of the turn.
    #[serde(default)]
    pub conversation_state: ConversationState,
    /// `None` until follow-up detection has run for this turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_follow_up: Option<bool>,
    /// The earlier user request a follow-up answers, when one was found.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_request: Option<String>,
    /// Lowest confidence any stage has recorded so far; 1.0 when none has.
    #[serde(default)]
    pub confidence: Confidence,
}

impl PipelineContext {
    pub fn new(
        conversation_history: Vec<ConversationMessage>,
        workspace_entities: Vec<WorkspaceEntity>,
    ) -> Self {
        let keep_from = conversation_history.len().saturating_sub(MAX_HISTORY);
        Self {
            conversation_history: conversation_history[keep_from..].to_vec(),
            workspace_entities,
            ..Default::default()
        }
    }

    pub fn with_document(mut self, document: DocumentView) -> Self {
        self.document = document;
        self
    }

    pub fn with_state(mut self, state: ConversationState) -> Self {
        self.conversation_state = state;
        self
    }
}

// ---------------------------------------------------------------------------
// IntentResult
// ---------------------------------------------------------------------------

/// The structured interpretation handed to the generation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentResult {
    /// What the user wants done.
    pub intent_kind: IntentKind,
    /// Always contains `"message"`; other keys depend on the intent.
    pub resolved_parameters: BTreeMap<String, serde_json::Value>,
    /// Final confidence in `intent_kind`.
    pub confidence: Confidence,
    /// Tier that produced (or would have produced) the answer.
    pub chosen_tier: ModelTier,
    /// Question to put to the user before acting, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarification_needed: Option<String>,
    /// Short explanation of how the intent was derived.
    #[serde(default)]
    pub reasoning: String,
    /// Whether a model call contributed to the result.
    #[serde(default)]
    pub used_model: bool,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_is_clamped() {
        assert_eq!(Confidence::new(1.7).value(), 1.0);
        assert_eq!(Confidence::new(-0.2).value(), 0.0);
        assert_eq!(Confidence::new(f32::NAN).value(), 0.0);
        assert_eq!(Confidence::new(0.42).value(), 0.42);
    }

    #[test]
    fn confidence_deserialization_clamps() {
        let c: Confidence = serde_json::from_str("3.5").unwrap();
        assert_eq!(c, Confidence::MAX);
        assert_eq!(serde_json::to_string(&Confidence::new(0.5)).unwrap(), "0.5");
    }

    #[test]
    fn conversation_state_tagging() {
        let state = ConversationState::AwaitingClarification {
            question: "Which chapter?".into(),
            options: vec!["Chapter 1".into()],
        };
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains(r#""state":"awaiting_clarification""#));

        let parsed: ConversationState =
            serde_json::from_str(r#"{"state":"follow_up","original_request":"write ch 2"}"#)
                .unwrap();
        assert_eq!(
            parsed,
            ConversationState::FollowUp {
                original_request: "write ch 2".into()
            }
        );
    }

    #[test]
    fn intent_kind_parses_labels() {
        assert_eq!(
            "write_content".parse::<IntentKind>().unwrap(),
            IntentKind::WriteContent
        );
        assert_eq!(
            " Create_Structure ".parse::<IntentKind>().unwrap(),
            IntentKind::CreateStructure
        );
        assert!("dance".parse::<IntentKind>().is_err());
    }

    #[test]
    fn context_truncates_history() {
        let history: Vec<_> = (0..14)
            .map(|i| ConversationMessage::user(format!("m{i}")))
            .collect();
        let ctx = PipelineContext::new(history, vec![]);
        assert_eq!(ctx.conversation_history.len(), MAX_HISTORY);
        assert_eq!(ctx.conversation_history[0].content, "m4");
        assert_eq!(ctx.confidence, Confidence::MAX);
    }

    #[test]
    fn session_id_roundtrip() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn model_tiers_are_ordered() {
        assert!(ModelTier::Fast < ModelTier::Smart);
        assert!(ModelTier::Smart < ModelTier::Reasoning);
    }
}
