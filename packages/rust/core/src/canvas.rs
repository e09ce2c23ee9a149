//! Workspace-entity matching and edit-vs-create classification.
//!
//! Scoring is lexical and pure: cost is O(entities × message length), fine
//! for the few hundred entities a canvas holds. Larger workspaces need an
//! index in front of [`CanvasAnalyzer::find_matching_nodes`].

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, instrument};

use intentflow_shared::{ScoredEntity, WorkspaceEntity};

/// Maximum number of entities returned by a match.
pub const MAX_MATCHES: usize = 3;

const LABEL_MATCH: u32 = 10;
const CATEGORY_MATCH: u32 = 5;
const SHARED_WORD: u32 = 2;
const PREFIX_MATCH: u32 = 3;
const PREFIX_CHARS: usize = 5;

/// Document formats recognised in free text, in priority order.
pub const DOCUMENT_TYPES: &[&str] = &[
    "novel",
    "screenplay",
    "script",
    "podcast",
    "report",
    "story",
    "book",
    "article",
    "blog",
    "essay",
];

// ---------------------------------------------------------------------------
// Classifier strategies
// ---------------------------------------------------------------------------

/// Extracts the document format a message asks for.
pub trait DocumentTypeClassifier: Send + Sync {
    fn classify(&self, text: &str) -> Option<String>;
}

/// Decides whether a message points at an existing entity of a category.
pub trait ExistingReferenceClassifier: Send + Sync {
    fn classify(&self, text: &str, category: &str) -> bool;
}

/// First entry of [`DOCUMENT_TYPES`] contained in the message. Vocabulary
/// order wins over position in the message: "a report on my novel" is a novel.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordDocumentType;

impl DocumentTypeClassifier for KeywordDocumentType {
    fn classify(&self, text: &str) -> Option<String> {
        let lower = text.to_lowercase();
        DOCUMENT_TYPES
            .iter()
            .find(|kind| lower.contains(*kind))
            .map(|kind| (*kind).to_string())
    }
}

/// Possessive/demonstrative templates: "my X", "the X", "our X", "that X", "this X".
#[derive(Debug, Clone, Copy, Default)]
pub struct DeterminerReference;

impl ExistingReferenceClassifier for DeterminerReference {
    fn classify(&self, text: &str, category: &str) -> bool {
        let category = category.trim().to_lowercase();
        if category.is_empty() {
            return false;
        }
        let lower = text.to_lowercase();
        ["my", "the", "our", "that", "this"]
            .iter()
            .any(|det| lower.contains(&format!("{det} {category}")))
    }
}

// ---------------------------------------------------------------------------
// Analyzer
// ---------------------------------------------------------------------------

/// Ranks workspace entities against a message.
#[derive(Clone)]
pub struct CanvasAnalyzer {
    document_type: Arc<dyn DocumentTypeClassifier>,
    existing: Arc<dyn ExistingReferenceClassifier>,
}

impl Default for CanvasAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl CanvasAnalyzer {
    pub fn new() -> Self {
        Self {
            document_type: Arc::new(KeywordDocumentType),
            existing: Arc::new(DeterminerReference),
        }
    }

    pub fn with_document_type(mut self, classifier: Arc<dyn DocumentTypeClassifier>) -> Self {
        self.document_type = classifier;
        self
    }

    pub fn with_existing_reference(
        mut self,
        classifier: Arc<dyn ExistingReferenceClassifier>,
    ) -> Self {
        self.existing = classifier;
        self
    }

    /// Up to [`MAX_MATCHES`] entities with a positive score, best first.
    /// Ties keep the input order.
    #[instrument(skip_all, fields(entities = entities.len()))]
    pub fn find_matching_nodes(
        &self,
        message: &str,
        entities: &[WorkspaceEntity],
    ) -> Vec<ScoredEntity> {
        let lower = message.to_lowercase();
        let message_words = tokenize(&lower);

        let mut scored: Vec<ScoredEntity> = entities
            .iter()
            .filter_map(|entity| {
                let score = score_entity(entity, &lower, &message_words);
                (score > 0).then(|| ScoredEntity {
                    entity: entity.clone(),
                    score,
                })
            })
            .collect();

        scored.sort_by(|a, b| b.score.cmp(&a.score));
        scored.truncate(MAX_MATCHES);

        debug!(matched = scored.len(), "entity matching complete");
        scored
    }

    pub fn is_referring_to_existing(&self, message: &str, category: &str) -> bool {
        self.existing.classify(message, category)
    }

    pub fn extract_document_type(&self, message: &str) -> Option<String> {
        self.document_type.classify(message)
    }
}

fn tokenize(lower: &str) -> HashSet<&str> {
    lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect()
}

fn score_entity(entity: &WorkspaceEntity, lower_message: &str, words: &HashSet<&str>) -> u32 {
    let label = entity.label.trim().to_lowercase();
    let category = entity.category.trim().to_lowercase();
    let mut score = 0;

    if !label.is_empty() {
        if lower_message.contains(&label) {
            score += LABEL_MATCH;
        }

        let shared = tokenize(&label)
            .into_iter()
            .filter(|w| words.contains(w))
            .count() as u32;
        score += SHARED_WORD * shared;

        let prefix: String = label.chars().take(PREFIX_CHARS).collect();
        if lower_message.contains(&prefix) {
            score += PREFIX_MATCH;
        }
    }

    if !category.is_empty() && lower_message.contains(&category) {
        score += CATEGORY_MATCH;
    }

    score
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
