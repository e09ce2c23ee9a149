//! Cheap first-pass classification.
//!
//! [`PatternTriage`] recognises the common, unambiguous requests by pattern
//! and in context (document open, section selected, entities on the canvas)
//! so they can skip the model entirely. Anything it cannot place comes back
//! as "no match", flagged for reasoning when the message carries comparison,
//! contrast or conditional markers.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, instrument};

use intentflow_shared::{Confidence, IntentKind, PipelineContext, Result};

use crate::canvas::CanvasAnalyzer;

/// A confident local classification.
#[derive(Debug, Clone, PartialEq)]
pub struct TriageMatch {
    pub intent: IntentKind,
    pub confidence: Confidence,
    pub reasoning: String,
    pub parameters: BTreeMap<String, Value>,
}

/// Result of a triage pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriageOutcome {
    pub matched: Option<TriageMatch>,
    /// The message needs more than a fast model to interpret.
    pub requires_reasoning: bool,
}

/// First stage of the pipeline. Implementations may call a model.
#[async_trait]
pub trait Triage: Send + Sync {
    async fn triage(&self, message: &str, context: &PipelineContext) -> Result<TriageOutcome>;

    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Patterns
// ---------------------------------------------------------------------------

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("triage regex"))
        .collect()
}

static NAVIGATE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[r"(?i)go to|jump to|navigate to|take me to|show me|find the"])
});

static WRITE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[r"(?i)\b(write|expand|continue|generate|create content|fill in|draft)\b"])
});

static REWRITE_COHERENCE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?i)(rewrite|update|change).*(coherent|consistent|flow|match)",
        r"(?i)make (it |this |them )?(all )?(coherent|consistent|flow)",
    ])
});

static IMPROVE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[r"(?i)\b(improve|enhance|refine|polish|make (it )?better|fix)\b"])
});

static DELETE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[r"(?i)\b(delete|remove|discard|trash|get rid of)\b"])
});

static QUESTION: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?i)^(what|who|where|when|why|how|can you|could you|tell me|explain)\b",
        r"\?$",
    ])
});

static OPEN_AND_WRITE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[r"(?i)\b(write|expand|continue)\b.*\b(in|for|on) (the |my )?"])
});

static CREATE_STRUCTURE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?i)\b(create|start|begin|make|build|write)\b.*\b(novel|story|book|screenplay|script|podcast|report)",
        r"(?i)\b(novel|story|book|screenplay|script|podcast|report)\b.*\b(about|on|regarding)\b",
        r"(?i)^(a |the )?(new )?(novel|story|book|screenplay|script|podcast|report)",
    ])
});

static MODIFY_STRUCTURE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?i)\b(add|insert|move|reorder|reorganize|restructure)\b",
        r"(?i)\b(new|another) (chapter|scene|act|section|part)\b",
    ])
});

/// Comparison, contrast and conditional markers.
static COMPLEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(like|similar to|based on|inspired by|but|however|although|except|if|when|unless|until)\b",
    )
    .expect("complex marker regex")
});

fn any_match(patterns: &[Regex], text: &str) -> bool {
    patterns.iter().any(|re| re.is_match(text))
}

// ---------------------------------------------------------------------------
// PatternTriage
// ---------------------------------------------------------------------------

/// Priority-ordered pattern classifier; first rule that applies wins.
#[derive(Clone, Default)]
pub struct PatternTriage {
    canvas: CanvasAnalyzer,
}

impl PatternTriage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_canvas(canvas: CanvasAnalyzer) -> Self {
        Self { canvas }
    }

    /// Synchronous core of [`Triage::triage`].
    pub fn classify(&self, message: &str, context: &PipelineContext) -> TriageOutcome {
        let text = message.trim();
        TriageOutcome {
            matched: self.match_rules(text, context),
            requires_reasoning: COMPLEX.is_match(text),
        }
    }

    fn match_rules(&self, text: &str, context: &PipelineContext) -> Option<TriageMatch> {
        let document = &context.document;
        let format = document.document_format.as_deref().unwrap_or("document");

        if document.document_open && any_match(&NAVIGATE, text) {
            return Some(
                hit(
                    IntentKind::NavigateSection,
                    0.95,
                    format!("navigation request within the open {format}"),
                )
                .with("target", text),
            );
        }

        if let Some(section) = &document.active_section {
            let rule = if any_match(&WRITE, text) {
                Some((
                    IntentKind::WriteContent,
                    0.95,
                    format!("explicit content generation for \"{}\"", section.name),
                ))
            } else if any_match(&REWRITE_COHERENCE, text) {
                Some((
                    IntentKind::RewriteWithCoherence,
                    0.95,
                    format!("multi-section rewrite starting from \"{}\"", section.name),
                ))
            } else if any_match(&IMPROVE, text) {
                Some((
                    IntentKind::ImproveContent,
                    0.9,
                    format!("refine existing content in \"{}\"", section.name),
                ))
            } else {
                None
            };

            if let Some((intent, confidence, reasoning)) = rule {
                return Some(
                    hit(intent, confidence, reasoning)
                        .with("section", section.name.as_str())
                        .with("section_id", section.id.as_str()),
                );
            }
        }

        if any_match(&DELETE, text) {
            return Some(hit(
                IntentKind::DeleteNode,
                0.9,
                "delete or remove a workspace node".into(),
            ));
        }

        if any_match(&QUESTION, text) {
            return Some(hit(
                IntentKind::AnswerQuestion,
                0.9,
                "interrogative phrasing".into(),
            ));
        }

        let on_canvas = !document.document_open && document.active_section.is_none();

        if on_canvas && !context.workspace_entities.is_empty() && any_match(&OPEN_AND_WRITE, text)
        {
            let mut found = hit(
                IntentKind::OpenAndWrite,
                0.95,
                "write into an existing canvas document".into(),
            );
            if let Some(best) = self
                .canvas
                .find_matching_nodes(text, &context.workspace_entities)
                .first()
            {
                found = found
                    .with("target", best.entity.label.as_str())
                    .with("target_id", best.entity.id.as_str());
            }
            return Some(found);
        }

        if on_canvas && any_match(&CREATE_STRUCTURE, text) {
            let kind = self.canvas.extract_document_type(text);

            // "my novel", "the script": an edit to something already on the canvas.
            if let Some(kind) = kind
                .as_deref()
                .filter(|k| self.canvas.is_referring_to_existing(text, k))
            {
                let mut found = hit(
                    IntentKind::ModifyStructure,
                    0.85,
                    format!("refers to an existing {kind} on the canvas"),
                )
                .with("document_type", kind);
                if let Some(best) = self
                    .canvas
                    .find_matching_nodes(text, &context.workspace_entities)
                    .first()
                {
                    found = found
                        .with("target", best.entity.label.as_str())
                        .with("target_id", best.entity.id.as_str());
                }
                return Some(found);
            }

            let mut found = hit(
                IntentKind::CreateStructure,
                0.9,
                "new document structure requested from the canvas".into(),
            );
            if let Some(kind) = kind {
                found = found.with("document_type", kind.as_str());
            }
            return Some(found);
        }

        if any_match(&MODIFY_STRUCTURE, text) {
            return Some(hit(
                IntentKind::ModifyStructure,
                0.85,
                "change to the existing structure".into(),
            ));
        }

        None
    }
}

fn hit(intent: IntentKind, confidence: f32, reasoning: String) -> TriageMatch {
    TriageMatch {
        intent,
        confidence: Confidence::new(confidence),
        reasoning,
        parameters: BTreeMap::new(),
    }
}

impl TriageMatch {
    fn with(mut self, key: &str, value: &str) -> Self {
        self.parameters
            .insert(key.to_string(), Value::String(value.to_string()));
        self
    }
}

#[async_trait]
impl Triage for PatternTriage {
    #[instrument(skip_all, name = "pattern_triage")]
    async fn triage(&self, message: &str, context: &PipelineContext) -> Result<TriageOutcome> {
        let outcome = self.classify(message, context);
        debug!(
            intent = outcome.matched.as_ref().map(|m| m.intent.as_str()),
            requires_reasoning = outcome.requires_reasoning,
            "triage complete"
        );
        Ok(outcome)
    }

    fn name(&self) -> &str {
        "pattern"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
