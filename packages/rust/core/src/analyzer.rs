//! Model-backed intent analysis for messages triage could not place.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use intentflow_shared::{
    Confidence, ConversationState, IntentKind, PipelineContext, Role,
};

use crate::structured::parse_structured;

const RECENT_TURNS: usize = 3;
const TURN_PREVIEW_CHARS: usize = 100;
const CANVAS_PREVIEW: usize = 3;

pub const FALLBACK_QUESTION: &str =
    "I'm not sure I understood your request. Could you please clarify what you'd like me to do?";

const SYSTEM_PROMPT_HEAD: &str = "\
You are the intent analyzer of a content-orchestration assistant for long-form writing.

Determine what the user wants. The possible intents are:

STRUCTURE INTENTS (creating/modifying document structure):
- create_structure: create a new story/document from scratch
- modify_structure: add, remove, or reorganize sections

CONTENT INTENTS (writing/editing content):
- write_content: generate new content for a section
- improve_content: refine or polish existing content
- rewrite_with_coherence: update content while keeping sections consistent

NAVIGATION INTENTS:
- navigate_section: jump to a specific section
- open_and_write: open a document from the canvas and write in it

OTHER INTENTS:
- answer_question: a question, not a request for action
- delete_node: delete something
- general_chat: conversation that fits nothing above
";

const SYSTEM_PROMPT_TAIL: &str = "
IMPORTANT:
- Return ONLY valid JSON
- Keep reasoning to one or two sentences
- Confidence reflects certainty (0.5 = unsure, 0.9+ = very confident)
- If the request is truly ambiguous, set needsClarification=true and provide a clarifyingQuestion";

/// Parsed model answer.
#[derive(Debug, Clone, PartialEq)]
pub struct DeepAnalysis {
    pub intent: IntentKind,
    pub confidence: Confidence,
    pub reasoning: String,
    pub clarifying_question: Option<String>,
    pub extracted_entities: BTreeMap<String, Value>,
}

impl DeepAnalysis {
    /// Used when the reply cannot be parsed at all.
    pub fn fallback() -> Self {
        Self {
            intent: IntentKind::GeneralChat,
            confidence: Confidence::new(0.3),
            reasoning: "analysis reply was unusable, defaulting to conversation".into(),
            clarifying_question: Some(FALLBACK_QUESTION.into()),
            extracted_entities: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalysisReply {
    #[serde(default)]
    intent: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    needs_clarification: bool,
    #[serde(default)]
    clarifying_question: Option<String>,
    #[serde(default)]
    extracted_entities: BTreeMap<String, Value>,
}

/// Interpret a model reply. Missing fields take defaults (`general_chat`,
/// confidence 0.5); an unparseable reply gives [`DeepAnalysis::fallback`].
pub fn parse_analysis(raw: &str) -> DeepAnalysis {
    let reply: AnalysisReply = match parse_structured(raw) {
        Ok(reply) => reply,
        Err(e) => {
            warn!(error = %e, "deep analysis reply unusable");
            return DeepAnalysis::fallback();
        }
    };

    let intent = match reply.intent.as_deref() {
        Some(name) => name.parse().unwrap_or_else(|_| {
            warn!(intent = name, "unknown intent in analysis reply");
            IntentKind::GeneralChat
        }),
        None => IntentKind::GeneralChat,
    };

    let clarifying_question = if reply.needs_clarification || intent == IntentKind::ClarificationNeeded {
        Some(
            reply
                .clarifying_question
                .filter(|q| !q.trim().is_empty())
                .unwrap_or_else(|| FALLBACK_QUESTION.to_string()),
        )
    } else {
        None
    };

    DeepAnalysis {
        intent,
        confidence: Confidence::new(reply.confidence.unwrap_or(0.5)),
        reasoning: reply
            .reasoning
            .unwrap_or_else(|| "deep analysis completed".into()),
        clarifying_question,
        extracted_entities: reply.extracted_entities,
    }
}

/// Describe document, canvas and conversation state for the model.
pub fn context_section(context: &PipelineContext) -> String {
    let mut lines = Vec::new();
    let document = &context.document;

    if document.document_open {
        lines.push(format!(
            "- Document panel is OPEN (format: {})",
            document.document_format.as_deref().unwrap_or("unknown")
        ));
        if let Some(section) = &document.active_section {
            lines.push(format!("- Active section: \"{}\"", section.name));
        }
    } else {
        lines.push("- Document panel is CLOSED (user is on the canvas)".to_string());
    }

    if !context.workspace_entities.is_empty() {
        lines.push(format!(
            "- Canvas has {} entities",
            context.workspace_entities.len()
        ));
        let names: Vec<&str> = context
            .workspace_entities
            .iter()
            .take(CANVAS_PREVIEW)
            .map(|e| e.label.as_str())
            .collect();
        lines.push(format!("- On the canvas: {}", names.join(", ")));
    }

    if !context.matched_entities.is_empty() {
        let names: Vec<&str> = context
            .matched_entities
            .iter()
            .map(|m| m.entity.label.as_str())
            .collect();
        lines.push(format!("- Message mentions: {}", names.join(", ")));
    }

    let history = &context.conversation_history;
    let recent = &history[history.len().saturating_sub(RECENT_TURNS)..];
    if !recent.is_empty() {
        lines.push("- Recent conversation:".to_string());
        for turn in recent {
            let role = match turn.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            let preview: String = turn.content.chars().take(TURN_PREVIEW_CHARS).collect();
            lines.push(format!("  [{role}]: {preview}..."));
        }
    }

    match &context.conversation_state {
        ConversationState::Initial => {}
        ConversationState::AwaitingClarification { question, options } => {
            lines.push(format!("- Assistant asked: \"{question}\""));
            if !options.is_empty() {
                lines.push(format!("- Offered options: {}", options.join(" | ")));
            }
        }
        ConversationState::FollowUp { original_request } => {
            lines.push(format!("- Ongoing request: \"{original_request}\""));
        }
    }

    if context.is_follow_up == Some(true) {
        if let Some(original) = &context.original_request {
            lines.push(format!(
                "- This message answers the earlier request: \"{original}\""
            ));
        }
    }

    lines.join("\n")
}

/// Full system prompt including context and prompt-module sections.
pub fn system_prompt(context: &PipelineContext, extra_sections: &[String]) -> String {
    let mut prompt = String::from(SYSTEM_PROMPT_HEAD);
    prompt.push_str("\nCONTEXT INFORMATION:\n");
    prompt.push_str(&context_section(context));
    prompt.push('\n');

    for section in extra_sections {
        prompt.push('\n');
        prompt.push_str(section);
        prompt.push('\n');
    }

    prompt.push_str(SYSTEM_PROMPT_TAIL);
    prompt
}

pub fn user_prompt(message: &str) -> String {
    format!(
        "Analyze this user message and determine the intent:

\"{message}\"

Return your analysis as JSON with these fields:
- intent: string (one of the intents listed above)
- confidence: number (0.0 to 1.0)
- reasoning: string (brief explanation)
- needsClarification: boolean
- clarifyingQuestion: string or null
- extractedEntities: object (names, numbers and other details from the message)

JSON response:"
    )
}
