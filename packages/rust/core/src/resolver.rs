//! Per-turn context enrichment.
//!
//! [`ContextResolver`] takes the caller's [`PipelineContext`] and returns a new
//! one with resolved references, matched entities and follow-up information
//! merged in. The input is never mutated and the current message is not
//! appended to the returned history, so identical inputs give identical outputs.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use intentflow_router::{CompletionRequest, GuardedRouter};
use intentflow_shared::{
    Confidence, IntentflowError, ModelTier, PipelineContext, Result, Role, TierBindings,
};

use crate::canvas::CanvasAnalyzer;
use crate::structured::parse_or_default;
use crate::tracker::{ConversationTracker, FollowUpClassifier, LexicalFollowUp};

/// History turns included in the resolution prompt.
const RECENT_TURNS: usize = 3;

/// Pronouns and "the <word>" phrases that may point at something earlier.
static REFERENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(it|its|that|this|these|those|them|they)\b|\bthe\s+\w+")
        .expect("reference regex")
});

const RESOLUTION_SYSTEM_PROMPT: &str = "\
You resolve ambiguous references in a user's message to a writing assistant.
Map each pronoun or vague phrase (\"it\", \"that\", \"the chapter\", ...) to the \
workspace entity or earlier topic it most likely refers to. Leave out tokens \
you cannot resolve.

Return ONLY JSON of the form:
{\"references\": {\"<token>\": \"<referent>\"}, \"confidence\": <0.0 to 1.0>}";

/// Whether `message` contains anything worth resolving.
pub fn has_reference_tokens(message: &str) -> bool {
    REFERENCE_RE.is_match(message)
}

#[derive(Debug, Default, Deserialize)]
struct ResolutionReply {
    #[serde(default)]
    references: BTreeMap<String, String>,
    #[serde(default)]
    confidence: Option<f32>,
}

/// Composes the tracker, the canvas analyzer and a fast-tier model call.
#[derive(Clone)]
pub struct ContextResolver {
    router: GuardedRouter,
    tiers: TierBindings,
    canvas: CanvasAnalyzer,
    follow_up: Arc<dyn FollowUpClassifier>,
}

impl ContextResolver {
    pub fn new(router: GuardedRouter) -> Self {
        Self {
            router,
            tiers: TierBindings::default(),
            canvas: CanvasAnalyzer::new(),
            follow_up: Arc::new(LexicalFollowUp),
        }
    }

    /// Bindings used to route the resolution call. An unbound fast tier
    /// falls back to the nearest bound one.
    pub fn with_tiers(mut self, tiers: TierBindings) -> Self {
        self.tiers = tiers;
        self
    }

    pub fn with_canvas(mut self, canvas: CanvasAnalyzer) -> Self {
        self.canvas = canvas;
        self
    }

    pub fn with_follow_up_classifier(mut self, classifier: Arc<dyn FollowUpClassifier>) -> Self {
        self.follow_up = classifier;
        self
    }

    pub fn canvas(&self) -> &CanvasAnalyzer {
        &self.canvas
    }

    /// Enrich `context` for `message`. Never fails: a failed or timed-out
    /// resolution call leaves the reference map empty.
    pub async fn resolve(&self, message: &str, context: &PipelineContext) -> PipelineContext {
        let cancel = CancellationToken::new();
        match self.resolve_with_cancel(message, context, &cancel).await {
            Ok(resolved) => resolved,
            // Unreachable with a private token, kept total for the type.
            Err(_) => context.clone(),
        }
    }

    /// Like [`resolve`](Self::resolve), but aborts with
    /// [`IntentflowError::Cancelled`] when `cancel` fires. No other error is
    /// returned.
    #[instrument(skip_all, fields(history = context.conversation_history.len()))]
    pub async fn resolve_with_cancel(
        &self,
        message: &str,
        context: &PipelineContext,
        cancel: &CancellationToken,
    ) -> Result<PipelineContext> {
        let mut tracker = ConversationTracker::with_classifier(self.follow_up.clone());
        tracker.initialize_from_history(&context.conversation_history);
        tracker.set_state(context.conversation_state.clone());

        let reply = if has_reference_tokens(message) {
            self.request_resolution(message, context, cancel).await?
        } else {
            debug!("no reference tokens, skipping resolution call");
            ResolutionReply::default()
        };

        let matched = self
            .canvas
            .find_matching_nodes(message, &context.workspace_entities);

        tracker.add_message(message, Role::User);
        let is_follow_up = tracker.is_follow_up_response(message);
        let original_request = if is_follow_up {
            tracker.original_request().map(str::to_string)
        } else {
            None
        };

        let mut resolved = context.clone();
        if let Some(reported) = reply.confidence.filter(|_| !reply.references.is_empty()) {
            resolved.confidence = resolved.confidence.min(Confidence::new(reported));
        }
        resolved.resolved_references.extend(reply.references);
        resolved.matched_entities = matched;
        resolved.conversation_state = tracker.state().clone();
        resolved.is_follow_up = Some(is_follow_up);
        if original_request.is_some() {
            resolved.original_request = original_request;
        }

        debug!(
            references = resolved.resolved_references.len(),
            matched = resolved.matched_entities.len(),
            is_follow_up,
            "context resolved"
        );
        Ok(resolved)
    }

    async fn request_resolution(
        &self,
        message: &str,
        context: &PipelineContext,
        cancel: &CancellationToken,
    ) -> Result<ResolutionReply> {
        let tier = self
            .tiers
            .nearest_bound(ModelTier::Fast)
            .unwrap_or(ModelTier::Fast);
        let request = CompletionRequest::new(
            tier,
            RESOLUTION_SYSTEM_PROMPT,
            resolution_prompt(message, context),
        )
        .with_max_tokens(300)
        .with_temperature(0.0);

        match self.router.complete(&request, cancel).await {
            Ok(raw) => Ok(parse_or_default(&raw)),
            Err(IntentflowError::Cancelled) => Err(IntentflowError::Cancelled),
            Err(e) => {
                warn!(error = %e, "reference resolution failed, continuing without it");
                Ok(ResolutionReply::default())
            }
        }
    }
}

fn resolution_prompt(message: &str, context: &PipelineContext) -> String {
    let mut prompt = String::new();

    let history = &context.conversation_history;
    let recent = &history[history.len().saturating_sub(RECENT_TURNS)..];
    if !recent.is_empty() {
        prompt.push_str("Recent conversation:\n");
        for turn in recent {
            let role = match turn.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            prompt.push_str(&format!("[{role}]: {}\n", turn.content));
        }
        prompt.push('\n');
    }

    if !context.workspace_entities.is_empty() {
        prompt.push_str("Workspace entities:\n");
        for entity in &context.workspace_entities {
            prompt.push_str(&format!("- {} ({})\n", entity.label, entity.category));
        }
        prompt.push('\n');
    }

    prompt.push_str(&format!("Message: \"{message}\"\n\nJSON response:"));
    prompt
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use intentflow_shared::{ConversationMessage, ConversationState, WorkspaceEntity};

    use super::*;
    use crate::testing::{StubRouter, guarded};

    const REPLY: &str =
        "```json\n{\"references\": {\"it\": \"Dragon Character\"}, \"confidence\": 0.7}\n```";

    fn context() -> PipelineContext {
        PipelineContext::new(
            vec![
                ConversationMessage::user("Tell me about the dragon"),
                ConversationMessage::assistant("The dragon is ancient and proud."),
            ],
            vec![WorkspaceEntity::new("n1", "Dragon Character", "character")],
        )
    }

    #[test]
    fn reference_token_detection() {
        assert!(has_reference_tokens("make it darker"));
        assert!(has_reference_tokens("expand the chapter"));
        assert!(has_reference_tokens("What about THOSE?"));
        assert!(!has_reference_tokens("Create a new novel about dragons"));
        // Word boundaries: "item" and "within" do not count.
        assert!(!has_reference_tokens("add an item within reach"));
    }

    #[tokio::test]
    async fn no_reference_tokens_means_no_router_call() {
        let stub = Arc::new(StubRouter::replying(REPLY));
        let resolver = ContextResolver::new(guarded(&stub));

        for message in ["Create a new novel about dragons", "yes", "chapter 2", "Write a poem"] {
            let resolved = resolver.resolve(message, &context()).await;
            assert!(resolved.resolved_references.is_empty());
        }
        assert_eq!(stub.call_count(), 0);
    }

    #[tokio::test]
    async fn resolves_references_on_fast_tier() {
        let stub = Arc::new(StubRouter::replying(REPLY));
        let resolver = ContextResolver::new(guarded(&stub));

        let resolved = resolver.resolve("make it scarier", &context()).await;
        assert_eq!(resolved.resolved_references["it"], "Dragon Character");
        assert_eq!(resolved.confidence, Confidence::new(0.7));
        assert_eq!(stub.tiers(), vec![ModelTier::Fast]);

        let request = &stub.requests()[0];
        assert_eq!(request.max_tokens, 300);
        assert!(request.user_prompt.contains("Dragon Character (character)"));
        assert!(request.user_prompt.contains("[assistant]: The dragon is ancient"));
    }

    #[tokio::test]
    async fn unbound_fast_tier_resolves_on_nearest_bound_tier() {
        let tiers = TierBindings {
            smart: Some("smart-model".into()),
            ..TierBindings::unbound()
        };
        let bound = tiers.clone();
        let stub = Arc::new(StubRouter::with(move |req| {
            if bound.is_bound(req.tier) {
                Ok(REPLY.to_string())
            } else {
                Err(IntentflowError::config(format!("no model bound to the {} tier", req.tier)))
            }
        }));
        let resolver = ContextResolver::new(guarded(&stub)).with_tiers(tiers);

        let resolved = resolver.resolve("make it scarier", &context()).await;
        assert_eq!(stub.tiers(), vec![ModelTier::Smart]);
        assert_eq!(resolved.resolved_references["it"], "Dragon Character");
    }

    #[tokio::test]
    async fn resolution_timeout_yields_empty_references() {
        let stub = Arc::new(StubRouter::replying(REPLY).delayed(Duration::from_secs(30)));
        let resolver = ContextResolver::new(guarded(&stub));

        let resolved = resolver.resolve("make it scarier", &context()).await;
        assert!(resolved.resolved_references.is_empty());
        assert_eq!(resolved.confidence, Confidence::MAX);
        assert_eq!(resolved.matched_entities.len(), 0);
    }

    #[tokio::test]
    async fn malformed_reply_yields_empty_references() {
        let stub = Arc::new(StubRouter::replying("I think 'it' is the dragon."));
        let resolver = ContextResolver::new(guarded(&stub));

        let resolved = resolver.resolve("make it scarier", &context()).await;
        assert!(resolved.resolved_references.is_empty());
        assert_eq!(stub.call_count(), 1);
    }

    #[tokio::test]
    async fn transport_failure_yields_empty_references() {
        let stub = Arc::new(StubRouter::failing());
        let resolver = ContextResolver::new(guarded(&stub));

        let resolved = resolver.resolve("rewrite that", &context()).await;
        assert!(resolved.resolved_references.is_empty());
        assert_eq!(resolved.is_follow_up, Some(false));
    }

    #[tokio::test]
    async fn resolve_is_idempotent_and_leaves_input_untouched() {
        let stub = Arc::new(StubRouter::replying(REPLY));
        let resolver = ContextResolver::new(guarded(&stub));
        let input = context();
        let before = input.clone();

        let first = resolver.resolve("tell me about the dragon character", &input).await;
        let second = resolver.resolve("tell me about the dragon character", &input).await;

        assert_eq!(first, second);
        assert_eq!(input, before);
        assert_eq!(first.conversation_history, input.conversation_history);
        assert_eq!(first.matched_entities[0].entity.id, "n1");
        assert!(first.matched_entities[0].score >= 15);
    }

    #[tokio::test]
    async fn follow_up_detection_records_original_request() {
        let stub = Arc::new(StubRouter::replying(REPLY));
        let resolver = ContextResolver::new(guarded(&stub));
        let input = PipelineContext::new(
            vec![
                ConversationMessage::user("Write chapter 3"),
                ConversationMessage::assistant("Which tone do you want?"),
            ],
            vec![],
        )
        .with_state(ConversationState::AwaitingClarification {
            question: "Which tone do you want?".into(),
            options: vec![],
        });

        let resolved = resolver.resolve("yes", &input).await;
        assert_eq!(resolved.is_follow_up, Some(true));
        assert_eq!(resolved.original_request.as_deref(), Some("Write chapter 3"));
        assert_eq!(resolved.conversation_state, input.conversation_state);
    }

    #[tokio::test]
    async fn initial_state_is_explicitly_not_follow_up() {
        let stub = Arc::new(StubRouter::replying(REPLY));
        let resolver = ContextResolver::new(guarded(&stub));

        let resolved = resolver.resolve("yes", &context()).await;
        assert_eq!(resolved.is_follow_up, Some(false));
        assert_eq!(resolved.original_request, None);
    }

    #[tokio::test]
    async fn cancellation_propagates() {
        let stub = Arc::new(StubRouter::replying(REPLY).delayed(Duration::from_secs(30)));
        let resolver = ContextResolver::new(guarded(&stub));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = resolver
            .resolve_with_cancel("make it scarier", &context(), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn existing_references_are_preserved() {
        let stub = Arc::new(StubRouter::replying(REPLY));
        let resolver = ContextResolver::new(guarded(&stub));
        let mut input = context();
        input
            .resolved_references
            .insert("them".into(), "the villagers".into());

        let resolved = resolver.resolve("make it scarier", &input).await;
        assert_eq!(resolved.resolved_references.len(), 2);
        assert_eq!(resolved.resolved_references["them"], "the villagers");
    }
}
