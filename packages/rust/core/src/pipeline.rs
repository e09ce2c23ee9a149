//! Turn pipeline: triage → context resolution → prompt modules → tier
//! selection / model call → validation.
//!
//! [`Orchestrator::run_turn`] always produces an [`IntentResult`]. Stage
//! failures lower confidence and push the turn toward the reasoning tier;
//! a failed model call falls back to the triage match or to a clarifying
//! `general_chat`. Only caller-initiated cancellation is returned as an error.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use intentflow_router::{CompletionRequest, GuardedRouter};
use intentflow_shared::{
    AppConfig, Confidence, ConfidenceBands, EscalationThresholds, IntentKind, IntentResult,
    IntentflowError, ModelTier, PipelineContext, Result, StageToggles, TierBindings,
};

use crate::analyzer::{self, DeepAnalysis, FALLBACK_QUESTION};
use crate::modules::{DraftIntent, EntityGlossary, PipelineModule, RequireTarget, run_modules};
use crate::resolver::ContextResolver;
use crate::triage::{PatternTriage, Triage, TriageMatch, TriageOutcome};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Runtime configuration for the [`Orchestrator`].
#[derive(Clone)]
pub struct PipelineConfig {
    pub tiers: TierBindings,
    pub stages: StageToggles,
    pub bands: ConfidenceBands,
    pub escalation: EscalationThresholds,
    /// Applied before the model call.
    pub prompt_modules: Vec<Arc<dyn PipelineModule>>,
    /// Applied after the model call.
    pub validation_rules: Vec<Arc<dyn PipelineModule>>,
}

impl std::fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = |modules: &[Arc<dyn PipelineModule>]| -> Vec<String> {
            modules.iter().map(|m| m.name().to_string()).collect()
        };
        f.debug_struct("PipelineConfig")
            .field("tiers", &self.tiers)
            .field("stages", &self.stages)
            .field("bands", &self.bands)
            .field("escalation", &self.escalation)
            .field("prompt_modules", &names(&self.prompt_modules))
            .field("validation_rules", &names(&self.validation_rules))
            .finish()
    }
}

impl From<&AppConfig> for PipelineConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            tiers: config.tiers.clone(),
            stages: config.stages,
            bands: config.confidence,
            escalation: config.escalation,
            prompt_modules: vec![Arc::new(EntityGlossary)],
            validation_rules: vec![Arc::new(RequireTarget)],
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        self.bands.validate()?;
        self.escalation.validate()
    }

    /// Drop both module lists.
    pub fn without_modules(mut self) -> Self {
        self.prompt_modules.clear();
        self.validation_rules.clear();
        self
    }
}

// ---------------------------------------------------------------------------
// Tier selection
// ---------------------------------------------------------------------------

/// Where a turn goes and why.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierDecision {
    pub tier: ModelTier,
    pub escalated: bool,
}

/// Apply the escalation rule.
///
/// Escalates when `confidence` is below the plain threshold, when reasoning is
/// required and `confidence` is below the reasoning threshold, or when
/// `force_reasoning` is set. Escalation targets the reasoning tier if reasoning
/// is required or forced, the smart tier otherwise. Unbound tiers fall back
/// to the nearest bound one.
pub fn select_tier(
    confidence: Confidence,
    requires_reasoning: bool,
    force_reasoning: bool,
    config: &PipelineConfig,
) -> TierDecision {
    let c = confidence.value();
    let escalated = force_reasoning
        || c < config.escalation.confidence_threshold
        || (requires_reasoning && c < config.escalation.reasoning_threshold);

    let desired = match (escalated, requires_reasoning || force_reasoning) {
        (false, _) => ModelTier::Fast,
        (true, true) => ModelTier::Reasoning,
        (true, false) => ModelTier::Smart,
    };

    TierDecision {
        tier: config.tiers.nearest_bound(desired).unwrap_or(desired),
        escalated,
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// A finished turn: the result plus the enriched context it was derived from.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub result: IntentResult,
    pub context: PipelineContext,
}

/// The intent as carried between the model call and validation.
struct Answer {
    draft: DraftIntent,
    reasoning: String,
    tier: ModelTier,
    used_model: bool,
}

impl Answer {
    fn from_analysis(analysis: DeepAnalysis, base: &DraftIntent, tier: ModelTier) -> Self {
        let mut draft = base.clone();
        draft.intent = analysis.intent;
        draft.confidence = analysis.confidence;
        draft.parameters.extend(analysis.extracted_entities);
        draft.clarification = analysis.clarifying_question;
        Self {
            draft,
            reasoning: analysis.reasoning,
            tier,
            used_model: true,
        }
    }
}

/// Sequences the stages under one [`PipelineConfig`].
pub struct Orchestrator {
    config: PipelineConfig,
    router: GuardedRouter,
    triage: Arc<dyn Triage>,
    resolver: ContextResolver,
}

impl Orchestrator {
    /// Fails on an invalid configuration.
    pub fn new(config: PipelineConfig, router: GuardedRouter) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            resolver: ContextResolver::new(router.clone()).with_tiers(config.tiers.clone()),
            triage: Arc::new(PatternTriage::new()),
            config,
            router,
        })
    }

    pub fn with_triage(mut self, triage: Arc<dyn Triage>) -> Self {
        self.triage = triage;
        self
    }

    /// Replace the resolver. It is rebound to this pipeline's tiers.
    pub fn with_resolver(mut self, resolver: ContextResolver) -> Self {
        self.resolver = resolver.with_tiers(self.config.tiers.clone());
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run one turn to completion. Never fails.
    pub async fn run(&self, message: &str, context: &PipelineContext) -> IntentResult {
        let cancel = CancellationToken::new();
        match self.run_turn(message, context, &cancel).await {
            Ok(outcome) => outcome.result,
            Err(_) => unenriched(message),
        }
    }

    /// Run one turn, aborting with [`IntentflowError::Cancelled`] when
    /// `cancel` fires.
    #[instrument(skip_all, fields(chars = message.len()))]
    pub async fn run_turn(
        &self,
        message: &str,
        context: &PipelineContext,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome> {
        let start = Instant::now();
        let stages = self.config.stages;
        let bands = self.config.bands;
        let mut force_reasoning = false;

        // --- Stage 1: triage ---
        let triage = if stages.triage {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(IntentflowError::Cancelled),
                outcome = self.triage.triage(message, context) => outcome,
            };
            match outcome {
                Ok(outcome) => outcome,
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(triage = self.triage.name(), error = %e, "triage failed, skipping stage");
                    force_reasoning = true;
                    TriageOutcome::default()
                }
            }
        } else {
            TriageOutcome::default()
        };
        let mut requires_reasoning = triage.requires_reasoning;

        // --- Stage 2: context resolution ---
        let resolved = if stages.context_resolution {
            self.resolver
                .resolve_with_cancel(message, context, cancel)
                .await?
        } else {
            context.clone()
        };

        let mut confidence = resolved.confidence;
        match &triage.matched {
            Some(m) => confidence = confidence.min(m.confidence),
            None if stages.triage => confidence = confidence.min(Confidence::new(bands.low)),
            None => {}
        }

        // --- Stage 3: prompt modules ---
        let mut draft = DraftIntent::new(message);
        if let Some(m) = &triage.matched {
            draft.intent = m.intent;
            draft.confidence = m.confidence;
            draft.parameters = m.parameters.clone();
        }
        let report = run_modules(&self.config.prompt_modules, draft, &resolved);
        if report.errors > 0 {
            force_reasoning = true;
        }
        if report.failed() {
            confidence = confidence.min(Confidence::new(bands.low));
            requires_reasoning = true;
        }
        if force_reasoning {
            confidence = Confidence::MIN;
        }
        let draft = report.draft;

        // --- Stage 4: tier selection and model call ---
        let decision = select_tier(confidence, requires_reasoning, force_reasoning, &self.config);
        debug!(
            %confidence,
            requires_reasoning,
            force_reasoning,
            tier = %decision.tier,
            escalated = decision.escalated,
            "tier selected"
        );

        let fast_path = triage
            .matched
            .as_ref()
            .filter(|_| confidence.value() >= bands.high && !decision.escalated);

        let mut answer = match fast_path {
            Some(m) => Answer {
                draft: DraftIntent {
                    confidence,
                    ..draft
                },
                reasoning: m.reasoning.clone(),
                tier: ModelTier::Fast,
                used_model: false,
            },
            None => {
                self.consult_model(
                    message,
                    &resolved,
                    draft,
                    triage.matched.as_ref(),
                    decision,
                    requires_reasoning,
                    cancel,
                )
                .await?
            }
        };
        if answer.used_model {
            answer.draft.confidence = answer.draft.confidence.min(resolved.confidence);
        }

        // --- Stage 5: validation ---
        if stages.validation {
            let report = run_modules(&self.config.validation_rules, answer.draft, &resolved);
            answer.draft = report.draft;
            if report.errors > 0 {
                answer.draft.confidence = Confidence::MIN;
            }
            if let Some(reason) = report.failures.into_iter().next() {
                answer.draft.confidence = answer.draft.confidence.min(Confidence::new(bands.low));
                answer.draft.clarification.get_or_insert(reason);
            }
        }

        let result = finish(message, answer, &resolved);
        info!(
            intent = %result.intent_kind,
            confidence = %result.confidence,
            tier = %result.chosen_tier,
            used_model = result.used_model,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "turn complete"
        );

        Ok(TurnOutcome {
            result,
            context: resolved,
        })
    }

    /// Deep analysis on the selected tier, with one escalation for a weak
    /// fast-tier answer and one reasoning-tier retry for a failed call.
    #[allow(clippy::too_many_arguments)]
    async fn consult_model(
        &self,
        message: &str,
        context: &PipelineContext,
        draft: DraftIntent,
        triage_match: Option<&TriageMatch>,
        decision: TierDecision,
        requires_reasoning: bool,
        cancel: &CancellationToken,
    ) -> Result<Answer> {
        let request = CompletionRequest::new(
            decision.tier,
            analyzer::system_prompt(context, &draft.prompt_sections),
            analyzer::user_prompt(message),
        );

        let failure = match self.router.complete(&request, cancel).await {
            Ok(raw) => {
                let analysis = analyzer::parse_analysis(&raw);
                if decision.escalated {
                    return Ok(Answer::from_analysis(analysis, &draft, decision.tier));
                }

                let second = select_tier(analysis.confidence, requires_reasoning, false, &self.config);
                if !second.escalated || second.tier == decision.tier {
                    return Ok(Answer::from_analysis(analysis, &draft, decision.tier));
                }

                debug!(
                    confidence = %analysis.confidence,
                    tier = %second.tier,
                    "fast answer below threshold, escalating"
                );
                return match self.router.complete(&request.on_tier(second.tier), cancel).await {
                    Ok(raw) => Ok(Answer::from_analysis(
                        analyzer::parse_analysis(&raw),
                        &draft,
                        second.tier,
                    )),
                    Err(e) if e.is_cancelled() => Err(e),
                    Err(e) => {
                        warn!(tier = %second.tier, error = %e, "escalated call failed, keeping first answer");
                        Ok(Answer::from_analysis(analysis, &draft, decision.tier))
                    }
                };
            }
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => e,
        };

        warn!(tier = %decision.tier, error = %failure, "model call failed");
        let retry_tier = self
            .config
            .tiers
            .nearest_bound(ModelTier::Reasoning)
            .unwrap_or(ModelTier::Reasoning);

        if retry_tier != decision.tier {
            match self.router.complete(&request.on_tier(retry_tier), cancel).await {
                Ok(raw) => {
                    return Ok(Answer::from_analysis(
                        analyzer::parse_analysis(&raw),
                        &draft,
                        retry_tier,
                    ));
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => warn!(tier = %retry_tier, error = %e, "reasoning retry failed"),
            }
        }

        Ok(degraded(draft, triage_match, retry_tier))
    }
}

/// Result when no model could be reached.
fn degraded(draft: DraftIntent, triage_match: Option<&TriageMatch>, tier: ModelTier) -> Answer {
    let (draft, reasoning) = match triage_match {
        Some(m) => (
            DraftIntent {
                confidence: Confidence::MIN,
                ..draft
            },
            format!("model unavailable, using local match: {}", m.reasoning),
        ),
        None => (
            DraftIntent {
                intent: IntentKind::GeneralChat,
                confidence: Confidence::MIN,
                clarification: Some(FALLBACK_QUESTION.into()),
                ..draft
            },
            "model unavailable and no local match".to_string(),
        ),
    };
    Answer {
        draft,
        reasoning,
        tier,
        used_model: false,
    }
}

fn finish(message: &str, answer: Answer, context: &PipelineContext) -> IntentResult {
    let Answer {
        draft,
        reasoning,
        tier,
        used_model,
    } = answer;

    let mut parameters: BTreeMap<String, Value> = draft.parameters;
    parameters.insert("message".into(), Value::String(message.to_string()));
    if !context.resolved_references.is_empty() {
        let references = context
            .resolved_references
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        parameters.insert("references".into(), Value::Object(references));
    }
    if context.is_follow_up == Some(true) {
        if let Some(original) = &context.original_request {
            parameters.insert("original_request".into(), Value::String(original.clone()));
        }
    }

    IntentResult {
        intent_kind: draft.intent,
        resolved_parameters: parameters,
        confidence: draft.confidence,
        chosen_tier: tier,
        clarification_needed: draft.clarification,
        reasoning,
        used_model,
    }
}

/// The documented worst case: the message, unenriched, at minimum confidence.
fn unenriched(message: &str) -> IntentResult {
    IntentResult {
        intent_kind: IntentKind::GeneralChat,
        resolved_parameters: BTreeMap::from([(
            "message".to_string(),
            Value::String(message.to_string()),
        )]),
        confidence: Confidence::MIN,
        chosen_tier: ModelTier::Fast,
        clarification_needed: Some(FALLBACK_QUESTION.into()),
        reasoning: "turn abandoned".into(),
        used_model: false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
