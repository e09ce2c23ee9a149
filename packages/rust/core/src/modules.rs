//! Pluggable units run before the model call (prompt modules) and after it
//! (validation rules).
//!
//! Each unit sees the current [`DraftIntent`] and answers pass, correct or
//! fail. The pipeline folds an ordered list of them over the draft; a unit
//! that errors is skipped.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use intentflow_shared::{Confidence, IntentKind, PipelineContext, Result};

/// The intent as it stands at some point in the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct DraftIntent {
    pub message: String,
    pub intent: IntentKind,
    pub confidence: Confidence,
    pub parameters: BTreeMap<String, Value>,
    /// Extra prompt text contributed by prompt modules.
    pub prompt_sections: Vec<String>,
    pub clarification: Option<String>,
}

impl DraftIntent {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            intent: IntentKind::GeneralChat,
            confidence: Confidence::MAX,
            parameters: BTreeMap::new(),
            prompt_sections: Vec::new(),
            clarification: None,
        }
    }
}

/// What a module decided about a draft.
#[derive(Debug, Clone, PartialEq)]
pub enum ModuleVerdict {
    Pass,
    /// Replace the draft with this one.
    Correct(DraftIntent),
    Fail { reason: String },
}

/// A narrow capability applied to every turn.
pub trait PipelineModule: Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, draft: &DraftIntent, context: &PipelineContext) -> Result<ModuleVerdict>;
}

/// Result of folding a module list over a draft.
#[derive(Debug, Clone)]
pub struct ModuleReport {
    pub draft: DraftIntent,
    /// Failure reasons, in module order.
    pub failures: Vec<String>,
    /// Modules that returned an error and were skipped.
    pub errors: usize,
}

impl ModuleReport {
    pub fn failed(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Apply `modules` in order. Corrections feed into the next module.
pub fn run_modules(
    modules: &[Arc<dyn PipelineModule>],
    draft: DraftIntent,
    context: &PipelineContext,
) -> ModuleReport {
    let start = ModuleReport {
        draft,
        failures: Vec::new(),
        errors: 0,
    };

    modules.iter().fold(start, |mut report, module| {
        match module.apply(&report.draft, context) {
            Ok(ModuleVerdict::Pass) => {}
            Ok(ModuleVerdict::Correct(draft)) => {
                debug!(module = module.name(), "module corrected draft");
                report.draft = draft;
            }
            Ok(ModuleVerdict::Fail { reason }) => {
                debug!(module = module.name(), %reason, "module failed draft");
                report.failures.push(reason);
            }
            Err(e) => {
                warn!(module = module.name(), error = %e, "module errored, skipping");
                report.errors += 1;
            }
        }
        report
    })
}

// ---------------------------------------------------------------------------
// Built-ins
// ---------------------------------------------------------------------------

/// Adds matched entities and resolved references to the prompt.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntityGlossary;

impl PipelineModule for EntityGlossary {
    fn name(&self) -> &str {
        "entity_glossary"
    }

    fn apply(&self, draft: &DraftIntent, context: &PipelineContext) -> Result<ModuleVerdict> {
        if context.matched_entities.is_empty() && context.resolved_references.is_empty() {
            return Ok(ModuleVerdict::Pass);
        }

        let mut section = String::from("Glossary:");
        for scored in &context.matched_entities {
            section.push_str(&format!(
                "\n- {} [{}] (id {}, match score {})",
                scored.entity.label, scored.entity.category, scored.entity.id, scored.score
            ));
        }
        for (token, referent) in &context.resolved_references {
            section.push_str(&format!("\n- \"{token}\" refers to {referent}"));
        }

        let mut corrected = draft.clone();
        corrected.prompt_sections.push(section);
        Ok(ModuleVerdict::Correct(corrected))
    }
}

/// Parameter keys that name what an edit applies to.
const TARGET_KEYS: &[&str] = &["target", "target_id", "section", "section_id", "node", "node_id"];

/// Intents that act on existing content must know which content.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequireTarget;

impl PipelineModule for RequireTarget {
    fn name(&self) -> &str {
        "require_target"
    }

    fn apply(&self, draft: &DraftIntent, context: &PipelineContext) -> Result<ModuleVerdict> {
        if !draft.intent.targets_existing() {
            return Ok(ModuleVerdict::Pass);
        }

        let has_target = TARGET_KEYS.iter().any(|k| draft.parameters.contains_key(*k))
            || context.document.active_section.is_some()
            || !context.matched_entities.is_empty()
            || !context.resolved_references.is_empty();

        if has_target {
            return Ok(ModuleVerdict::Pass);
        }

        let what = match draft.intent {
            IntentKind::DeleteNode | IntentKind::OpenAndWrite => "document",
            _ => "section",
        };
        Ok(ModuleVerdict::Fail {
            reason: format!("Which {what} do you mean?"),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use intentflow_shared::{IntentflowError, ScoredEntity, WorkspaceEntity};

    use super::*;

    struct Upgrade;
    impl PipelineModule for Upgrade {
        fn name(&self) -> &str {
            "upgrade"
        }
        fn apply(&self, draft: &DraftIntent, _ctx: &PipelineContext) -> Result<ModuleVerdict> {
            let mut next = draft.clone();
            next.intent = IntentKind::ImproveContent;
            Ok(ModuleVerdict::Correct(next))
        }
    }

    struct Broken;
    impl PipelineModule for Broken {
        fn name(&self) -> &str {
            "broken"
        }
        fn apply(&self, _draft: &DraftIntent, _ctx: &PipelineContext) -> Result<ModuleVerdict> {
            Err(IntentflowError::validation("module crashed"))
        }
    }

    fn matched_context() -> PipelineContext {
        let mut context = PipelineContext::default();
        context.matched_entities = vec![ScoredEntity {
            entity: WorkspaceEntity::new("n1", "Dragon Character", "character"),
            score: 22,
        }];
        context
            .resolved_references
            .insert("it".into(), "Dragon Character".into());
        context
    }

    #[test]
    fn fold_applies_in_order_and_skips_errors() {
        let modules: Vec<Arc<dyn PipelineModule>> =
            vec![Arc::new(Broken), Arc::new(Upgrade), Arc::new(RequireTarget)];
        let report = run_modules(&modules, DraftIntent::new("polish it"), &PipelineContext::default());

        assert_eq!(report.errors, 1);
        assert_eq!(report.draft.intent, IntentKind::ImproveContent);
        // RequireTarget saw the corrected draft.
        assert_eq!(report.failures, vec!["Which section do you mean?".to_string()]);
        assert!(report.failed());
    }

    #[test]
    fn empty_module_list_is_identity() {
        let draft = DraftIntent::new("hello");
        let report = run_modules(&[], draft.clone(), &PipelineContext::default());
        assert_eq!(report.draft, draft);
        assert!(!report.failed());
        assert_eq!(report.errors, 0);
    }

    #[test]
    fn glossary_lists_entities_and_references() {
        let verdict = EntityGlossary
            .apply(&DraftIntent::new("make it scarier"), &matched_context())
            .unwrap();
        let ModuleVerdict::Correct(draft) = verdict else {
            panic!("expected a correction");
        };
        let section = &draft.prompt_sections[0];
        assert!(section.contains("Dragon Character [character]"));
        assert!(section.contains("\"it\" refers to Dragon Character"));
    }

    #[test]
    fn glossary_passes_without_matches() {
        let verdict = EntityGlossary
            .apply(&DraftIntent::new("hi"), &PipelineContext::default())
            .unwrap();
        assert_eq!(verdict, ModuleVerdict::Pass);
    }

    #[test]
    fn require_target_only_checks_edit_intents() {
        let mut draft = DraftIntent::new("delete");
        draft.intent = IntentKind::AnswerQuestion;
        assert_eq!(
            RequireTarget.apply(&draft, &PipelineContext::default()).unwrap(),
            ModuleVerdict::Pass
        );

        draft.intent = IntentKind::DeleteNode;
        assert_eq!(
            RequireTarget.apply(&draft, &PipelineContext::default()).unwrap(),
            ModuleVerdict::Fail {
                reason: "Which document do you mean?".into()
            }
        );
        assert_eq!(
            RequireTarget.apply(&draft, &matched_context()).unwrap(),
            ModuleVerdict::Pass
        );

        draft
            .parameters
            .insert("target".into(), Value::String("Old Notes".into()));
        assert_eq!(
            RequireTarget.apply(&draft, &PipelineContext::default()).unwrap(),
            ModuleVerdict::Pass
        );
    }
}
