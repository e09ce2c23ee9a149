//! Intent resolution pipeline for IntentFlow.
//!
//! This crate turns a chat message plus its surroundings (history, canvas
//! entities, document panel) into an [`IntentResult`](intentflow_shared::IntentResult):
//! - [`tracker`]: bounded history and follow-up detection
//! - [`canvas`]: workspace-entity ranking and edit-vs-create cues
//! - [`resolver`]: per-turn context enrichment with reference resolution
//! - [`triage`] / [`analyzer`]: local pattern triage and model-backed analysis
//! - [`pipeline`]: the staged, confidence-gated [`Orchestrator`]
//! - [`session`]: per-conversation [`SessionHandle`]

pub mod analyzer;
pub mod canvas;
pub mod modules;
pub mod pipeline;
pub mod resolver;
pub mod session;
pub mod structured;
pub mod tracker;
pub mod triage;

#[cfg(test)]
pub(crate) mod testing;

pub use canvas::CanvasAnalyzer;
pub use modules::{DraftIntent, EntityGlossary, ModuleVerdict, PipelineModule, RequireTarget};
pub use pipeline::{Orchestrator, PipelineConfig, TierDecision, TurnOutcome, select_tier};
pub use resolver::ContextResolver;
pub use session::SessionHandle;
pub use tracker::ConversationTracker;
pub use triage::{PatternTriage, Triage, TriageOutcome};
