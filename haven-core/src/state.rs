//! Pipeline state record and the stage transition machinery.
//!
//! One `PipelineState` is threaded through every stage of one run and is
//! never shared across concurrent runs. Stages communicate decisions only
//! through the boolean flags they own (`should_escalate`, `skip_llm`);
//! no stage looks ahead or rewrites another stage's decision.

use std::collections::BTreeMap;

use crate::types::{GraphHit, ProvenanceEntry, RiskLevel, ScoredItem, VectorHit};

/// Mutable record threaded through every stage of one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineState {
    /// Sanitized user text.
    pub message: String,
    /// Query embedding, absent until preprocessing (or on embedder failure).
    pub query_embedding: Option<Vec<f32>>,
    pub vector_hits: Vec<VectorHit>,
    pub graph_hits: Vec<GraphHit>,
    /// Fused, ranked list of scored items.
    pub fused: Vec<ScoredItem>,
    /// Assembled context string.
    pub context: String,
    /// Subset of fused items that made it into the context.
    pub context_items: Vec<ScoredItem>,
    /// Constructed generation prompt.
    pub prompt: String,
    /// Generated (or substituted) reply text.
    pub reply: String,
    pub risk_level: RiskLevel,
    /// Risk score in [0, 1].
    pub risk_score: f64,
    /// Once true, no later stage may call the generation backend.
    pub should_escalate: bool,
    /// True means the run terminates at the context stage without
    /// invoking generation.
    pub skip_llm: bool,
    pub provenance: Vec<ProvenanceEntry>,
    /// Wall-clock seconds per stage, keyed by stage name.
    pub timings: BTreeMap<String, f64>,
    /// Recoverable error recorded during the run, if any.
    pub error: Option<String>,
}

impl PipelineState {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            query_embedding: None,
            vector_hits: Vec::new(),
            graph_hits: Vec::new(),
            fused: Vec::new(),
            context: String::new(),
            context_items: Vec::new(),
            prompt: String::new(),
            reply: String::new(),
            risk_level: RiskLevel::Safe,
            risk_score: 0.0,
            should_escalate: false,
            skip_llm: false,
            provenance: Vec::new(),
            timings: BTreeMap::new(),
            error: None,
        }
    }
}

/// One stage of the pipeline's directed state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Preprocess,
    SafetyPrefilter,
    VectorRetrieve,
    GraphRetrieve,
    HybridFuse,
    ContextAssemble,
    Generate,
    SafetyPostfilter,
    ProvenanceBuild,
    StreamOut,
}

impl Stage {
    /// Canonical stage name, used as the timing map key.
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Preprocess => "preprocess",
            Stage::SafetyPrefilter => "safety_prefilter",
            Stage::VectorRetrieve => "vector_retrieve",
            Stage::GraphRetrieve => "graph_retrieve",
            Stage::HybridFuse => "hybrid_fuse",
            Stage::ContextAssemble => "context_assemble",
            Stage::Generate => "generate",
            Stage::SafetyPostfilter => "safety_postfilter",
            Stage::ProvenanceBuild => "provenance_build",
            Stage::StreamOut => "stream_out",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of executing one stage, consumed by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Continue with the given stage.
    Next(Stage),
    /// The run is complete; produce the terminal response.
    Terminal,
}
