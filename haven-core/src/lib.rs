//! # Haven Core
//!
//! Core library for the Haven wellness support pipeline. A user message is
//! routed through a multi-stage decision pipeline that screens for
//! crisis-level risk before any expensive work happens, retrieves
//! supporting knowledge from a dense vector index and a relationship graph,
//! fuses and budgets that knowledge into a bounded context, invokes a
//! generative backend, re-screens the reply, and streams the result while
//! recording provenance and per-stage latency.

pub mod cache;
pub mod config;
pub mod context;
pub mod embeddings;
pub mod error;
pub mod fusion;
pub mod generate;
pub mod pipeline;
pub mod providers;
pub mod retrieval;
pub mod safety;
pub mod state;
pub mod types;

// Re-export commonly used types at the crate root.
pub use cache::{Cache, MemoryCache, NoopCache};
pub use config::{PipelineConfig, load_config};
pub use error::{HavenError, Result};
pub use generate::{GenerationInvoker, LlmProvider, MockLlmProvider};
pub use pipeline::{EscalationEvent, EscalationSink, Pipeline, PipelineBackends};
pub use safety::{RiskAssessment, RiskClassifier};
pub use types::{
    PipelineRequest, PipelineResponse, ProvenanceEntry, RiskLevel, SafetyLevel, ScoredItem,
    SourceKind,
};
