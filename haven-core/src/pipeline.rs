//! Pipeline orchestrator — sequences the stages, enforces timeouts, and
//! decides early termination.
//!
//! The stage graph:
//!
//! ```text
//! preprocess -> safety_prefilter
//! safety_prefilter -> [escalate: TERMINAL] | vector_retrieve
//! vector_retrieve -> graph_retrieve -> hybrid_fuse -> context_assemble
//! context_assemble -> [skip_llm: TERMINAL] | generate
//! generate -> safety_postfilter -> provenance_build -> stream_out -> TERMINAL
//! ```
//!
//! Each stage records its wall-clock duration into the timing map before
//! the dispatcher advances. The two conditional edges read only the
//! decision flags set by earlier stages. Any unexpected failure is caught
//! at the orchestrator boundary and converted to a fixed degraded response;
//! the pipeline never errors out ungracefully to its caller.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cache::{Cache, cache_key};
use crate::config::PipelineConfig;
use crate::context::ContextAssembler;
use crate::embeddings::Embedder;
use crate::error::{ConfigError, HavenError, InputError};
use crate::fusion::fuse;
use crate::generate::{GenerationInvoker, LlmProvider};
use crate::retrieval::{GraphStore, SearchFilters, VectorSearch, timed_retrieval};
use crate::safety::RiskClassifier;
use crate::state::{PipelineState, Stage, Transition};
use crate::types::{
    GraphHit, PipelineRequest, PipelineResponse, ProvenanceEntry, RiskLevel, SafetyLevel,
};

/// Reply used for the degraded terminal response when the pipeline itself
/// failed unexpectedly.
const DEGRADED_REPLY: &str =
    "I apologize, but I'm having trouble right now. Please try again.";

/// Maximum number of provenance entries exposed to callers.
const PROVENANCE_LIMIT: usize = 10;

/// Maximum snippet length in a provenance entry, in characters.
const PROVENANCE_SNIPPET_CHARS: usize = 200;

/// An escalation raised by the safety prefilter.
#[derive(Debug, Clone)]
pub struct EscalationEvent {
    /// Generated id, `ESC_`-prefixed.
    pub escalation_id: String,
    pub session_id: String,
    pub reason: String,
    pub severity: RiskLevel,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Receives escalation notifications. Persistence and human handoff are
/// external collaborators; the default sink only logs.
#[async_trait::async_trait]
pub trait EscalationSink: Send + Sync {
    async fn notify(&self, event: &EscalationEvent);
}

/// Default sink: structured warning log, nothing else.
#[derive(Debug, Default)]
pub struct LogOnlySink;

#[async_trait::async_trait]
impl EscalationSink for LogOnlySink {
    async fn notify(&self, event: &EscalationEvent) {
        warn!(
            escalation_id = %event.escalation_id,
            session_id = %event.session_id,
            severity = %event.severity,
            reason = %event.reason,
            "Escalation raised"
        );
    }
}

/// External service handles consumed by one pipeline instance.
///
/// All handles are `Arc`s so concurrent runs share backends without
/// sharing any per-run state.
#[derive(Clone)]
pub struct PipelineBackends {
    pub embedder: Arc<dyn Embedder>,
    pub vector: Arc<dyn VectorSearch>,
    pub graph: Arc<dyn GraphStore>,
    pub llm: Arc<dyn LlmProvider>,
    pub cache: Arc<dyn Cache>,
}

/// Per-run streaming context: the caller's delta channel and cancellation.
struct StreamHandle {
    deltas: mpsc::Sender<String>,
    cancel: CancellationToken,
}

/// The pipeline orchestrator.
///
/// One instance serves many concurrent runs; each call to
/// [`Pipeline::process_message`] owns its own [`PipelineState`].
pub struct Pipeline {
    config: PipelineConfig,
    classifier: RiskClassifier,
    assembler: ContextAssembler,
    invoker: GenerationInvoker,
    embedder: Arc<dyn Embedder>,
    vector: Arc<dyn VectorSearch>,
    graph: Arc<dyn GraphStore>,
    cache: Arc<dyn Cache>,
    escalations: Arc<dyn EscalationSink>,
}

impl Pipeline {
    /// Build a pipeline from configuration and backend handles.
    ///
    /// Fails only if the configured risk patterns do not compile.
    pub fn new(config: PipelineConfig, backends: PipelineBackends) -> Result<Self, ConfigError> {
        let classifier = RiskClassifier::new(&config.safety)?;
        let assembler = ContextAssembler::new(config.context.clone());
        let invoker = GenerationInvoker::new(backends.llm, config.llm.clone());
        Ok(Self {
            config,
            classifier,
            assembler,
            invoker,
            embedder: backends.embedder,
            vector: backends.vector,
            graph: backends.graph,
            cache: backends.cache,
            escalations: Arc::new(LogOnlySink),
        })
    }

    /// Replace the escalation sink.
    pub fn with_escalation_sink(mut self, sink: Arc<dyn EscalationSink>) -> Self {
        self.escalations = sink;
        self
    }

    /// Process one message and return the terminal response.
    ///
    /// Returns `Err` only for input rejection (empty or oversized text),
    /// which happens before the state machine starts. Every run that enters
    /// the pipeline produces a well-formed response.
    pub async fn process_message(
        &self,
        request: PipelineRequest,
    ) -> Result<PipelineResponse, HavenError> {
        self.validate(&request)?;
        Ok(self.run_guarded(request, None).await)
    }

    /// Process one message with streaming delivery.
    ///
    /// Reply fragments are sent to `deltas` as strictly increasing suffix
    /// deltas before the final summary is returned. Cancelling `cancel`
    /// stops delivery promptly without leaking the in-flight generation.
    pub async fn process_message_streaming(
        &self,
        request: PipelineRequest,
        deltas: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<PipelineResponse, HavenError> {
        self.validate(&request)?;
        let stream = StreamHandle { deltas, cancel };
        Ok(self.run_guarded(request, Some(stream)).await)
    }

    /// Reject inputs that must never enter the state machine.
    fn validate(&self, request: &PipelineRequest) -> Result<(), HavenError> {
        let trimmed = request.message.trim();
        if trimmed.is_empty() {
            return Err(InputError::EmptyMessage.into());
        }
        let max = self.config.limits.max_message_length;
        if trimmed.chars().count() > max {
            return Err(InputError::MessageTooLong {
                max,
                got: trimmed.chars().count(),
            }
            .into());
        }
        Ok(())
    }

    /// Run the state machine with the orchestrator-boundary catch.
    async fn run_guarded(
        &self,
        request: PipelineRequest,
        stream: Option<StreamHandle>,
    ) -> PipelineResponse {
        let session_id = request.session_id.clone();
        let run = AssertUnwindSafe(self.run_stages(request, stream)).catch_unwind();

        match run.await {
            Ok(state) => {
                info!(
                    session_id = %session_id,
                    safety_level = %state.risk_level,
                    escalated = state.should_escalate,
                    "Pipeline run complete"
                );
                response_from_state(state)
            }
            Err(panic) => {
                let message = panic_message(panic);
                error!(session_id = %session_id, error = %message, "Pipeline run failed");
                degraded_response(message)
            }
        }
    }

    /// Table-driven dispatch over the stage graph.
    async fn run_stages(
        &self,
        request: PipelineRequest,
        mut stream: Option<StreamHandle>,
    ) -> PipelineState {
        let mut state = PipelineState::new(request.message.trim());
        // Fan-out handle: the graph expansion launched by vector_retrieve,
        // collected by graph_retrieve.
        let mut graph_task: Option<JoinHandle<Vec<GraphHit>>> = None;

        let mut stage = Stage::Preprocess;
        loop {
            let started = Instant::now();
            let transition = match stage {
                Stage::Preprocess => self.preprocess(&mut state).await,
                Stage::SafetyPrefilter => {
                    self.safety_prefilter(&mut state, &request, stream.as_mut()).await
                }
                Stage::VectorRetrieve => {
                    self.vector_retrieve(&mut state, &request, &mut graph_task).await
                }
                Stage::GraphRetrieve => self.graph_retrieve(&mut state, &mut graph_task).await,
                Stage::HybridFuse => self.hybrid_fuse(&mut state),
                Stage::ContextAssemble => self.context_assemble(&mut state, &request),
                Stage::Generate => self.generate(&mut state, stream.as_mut()).await,
                Stage::SafetyPostfilter => self.safety_postfilter(&mut state),
                Stage::ProvenanceBuild => self.provenance_build(&mut state),
                Stage::StreamOut => self.stream_out(&state),
            };
            state
                .timings
                .insert(stage.name().to_string(), started.elapsed().as_secs_f64());

            match transition {
                Transition::Next(next) => stage = next,
                Transition::Terminal => break,
            }
        }

        state
    }

    /// Sanitize the input and generate the query embedding.
    async fn preprocess(&self, state: &mut PipelineState) -> Transition {
        let max = self.config.limits.max_message_length;
        if state.message.chars().count() > max {
            state.message = state.message.chars().take(max).collect();
        }
        state.skip_llm = self.config.llm.skip_generation;

        let key = cache_key("emb", &state.message);
        if let Some(cached) = self.cache.get(&key).await
            && let Ok(embedding) = serde_json::from_str::<Vec<f32>>(&cached)
        {
            state.query_embedding = Some(embedding);
            return Transition::Next(Stage::SafetyPrefilter);
        }

        match self.embedder.embed(&state.message).await {
            Ok(embedding) => {
                if let Ok(serialized) = serde_json::to_string(&embedding) {
                    self.cache
                        .set(&key, serialized, Duration::from_secs(self.config.cache.ttl_secs))
                        .await;
                }
                state.query_embedding = Some(embedding);
            }
            Err(e) => {
                // Retrieval degrades to graph-only; the run continues.
                warn!(error = %e, "Embedding failed, vector retrieval will be skipped");
            }
        }

        Transition::Next(Stage::SafetyPrefilter)
    }

    /// Fast risk triage before any expensive work.
    async fn safety_prefilter(
        &self,
        state: &mut PipelineState,
        request: &PipelineRequest,
        stream: Option<&mut StreamHandle>,
    ) -> Transition {
        let assessment = self.classifier.assess(&state.message);
        state.risk_level = assessment.level;
        state.risk_score = assessment.score;

        if !assessment.escalate {
            return Transition::Next(Stage::VectorRetrieve);
        }

        state.should_escalate = true;
        state.skip_llm = true;
        state.reply = assessment
            .safe_response
            .unwrap_or_else(|| self.config.safety.crisis_response.clone());

        warn!(
            session_id = %request.session_id,
            level = %state.risk_level,
            score = state.risk_score,
            "Message flagged by safety prefilter"
        );

        let event = EscalationEvent {
            escalation_id: escalation_id(),
            session_id: request.session_id.clone(),
            reason: assessment.triggered.join(", "),
            severity: state.risk_level,
            timestamp: chrono::Utc::now(),
        };
        self.escalations.notify(&event).await;

        if let Some(stream) = stream {
            let _ = stream.deltas.send(state.reply.clone()).await;
        }

        Transition::Terminal
    }

    /// Dense retrieval; also fans out the graph expansion so both backends
    /// run concurrently and both results are in hand before fusion.
    async fn vector_retrieve(
        &self,
        state: &mut PipelineState,
        request: &PipelineRequest,
        graph_task: &mut Option<JoinHandle<Vec<GraphHit>>>,
    ) -> Transition {
        *graph_task = Some(self.spawn_graph_expansion(request));

        if let Some(embedding) = state.query_embedding.clone() {
            let filters = SearchFilters {
                language: Some(request.language.clone()),
            };
            let top_k = self.config.retrieval.vector_top_k;
            let vector = Arc::clone(&self.vector);
            state.vector_hits = timed_retrieval(
                "vector",
                self.config.retrieval.vector_timeout_secs,
                async move { vector.search(&embedding, top_k, &filters).await },
            )
            .await;
        }

        info!(hits = state.vector_hits.len(), "Vector retrieval complete");
        Transition::Next(Stage::GraphRetrieve)
    }

    /// Launch seed lookup plus graph expansion on its own task, bounded by
    /// the graph timeout.
    fn spawn_graph_expansion(&self, request: &PipelineRequest) -> JoinHandle<Vec<GraphHit>> {
        let graph = Arc::clone(&self.graph);
        let text = request.message.clone();
        let language = request.language.clone();
        let max_hops = self.config.retrieval.graph_max_hops;
        let max_nodes = self.config.retrieval.graph_max_nodes;
        let timeout_secs = self.config.retrieval.graph_timeout_secs;

        tokio::spawn(async move {
            timed_retrieval("graph", timeout_secs, async move {
                let seeds = graph.find_seeds(&text, &language).await?;
                if seeds.is_empty() {
                    return Ok(Vec::new());
                }
                let seed_ids: Vec<String> = seeds.into_iter().map(|s| s.id).collect();
                graph.expand(&seed_ids, max_hops, max_nodes).await
            })
            .await
        })
    }

    /// Collect the graph expansion launched during vector retrieval.
    async fn graph_retrieve(
        &self,
        state: &mut PipelineState,
        graph_task: &mut Option<JoinHandle<Vec<GraphHit>>>,
    ) -> Transition {
        state.graph_hits = match graph_task.take() {
            Some(task) => task.await.unwrap_or_else(|e| {
                warn!(error = %e, "Graph expansion task failed, continuing without graph results");
                Vec::new()
            }),
            None => Vec::new(),
        };

        info!(hits = state.graph_hits.len(), "Graph retrieval complete");
        Transition::Next(Stage::HybridFuse)
    }

    /// Merge and rank the two result lists.
    fn hybrid_fuse(&self, state: &mut PipelineState) -> Transition {
        state.fused = fuse(&state.vector_hits, &state.graph_hits, &self.config.fusion);
        info!(items = state.fused.len(), "Fused hybrid results");
        Transition::Next(Stage::ContextAssemble)
    }

    /// Assemble the bounded context and build the generation prompt.
    fn context_assemble(&self, state: &mut PipelineState, request: &PipelineRequest) -> Transition {
        let assembled = self.assembler.assemble(&state.fused);
        state.prompt = self.assembler.build_prompt(&assembled.text, request);
        state.context = assembled.text;
        state.context_items = assembled.used;

        if state.skip_llm {
            return Transition::Terminal;
        }
        Transition::Next(Stage::Generate)
    }

    /// Invoke the generation backend, honoring the response cache.
    async fn generate(
        &self,
        state: &mut PipelineState,
        stream: Option<&mut StreamHandle>,
    ) -> Transition {
        let key = cache_key("llm", &state.message);
        if let Some(cached) = self.cache.get(&key).await {
            info!("Response cache hit");
            state.reply = cached;
            if let Some(stream) = stream {
                let _ = stream.deltas.send(state.reply.clone()).await;
            }
            return Transition::Next(Stage::SafetyPostfilter);
        }

        let outcome = match stream {
            Some(stream) => {
                self.invoker
                    .invoke_streaming(&state.prompt, stream.deltas.clone(), stream.cancel.clone())
                    .await
            }
            None => self.invoker.invoke(&state.prompt).await,
        };

        state.reply = outcome.reply;
        state.error = outcome.error;

        if state.error.is_none() && !state.reply.is_empty() {
            self.cache
                .set(
                    &key,
                    state.reply.clone(),
                    Duration::from_secs(self.config.cache.ttl_secs),
                )
                .await;
        }

        Transition::Next(Stage::SafetyPostfilter)
    }

    /// Re-screen the generated reply. Advisory only: the assessment can
    /// raise the recorded risk and set the escalation flag, but it never
    /// rewrites an already-produced reply.
    fn safety_postfilter(&self, state: &mut PipelineState) -> Transition {
        let assessment = self.classifier.assess(&state.reply);
        if assessment.score > state.risk_score {
            state.risk_score = assessment.score;
            state.risk_level = assessment.level;
        }
        if assessment.escalate {
            warn!(
                level = %assessment.level,
                "Generated reply flagged by safety postfilter"
            );
            state.should_escalate = true;
        }
        Transition::Next(Stage::ProvenanceBuild)
    }

    /// Extract source attribution from the context items.
    fn provenance_build(&self, state: &mut PipelineState) -> Transition {
        state.provenance = state
            .context_items
            .iter()
            .take(PROVENANCE_LIMIT)
            .map(|item| ProvenanceEntry {
                source_id: item.id.clone(),
                source_type: item.kind,
                score: round3(item.weighted_score),
                snippet: item.text.chars().take(PROVENANCE_SNIPPET_CHARS).collect(),
            })
            .collect();
        Transition::Next(Stage::StreamOut)
    }

    /// Final bookkeeping before the terminal response.
    fn stream_out(&self, state: &PipelineState) -> Transition {
        info!(
            safety_level = %state.risk_level,
            reply_chars = state.reply.len(),
            provenance = state.provenance.len(),
            "Response prepared"
        );
        Transition::Terminal
    }
}

fn response_from_state(state: PipelineState) -> PipelineResponse {
    PipelineResponse {
        reply: state.reply,
        safety_level: SafetyLevel::from(state.risk_level),
        safety_score: state.risk_score,
        provenance: state.provenance,
        escalated: state.should_escalate,
        timings: state.timings,
        error: state.error,
    }
}

fn degraded_response(error: String) -> PipelineResponse {
    PipelineResponse {
        reply: DEGRADED_REPLY.to_string(),
        safety_level: SafetyLevel::Error,
        safety_score: 0.0,
        provenance: Vec::new(),
        escalated: false,
        timings: std::collections::BTreeMap::new(),
        error: Some(error),
    }
}

fn escalation_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("ESC_{}", &hex[..16])
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escalation_id_shape() {
        let id = escalation_id();
        assert!(id.starts_with("ESC_"));
        assert_eq!(id.len(), 4 + 16);
    }

    #[test]
    fn test_round3() {
        assert_eq!(round3(0.5399999), 0.54);
        assert_eq!(round3(0.1234), 0.123);
        assert_eq!(round3(0.0), 0.0);
    }

    #[test]
    fn test_degraded_response_shape() {
        let resp = degraded_response("boom".into());
        assert_eq!(resp.safety_level, SafetyLevel::Error);
        assert_eq!(resp.reply, DEGRADED_REPLY);
        assert!(resp.provenance.is_empty());
        assert!(!resp.escalated);
        assert_eq!(resp.error.as_deref(), Some("boom"));
    }
}
