//! Haven CLI — terminal front-end for the reply pipeline.
//!
//! Runs one message (or an interactive loop) through the pipeline with a
//! bundled demo knowledge base, streaming the reply to stdout. Generation
//! uses the configured backend, or the built-in mock in offline mode.

use anyhow::Context;
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use haven_core::cache::MemoryCache;
use haven_core::config::{PipelineConfig, load_config};
use haven_core::embeddings::{Embedder, HashEmbedder};
use haven_core::pipeline::{Pipeline, PipelineBackends};
use haven_core::providers::create_provider;
use haven_core::retrieval::{GraphEdge, IndexedDocument, StaticGraphStore, StaticVectorIndex};
use haven_core::types::PipelineRequest;

/// Haven: safety-gated wellness support pipeline
#[derive(Parser, Debug)]
#[command(name = "haven", version, about, long_about = None)]
struct Cli {
    /// Message to process (starts interactive mode if omitted)
    message: Option<String>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Use the built-in mock generation backend
    #[arg(long)]
    offline: bool,

    /// Language tag for retrieval filtering
    #[arg(short, long, default_value = "en")]
    language: String,

    /// Audience age range tag
    #[arg(long, default_value = "8-12")]
    age_range: String,

    /// Session identifier
    #[arg(short, long, default_value = "cli")]
    session: String,

    /// Print the run summary (risk level, provenance, timings) as JSON
    #[arg(long)]
    summary: bool,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("haven_core={default},haven={default}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Bundled demo corpus so the CLI works without external services.
const DEMO_DOCUMENTS: &[(&str, &str)] = &[
    (
        "breathing-basics",
        "Slow diaphragmatic breathing activates the body's relaxation response. \
Box breathing (in for four counts, hold four, out four, hold four) is an \
easy pattern to practice anywhere.",
    ),
    (
        "sleep-hygiene",
        "Consistent sleep and wake times support emotional regulation. Screens \
off an hour before bed and a dark, cool room improve sleep quality.",
    ),
    (
        "grounding-54321",
        "The 5-4-3-2-1 grounding technique anchors attention during anxious \
moments: name five things you can see, four you can touch, three you can \
hear, two you can smell, and one you can taste.",
    ),
    (
        "worry-time",
        "Scheduling a short daily worry time helps contain rumination. Writing \
worries down and revisiting them at a set time reduces their grip.",
    ),
    (
        "movement-mood",
        "Regular physical activity, even a short walk, releases tension and \
lifts mood through endorphin release.",
    ),
];

const DEMO_EDGES: &[(&str, &str, &str, f64)] = &[
    ("anxiety", "breathing", "managed_by", 0.8),
    ("anxiety", "grounding", "managed_by", 0.7),
    ("anxiety", "sleep", "worsened_by_poor", 0.6),
    ("stress", "movement", "reduced_by", 0.7),
    ("stress", "breathing", "managed_by", 0.6),
    ("sleep", "routine", "improved_by", 0.5),
    ("panic", "grounding", "managed_by", 0.8),
];

async fn demo_backends(
    config: &PipelineConfig,
    offline: bool,
) -> anyhow::Result<PipelineBackends> {
    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::default());

    let mut documents = Vec::with_capacity(DEMO_DOCUMENTS.len());
    for (id, text) in DEMO_DOCUMENTS {
        documents.push(IndexedDocument {
            id: (*id).to_string(),
            text: (*text).to_string(),
            language: "en".to_string(),
            embedding: embedder
                .embed(text)
                .await
                .map_err(|e| anyhow::anyhow!("demo index build failed: {e}"))?,
        });
    }

    let edges = DEMO_EDGES
        .iter()
        .map(|(from, to, relation, score)| GraphEdge {
            from: (*from).to_string(),
            to: (*to).to_string(),
            relation: (*relation).to_string(),
            score: Some(*score),
        })
        .collect();

    let llm_config = if offline {
        let mut c = config.llm.clone();
        c.provider = "mock".to_string();
        c
    } else {
        config.llm.clone()
    };
    let llm = create_provider(&llm_config).context("failed to create generation provider")?;

    Ok(PipelineBackends {
        embedder,
        vector: Arc::new(StaticVectorIndex::new(documents)),
        graph: Arc::new(StaticGraphStore::new(edges)),
        llm,
        cache: MemoryCache::from_config(&config.cache),
    })
}

async fn run_message(pipeline: &Pipeline, cli: &Cli, message: &str) -> anyhow::Result<()> {
    let request = PipelineRequest::new(cli.session.clone(), message)
        .with_language(cli.language.clone())
        .with_age_range(cli.age_range.clone());

    let (tx, mut rx) = mpsc::channel::<String>(64);
    let cancel = CancellationToken::new();

    // Ctrl-C cancels streaming without killing the process mid-write.
    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_on_signal.cancel();
        }
    });

    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        while let Some(delta) = rx.recv().await {
            let _ = stdout.write_all(delta.as_bytes());
            let _ = stdout.flush();
        }
        let _ = stdout.write_all(b"\n");
        let _ = stdout.flush();
    });

    let response = pipeline
        .process_message_streaming(request, tx, cancel)
        .await?;
    let _ = printer.await;

    if cli.summary {
        println!("{}", serde_json::to_string_pretty(&response)?);
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = load_config(cli.config.as_deref()).context("failed to load configuration")?;
    tracing::info!(
        offline = cli.offline,
        provider = %config.llm.provider,
        model = %config.llm.model,
        "Starting haven pipeline"
    );
    let backends = demo_backends(&config, cli.offline).await?;
    let pipeline = Pipeline::new(config, backends)
        .map_err(|e| anyhow::anyhow!("failed to build pipeline: {e}"))?;

    match &cli.message {
        Some(message) => run_message(&pipeline, &cli, message).await?,
        None => {
            eprintln!("haven interactive mode (empty line exits)");
            let stdin = std::io::stdin();
            loop {
                eprint!("> ");
                let mut line = String::new();
                if stdin.read_line(&mut line)? == 0 {
                    break;
                }
                let line = line.trim();
                if line.is_empty() {
                    break;
                }
                if let Err(e) = run_message(&pipeline, &cli, line).await {
                    eprintln!("error: {e}");
                }
            }
        }
    }

    Ok(())
}
