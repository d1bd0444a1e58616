use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use trope_miner::config::AppConfig;
use trope_miner::db::Database;
use trope_miner::embedder::{embed_catalog, embed_chunks};
use trope_miner::embedding::EmbedClient;
use trope_miner::error::{classify, MinerError};
use trope_miner::gazetteer::seed_gazetteer;
use trope_miner::ollama::OllamaClient;
use trope_miner::orchestrator::Orchestrator;
use trope_miner::qdrant_store::QdrantStore;
use trope_miner::semantic::seed_semantic;
use trope_miner::text_index::TextIndex;

#[derive(Parser, Debug)]
#[command(name = "trope-miner")]
#[command(about = "Judge which tropes fire in which scenes of an ingested work")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Embed chunks (and optionally the trope catalog) into the vector store
    Embed {
        #[arg(long)]
        work_id: Option<String>,
        /// Also embed the trope catalog collection
        #[arg(long, default_value_t = false)]
        catalog: bool,
    },
    /// Seed gazetteer + semantic candidates for a work
    Seed {
        #[arg(long)]
        work_id: String,
    },
    /// Run the full judging pipeline for a work
    Judge {
        #[arg(long)]
        work_id: String,
    },
}

#[tokio::main]
async fn main() {
    init_tracing();

    let code = match run().await {
        Ok(()) => 0,
        Err(err) => {
            tracing::error!("{err:#}");
            err.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<(), MinerError> {
    let cli = Cli::parse();
    let config = AppConfig::from_env();
    config.validate()?;

    let db = Database::new(&config).await.map_err(classify)?;
    let ollama = OllamaClient::new(config.ollama_base_url.clone());
    let store = QdrantStore::new(config.qdrant_base_url.clone(), config.vector_timeout);
    let embedder = EmbedClient::new(
        ollama.clone(),
        config.models.embed_model.clone(),
        config.embed_timeout,
        config.n_embed,
    );

    match cli.command {
        Command::Embed { work_id, catalog } => {
            let n = embed_chunks(&db, &store, &embedder, &config, work_id.as_deref())
                .await
                .map_err(classify)?;
            println!("Embedded {n} chunk(s).");
            if catalog {
                let n = embed_catalog(&db, &store, &embedder, &config)
                    .await
                    .map_err(classify)?;
                println!("Embedded {n} catalog trope(s).");
            }
            Ok(())
        }
        Command::Seed { work_id } => {
            let work = db
                .get_work(&work_id)
                .await?
                .ok_or_else(|| MinerError::Config(format!("work not found: {work_id}")))?;
            let chunks = db.chunks_for_work(&work_id).await?;
            let tropes = db.load_tropes().await?;
            if tropes.is_empty() {
                return Err(MinerError::Config("trope catalog is empty".into()));
            }

            let index = TextIndex::new(work);
            index
                .verify_chunks(&chunks)
                .map_err(|e| MinerError::Integrity(e.to_string()))?;

            let gazetteer = seed_gazetteer(&db, &work_id, &chunks, &tropes, &config.seed)
                .await
                .map_err(classify)?;
            let semantic =
                seed_semantic(&db, &store, &embedder, &config, &work_id, &chunks, &tropes)
                    .await
                    .map_err(classify)?;
            println!("Seeded {gazetteer} gazetteer and {semantic} semantic candidate(s) for work {work_id}.");
            Ok(())
        }
        Command::Judge { work_id } => {
            let cancel = CancellationToken::new();
            let signal_cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("cancellation requested, finishing current scenes");
                    signal_cancel.cancel();
                }
            });

            let orchestrator = Orchestrator::new(db, store, ollama, embedder, config);
            let summary = orchestrator.run_work(&work_id, cancel).await?;

            println!(
                "Run {} {}: {} scenes ({} judged, {} skipped), {} findings, \
                 {} spans adjusted, negation: {} flagged / {} downweighted / {} deleted, \
                 candidates: {} gazetteer + {} semantic",
                summary.run_id,
                if summary.cancelled { "CANCELLED" } else { "complete" },
                summary.scenes_total,
                summary.scenes_judged,
                summary.scenes_skipped,
                summary.findings_inserted,
                summary.spans_adjusted,
                summary.negation_flagged,
                summary.negation_downweighted,
                summary.negation_deleted,
                summary.gazetteer_candidates,
                summary.semantic_candidates,
            );
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
