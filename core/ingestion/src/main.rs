//! Memory graph command-line front end
//!
//! Usage:
//!   memory-graph [--db-path <path>] import-records <file> [--enrich-similarity]
//!   memory-graph [--db-path <path>] import-code <dir> --project <id> [--repo <name>] [--ext .py]
//!   memory-graph [--db-path <path>] import-code-json <file>
//!   memory-graph [--db-path <path>] ingest-conversation <file>
//!   memory-graph [--db-path <path>] stats
//!   memory-graph [--db-path <path>] requests --project <id> [--chat <id>] [--days 7]
//!   memory-graph [--db-path <path>] flow <request_id>
//!   memory-graph [--db-path <path>] context-files --project <id> [--days 30] [--limit 20]
//!   memory-graph [--db-path <path>] tools [--project <id>] [--days 30]
//!
//! Extraction, TTL, correlation and similarity settings come from the
//! environment (see `EngineConfig::from_env`).
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use memory_graph_ingestion::{
    import_code_json, import_directory, merge_partitioned, parse_record_batch, shared,
    BatchMerger, ConversationIngestor, Database, EngineConfig, EpisodeSubmitter, GraphStore,
    HttpExtractionClient, MergeOptions, NoopInvalidation, TimeWindow,
};
use memory_graph_schemas::ConversationContext;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "memory-graph")]
#[command(about = "Build and enrich the memory graph from conversations, records and source code")]
struct Args {
    /// Path to SQLite graph file (defaults to DB_PATH or ~/.memory-graph/graph.db)
    #[arg(long, short, global = true)]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Merge exported short-term memory records
    ImportRecords {
        file: PathBuf,

        /// Link similar messages by embedding
        #[arg(long)]
        enrich_similarity: bool,
    },
    /// Parse a source tree into CodeFile / CodeSymbol nodes
    ImportCode {
        dir: PathBuf,

        /// Group the files belong to
        #[arg(long)]
        project: String,

        /// Repository name (defaults to the first path segment)
        #[arg(long)]
        repo: Option<String>,

        /// File extensions to include
        #[arg(long = "ext", default_value = ".py")]
        extensions: Vec<String>,
    },
    /// Import code-file metadata exported by an indexer
    ImportCodeJson { file: PathBuf },
    /// Submit one captured request and build its provenance graph
    IngestConversation { file: PathBuf },
    /// Print node and edge counts
    Stats,
    /// List live requests in a project, newest first
    Requests {
        #[arg(long)]
        project: String,

        /// Only requests from this chat
        #[arg(long)]
        chat: Option<String>,

        #[arg(long, default_value_t = 7)]
        days: i64,
    },
    /// Show one request's messages, context files and tools
    Flow { request_id: String },
    /// Most used context files in a project
    ContextFiles {
        #[arg(long)]
        project: String,

        #[arg(long, default_value_t = 30)]
        days: i64,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Call counts and success rates per tool
    Tools {
        /// Restrict to one project (all projects otherwise)
        #[arg(long)]
        project: Option<String>,

        #[arg(long, default_value_t = 30)]
        days: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args = Args::parse();
    let mut config = EngineConfig::from_env()?;
    if let Some(path) = args.db_path {
        config.db_path = path;
    }

    info!("Graph database: {}", config.db_path.display());
    let db = Database::new(&config.db_path)
        .with_context(|| format!("opening {}", config.db_path.display()))?;
    let graph = shared(db);

    match args.command {
        Command::ImportRecords {
            file,
            enrich_similarity,
        } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let batch = parse_record_batch(&raw)?;
            for (index, reason) in &batch.rejected {
                warn!("Rejected record #{}: {}", index, reason);
            }

            let merger = Arc::new(BatchMerger::new(MergeOptions {
                enrich_similarity,
                similarity: config.similarity.clone(),
            }));
            let mut summary = merge_partitioned(graph.clone(), merger, batch.records).await;
            summary.rejected += batch.rejected.len();

            println!("{}", serde_json::to_string_pretty(&summary)?);
            info!("Record import finished with status {}", summary.status());
        }
        Command::ImportCode {
            dir,
            project,
            repo,
            extensions,
        } => {
            let store = graph.lock().await;
            let summary = import_directory(&*store, &dir, &project, repo.as_deref(), &extensions)?;
            println!(
                "files={} symbols={} calls={} skipped={} parse_failures={} failed={} status={}",
                summary.files,
                summary.symbols,
                summary.calls,
                summary.skipped.len(),
                summary.parse_failures.len(),
                summary.failed.len(),
                summary.status()
            );
        }
        Command::ImportCodeJson { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let store = graph.lock().await;
            let summary = import_code_json(&*store, &raw)?;
            println!(
                "files={} symbols={} skipped={} failed={} status={}",
                summary.files,
                summary.symbols,
                summary.skipped.len(),
                summary.failed.len(),
                summary.status()
            );
        }
        Command::IngestConversation { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let ctx: ConversationContext = serde_json::from_str(&raw)?;

            let client = HttpExtractionClient::new(config.extraction.clone())?;
            let ingestor = ConversationIngestor::new(
                graph.clone(),
                EpisodeSubmitter::new(Arc::new(client)),
                config.correlator.clone(),
                config.ttl.clone(),
                Box::new(NoopInvalidation),
            );

            let report = ingestor.ingest(&ctx).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Stats => {
            let store = graph.lock().await;
            println!("nodes: {}", store.count_nodes(None)?);
            for (label, count) in store.label_counts()? {
                println!("  {:<16} {}", label, count);
            }
            println!("edges: {}", store.count_edges(None)?);
            for (rel_type, count) in store.edge_type_counts()? {
                println!("  {:<20} {}", rel_type, count);
            }
        }
        Command::Requests {
            project,
            chat,
            days,
        } => {
            let store = graph.lock().await;
            let requests =
                store.search_requests(&project, chat.as_deref(), &TimeWindow::last_days(days))?;
            println!("{}", serde_json::to_string_pretty(&requests)?);
        }
        Command::Flow { request_id } => {
            let store = graph.lock().await;
            match store.conversation_flow(&request_id)? {
                Some(flow) => println!("{}", serde_json::to_string_pretty(&flow)?),
                None => anyhow::bail!("no request {}", request_id),
            }
        }
        Command::ContextFiles {
            project,
            days,
            limit,
        } => {
            let store = graph.lock().await;
            let stats = store.context_file_stats(&project, &TimeWindow::last_days(days), limit)?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Tools { project, days } => {
            let store = graph.lock().await;
            let stats = store.tool_statistics(project.as_deref(), &TimeWindow::last_days(days))?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}
