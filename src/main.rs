use anyhow::Context;
use card_show_scraper::config::Config;
use card_show_scraper::domain::ShowEdits;
use card_show_scraper::feedback::FeedbackLoop;
use card_show_scraper::logging;
use card_show_scraper::metrics;
use card_show_scraper::pipeline::dedup::Deduplicator;
use card_show_scraper::pipeline::extractor::ChatCompletionsClient;
use card_show_scraper::pipeline::fetcher::HttpFetcher;
use card_show_scraper::pipeline::{Pipeline, RunOptions};
use card_show_scraper::registry::SourceRegistry;
use card_show_scraper::review::ReviewService;
use card_show_scraper::server::{self, AppState};
use card_show_scraper::storage::{InMemoryStorage, SqliteStorage, Storage};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "card_show_scraper")]
#[command(about = "Card show listing ingestion and review staging")]
#[command(version)]
struct Cli {
    /// Path to a TOML config file (defaults to card_shows.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one batch over the source registry
    Run {
        /// Also run auto-disabled sources
        #[arg(long)]
        include_disabled: bool,
        /// Work against an in-memory copy; nothing is persisted
        #[arg(long)]
        dry_run: bool,
        /// Seed file or directory to import before running
        #[arg(long)]
        sources: Option<PathBuf>,
        /// Override today's date for the recency filter (YYYY-MM-DD)
        #[arg(long)]
        today: Option<NaiveDate>,
    },
    /// Serve the admin decision and stats API
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Print the review queue
    Queue,
    /// Approve a pending show
    Approve {
        id: Uuid,
        /// Field edits as JSON, e.g. '{"state": "IN"}'
        #[arg(long)]
        edits: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Reject a pending show
    Reject {
        id: Uuid,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Per-source review statistics
    Stats {
        #[arg(long, default_value_t = 30)]
        days_ago: i64,
        #[arg(long, default_value_t = 1)]
        min_count: usize,
    },
    /// Recompute source priorities from recent feedback
    Feedback,
    /// Manage the source registry
    Sources {
        #[command(subcommand)]
        command: SourcesCommand,
    },
    /// Link pending rows that duplicate an earlier pending row
    Sweep,
}

#[derive(Subcommand)]
enum SourcesCommand {
    /// Import sources from a TOML/JSON file or a directory of them
    Import { path: PathBuf },
    List,
    Enable { url: String },
    Disable { url: String },
}

fn open_storage(config: &Config) -> anyhow::Result<Arc<dyn Storage>> {
    let storage = SqliteStorage::open(&config.database_path)
        .with_context(|| format!("opening database {}", config.database_path))?;
    Ok(Arc::new(storage))
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let _guard = logging::init_logging("logs");

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            include_disabled,
            dry_run,
            sources,
            today,
        } => {
            config.validate_for_run()?;
            let recorder = metrics::init_metrics();
            let persistent = open_storage(&config)?;

            let storage: Arc<dyn Storage> = if dry_run {
                let copy: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
                for source in persistent.list_sources().await? {
                    copy.upsert_source(&source).await?;
                }
                info!("Dry run: working on an in-memory copy of the registry");
                copy
            } else {
                persistent
            };

            if let Some(path) = sources {
                let registry = SourceRegistry::new(storage.clone(), &config.feedback);
                registry.import(SourceRegistry::load_seeds(&path)?).await?;
            }

            let api_key = config
                .extraction
                .api_key
                .clone()
                .context("EXTRACTION_API_KEY is not set")?;
            let pipeline = Pipeline::new(
                &config,
                storage.clone(),
                Arc::new(HttpFetcher::new(&config.fetch)?),
                Arc::new(ChatCompletionsClient::new(api_key, &config.extraction)?),
            );

            let cancel = pipeline.cancel_flag();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, finishing in-flight sources");
                    cancel.cancel();
                }
            });

            let mut options = RunOptions {
                include_disabled,
                ..RunOptions::default()
            };
            if let Some(today) = today {
                options.today = today;
            }
            let report = pipeline.run(options).await?;

            let links = Deduplicator::new(config.dedup.clone())
                .sweep_pending(storage.as_ref())
                .await?;
            if !links.is_empty() {
                info!("Linked {} late duplicates", links.len());
            }
            if let Some(handle) = recorder {
                metrics::push::publish_run_metrics(&config.metrics, &handle).await;
            }
            print_json(&report)?;
        }
        Commands::Serve { port } => {
            let storage = open_storage(&config)?;
            let state = AppState {
                storage: storage.clone(),
                review: ReviewService::new(storage.clone())
                    .with_low_confidence_threshold(config.feedback.low_confidence_threshold),
                feedback: FeedbackLoop::new(storage, &config.feedback),
                metrics: metrics::init_metrics(),
            };
            server::start_server(state, port).await?;
        }
        Commands::Queue => {
            let storage = open_storage(&config)?;
            let queue = ReviewService::new(storage)
                .with_low_confidence_threshold(config.feedback.low_confidence_threshold)
                .list_queue()
                .await?;
            if queue.is_empty() {
                println!("Review queue is empty");
            }
            for entry in queue {
                let show = &entry.show;
                println!(
                    "{} {:>3}{} {} | {} | {}, {} | {}",
                    show.id,
                    show.confidence_score,
                    if entry.low_confidence { "!" } else { " " },
                    show.raw_payload.start_date,
                    show.raw_payload.name,
                    show.raw_payload.city.as_deref().unwrap_or("-"),
                    show.raw_payload.state.as_deref().unwrap_or("-"),
                    show.source_url
                );
            }
        }
        Commands::Approve { id, edits, notes } => {
            let edits: Option<ShowEdits> = edits
                .map(|raw| serde_json::from_str(&raw))
                .transpose()
                .context("parsing --edits")?;
            let review = ReviewService::new(open_storage(&config)?);
            let show = review.approve(id, edits.as_ref(), notes.as_deref()).await?;
            print_json(&show)?;
        }
        Commands::Reject { id, notes } => {
            let review = ReviewService::new(open_storage(&config)?);
            review.reject(id, notes.as_deref()).await?;
            println!("Rejected {}", id);
        }
        Commands::Stats { days_ago, min_count } => {
            let feedback = FeedbackLoop::new(open_storage(&config)?, &config.feedback);
            print_json(&feedback.get_feedback_stats(days_ago, min_count).await?)?;
        }
        Commands::Feedback => {
            let feedback = FeedbackLoop::new(open_storage(&config)?, &config.feedback);
            let updates = feedback.recompute_priorities().await?;
            println!("Updated {} source priorities", updates.len());
            print_json(&updates)?;
        }
        Commands::Sources { command } => {
            let registry = SourceRegistry::new(open_storage(&config)?, &config.feedback);
            match command {
                SourcesCommand::Import { path } => {
                    let summary = registry.import(SourceRegistry::load_seeds(&path)?).await?;
                    println!("Imported: {} added, {} updated", summary.added, summary.updated);
                }
                SourcesCommand::List => print_json(&registry.list().await?)?,
                SourcesCommand::Enable { url } => print_json(&registry.set_enabled(&url, true).await?)?,
                SourcesCommand::Disable { url } => print_json(&registry.set_enabled(&url, false).await?)?,
            }
        }
        Commands::Sweep => {
            let storage = open_storage(&config)?;
            let links = Deduplicator::new(config.dedup.clone())
                .sweep_pending(storage.as_ref())
                .await?;
            println!("Linked {} duplicate pending rows", links.len());
        }
    }

    Ok(())
}
