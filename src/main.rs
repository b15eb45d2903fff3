//! # Forecast Harness CLI (`fcast`)
//!
//! ## Usage
//!
//! ```bash
//! fcast --config ./config/fcast.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `fcast forecast <url>` | Run the full pipeline and print the forecast as JSON |
//! | `fcast acquire <url>` | Download the source's documents into the work directory |
//! | `fcast index build` | Index every document in the work directory |
//! | `fcast index query "<text>"` | Print the top-k passages for a query |
//! | `fcast metrics <url>` | Print the source page's quarterly metrics as JSON |
//! | `fcast reset` | Delete downloaded documents and the vector index |
//! | `fcast init` | Create the request-log database |
//!
//! Logs go to stderr (`RUST_LOG`, default `forecast_harness=info`); results
//! go to stdout.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use forecast_harness::acquire::{self, Acquirer};
use forecast_harness::config::{self, Config};
use forecast_harness::embedding::create_embedder;
use forecast_harness::index::VectorIndex;
use forecast_harness::metrics;
use forecast_harness::models::ForecastRequest;
use forecast_harness::pipeline::ForecastService;
use forecast_harness::request_log::SqliteRequestLog;

const DEFAULT_CONFIG: &str = "./config/fcast.toml";

/// Forecast Harness: next-quarter outlooks from a company's public filings.
#[derive(Parser)]
#[command(name = "fcast", version)]
struct Cli {
    /// Path to the configuration file (TOML).
    ///
    /// Defaults to `./config/fcast.toml`; built-in defaults apply when that
    /// file does not exist.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline for a company source page.
    Forecast {
        /// Company source page URL (e.g. `https://www.screener.in/company/TCS/`).
        url: String,

        /// Number of recent reporting periods to analyse.
        #[arg(long, default_value_t = 2)]
        periods: u32,

        /// Include the latest market quote.
        #[arg(long)]
        market: bool,
    },

    /// Download the documents linked from a source page.
    Acquire {
        url: String,
    },

    /// Build or query the vector index.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Print the quarterly metrics table of a source page.
    Metrics {
        url: String,

        #[arg(long, default_value_t = 2)]
        periods: usize,
    },

    /// Delete downloaded documents and the persisted index.
    Reset,

    /// Create the request-log database and schema.
    Init,
}

#[derive(Subcommand)]
enum IndexAction {
    /// Extract, chunk and index every document in the work directory.
    Build,

    /// Print the top-k passages for a query.
    Query {
        text: String,

        /// Override `retrieval.k`.
        #[arg(long)]
        k: Option<usize>,
    },
}

fn load(cli_path: Option<&Path>) -> Result<Config> {
    match cli_path {
        Some(path) => config::load_config(path),
        None => {
            let path = Path::new(DEFAULT_CONFIG);
            if path.exists() {
                config::load_config(path)
            } else {
                tracing::debug!("no config file at {}; using defaults", DEFAULT_CONFIG);
                Ok(Config::default())
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "forecast_harness=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let cfg = load(cli.config.as_deref())?;

    match cli.command {
        Commands::Forecast {
            url,
            periods,
            market,
        } => {
            let service = ForecastService::from_config(cfg).await?;
            let response = service
                .forecast(ForecastRequest {
                    source_url: url,
                    periods_requested: periods,
                    include_market_data: market,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Acquire { url } => {
            let acquirer = Acquirer::new(&cfg.acquisition, &cfg.workspace.document_dir)?;
            let documents = acquirer
                .acquire(&url, cfg.acquisition.max_documents_per_type)
                .await?;
            for doc in &documents {
                let date = doc
                    .published
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "undated".into());
                println!("{:<18} {:<10} {}", doc.doc_type, date, doc.id);
            }
            println!("{} documents in {}", documents.len(), cfg.workspace.document_dir.display());
        }
        Commands::Index { action } => match action {
            IndexAction::Build => {
                let documents = acquire::load_workdir(&cfg.workspace.document_dir)
                    .with_context(|| {
                        format!("Failed to read {}", cfg.workspace.document_dir.display())
                    })?;
                if documents.is_empty() {
                    bail!(
                        "No documents in {}; run `fcast acquire <url>` first",
                        cfg.workspace.document_dir.display()
                    );
                }
                let service = ForecastService::from_config(cfg).await?;
                let report = service.index_documents(documents).await;
                for note in &report.notes {
                    eprintln!("warning: {}", note);
                }
                println!(
                    "Indexed {} documents ({} new chunks, {} total)",
                    report.documents_used.len(),
                    report.chunks_added,
                    service.index().len().await
                );
            }
            IndexAction::Query { text, k } => {
                let embedder = create_embedder(&cfg.embedding)?;
                let index = VectorIndex::load(&cfg.workspace.index_dir, embedder.as_ref())?
                    .with_metric(cfg.retrieval.metric);
                let result = index
                    .query(embedder.as_ref(), &text, k.unwrap_or(cfg.retrieval.k))
                    .await?;
                for (rank, hit) in result.hits.iter().enumerate() {
                    println!(
                        "{}. [{:.3}] {} ({})",
                        rank + 1,
                        hit.score,
                        hit.chunk.source.label,
                        hit.chunk.id
                    );
                    println!("    {}", hit.chunk.text.replace('\n', " "));
                }
            }
        },
        Commands::Metrics { url, periods } => {
            let acquirer = Acquirer::new(&cfg.acquisition, &cfg.workspace.document_dir)?;
            let (_, html) = acquirer.fetch_page(&url).await?;
            let found = metrics::extract_from_table(&html, periods.max(1));
            println!("{}", serde_json::to_string_pretty(&found)?);
        }
        Commands::Reset => {
            let removed = acquire::reset_workdir(&cfg.workspace.document_dir)?;
            if cfg.workspace.index_dir.exists() {
                std::fs::remove_dir_all(&cfg.workspace.index_dir)?;
            }
            println!(
                "Removed {} documents and the index at {}",
                removed,
                cfg.workspace.index_dir.display()
            );
        }
        Commands::Init => {
            let Some(path) = cfg.request_log.path.as_deref() else {
                bail!("request_log.path is not set in the configuration");
            };
            SqliteRequestLog::open(path).await?;
            println!("Request log initialized at {}", path.display());
        }
    }

    Ok(())
}
