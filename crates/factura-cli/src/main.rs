use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use factura_client::{DriveDiscovery, OpenAiStructurer, ParseServiceClient, SheetsLookup};
use factura_core::engine::{EngineConfig, ValidationPolicy};
use factura_core::error::ExtractError;
use factura_core::limiter::LimiterConfig;
use factura_core::pipeline::{BatchPipeline, BatchSummary, PipelineConfig};
use factura_core::session::SessionStore;
use factura_core::traits::{NullReferenceLookup, ReferenceLookup};

#[derive(Parser)]
#[command(
    name = "factura",
    version,
    about = "Batch extraction pipeline for scanned commercial invoices"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process every parent group under a root folder
    Run {
        /// Root folder id in the document store
        #[arg(short, long, env = "FACTURA_ROOT_FOLDER")]
        folder: String,

        #[command(flatten)]
        service: ServiceArgs,

        #[command(flatten)]
        tuning: TuningArgs,
    },

    /// Resume an interrupted session, skipping completed groups
    Resume {
        /// Session id from a previous run
        #[arg(short, long)]
        session: String,

        #[command(flatten)]
        service: ServiceArgs,

        #[command(flatten)]
        tuning: TuningArgs,
    },

    /// List resumable sessions
    Sessions {
        /// Directory holding session checkpoints
        #[arg(long, default_value = "exports")]
        session_dir: PathBuf,
    },
}

#[derive(Args)]
struct ServiceArgs {
    /// API key for the document parse service
    #[arg(long, env = "FACTURA_PARSE_API_KEY")]
    parse_api_key: String,

    /// API key for the structuring model
    #[arg(long, env = "FACTURA_LLM_API_KEY")]
    llm_api_key: String,

    /// Structuring model to use (e.g. "gpt-4o-mini")
    #[arg(short, long, env = "FACTURA_MODEL", default_value = "gpt-4o-mini")]
    model: String,

    /// OpenAI-compatible API base URL
    #[arg(
        long,
        env = "FACTURA_LLM_BASE_URL",
        default_value = "https://api.openai.com/v1"
    )]
    llm_base_url: String,

    /// OAuth bearer token for the document store and reference sheet
    #[arg(long, env = "FACTURA_GOOGLE_TOKEN")]
    google_token: String,

    /// Reference spreadsheet id; omit to skip total reconciliation
    #[arg(long, env = "FACTURA_SHEETS_ID")]
    sheets_id: Option<String>,
}

#[derive(Args)]
struct TuningArgs {
    /// Extraction cache directory
    #[arg(long, default_value = "data/cache")]
    cache_dir: PathBuf,

    /// Session checkpoint directory
    #[arg(long, default_value = "exports")]
    session_dir: PathBuf,

    /// Language hint for the parse service
    #[arg(long, default_value = "es")]
    language: String,

    /// Concurrent extraction permits (defaults to a per-host clamp)
    #[arg(long)]
    concurrency: Option<usize>,

    /// Parent groups processed at once
    #[arg(long, default_value_t = 2)]
    group_concurrency: usize,

    /// Reconciliation tolerance in currency units
    #[arg(long, default_value = "0.01")]
    tolerance: Decimal,

    /// Drop line items with negative values instead of clamping to zero
    #[arg(long, default_value_t = false)]
    reject_negative: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("factura=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            folder,
            service,
            tuning,
        } => {
            let pipeline = build_pipeline(&service, &tuning)?;
            let cancel = install_interrupt_handler();
            tracing::info!("starting batch over folder {}", folder);
            let summary = pipeline.run(&folder, &cancel).await?;
            print_summary(&summary);
        }
        Commands::Resume {
            session,
            service,
            tuning,
        } => {
            let pipeline = build_pipeline(&service, &tuning)?;
            let cancel = install_interrupt_handler();
            tracing::info!("resuming session {}", session);
            let summary = pipeline.resume(&session, &cancel).await?;
            print_summary(&summary);
        }
        Commands::Sessions { session_dir } => {
            cmd_sessions(&session_dir)?;
        }
    }

    Ok(())
}

type Pipeline = BatchPipeline<ParseServiceClient, OpenAiStructurer, DriveDiscovery, Lookup>;

/// Reference lookup selected at startup: a spreadsheet when one is
/// configured, otherwise a no-op.
#[derive(Clone)]
enum Lookup {
    Sheets(SheetsLookup),
    Null(NullReferenceLookup),
}

impl ReferenceLookup for Lookup {
    async fn declared_total(&self, key: &str) -> Result<Option<Decimal>, ExtractError> {
        match self {
            Lookup::Sheets(lookup) => lookup.declared_total(key).await,
            Lookup::Null(lookup) => lookup.declared_total(key).await,
        }
    }
}

fn build_pipeline(service: &ServiceArgs, tuning: &TuningArgs) -> Result<Pipeline> {
    let parser = ParseServiceClient::new(&service.parse_api_key)
        .context("Failed to create parse service client")?;
    let structurer =
        OpenAiStructurer::with_base_url(&service.llm_api_key, &service.model, &service.llm_base_url)
            .context("Failed to create structuring client")?;
    let discovery =
        DriveDiscovery::new(&service.google_token).context("Failed to create document store client")?;
    let lookup = match &service.sheets_id {
        Some(id) => Lookup::Sheets(
            SheetsLookup::new(&service.google_token, id)
                .context("Failed to create reference sheet client")?,
        ),
        None => Lookup::Null(NullReferenceLookup),
    };

    let policy = if tuning.reject_negative {
        ValidationPolicy::RejectNegative
    } else {
        ValidationPolicy::ClampNegative
    };
    let engine = EngineConfig::default()
        .with_language(&tuning.language)
        .with_validation_policy(policy);

    let mut config = PipelineConfig::new(&tuning.cache_dir, &tuning.session_dir)
        .with_engine(engine)
        .with_group_concurrency(tuning.group_concurrency)
        .with_tolerance(tuning.tolerance);
    if let Some(permits) = tuning.concurrency {
        config = config.with_limiter(LimiterConfig::new(permits).with_stagger(Duration::from_millis(100)));
    }

    Ok(BatchPipeline::new(parser, structurer, discovery, lookup, config)?)
}

/// Ctrl-C cancels the batch after in-flight groups wind down; the
/// session stays resumable.
fn install_interrupt_handler() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; stopping after the current checkpoint");
            token.cancel();
        }
    });
    cancel
}

fn print_summary(summary: &BatchSummary) {
    println!("\nSession {}", summary.session_id);
    println!(
        "  groups: {} completed, {} failed, {} skipped (plan of {})",
        summary.completed_units, summary.failed_units, summary.skipped_units, summary.total_units
    );
    println!(
        "  records: {} invoices, {} line items",
        summary.total_records, summary.total_line_items
    );
    println!(
        "  confidence: {} high / {} medium / {} low / {} error",
        summary.tally.high, summary.tally.medium, summary.tally.low, summary.tally.error
    );
    println!(
        "  cache hits: {}, fallback extractions: {}",
        summary.cache_hits, summary.fallback_extractions
    );

    if !summary.reconciliations.is_empty() {
        println!("  reconciliation:");
        for rec in &summary.reconciliations {
            match (rec.declared_total, rec.difference) {
                (Some(declared), Some(_)) if rec.within_tolerance == Some(true) => {
                    println!(
                        "    [match] {}: calculated {} against declared {}",
                        rec.parent_id, rec.calculated_total, declared
                    );
                }
                (Some(declared), Some(difference)) => {
                    println!(
                        "    [MISMATCH] {}: calculated {} against declared {} (diff {})",
                        rec.parent_id, rec.calculated_total, declared, difference
                    );
                }
                _ => {
                    println!(
                        "    [no reference] {}: calculated {}",
                        rec.parent_id, rec.calculated_total
                    );
                }
            }
        }
    }

    println!("  checkpoint: {}", summary.checkpoint_file.display());
    println!("  line items: {}", summary.csv_file.display());
    println!("  elapsed: {:.1}s", summary.total_secs);

    if summary.interrupted {
        println!(
            "\nInterrupted. Resume with: factura resume --session {}",
            summary.session_id
        );
    }
}

fn cmd_sessions(session_dir: &Path) -> Result<()> {
    let sessions = SessionStore::list_resumable(session_dir)?;

    if sessions.is_empty() {
        println!("No resumable sessions in {}", session_dir.display());
        return Ok(());
    }

    println!("Resumable sessions in {}:\n", session_dir.display());
    for session in &sessions {
        println!(
            "  {}  {} ({}/{} groups, last updated {})",
            session.session_id,
            session.status.as_str(),
            session.completed_units,
            session.total_units,
            session.last_updated.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    println!("\nResume with: factura resume --session <id>");

    Ok(())
}
