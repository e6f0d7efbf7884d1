//! evload Ingest - resumable event loader

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use evload_common::logging::{init_logging, LogConfig, LogLevel};
use evload_ingest::{
    CheckpointStore, FetchClient, IngestConfig, IngestOrchestrator, PgCheckpointStore,
    PgMergeTarget, RetryPolicy, RunOutcome,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Exit status when the export token lapsed mid-run
const EXIT_CREDENTIAL_EXPIRED: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "evload-ingest")]
#[command(author, version, about = "Resumable bulk loader for paginated event sources")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Load environment from this file instead of ./.env
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pull events from the source until exhausted, cancelled, or the token expires
    Run(RunArgs),

    /// Print the latest checkpoint for a stream
    Status {
        #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
        database_url: String,

        #[arg(long, env = "EVLOAD_STREAM", default_value = "events")]
        stream: String,
    },

    /// Apply database migrations
    Migrate {
        #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
        database_url: String,
    },
}

/// Overrides for values otherwise read from `EVLOAD_*` variables
#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long)]
    page_size: Option<u32>,

    #[arg(long)]
    batch_size: Option<usize>,

    /// Minimum events between checkpoint saves (0 = every durable batch)
    #[arg(long)]
    checkpoint_every: Option<u64>,

    /// Spacing between requests on the rate-limited endpoint
    #[arg(long)]
    request_interval_ms: Option<u64>,

    /// Collection size used for ETA when the source does not report one
    #[arg(long)]
    expected_total: Option<u64>,

    #[arg(long)]
    stream: Option<String>,

    /// After the run, delete all but this many checkpoint rows for the stream
    #[arg(long, env = "EVLOAD_KEEP_CHECKPOINTS", value_parser = clap::value_parser!(i64).range(1..))]
    keep_checkpoints: Option<i64>,

    /// Apply pending migrations before starting
    #[arg(long)]
    migrate: bool,
}

impl RunArgs {
    fn apply(&self, config: &mut IngestConfig) {
        if let Some(page_size) = self.page_size {
            config.source.page_size = page_size;
        }
        if let Some(batch_size) = self.batch_size {
            config.writer.batch_size = batch_size;
        }
        if let Some(every) = self.checkpoint_every {
            config.writer.checkpoint_every_events = every;
        }
        if let Some(interval) = self.request_interval_ms {
            config.pacing.request_interval_ms = interval;
        }
        if self.expected_total.is_some() {
            config.pacing.expected_total = self.expected_total;
        }
        if let Some(stream) = &self.stream {
            config.stream = stream.clone();
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run_cli().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        },
    }
}

async fn run_cli() -> Result<ExitCode> {
    let cli = Cli::parse();

    match &cli.env_file {
        Some(path) => {
            dotenvy::from_path(path)
                .with_context(|| format!("failed to load env file {}", path.display()))?;
        },
        None => {
            dotenvy::dotenv().ok();
        },
    }

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::default()
        .with_level(log_level)
        .with_file_prefix("evload-ingest")
        .with_directives("sqlx=warn,hyper=info,reqwest=info")
        .merge_env()
        .context("invalid logging configuration")?;
    let _guard = init_logging(&log_config)?;

    // Must be logged before `_guard` drops
    let result = dispatch(cli.command).await;
    if let Err(e) = &result {
        error!(error = %format!("{e:#}"), "evload-ingest failed");
    }
    result
}

async fn dispatch(command: Command) -> Result<ExitCode> {
    match command {
        Command::Run(args) => run(args).await,
        Command::Status {
            database_url,
            stream,
        } => {
            let pool = connect(&database_url, 1).await?;
            status(pool, stream).await?;
            Ok(ExitCode::SUCCESS)
        },
        Command::Migrate { database_url } => {
            let pool = connect(&database_url, 1).await?;
            migrate(&pool).await?;
            Ok(ExitCode::SUCCESS)
        },
    }
}

async fn run(args: RunArgs) -> Result<ExitCode> {
    let mut config = IngestConfig::from_env().context("failed to load configuration")?;
    args.apply(&mut config);
    config.validate()?;
    info!(
        source = %config.source.base_url,
        privileged = config.privileged(),
        stream = %config.stream,
        "Configuration loaded"
    );

    let pool = connect(&config.database.url, config.database.max_connections).await?;
    if args.migrate {
        migrate(&pool).await?;
    }

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let source = FetchClient::new(&config.source, RetryPolicy::from(&config.retry))?
        .with_cancellation(cancel.clone());
    let mut orchestrator = IngestOrchestrator::from_config(
        source,
        PgMergeTarget::new(pool.clone()),
        PgCheckpointStore::new(pool.clone(), config.stream.clone()),
        &config,
    )
    .with_cancellation(cancel);

    let report = orchestrator.run().await?;
    if let Some(keep) = args.keep_checkpoints {
        let store = PgCheckpointStore::new(pool.clone(), config.stream.clone());
        match store.prune(keep).await {
            Ok(deleted) => info!(deleted, keep, "Pruned old checkpoints"),
            Err(e) => warn!(error = %e, "Checkpoint pruning failed"),
        }
    }
    pool.close().await;

    match report.outcome {
        RunOutcome::Completed | RunOutcome::Cancelled => Ok(ExitCode::SUCCESS),
        RunOutcome::CredentialExpired => {
            warn!(
                events_ingested = report.checkpoint.events_ingested,
                "Export token expired; rerun with a fresh EVLOAD_EXPORT_TOKEN to resume"
            );
            Ok(ExitCode::from(EXIT_CREDENTIAL_EXPIRED))
        },
    }
}

async fn status(pool: PgPool, stream: String) -> Result<()> {
    let store = PgCheckpointStore::new(pool, stream);
    match store.load().await? {
        Some(state) => {
            println!("stream:          {}", store.stream());
            println!(
                "cursor:          {}",
                state.cursor_token.as_ref().map(|c| c.as_str()).unwrap_or("<none>")
            );
            println!("events_ingested: {}", state.events_ingested);
        },
        None => println!("No checkpoint recorded for stream '{}'", store.stream()),
    }
    Ok(())
}

async fn migrate(pool: &PgPool) -> Result<()> {
    info!("Applying migrations");
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .context("failed to apply migrations")?;
    info!("Migrations applied");
    Ok(())
}

async fn connect(url: &str, max_connections: u32) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect(url)
        .await
        .context("failed to connect to PostgreSQL")
}

/// Cancel on SIGINT or SIGTERM; the run drains and exits cleanly
async fn cancel_on_signal(cancel: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            },
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable, listening for Ctrl-C only");
                let _ = ctrl_c.await;
            },
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }

    info!("Shutdown requested, finishing current page");
    cancel.cancel();
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn run_args(argv: &[&str]) -> RunArgs {
        let cli = Cli::try_parse_from(argv).unwrap();
        match cli.command {
            Command::Run(args) => args,
            other => panic!("expected run, got {other:?}"),
        }
    }

    #[test]
    fn test_keep_checkpoints_flag() {
        let args = run_args(&["evload-ingest", "run", "--keep-checkpoints", "50"]);
        assert_eq!(args.keep_checkpoints, Some(50));
    }

    #[test]
    fn test_keep_checkpoints_must_be_positive() {
        assert!(Cli::try_parse_from(["evload-ingest", "run", "--keep-checkpoints", "0"]).is_err());
    }

    #[test]
    fn test_run_overrides_apply() {
        let args = run_args(&["evload-ingest", "run", "--page-size", "250", "--stream", "audit"]);
        let mut config = IngestConfig::default();
        args.apply(&mut config);
        assert_eq!(config.source.page_size, 250);
        assert_eq!(config.stream, "audit");
    }
}
