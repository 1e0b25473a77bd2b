//! stockbit-ingest - CLI entry point.
//!
//! Starts the ingest core and runs until Ctrl-C. Flags can seed a
//! credential, kick off a historical job, or open streams at boot; the
//! typed facade does the rest.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use dotenv::dotenv;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stockbit_ingest::jobs::NewJob;
use stockbit_ingest::{IngestConfig, IngestHub};

#[derive(Parser, Debug)]
#[command(name = "stockbit-ingest", about = "Stockbit market data ingestor")]
struct Cli {
    /// Bearer token to store before starting (overwrites the persisted one).
    #[arg(long, env = "STOCKBIT_TOKEN")]
    token: Option<String>,

    /// Cookie string stored together with the token.
    #[arg(long, env = "STOCKBIT_COOKIES")]
    cookies: Option<String>,

    /// Start a streaming session over these tickers (comma separated).
    #[arg(long, value_delimiter = ',')]
    stream: Vec<String>,

    /// Create a historical job over these tickers (comma separated).
    #[arg(long, value_delimiter = ',')]
    backfill: Vec<String>,

    /// First trading day of the backfill job (YYYY-MM-DD).
    #[arg(long, requires = "backfill")]
    from: Option<NaiveDate>,

    /// Last trading day of the backfill job, inclusive (YYYY-MM-DD).
    #[arg(long, requires = "backfill")]
    until: Option<NaiveDate>,

    /// Delay between page fetches in milliseconds.
    #[arg(long, default_value_t = 500)]
    delay_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = IngestConfig::from_env();

    info!(
        data_dir = %config.data_dir.display(),
        db = %config.db_path.display(),
        "starting stockbit-ingest"
    );

    let hub = IngestHub::start(config).context("failed to start ingest core")?;

    if let Some(token) = &cli.token {
        let status = hub
            .set_token(token, cli.cookies.as_deref())
            .context("failed to store credential")?;
        info!(valid = status.valid, user_id = ?status.user_id, "credential stored");
    }

    if !cli.backfill.is_empty() {
        let from = cli.from.context("--backfill requires --from")?;
        let until = cli.until.unwrap_or(from);
        let job = hub.create_job(NewJob {
            tickers: cli.backfill.clone(),
            date_from: from,
            date_until: until,
            delay_ms: cli.delay_ms,
        })?;
        info!(job_id = %job.id, "backfill job created");
    }

    if !cli.stream.is_empty() {
        match hub.start_stream(cli.stream.clone(), None, None) {
            Ok(session_id) => info!(session_id = %session_id, "stream session started"),
            Err(e) => error!(error = %e, "failed to start stream"),
        }
    }

    info!("running; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("shutting down");
    hub.shutdown().await;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stockbit_ingest=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
