use anyhow::{anyhow, Context, Result};
use clap::Parser;
use iceload::config::AppConfig;
use iceload::pipeline::{InvocationEvent, PipelineOrchestrator, RunOutcome};
use iceload::telemetry::{init_telemetry, shutdown_telemetry};
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(
    name = "iceload",
    about = "Load one daily CSV partition from S3 into an Iceberg table"
)]
struct Cli {
    /// Path to an optional config file
    #[arg(long)]
    config: Option<String>,

    /// Partition date (YYYY-MM-DD); defaults to DEFAULT_TARGET_DATE, then yesterday
    #[arg(long, conflicts_with_all = ["event", "stdin"])]
    target_date: Option<String>,

    /// Invocation event as JSON, e.g. '{"target_date": "2024-03-01"}'
    #[arg(long, conflicts_with = "stdin")]
    event: Option<String>,

    /// Read newline-delimited events from stdin and run them on one warm process
    #[arg(long)]
    stdin: bool,

    /// Per-invocation deadline in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let started = Instant::now();
    init_telemetry().map_err(|e| anyhow!("Failed to initialize telemetry: {}", e))?;

    let cli = Cli::parse();

    let mut config =
        AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if cli.timeout_secs.is_some() {
        config.ingest.timeout_secs = cli.timeout_secs;
    }

    let orchestrator = PipelineOrchestrator::from_config(&config)
        .await
        .context("Startup failed")?;

    tracing::info!(
        table = %orchestrator.target(),
        "Ready in {}ms",
        started.elapsed().as_millis()
    );

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown().await;
            cancel.cancel();
        }
    });

    let last_succeeded = if cli.stdin {
        run_stdin(&orchestrator, &cancel).await?
    } else {
        let event = match (&cli.event, cli.target_date) {
            (Some(json), _) => serde_json::from_str(json).context("Invalid --event JSON")?,
            (None, target_date) => InvocationEvent { target_date },
        };
        let outcome = orchestrator.run(event, cancel.clone()).await;
        emit(&outcome)?;
        outcome.is_success()
    };

    shutdown_telemetry();

    if !last_succeeded {
        std::process::exit(1);
    }
    Ok(())
}

/// Run each stdin line as one invocation. Returns whether the last one succeeded.
async fn run_stdin(orchestrator: &PipelineOrchestrator, cancel: &CancellationToken) -> Result<bool> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut last_succeeded = true;

    while let Some(line) = lines.next_line().await? {
        if cancel.is_cancelled() {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }

        let outcome = match serde_json::from_str::<InvocationEvent>(&line) {
            Ok(event) => orchestrator.run(event, cancel.clone()).await,
            Err(e) => RunOutcome::failure(
                format!("invalid event: {}", e),
                None,
                &orchestrator.target().to_string(),
            ),
        };

        emit(&outcome)?;
        last_succeeded = outcome.is_success();
    }

    Ok(last_succeeded)
}

fn emit(outcome: &RunOutcome) -> Result<()> {
    println!("{}", serde_json::to_string(outcome)?);
    Ok(())
}

async fn shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, cancelling in-flight run...");
}
