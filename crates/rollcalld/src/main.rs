use anyhow::{Context, Result};
use clap::Parser;
use rollcall_core::{EventId, Settings};
use rollcall_store::Store;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

mod feed;
mod session;

use feed::{FeedOracle, FeedSource};
use session::{Session, SessionConfig, SessionState, TickOutcome};

#[derive(Parser)]
#[command(name = "rollcalld", about = "Rollcall attendance daemon", version)]
struct Args {
    /// Event to take attendance for (default: the active event)
    #[arg(long)]
    event: Option<String>,

    /// Detection feed file, one JSON frame per line (default: stdin)
    #[arg(long)]
    feed: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(run(args));
    // A capture blocked on stdin must not hold up exit.
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn run(args: Args) -> Result<()> {
    let settings = Settings::load().context("failed to load settings")?;
    tracing::info!(
        db = %settings.db_path.display(),
        threshold = settings.match_threshold,
        tick_ms = settings.tick_interval_ms,
        "rollcalld starting"
    );

    let store = Store::open(&settings.db_path)
        .await
        .with_context(|| format!("failed to open {}", settings.db_path.display()))?;

    let reader: Box<dyn BufRead + Send> = match &args.feed {
        Some(path) => {
            let file = std::fs::File::open(path)
                .with_context(|| format!("failed to open feed {}", path.display()))?;
            Box::new(BufReader::new(file))
        }
        None => Box::new(BufReader::new(std::io::stdin())),
    };

    let session = Session::new(
        store.clone(),
        Arc::new(FeedSource::new(reader)),
        Arc::new(FeedOracle::new(settings.descriptor_len)),
    );
    let mut reports = session.subscribe();
    let config = SessionConfig::from_settings(&settings, args.event.map(EventId::from));
    let handle = session.start(config).await?;

    // Machine-readable recognitions on stdout; everything else goes to the log.
    let printer = tokio::spawn(async move {
        loop {
            match reports.recv().await {
                Ok(report) => {
                    if let TickOutcome::Recorded { record, .. } = &report.outcome {
                        match serde_json::to_string(record) {
                            Ok(line) => println!("{line}"),
                            Err(e) => tracing::warn!(error = %e, "failed to encode record"),
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "report printer lagging");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    tracing::info!("rollcalld ready");

    let mut state = session.watch_state();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("rollcalld shutting down");
        }
        _ = state.wait_for(|s| *s == SessionState::Stopped) => {}
    }

    let stats = handle.shutdown().await?;
    let final_state = session.state();
    drop(session);
    let _ = printer.await;
    store.close().await?;
    tracing::info!(
        state = ?final_state,
        ticks = stats.ticks,
        dropped = stats.ticks_dropped,
        recorded = stats.recorded,
        already_marked = stats.already_marked,
        unrecognized = stats.unrecognized,
        no_face = stats.no_face,
        failures = stats.failures,
        "rollcalld stopped"
    );

    Ok(())
}
