use std::sync::Arc;

use adwatch_storage::{read_snapshot, CorpusStore, StoreError};
use adwatch_sync::{
    build_runner, export_listings, ExportFormat, IngestionScheduler, SyncConfig, Trigger,
    TriggerOutcome,
};
use adwatch_web::AppState;
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "adwatch-cli")]
#[command(about = "Classified ad watcher: ingest, review and export listings")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the scheduler and the HTTP API until Ctrl-C.
    Run,
    /// Run a single ingestion cycle.
    Scrape,
    /// Print stored listings.
    List {
        #[arg(long)]
        unseen: bool,
    },
    /// Mark listings as seen by id.
    MarkSeen {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Export listings as CSV or Excel.
    Export {
        #[arg(long, default_value = "csv")]
        format: String,
        #[arg(long)]
        unseen: bool,
    },
    /// Serve the HTTP API without the scheduler.
    Serve,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "could not listen for ctrl-c");
    }
}

/// Another process owns the corpus; point at the API that can still reach it.
fn explain_locked(err: anyhow::Error) -> anyhow::Error {
    let locked = err
        .chain()
        .any(|cause| matches!(cause.downcast_ref::<StoreError>(), Some(StoreError::Locked { .. })));
    if locked {
        err.context("corpus is busy: is `adwatch-cli run` or `serve` running? use its HTTP API instead")
    } else {
        err
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    execute(cli.command.unwrap_or(Commands::Scrape), config)
        .await
        .map_err(explain_locked)
}

async fn execute(command: Commands, config: SyncConfig) -> Result<()> {
    match command {
        Commands::Run => run(config).await?,
        Commands::Scrape => {
            let runner = build_runner(&config).await?;
            match runner.try_run_cycle(Trigger::OnDemand).await {
                TriggerOutcome::Completed(report) => println!(
                    "scrape complete: new={} total={} unseen={} pages={}",
                    report.new_listings,
                    report.total_listings,
                    report.unseen_listings,
                    report.pages_fetched
                ),
                TriggerOutcome::Skipped => println!("scrape skipped: a cycle is already running"),
                TriggerOutcome::Failed(err) => return Err(anyhow!(err).context("scrape failed")),
            }
        }
        Commands::List { unseen } => {
            let mut listings = read_snapshot(&config.data_file)
                .await
                .context("reading corpus")?;
            if unseen {
                listings.retain(|l| !l.seen);
            }
            for l in &listings {
                let marker = if l.seen { " " } else { "*" };
                println!(
                    "{marker} {}  {} | {} | {} | {} | {}",
                    l.id, l.title, l.price, l.location, l.date, l.link
                );
            }
            println!("{} listing(s)", listings.len());
        }
        Commands::MarkSeen { ids } => {
            let store = CorpusStore::open(&config.data_file)
                .await
                .context("opening corpus")?;
            let marked = store.mark_seen(&ids).await.context("marking listings as seen")?;
            println!("marked {marked} of {} listing(s) as seen", ids.len());
        }
        Commands::Export { format, unseen } => {
            let format: ExportFormat = format.parse()?;
            let listings = read_snapshot(&config.data_file)
                .await
                .context("reading corpus")?;
            match export_listings(&listings, format, &config.export_dir, !unseen)? {
                Some(path) => println!("exported to {}", path.display()),
                None => println!("no listings to export"),
            }
        }
        Commands::Serve => {
            let runner = build_runner(&config).await?;
            let state = AppState::new(runner, config.export_dir.clone());
            adwatch_web::serve(state, config.web_port, shutdown_signal()).await?;
        }
    }

    Ok(())
}

async fn run(config: SyncConfig) -> Result<()> {
    let runner = build_runner(&config).await?;
    let scheduler = IngestionScheduler::start(Arc::clone(&runner), config.scheduler()).await?;

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let state = AppState::new(Arc::clone(&runner), config.export_dir.clone());
    let mut server = tokio::spawn(adwatch_web::serve(state, config.web_port, async move {
        let _ = stop_rx.await;
    }));

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("waiting for ctrl-c")?;
            info!("shutdown requested");
        }
        res = &mut server => {
            scheduler.stop().await?;
            res.context("api server task")??;
            return Err(anyhow!("api server exited unexpectedly"));
        }
    }

    scheduler.stop().await?;
    let _ = stop_tx.send(());
    server.await.context("api server task")??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locked_corpus_error_points_at_running_process() {
        let err = anyhow::Error::new(StoreError::Locked {
            path: "data.json".into(),
            lock: "data.json.lock".into(),
        })
        .context("opening corpus");

        let message = format!("{:#}", explain_locked(err));
        assert!(message.starts_with("corpus is busy"));
        assert!(message.contains("already opened by another process"));

        let other = explain_locked(anyhow!("boom"));
        assert_eq!(format!("{other:#}"), "boom");
    }
}
