//! pubindex-worker - publication indexing worker

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use pubindex_common::logging::{init_logging, LogConfig};
use pubindex_common::types::{TaskId, TaskState};
use pubindex_worker::config::Settings;
use pubindex_worker::consumer::{AmqpConnector, ExitReason, QueueConsumer, ReconnectPolicy};
use pubindex_worker::ledger::TaskLedger;
use pubindex_worker::message::Message;
use pubindex_worker::pipeline::{Controller, Outcome};
use pubindex_worker::watch::TaskWatcher;

#[derive(Parser, Debug)]
#[command(name = "pubindex-worker")]
#[command(author, version, about = "Queue-driven publication indexing worker")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Settings file
    #[arg(short, long, global = true, env = "PUBINDEX_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Consume messages from the broker until interrupted
    Consume {
        /// Truncate the task ledger before consuming (only when no other
        /// worker shares the ledger file)
        #[arg(long)]
        reset_ledger: bool,
    },

    /// Run one JSON message through the pipeline
    Process {
        /// File containing the message payload
        #[arg(short, long)]
        message: PathBuf,
    },

    /// Poll the search index until tasks finish
    Watch {
        /// Ledger to read task ids from (defaults to the configured ledger)
        #[arg(long)]
        ledger: Option<PathBuf>,

        /// Task id to watch; may be repeated
        #[arg(long = "task")]
        tasks: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let settings = match Settings::load(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            let _guard = init_logging(&LogConfig::default()).ok();
            let cause = format!("{:#}", e);
            error!(cause = %cause, "Invalid configuration");
            return Ok(ExitCode::from(2));
        },
    };

    let log_config = if cli.verbose {
        settings.logging.clone().verbose()
    } else {
        settings.logging.clone()
    };
    let _guard = init_logging(&log_config)?;

    match cli.command {
        Command::Consume { reset_ledger } => consume(&settings, reset_ledger).await,
        Command::Process { message } => process(&settings, message).await,
        Command::Watch { ledger, tasks } => watch(&settings, ledger, tasks).await,
    }
}

async fn consume(settings: &Settings, reset_ledger: bool) -> Result<ExitCode> {
    let controller = Arc::new(Controller::from_settings(settings)?);

    if reset_ledger {
        controller.ledger().reset().await?;
        warn!(ledger = %controller.ledger().path().display(), "Task ledger truncated");
    }

    let connector = Arc::new(AmqpConnector::new(settings.broker.clone()));
    let mut consumer = QueueConsumer::new(
        connector,
        controller,
        ReconnectPolicy::from_config(&settings.broker),
    );

    let cancel = spawn_shutdown_listener();
    info!(queue = %settings.broker.queue, "Worker started");

    let reason = consumer.run(cancel).await;
    let stats = consumer.stats();
    info!(
        received = stats.received,
        succeeded = stats.succeeded,
        failed = stats.failed,
        rejected = stats.rejected,
        "Worker stopped"
    );

    match reason {
        ExitReason::Interrupted => Ok(ExitCode::SUCCESS),
        ExitReason::TransportFailed(err) => {
            error!(cause = %err, "Broker unavailable, exiting");
            Ok(ExitCode::FAILURE)
        },
        ExitReason::RetriesExhausted { attempts, last } => {
            error!(attempts, cause = %last, "Broker unavailable after retries, exiting");
            Ok(ExitCode::FAILURE)
        },
    }
}

async fn process(settings: &Settings, path: PathBuf) -> Result<ExitCode> {
    let payload = tokio::fs::read(&path)
        .await
        .with_context(|| format!("Failed to read message file {}", path.display()))?;

    let outcome = match Message::from_slice(&payload) {
        Ok(message) => Controller::from_settings(settings)?.process(&message).await,
        Err(err) => Outcome::rejected(err),
    };

    println!("{}", outcome);
    Ok(if outcome.is_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn watch(settings: &Settings, ledger: Option<PathBuf>, tasks: Vec<String>) -> Result<ExitCode> {
    let task_ids: Vec<TaskId> = if tasks.is_empty() {
        let ledger = TaskLedger::new(ledger.unwrap_or_else(|| settings.paths.ledger_file.clone()));
        let mut seen = HashSet::new();
        ledger
            .read_all()
            .await?
            .into_iter()
            .filter(|id| seen.insert(id.clone()))
            .collect()
    } else {
        tasks.into_iter().map(TaskId::new).collect()
    };

    if task_ids.is_empty() {
        info!("No task ids to watch");
        return Ok(ExitCode::SUCCESS);
    }

    let watcher = TaskWatcher::from_config(&settings.search)?;
    let cancel = spawn_shutdown_listener();
    let reports = watcher.watch(&task_ids, &cancel).await;

    let mut all_succeeded = true;
    for report in &reports {
        let state = report.state.map(|s| s.as_str()).unwrap_or("UNKNOWN");
        println!("{}\t{}", report.task_id, state);
        all_succeeded &= report.state == Some(TaskState::Success);
    }

    Ok(if all_succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Cancel the returned token on Ctrl+C or SIGTERM
fn spawn_shutdown_listener() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        token.cancel();
    });
    cancel
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
