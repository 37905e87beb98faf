//! TimeFlow Agent - desktop activity capture with durable offline sync.
//!
//! This binary hosts the tracking coordinator and exposes it to the desktop
//! UI over stdin/stdout.
//!
//! # Commands
//!
//! - `timeflow-agent run`: Start the agent and accept JSON-line commands on stdin
//! - `timeflow-agent status`: Show the saved session and queue backlog
//! - `timeflow-agent sync`: Flush the offline queue once
//!
//! # Environment Variables
//!
//! See the [`config`] module for available configuration options.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use timeflow_agent::config::Config;
use timeflow_agent::control::{handle_line, ControlResponse};
use timeflow_agent::coordinator::Coordinator;
use timeflow_agent::platform::capabilities_from_config;
use timeflow_agent::queue::DurableQueue;
use timeflow_agent::remote::{MemoryStore, RemoteStore, SupabaseStore};
use timeflow_agent::session::SessionStore;

/// TimeFlow Agent - desktop activity capture.
///
/// Captures screenshots, foreground application usage and idle time while
/// the user tracks a task, and syncs them to the TimeFlow backend.
#[derive(Parser, Debug)]
#[command(name = "timeflow-agent")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "\
ENVIRONMENT VARIABLES:
    TIMEFLOW_SUPABASE_URL              Remote store URL (required for 'run' and 'sync')
    TIMEFLOW_SUPABASE_KEY              Remote store API key
    TIMEFLOW_DATA_DIR                  Session and queue directory
    TIMEFLOW_SCREENSHOT_INTERVAL_SECS  Screenshot cadence (default: 60)
    TIMEFLOW_SCREENSHOT_JITTER_SECS    Screenshot cadence spread (default: 0)
    TIMEFLOW_APP_INTERVAL_SECS         Foreground app cadence (default: 10)
    TIMEFLOW_IDLE_POLL_SECS            Cursor poll period (default: 5)
    TIMEFLOW_IDLE_TIMEOUT_SECS         Idle threshold (default: 300)
    TIMEFLOW_FLUSH_INTERVAL_SECS       Queue flush period (default: 30)
    TIMEFLOW_SCREENSHOT_CMD            Command printing a PNG frame
    TIMEFLOW_WINDOW_CMD                Command printing app name and window title
    TIMEFLOW_CURSOR_CMD                Command printing the cursor position

EXAMPLES:
    # Start the agent against the backend
    export TIMEFLOW_SUPABASE_URL=https://xyz.supabase.co
    export TIMEFLOW_SUPABASE_KEY=...
    timeflow-agent run

    # Drive it from the host UI
    echo '{\"command\":\"set_user_id\",\"id\":\"u1\"}' | timeflow-agent run --offline
")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Start the agent.
    ///
    /// Reads one JSON command per line on stdin and writes one JSON response
    /// per line on stdout. Logs go to stderr.
    Run {
        /// Keep all records in memory instead of contacting the backend.
        #[arg(long)]
        offline: bool,
    },

    /// Print the saved session and the number of queued records.
    Status,

    /// Flush the offline queue once and print the result.
    Sync,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    runtime.block_on(async move {
        match cli.command {
            Command::Run { offline } => run_agent(offline).await,
            Command::Status => run_status().await,
            Command::Sync => run_sync().await,
        }
    })
}

/// Runs the agent until stdin closes or a shutdown signal arrives.
async fn run_agent(offline: bool) -> Result<()> {
    info!("Starting TimeFlow Agent");

    let config = Config::from_env().context("Failed to load configuration")?;
    info!(
        data_dir = %config.data_dir.display(),
        offline,
        "Configuration loaded"
    );

    let remote: Arc<dyn RemoteStore> = if offline {
        info!("Offline mode, records stay in memory");
        Arc::new(MemoryStore::new())
    } else {
        remote_from_config(&config)?
    };

    let coordinator = Coordinator::open(&config, remote, capabilities_from_config(&config))
        .context("Failed to open agent data directory")?;

    let report = coordinator.sync_offline_data().await;
    info!(
        delivered = report.delivered,
        remaining = report.remaining,
        "Startup flush finished"
    );

    let mut stdout = tokio::io::stdout();
    if let Some(session) = coordinator.pending_resume() {
        write_response(&mut stdout, &ControlResponse::ResumePrompt { session }).await?;
    }

    info!("Agent running. Send commands on stdin, Ctrl+C to stop.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = wait_for_shutdown();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }

            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some(response) = handle_line(&coordinator, &line).await {
                        write_response(&mut stdout, &response).await?;
                    }
                }
                Ok(None) => {
                    info!("Input closed");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to read command input");
                    break;
                }
            },
        }
    }

    info!("Shutting down...");
    coordinator.stop_tracking().await;

    let pending = coordinator.queue().len().await;
    if pending > 0 {
        warn!(
            queued_records = pending,
            "Records remain queued and will be sent on the next start"
        );
    }

    info!("Agent stopped");
    Ok(())
}

/// Prints the saved session and queue backlog without touching the network.
async fn run_status() -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    let queue = DurableQueue::open(&config.data_dir, config.queue_warn_threshold)
        .context("Failed to open offline queue")?;
    let counts = queue.counts().await;

    println!("Data directory: {}", config.data_dir.display());
    println!();
    match SessionStore::new(&config.data_dir).load() {
        Some(session) => {
            println!("Saved session:");
            println!("  user:      {}", session.user_id);
            println!("  task:      {}", session.task_id);
            println!("  started:   {}", session.start_time);
            println!(
                "  time log:  {}",
                session.time_log_id.as_deref().unwrap_or("(not confirmed)")
            );
        }
        None => println!("No saved session."),
    }
    println!();
    println!("Queued records:");
    println!("  time logs:   {}", counts.time_logs);
    println!("  screenshots: {}", counts.screenshots);
    println!("  app logs:    {}", counts.app_logs);

    Ok(())
}

/// Flushes the offline queue once against the configured backend.
async fn run_sync() -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    let remote = remote_from_config(&config)?;
    let queue = DurableQueue::open(&config.data_dir, config.queue_warn_threshold)
        .context("Failed to open offline queue")?;

    let report = queue.flush(remote.as_ref()).await;
    println!(
        "Delivered {} record(s), {} remaining.",
        report.delivered, report.remaining
    );

    Ok(())
}

fn remote_from_config(config: &Config) -> Result<Arc<dyn RemoteStore>> {
    let remote = config.remote.as_ref().context(
        "TIMEFLOW_SUPABASE_URL is not set. Set it (and TIMEFLOW_SUPABASE_KEY) or use --offline.",
    )?;
    let store = SupabaseStore::new(&remote.url, &remote.api_key)
        .context("Failed to create remote store client")?;
    info!(url = %store.base_url(), "Remote store configured");
    Ok(Arc::new(store))
}

async fn write_response(stdout: &mut tokio::io::Stdout, response: &ControlResponse) -> Result<()> {
    let mut line = serde_json::to_string(response).context("Failed to encode response")?;
    line.push('\n');
    stdout
        .write_all(line.as_bytes())
        .await
        .context("Failed to write response")?;
    stdout.flush().await.context("Failed to flush stdout")?;
    Ok(())
}

/// Initializes the tracing subscriber with environment filter.
///
/// Logs go to stderr so stdout carries only command responses.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .init();
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
