use clap::Parser;
use std::error::Error;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use probe_agent::agent_modules::checkers::default_registry;
use probe_agent::agent_modules::config::load_agent_config;
use probe_agent::agent_modules::context::AgentContext;
use probe_agent::agent_modules::heartbeat::{HeartbeatClient, heartbeat_loop};
use probe_agent::agent_modules::scheduler::Scheduler;
use probe_agent::agent_modules::store::ChecklistStore;
use probe_agent::version::VERSION;

#[derive(Parser, Debug)]
#[command(name = "probe-agent", version = VERSION, about = "Runs health checks and reports them to the control plane")]
struct Cli {
    /// Path to the agent configuration file.
    #[arg(long, default_value = "agent_config.toml")]
    config: String,

    /// Run a single check cycle, flush state and exit.
    #[arg(long)]
    once: bool,
}

fn init_logging(log_dir: &str) {
    // Log to a file: JSON format, daily rotation
    let file_appender = rolling::daily(log_dir, "agent.log");
    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .json();

    // Log to stdout: human-readable format
    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    // Default to `info` level if RUST_LOG is not set.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler; only Ctrl-C will stop the agent.");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn spawn_core_tasks(
    ctx: Arc<AgentContext>,
    heartbeat_client: HeartbeatClient,
    shutdown_rx: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::new();

    // Scheduler Task
    let scheduler = Scheduler::new(Arc::clone(&ctx));
    let scheduler_shutdown = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        scheduler.run(scheduler_shutdown).await;
        info!("Scheduler loop ended.");
    }));

    // Heartbeat Task
    let heartbeat_ctx = Arc::clone(&ctx);
    let heartbeat_shutdown = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        heartbeat_loop(heartbeat_ctx, heartbeat_client, heartbeat_shutdown).await;
    }));

    // Persistence backstop Task
    let store = Arc::clone(&ctx.store);
    tasks.push(tokio::spawn(async move {
        store.backstop_loop(shutdown_rx).await;
    }));

    info!("All core tasks spawned.");
    tasks
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let config = match load_agent_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Critical error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    init_logging(&config.log_dir);
    info!(version = VERSION, check_id = %config.check_id, "Starting agent...");

    let store = Arc::new(ChecklistStore::load(config.checklist_path()));
    let registry = default_registry()?;
    info!(check_types = ?registry.types(), "Checker registry populated.");
    let ctx = Arc::new(AgentContext::new(config, registry, store)?);

    if cli.once {
        let scheduler = Scheduler::new(Arc::clone(&ctx));
        let handles = scheduler.run_cycle();
        info!(jobs = handles.len(), "Running a single check cycle.");
        for outcome in futures::future::join_all(handles).await {
            if let Err(join_error) = outcome {
                error!(error = ?join_error, "A check task panicked.");
            }
        }
        ctx.store.flush().await?;
        info!("Single cycle finished.");
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks = spawn_core_tasks(Arc::clone(&ctx), HeartbeatClient::new()?, shutdown_rx);

    // Heartbeat ends on its own when the control plane drops this agent; the
    // remaining tasks keep checking until a shutdown signal arrives.
    wait_for_shutdown_signal().await;
    info!("Shutdown signal received. Stopping agent...");
    if shutdown_tx.send(true).is_err() {
        warn!("All core tasks had already stopped.");
    }

    for outcome in futures::future::join_all(tasks).await {
        if let Err(join_error) = outcome {
            error!(error = ?join_error, "A core task panicked.");
        }
    }

    match ctx.store.flush().await {
        Ok(_) => info!("Checklist flushed. Agent stopped."),
        Err(e) => {
            error!(error = %e, "Final checklist flush failed.");
            return Err(e.into());
        }
    }
    Ok(())
}
