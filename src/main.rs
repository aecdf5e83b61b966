use spinhost::build_queue::BuildQueue;
use spinhost::builder::BuildJob;
use spinhost::config::Config;
use spinhost::events::SpinletEvent;
use spinhost::orchestrator::{Orchestrator, OrchestratorBuilder, OrchestratorConfig};
use spinhost::store::{open_store, ResourceStore};
use spinhost::{PKG_NAME, VERSION};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

const USAGE: &str = "usage: spinhost [config.toml]\n       spinhost build <tenant> <spinlet> <source-dir> [config.toml]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("spinhost=debug".parse()?),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("build") => {
            let [tenant, spinlet, source] = match &args[1..] {
                [tenant, spinlet, source, ..] => [tenant, spinlet, source],
                _ => anyhow::bail!("{}", USAGE),
            };
            let config = load_config(args.get(4).map(PathBuf::from))?;
            build_once(&config, tenant, spinlet, Path::new(source)).await
        }
        Some("-h") | Some("--help") => {
            println!("{}", USAGE);
            Ok(())
        }
        path => {
            let config = load_config(path.map(PathBuf::from))?;
            run_daemon(config).await
        }
    }
}

/// Load the given file, else `config.toml` if present, else defaults
fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    let path = match path {
        Some(path) => path,
        None if Path::new("config.toml").exists() => PathBuf::from("config.toml"),
        None => {
            info!("No configuration file, using defaults");
            return Ok(Config::default());
        }
    };

    let config = Config::load(&path).map_err(|e| {
        error!(path = %path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %path.display(), "Configuration loaded");
    Ok(config)
}

async fn run_daemon(config: Config) -> anyhow::Result<()> {
    print_startup_banner(&config);

    let store: Arc<dyn ResourceStore> = open_store(&config.store)?;
    let orchestrator = OrchestratorBuilder::new(store)
        .config(OrchestratorConfig::from_config(&config))
        .build();

    orchestrator.ports().initialize().await?;
    orchestrator.start();

    let event_log = tokio::spawn(log_events(orchestrator.subscribe()));

    wait_for_shutdown_signal().await?;

    shutdown(&orchestrator).await;
    event_log.abort();

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown(orchestrator: &Arc<Orchestrator>) {
    info!(running = orchestrator.list_running().len(), "Stopping all spinlets...");
    orchestrator.shutdown().await;
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

/// Surface health and crash events in the daemon log
async fn log_events(mut events: broadcast::Receiver<SpinletEvent>) {
    loop {
        match events.recv().await {
            Ok(SpinletEvent::Crashed { spinlet_id, error }) => {
                error!(spinlet_id = %spinlet_id, error = %error, "Spinlet crashed");
            }
            Ok(SpinletEvent::Unhealthy {
                spinlet_id,
                reason,
                failures,
            }) => {
                warn!(spinlet_id = %spinlet_id, reason = %reason, failures, "Spinlet unhealthy");
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Event log lagged behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Build a source tree once and print the result as JSON
async fn build_once(config: &Config, tenant: &str, spinlet: &str, source: &Path) -> anyhow::Result<()> {
    let store = open_store(&config.store)?;
    let queue = BuildQueue::builder(&config.build).store(store).build();

    let result = queue.build(BuildJob::new(tenant, spinlet, source)).await;
    println!("{}", serde_json::to_string_pretty(&result)?);

    if !result.success {
        anyhow::bail!("Build failed: {}", result.errors.join("; "));
    }
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting spinlet host");
    info!(
        hostname = %config.host.hostname,
        service_host = %config.host.service_host,
        "Host identity"
    );
    info!(
        range_start = config.ports.range_start,
        range_end = config.ports.range_end,
        "Port pool"
    );
    info!(
        idle_timeout_secs = config.spinlets.idle_timeout_secs,
        startup_timeout_secs = config.spinlets.startup_timeout_secs,
        shutdown_grace_period_secs = config.spinlets.shutdown_grace_period_secs,
        unhealthy_threshold = config.spinlets.unhealthy_threshold,
        "Spinlet defaults"
    );
    info!(
        backend = ?config.store.backend,
        path = %config.store.path.display(),
        "Resource store"
    );
}
