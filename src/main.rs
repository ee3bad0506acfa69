//! HeadCNI Agent - per-node CNI control-plane agent

use anyhow::Result;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use headcni_agent::config::Config;
use headcni_agent::daemon::Daemon;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first so its log level can seed the filter
    let config = match Config::load() {
        Ok(cfg) => {
            init_tracing(&cfg.log_level);
            info!("Configuration loaded from {}", cfg.config_path().display());
            cfg
        }
        Err(e) => {
            init_tracing("info");
            error!("Failed to load configuration: {:#}", e);
            return Err(e);
        }
    };

    info!("HeadCNI agent starting...");

    let daemon = match Daemon::bootstrap(config).await {
        Ok(daemon) => daemon,
        Err(e) => {
            error!("Failed to initialize: {:#}", e);
            return Err(e);
        }
    };

    if let Err(e) = daemon.start().await {
        error!("Failed to start services: {:#}", e);
        daemon.shutdown().await;
        return Err(e);
    }

    info!("Agent running");
    run_signal_loop(&daemon).await;

    warn!("Shutdown signal received, stopping...");
    daemon.shutdown().await;
    info!("Agent stopped");
    Ok(())
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for termination, servicing SIGHUP reloads in place.
#[cfg(unix)]
async fn run_signal_loop(daemon: &Daemon) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sighup = signal(SignalKind::hangup()).expect("Failed to install SIGHUP handler");
    let mut sigint =
        signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");
    let mut sigterm =
        signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
    let mut sigquit = signal(SignalKind::quit()).expect("Failed to install SIGQUIT handler");

    loop {
        tokio::select! {
            _ = sighup.recv() => {
                info!("SIGHUP received, reloading configuration");
                if let Err(e) = daemon.reload().await {
                    error!("Reload failed: {:#}", e);
                }
            }
            _ = sigint.recv() => return,
            _ = sigterm.recv() => return,
            _ = sigquit.recv() => return,
        }
    }
}

#[cfg(not(unix))]
async fn run_signal_loop(_daemon: &Daemon) {
    let _ = tokio::signal::ctrl_c().await;
}
