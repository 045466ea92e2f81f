use std::path::PathBuf;
use std::sync::Arc;

use roost_dev::config::Config;
use roost_dev::server::{Server, ServerState};
use roost_dev::watcher::ConfigWatcher;
use tokio::sync::watch;
use tracing::{error, info};

/// Exit codes: 0 normal shutdown, 1 configuration fatal, 2 HTTP bind
/// failure.
const EXIT_CONFIG: i32 = 1;
const EXIT_BIND: i32 = 2;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("roost_dev=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_dir);

    let config = match Config::load(&config_dir) {
        Ok(config) => config,
        Err(e) => {
            error!(dir = %config_dir.display(), error = %format!("{e:#}"), "failed to load configuration");
            std::process::exit(EXIT_CONFIG);
        }
    };

    info!(
        dir = %config.dir.display(),
        tld = %config.tld,
        http_port = config.http_port,
        "configuration loaded"
    );

    let state = match ServerState::new(config) {
        Ok(state) => state,
        Err(e) => {
            error!(error = %format!("{e:#}"), "failed to load apps");
            std::process::exit(EXIT_CONFIG);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Bind before anything else so a taken port fails fast with its own
    // exit code.
    let server = match Server::bind(Arc::clone(&state), shutdown_rx.clone()).await {
        Ok(server) => server,
        Err(e) => {
            error!(
                port = state.config.http_port,
                error = %e,
                "failed to bind HTTP port"
            );
            std::process::exit(EXIT_BIND);
        }
    };

    // Config watching is best-effort; the server works without it.
    let watcher_state = Arc::clone(&state);
    let watcher = match ConfigWatcher::spawn(&state.config.dir, move || {
        watcher_state.reload_apps();
    }) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            state.log_request(&format!("Warning: could not watch config directory: {e}"));
            None
        }
    };

    let server_handle = tokio::spawn(server.run());

    wait_for_shutdown_signal().await;
    info!("shutting down");

    if let Some(watcher) = watcher {
        watcher.stop();
    }

    // Stop every managed process before closing the listener.
    state.manager.stop_all().await;

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), server_handle).await;

    info!("shutdown complete");
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}
