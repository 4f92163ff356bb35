use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::sync::watch;
use tracing::{error, info, warn};
use warden_core::LaunchSpec;
use warden_supervisor::{
    api::{self, AppState},
    config::{self, Config},
    hub::BroadcastHub,
    logging::init_logging,
    supervisor::Supervisor,
};

#[tokio::main]
async fn main() {
    let config = match config::load_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("config_error: {err}");
            std::process::exit(2);
        }
    };
    let _log_guard = init_logging(&config);
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };

    let hub = BroadcastHub::new(config.hub.clone());
    let supervisor = Supervisor::new(
        hub.clone(),
        config.supervisor.clone(),
        initial_launch(&config),
    );
    let (keepalive_tx, keepalive_rx) = watch::channel(false);
    hub.clone().spawn_keepalive(keepalive_rx);

    let app = api::router(AppState {
        supervisor: supervisor.clone(),
        hub: hub.clone(),
        catalog: Arc::new(config.catalog.clone()),
    });

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "bind_failed", error = %err, addr = %config.addr);
            return;
        }
    };

    info!(
        event = "supervisor_start",
        addr = %config.addr,
        games = config.catalog.games.len(),
        on_shutdown = %config.shutdown
    );

    let policy = config.shutdown;
    let shutdown = async move {
        shutdown_signal().await;
        info!(event = "shutdown_requested", policy = %policy);
        supervisor.shutdown(policy).await;
        let _ = keepalive_tx.send(true);
    };

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(event = "serve_error", error = %err);
    }
    info!(event = "supervisor_exit");
}

/// Record shown by the status endpoint before anything has been started.
fn initial_launch(config: &Config) -> LaunchSpec {
    match config.launch_spec(None, None) {
        Ok(spec) => spec,
        Err(err) => {
            warn!(event = "default_launch_unresolved", error = %err);
            let game_id = config
                .catalog
                .default_game()
                .map(|game| game.id.clone())
                .unwrap_or_default();
            LaunchSpec::new(game_id, PathBuf::new())
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                warn!(event = "sigterm_unavailable", error = %err);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
