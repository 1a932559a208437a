use ingest::{config, web, AppState};
use std::env;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let config_path =
        env::args().nth(1).unwrap_or_else(|| "/etc/roost/stream.toml".to_owned());
    let config = match config::load_config_from_path(Path::new(&config_path)) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %config_path, error = %e, "cannot load configuration");
            std::process::exit(1);
        }
    };
    if !config.stream.enabled {
        info!("stream intake is disabled; children will be refused as busy");
    }

    let bind_addr = config.stream.bind_address.clone();
    let app = AppState::new(config);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("failed to bind");
    info!(
        addr = %bind_addr,
        node_id = %app.localhost_guid,
        workers = app.workers.worker_count(),
        "stream intake listening"
    );

    tokio::select! {
        () = web::serve(listener, Arc::clone(&app)) => {}
        () = shutdown_signal() => {
            app.set_accepting_streams(false);
            info!("stream intake shut down");
        }
    }
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
