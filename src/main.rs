//! Realmcore World Server
//!
//! Accepts world connections, authenticates them into sessions and drives
//! every session from the world tick loop.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use realmcore_server::config::ServerConfig;
use realmcore_server::net::handler::ConnectionHandler;
use realmcore_server::state::AppState;
use realmcore_server::VERSION;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = ServerConfig::load().await?;

    info!(version = VERSION, realm = %config.server_name, "Starting Realmcore world server");
    info!("Configuration loaded from: {}", config.config_path.display());

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let state = Arc::new(AppState::new(config.clone(), shutdown_tx.clone())?);
    info!("Application state initialized");

    // World tick loop
    let world = Arc::clone(&state.world);
    let mut world_shutdown_rx = shutdown_tx.subscribe();
    let world_handle = tokio::spawn(async move {
        world.run(&mut world_shutdown_rx).await;
    });

    let world_addr: SocketAddr = config.listen_address().parse()?;
    let listener = TcpListener::bind(world_addr).await?;
    info!("World server listening on: {}", world_addr);

    let accept_state = Arc::clone(&state);
    let mut accept_shutdown_rx = shutdown_tx.subscribe();
    let accept_handle = tokio::spawn(async move {
        accept_connections(listener, accept_state, &mut accept_shutdown_rx).await;
    });

    info!(realm_id = config.realm_id, "Server startup complete");

    wait_for_shutdown(shutdown_tx.clone()).await;

    info!("Shutting down server...");

    let _ = accept_handle.await;
    // The world loop logs every session out before returning
    if let Err(e) = world_handle.await {
        error!("World loop ended abnormally: {}", e);
    }

    info!("Server shutdown complete. Goodbye!");
    Ok(())
}

/// Initialize the logging/tracing system
fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,realmcore_server=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .init();
}

/// Accept incoming world connections
async fn accept_connections(listener: TcpListener, state: Arc<AppState>, shutdown_rx: &mut broadcast::Receiver<()>) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        info!("New world connection from: {}", addr);
                        let handler = ConnectionHandler::new(state.clone());
                        tokio::spawn(async move {
                            if let Err(e) = handler.handle_tcp(stream, addr).await {
                                warn!("World connection error from {}: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept world connection: {}", e);
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("World connection acceptor shutting down");
                break;
            }
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn wait_for_shutdown(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    // Signal all tasks to shut down
    let _ = shutdown_tx.send(());
}
