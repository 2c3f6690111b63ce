//! Testable server startup logic.
//!
//! [`ServerConfig`] plus [`ServerHandle`] let integration tests spin up a
//! real relay server on an ephemeral port, exercise its HTTP and WebSocket
//! endpoints, and shut it down cleanly.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::server::{http, ws, RelayState};

/// Everything needed to start a relay server.
pub struct ServerConfig {
    pub state: Arc<RelayState>,
    pub bind_address: SocketAddr,
}

impl ServerConfig {
    /// Minimal config for integration tests: OS-assigned port on loopback.
    pub fn for_testing(state: Arc<RelayState>) -> Self {
        ServerConfig {
            state,
            bind_address: SocketAddr::from(([127, 0, 0, 1], 0)),
        }
    }
}

/// Handle to a running server. Returned by [`run_server_with_config`].
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    state: Arc<RelayState>,
    server_task: JoinHandle<Result<(), std::io::Error>>,
}

impl ServerHandle {
    /// The port the server actually bound to.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `http://ip:port` base URL for the running server.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    /// `ws://ip:port` base URL for the running server.
    pub fn ws_base_url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    pub fn state(&self) -> &Arc<RelayState> {
        &self.state
    }

    /// Trigger graceful shutdown and await the server task.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        match tokio::time::timeout(Duration::from_secs(5), self.server_task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => error!("server task returned error: {}", e),
            Ok(Err(e)) => error!("server task panicked: {}", e),
            Err(_) => warn!("server task did not finish within 5s timeout"),
        }
    }
}

/// Build the full route table over the shared state.
pub fn build_router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/ws", get(ws::client_ws_handler))
        .route("/ws/agent", get(ws::agent_ws_handler))
        .route("/health", get(http::health_handler))
        .route("/list-files", get(http::list_files_handler))
        .route("/start-download/:name", post(http::start_download_handler))
        .route("/secure-file/:name", get(http::secure_file_handler))
        .with_state(state)
}

/// Bind the listener and spawn the accept loop. Returns once the socket is
/// bound, so callers can read the assigned port immediately.
pub async fn run_server_with_config(config: ServerConfig) -> std::io::Result<ServerHandle> {
    let app = build_router(config.state.clone());
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;
    let local_addr = listener.local_addr()?;

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let server_task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                while shutdown_rx.changed().await.is_ok() {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            })
            .await
    });

    info!(addr = %local_addr, "relay server listening");
    Ok(ServerHandle {
        local_addr,
        shutdown_tx,
        state: config.state,
        server_task,
    })
}
