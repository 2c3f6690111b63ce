//! CLI subcommand definitions and handlers.
//!
//! Uses clap derive to define the subcommand hierarchy:
//! - `serve` (default) -- start the relay server
//! - `agent` -- run the file agent against a relay server
//! - `version` -- print version info

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::agent::{run_agent, AgentRuntime};
use crate::config::{self, FerryConfig};
use crate::server::startup::{run_server_with_config, ServerConfig};
use crate::server::RelayState;
use crate::storage::BlobStore;

/// Ferry relay server and file agent.
#[derive(Parser, Debug)]
#[command(
    name = "ferry",
    version = env!("CARGO_PKG_VERSION"),
    about = "Ferry — relays file commands between browser clients and on-site agents"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the relay server (default when no subcommand is given).
    Serve {
        /// Listen address, e.g. 0.0.0.0:8000 (default: from config).
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Run the file agent against a relay server.
    Agent {
        /// Relay server base URL, e.g. ws://relay.example.com:8000.
        #[arg(short, long)]
        server: Option<String>,

        /// Relay access token (admin role required).
        #[arg(short, long, env = "FERRY_AGENT_TOKEN")]
        token: Option<String>,

        /// Key for the server's secure-file endpoint.
        #[arg(long, env = "FERRY_API_KEY")]
        api_key: Option<String>,

        /// Directory the agent stores files in.
        #[arg(long)]
        files_dir: Option<PathBuf>,
    },

    /// Print version information.
    Version,
}

/// Start the relay server and block until ctrl-c.
pub async fn handle_serve(bind: Option<String>) -> anyhow::Result<()> {
    let mut config = config::load_config().context("failed to load configuration")?;
    if let Some(bind) = bind {
        config.bind = Some(bind);
    }
    warn_on_open_relay(&config);

    let state = RelayState::from_config(&config).context("failed to open blob store")?;
    let server_config = ServerConfig {
        state,
        bind_address: config.bind_addr()?,
    };
    let handle = run_server_with_config(server_config)
        .await
        .context("failed to bind relay server")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");
    handle.shutdown().await;
    Ok(())
}

/// Run the agent loop until ctrl-c.
pub async fn handle_agent(
    server: Option<String>,
    token: Option<String>,
    api_key: Option<String>,
    files_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    let config = config::load_config().context("failed to load configuration")?;
    let mut agent_config = config.agent.clone();
    if let Some(server) = server {
        agent_config.server_url = server;
    }
    if token.is_some() {
        agent_config.token = token;
    }
    if api_key.is_some() {
        agent_config.api_key = api_key;
    }
    if files_dir.is_some() {
        agent_config.files_dir = files_dir;
    }
    if agent_config.token.is_none() {
        warn!("no relay token configured; the server will reject this agent");
    }

    let dir = agent_config
        .files_dir
        .clone()
        .unwrap_or_else(|| config::state_dir().join("agent-files"));
    let store = BlobStore::open(dir).context("failed to open agent file store")?;
    let runtime = AgentRuntime::new(agent_config, store);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    run_agent(runtime, shutdown_rx).await?;
    Ok(())
}

pub fn handle_version() {
    println!("ferry {}", env!("CARGO_PKG_VERSION"));
}

fn warn_on_open_relay(config: &FerryConfig) {
    if config.identity_store().is_empty() {
        warn!("no relay tokens configured; agent connections will be rejected");
    }
    if config.allow_anonymous_clients {
        warn!("anonymous client connections are enabled");
    }
    if config.api_key.is_none() {
        warn!("no api key configured; the secure-file endpoint is disabled");
    }
}
