//! Agent runtime.
//!
//! The agent is the remote process that performs actual file I/O. It keeps a
//! persistent WebSocket connection to the relay server, executes the file
//! commands it receives, and reports status back. Connection loss is routine:
//! the runtime reconnects with capped exponential backoff and jitter until a
//! shutdown is signalled.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::protocol::{
    Envelope, CMD_DELETE_FILE, CMD_DOWNLOAD, CMD_LIST_FILES, CMD_PING,
};
use crate::storage::{BlobStore, StorageError};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid server url {url}: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Executes relay commands against the local blob store and the server's
/// secure-file endpoint.
pub struct AgentRuntime {
    config: AgentConfig,
    store: BlobStore,
    http: reqwest::Client,
    /// `http(s)://` form of the server url, for the secure-file fetch.
    http_base: String,
}

impl AgentRuntime {
    pub fn new(config: AgentConfig, store: BlobStore) -> Self {
        let http_base = http_base_url(&config.server_url);
        Self {
            config,
            store,
            http: reqwest::Client::new(),
            http_base,
        }
    }

    pub fn store(&self) -> &BlobStore {
        &self.store
    }

    /// Execute one inbound frame, returning the envelope to send back (if
    /// any). Server acks and unknown frame shapes are ignored; they must not
    /// generate replies or the ack cycle would never terminate.
    pub async fn handle_frame(&self, text: &str) -> Option<Envelope> {
        let envelope = match Envelope::parse(text) {
            Ok(env) => env,
            Err(err) => {
                debug!(error = %err, "ignoring unrecognized frame");
                return None;
            }
        };
        match envelope {
            Envelope::Command {
                command,
                filename,
                content,
            } => Some(self.handle_command(&command, filename, content)),
            Envelope::Download { file } => Some(self.fetch_from_server(&file).await),
            other => {
                debug!(kind = other.type_name(), "ignoring non-command frame");
                None
            }
        }
    }

    /// Dispatch one client-issued command. Response replies carry the
    /// command name back so clients can match them to requests.
    pub fn handle_command(
        &self,
        command: &str,
        filename: Option<String>,
        content: Option<String>,
    ) -> Envelope {
        let reply = match command {
            CMD_PING => Envelope::response_ok("pong"),
            CMD_DOWNLOAD => self.save_inline(filename, content),
            CMD_LIST_FILES => match self.store.list() {
                Ok(files) => Envelope::AgentFiles { files },
                Err(err) => {
                    error!(error = %err, "failed to list files");
                    Envelope::response_error(format!("Error listing files: {err}"))
                }
            },
            CMD_DELETE_FILE => self.delete(filename),
            _ => Envelope::response_error("Unknown command"),
        };
        reply.with_command(command)
    }

    fn save_inline(&self, filename: Option<String>, content: Option<String>) -> Envelope {
        let (Some(name), Some(content_b64)) = (filename, content) else {
            return Envelope::response_error("Missing filename or content");
        };
        let bytes = match base64::engine::general_purpose::STANDARD.decode(&content_b64) {
            Ok(bytes) => bytes,
            Err(err) => {
                return Envelope::response_error(format!("Invalid base64 content: {err}"));
            }
        };
        match self.store.write(&name, &bytes) {
            Ok(()) => {
                info!(file = %name, bytes = bytes.len(), "file saved");
                Envelope::response_success(format!("File {name} downloaded successfully"))
            }
            Err(err) => {
                error!(file = %name, error = %err, "failed to save file");
                Envelope::response_error(format!("Error downloading file: {err}"))
            }
        }
    }

    fn delete(&self, filename: Option<String>) -> Envelope {
        let Some(name) = filename else {
            return Envelope::response_error("Missing filename");
        };
        match self.store.delete(&name) {
            Ok(()) => {
                info!(file = %name, "file deleted");
                Envelope::response_success(format!("File {name} deleted successfully"))
            }
            Err(StorageError::NotFound(_)) => Envelope::response_error("File not found"),
            Err(err) => {
                error!(file = %name, error = %err, "failed to delete file");
                Envelope::response_error(format!("Error deleting file: {err}"))
            }
        }
    }

    /// Pull `file` from the server's secure-file endpoint and persist it.
    async fn fetch_from_server(&self, file: &str) -> Envelope {
        match self.try_fetch(file).await {
            Ok(size) => {
                info!(file = %file, bytes = size, "server file fetched");
                Envelope::DownloadComplete {
                    file: file.to_string(),
                }
            }
            Err(message) => {
                warn!(file = %file, error = %message, "server file fetch failed");
                Envelope::DownloadFailed {
                    file: file.to_string(),
                    error: message,
                }
            }
        }
    }

    async fn try_fetch(&self, file: &str) -> Result<usize, String> {
        let url = format!("{}/secure-file/{}", self.http_base, file);
        let mut request = self.http.get(&url);
        if let Some(key) = self.config.api_key.as_deref() {
            request = request.header("api-key", key);
        }
        let response = request.send().await.map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("server returned {}", response.status()));
        }
        let bytes = response.bytes().await.map_err(|e| e.to_string())?;
        self.store
            .write(file, &bytes)
            .map_err(|e| e.to_string())?;
        Ok(bytes.len())
    }
}

/// Convert a `ws(s)://` base url into its `http(s)://` counterpart.
fn http_base_url(server_url: &str) -> String {
    let trimmed = server_url.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("wss://") {
        format!("https://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("ws://") {
        format!("http://{rest}")
    } else {
        trimmed.to_string()
    }
}

/// Backoff delay before reconnect attempt `attempt` (1-based): base doubled
/// per attempt, capped, then jittered by ±50% so a fleet of agents does not
/// hammer a recovering server in lockstep.
pub fn backoff_delay(base_ms: u64, cap_ms: u64, attempt: u32) -> Duration {
    let exp = base_ms
        .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1).min(16)))
        .min(cap_ms.max(base_ms));
    let jitter_span = exp / 2;
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .subsec_nanos() as u64;
    let jitter = if jitter_span == 0 {
        0
    } else {
        nanos % (jitter_span * 2 + 1)
    };
    Duration::from_millis(exp - jitter_span + jitter)
}

/// Run the agent connection lifecycle until shutdown.
///
/// Connects to `<server>/ws/agent`, processes frames, and reconnects with
/// capped exponential backoff on any failure (handshake, auth, or mid-stream
/// I/O). Flipping `shutdown_rx` to true ends the loop.
pub async fn run_agent(
    runtime: AgentRuntime,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), AgentError> {
    let mut attempts: u32 = 0;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        match connect(&runtime.config).await {
            Ok(ws_stream) => {
                info!(url = %runtime.config.server_url, "connected to relay server");
                attempts = 0;
                let shutdown = run_read_loop(&runtime, ws_stream, &mut shutdown_rx).await;
                if shutdown {
                    break;
                }
                warn!("connection to relay server lost, will reconnect");
            }
            Err(err) => {
                warn!(error = %err, "failed to connect to relay server");
            }
        }

        attempts += 1;
        let delay = backoff_delay(
            runtime.config.reconnect_base_ms,
            runtime.config.reconnect_cap_ms,
            attempts,
        );
        debug!(attempt = attempts, delay_ms = delay.as_millis() as u64, "reconnect backoff");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = shutdown_rx.changed() => {
                // A dropped sender means nobody can signal us anymore and
                // `changed()` would resolve instantly forever, defeating the
                // backoff. Treat it as shutdown.
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    info!("agent runtime stopped");
    Ok(())
}

async fn connect(
    config: &AgentConfig,
) -> Result<
    tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    AgentError,
> {
    let url = format!("{}/ws/agent", config.server_url.trim_end_matches('/'));
    let mut request = url
        .clone()
        .into_client_request()
        .map_err(|e| AgentError::InvalidUrl {
            url: url.clone(),
            message: e.to_string(),
        })?;
    if let Some(token) = config.token.as_deref() {
        let cookie = format!("access_token=Bearer {token}");
        request.headers_mut().insert(
            COOKIE,
            cookie.parse().map_err(|_| AgentError::InvalidUrl {
                url: url.clone(),
                message: "token contains invalid header characters".to_string(),
            })?,
        );
    }
    let (ws_stream, _response) = tokio_tungstenite::connect_async(request).await?;
    Ok(ws_stream)
}

/// Process frames on an established connection. Returns `true` if shutdown
/// was requested, `false` if the connection was lost and the caller should
/// reconnect.
async fn run_read_loop(
    runtime: &AgentRuntime,
    ws_stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> bool {
    let (mut sink, mut stream) = ws_stream.split();

    loop {
        tokio::select! {
            next = stream.next() => {
                let msg = match next {
                    Some(Ok(msg)) => msg,
                    Some(Err(err)) => {
                        warn!(error = %err, "websocket read error");
                        return false;
                    }
                    None => {
                        info!("connection closed by server");
                        return false;
                    }
                };
                match msg {
                    Message::Text(text) => {
                        if let Some(reply) = runtime.handle_frame(&text).await {
                            let frame = reply.encode_frame();
                            if sink.send(Message::Text(frame)).await.is_err() {
                                return false;
                            }
                        }
                    }
                    Message::Close(_) => {
                        info!("close frame received");
                        return false;
                    }
                    _ => {}
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    let _ = sink.send(Message::Close(None)).await;
                    return true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn runtime() -> (TempDir, AgentRuntime) {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        let config = AgentConfig {
            server_url: "ws://127.0.0.1:8000".to_string(),
            ..Default::default()
        };
        (dir, AgentRuntime::new(config, store))
    }

    #[test]
    fn test_ping_replies_pong() {
        let (_dir, runtime) = runtime();
        assert_eq!(
            runtime.handle_command(CMD_PING, None, None),
            Envelope::response_ok("pong").with_command(CMD_PING)
        );
    }

    #[test]
    fn test_unknown_command() {
        let (_dir, runtime) = runtime();
        let reply = runtime.handle_command("reformat_disk", None, None);
        assert_eq!(
            reply,
            Envelope::response_error("Unknown command").with_command("reformat_disk")
        );
    }

    #[test]
    fn test_inline_download_round_trips_bytes() {
        let (_dir, runtime) = runtime();
        let original: Vec<u8> = (0u8..=255).collect();
        let encoded = base64::engine::general_purpose::STANDARD.encode(&original);

        let reply = runtime.handle_command(
            CMD_DOWNLOAD,
            Some("blob.bin".to_string()),
            Some(encoded),
        );
        assert!(matches!(
            reply,
            Envelope::Response { ref status, .. } if status == "success"
        ));
        assert_eq!(runtime.store().read("blob.bin").unwrap(), original);
    }

    #[test]
    fn test_inline_download_requires_fields() {
        let (_dir, runtime) = runtime();
        let expected =
            Envelope::response_error("Missing filename or content").with_command(CMD_DOWNLOAD);
        let reply = runtime.handle_command(CMD_DOWNLOAD, Some("a.txt".to_string()), None);
        assert_eq!(reply, expected);
        let reply = runtime.handle_command(CMD_DOWNLOAD, None, Some("aGk=".to_string()));
        assert_eq!(reply, expected);
    }

    #[test]
    fn test_inline_download_rejects_bad_base64() {
        let (_dir, runtime) = runtime();
        let reply = runtime.handle_command(
            CMD_DOWNLOAD,
            Some("a.txt".to_string()),
            Some("!!not-base64!!".to_string()),
        );
        assert!(matches!(
            reply,
            Envelope::Response { ref status, .. } if status == "error"
        ));
        assert!(!runtime.store().exists("a.txt"));
    }

    #[test]
    fn test_list_files() {
        let (_dir, runtime) = runtime();
        runtime.store().write("x.txt", b"1").unwrap();
        runtime.store().write("y.txt", b"2").unwrap();
        let reply = runtime.handle_command(CMD_LIST_FILES, None, None);
        assert_eq!(
            reply,
            Envelope::AgentFiles {
                files: vec!["x.txt".to_string(), "y.txt".to_string()]
            }
        );
    }

    #[test]
    fn test_delete_file() {
        let (_dir, runtime) = runtime();
        runtime.store().write("gone.txt", b"bye").unwrap();
        let reply =
            runtime.handle_command(CMD_DELETE_FILE, Some("gone.txt".to_string()), None);
        assert!(matches!(
            reply,
            Envelope::Response { ref status, .. } if status == "success"
        ));
        assert!(!runtime.store().exists("gone.txt"));

        let reply =
            runtime.handle_command(CMD_DELETE_FILE, Some("gone.txt".to_string()), None);
        assert_eq!(
            reply,
            Envelope::response_error("File not found").with_command(CMD_DELETE_FILE)
        );
        let reply = runtime.handle_command(CMD_DELETE_FILE, None, None);
        assert_eq!(
            reply,
            Envelope::response_error("Missing filename").with_command(CMD_DELETE_FILE)
        );
    }

    #[tokio::test]
    async fn test_frame_dispatch_ignores_acks_and_noise() {
        let (_dir, runtime) = runtime();
        // Server ack has no type tag; must not generate a reply.
        assert_eq!(runtime.handle_frame(r#"{"status":"ok"}"#).await, None);
        assert_eq!(runtime.handle_frame("garbage").await, None);
        // Broadcasts the agent can observe but should not answer.
        assert_eq!(
            runtime
                .handle_frame(r#"{"type":"agent_status","connected":true}"#)
                .await,
            None
        );

        let reply = runtime
            .handle_frame(r#"{"type":"command","command":"ping"}"#)
            .await;
        assert_eq!(
            reply,
            Some(Envelope::response_ok("pong").with_command(CMD_PING))
        );
    }

    #[tokio::test]
    async fn test_dropped_shutdown_sender_stops_reconnect_loop() {
        // Reserve a port with nothing listening so connect attempts fail fast.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        let config = AgentConfig {
            server_url: format!("ws://127.0.0.1:{port}"),
            reconnect_base_ms: 10_000,
            reconnect_cap_ms: 10_000,
            ..Default::default()
        };
        let runtime = AgentRuntime::new(config, store);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        drop(shutdown_tx);
        // With the sender gone the loop must exit rather than spin through
        // reconnects with a cancelled backoff sleep.
        tokio::time::timeout(Duration::from_secs(2), run_agent(runtime, shutdown_rx))
            .await
            .expect("agent loop should stop when the shutdown channel is gone")
            .unwrap();
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        for attempt in 1..=10 {
            let delay = backoff_delay(5_000, 80_000, attempt).as_millis() as u64;
            let nominal = (5_000u64 * 2u64.pow(attempt - 1)).min(80_000);
            // Jitter stays within +-50% of the nominal delay.
            assert!(delay >= nominal / 2, "attempt {attempt}: {delay} too small");
            assert!(
                delay <= nominal + nominal / 2,
                "attempt {attempt}: {delay} too large"
            );
        }
    }

    #[test]
    fn test_backoff_handles_zero_base() {
        assert_eq!(backoff_delay(0, 0, 3), Duration::ZERO);
    }

    #[test]
    fn test_http_base_url_mapping() {
        assert_eq!(http_base_url("ws://host:8000"), "http://host:8000");
        assert_eq!(http_base_url("wss://relay.example.com/"), "https://relay.example.com");
        assert_eq!(http_base_url("http://host"), "http://host");
    }
}
