//! Configuration loading.
//!
//! JSON config file resolved from `FERRY_CONFIG_PATH`, then
//! `FERRY_STATE_DIR/ferry.json`, then `~/.ferry/ferry.json`. A missing file
//! yields defaults. Environment variables override individual fields so
//! deployments can inject secrets without writing them to disk.
//!
//! # Environment variables
//!
//! - `FERRY_CONFIG_PATH` - explicit config file path
//! - `FERRY_STATE_DIR` - state directory (config + default files dir)
//! - `FERRY_BIND` - server listen address
//! - `FERRY_API_KEY` - secure-file endpoint key
//! - `FERRY_AGENT_TOKEN` - adds/overrides an admin relay token
//! - `FERRY_FILES_DIR` - blob store directory

use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

use crate::auth::{Identity, IdentityRole, StaticTokenStore};

pub const DEFAULT_BIND: &str = "127.0.0.1:8000";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {message}")]
    ReadError { path: String, message: String },

    #[error("failed to parse config file {path}: {message}")]
    ParseError { path: String, message: String },

    #[error("invalid bind address {addr}: {message}")]
    InvalidBind { addr: String, message: String },
}

/// One relay credential from the token table.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenEntry {
    pub token: String,
    pub subject: String,
    #[serde(default)]
    pub role: TokenRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenRole {
    #[default]
    User,
    Admin,
}

/// Agent-side settings (`agent` section).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    /// WebSocket base URL of the relay server, e.g. `ws://host:8000`.
    pub server_url: String,
    /// Relay token presented in the `access_token` cookie.
    pub token: Option<String>,
    /// Key for the server's secure-file endpoint.
    pub api_key: Option<String>,
    pub files_dir: Option<PathBuf>,
    /// Base reconnect delay in milliseconds.
    pub reconnect_base_ms: u64,
    /// Upper bound on the backoff delay in milliseconds.
    pub reconnect_cap_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8000".to_string(),
            token: None,
            api_key: None,
            files_dir: None,
            reconnect_base_ms: 5_000,
            reconnect_cap_ms: 80_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct FerryConfig {
    pub bind: Option<String>,
    pub files_dir: Option<PathBuf>,
    /// Key required by `GET /secure-file/{name}`.
    pub api_key: Option<String>,
    /// When set, client relay sockets may connect without a token. Off by
    /// default: the relay accepts commands, so both channels are gated.
    pub allow_anonymous_clients: bool,
    pub tokens: Vec<TokenEntry>,
    pub agent: AgentConfig,
}

impl FerryConfig {
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = self.bind.as_deref().unwrap_or(DEFAULT_BIND);
        addr.parse().map_err(|e| ConfigError::InvalidBind {
            addr: addr.to_string(),
            message: format!("{e}"),
        })
    }

    pub fn files_dir(&self) -> PathBuf {
        self.files_dir
            .clone()
            .unwrap_or_else(|| state_dir().join("files"))
    }

    /// Build the identity store from the token table.
    pub fn identity_store(&self) -> StaticTokenStore {
        let entries = self
            .tokens
            .iter()
            .map(|t| {
                (
                    t.token.clone(),
                    Identity {
                        subject: t.subject.clone(),
                        role: match t.role {
                            TokenRole::Admin => IdentityRole::Admin,
                            TokenRole::User => IdentityRole::User,
                        },
                    },
                )
            })
            .collect();
        StaticTokenStore::new(entries)
    }
}

/// State directory: `FERRY_STATE_DIR` or `~/.ferry`.
pub fn state_dir() -> PathBuf {
    if let Ok(dir) = env::var("FERRY_STATE_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ferry")
}

/// Config file path: `FERRY_CONFIG_PATH` or `<state_dir>/ferry.json`.
pub fn config_path() -> PathBuf {
    if let Ok(path) = env::var("FERRY_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    state_dir().join("ferry.json")
}

/// Load the config file (defaults if absent) and apply env overrides.
pub fn load_config() -> Result<FerryConfig, ConfigError> {
    let path = config_path();
    let mut config = if path.exists() {
        let text = fs::read_to_string(&path).map_err(|e| ConfigError::ReadError {
            path: path.display().to_string(),
            message: format!("{e}"),
        })?;
        serde_json::from_str(&text).map_err(|e| ConfigError::ParseError {
            path: path.display().to_string(),
            message: format!("{e}"),
        })?
    } else {
        FerryConfig::default()
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

fn apply_env_overrides(config: &mut FerryConfig) {
    if let Ok(bind) = env::var("FERRY_BIND") {
        config.bind = Some(bind);
    }
    if let Ok(key) = env::var("FERRY_API_KEY") {
        config.api_key = Some(key.clone());
        if config.agent.api_key.is_none() {
            config.agent.api_key = Some(key);
        }
    }
    if let Ok(dir) = env::var("FERRY_FILES_DIR") {
        config.files_dir = Some(PathBuf::from(dir));
    }
    if let Ok(token) = env::var("FERRY_AGENT_TOKEN") {
        config.tokens.retain(|t| t.subject != "agent@env");
        config.tokens.push(TokenEntry {
            token: token.clone(),
            subject: "agent@env".to_string(),
            role: TokenRole::Admin,
        });
        if config.agent.token.is_none() {
            config.agent.token = Some(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::IdentityStore;

    #[test]
    fn test_defaults() {
        let config = FerryConfig::default();
        assert_eq!(config.bind_addr().unwrap().port(), 8000);
        assert!(!config.allow_anonymous_clients);
        assert!(config.identity_store().is_empty());
        assert_eq!(config.agent.reconnect_base_ms, 5_000);
    }

    #[test]
    fn test_parse_full_config() {
        let text = r#"{
            "bind": "0.0.0.0:9100",
            "apiKey": "k",
            "allowAnonymousClients": true,
            "tokens": [
                {"token": "t1", "subject": "ops@example.com", "role": "admin"},
                {"token": "t2", "subject": "user@example.com"}
            ],
            "agent": {"serverUrl": "wss://relay.example.com", "reconnectBaseMs": 1000}
        }"#;
        let config: FerryConfig = serde_json::from_str(text).unwrap();
        assert_eq!(config.bind_addr().unwrap().port(), 9100);
        assert!(config.allow_anonymous_clients);
        assert_eq!(config.agent.server_url, "wss://relay.example.com");
        assert_eq!(config.agent.reconnect_base_ms, 1000);
        // Defaulted fields in a partial agent section survive.
        assert_eq!(config.agent.reconnect_cap_ms, 80_000);

        let store = config.identity_store();
        assert!(store.validate("t1").unwrap().is_admin());
        assert!(!store.validate("t2").unwrap().is_admin());
        assert!(store.validate("t3").is_none());
    }

    #[test]
    fn test_invalid_bind_is_reported() {
        let config = FerryConfig {
            bind: Some("nonsense".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            config.bind_addr(),
            Err(ConfigError::InvalidBind { .. })
        ));
    }
}
