//! Server module
//!
//! HTTP collaborator routes plus the WebSocket relay endpoints.

pub mod http;
pub mod startup;
pub mod ws;

use std::sync::Arc;
use std::time::Instant;

use crate::auth::IdentityStore;
use crate::config::FerryConfig;
use crate::registry::Registry;
use crate::relay::Relay;
use crate::storage::{BlobStore, StorageError};

/// Shared state handed to every connection handler. The registry inside the
/// relay is the only mutable piece.
pub struct RelayState {
    pub relay: Relay,
    pub store: BlobStore,
    pub identity: Arc<dyn IdentityStore>,
    /// Key guarding the secure-file endpoint. `None` disables it.
    pub api_key: Option<String>,
    pub allow_anonymous_clients: bool,
    pub start_time: Instant,
}

impl RelayState {
    pub fn from_config(config: &FerryConfig) -> Result<Arc<Self>, StorageError> {
        let store = BlobStore::open(config.files_dir())?;
        Ok(Arc::new(Self {
            relay: Relay::new(Arc::new(Registry::new())),
            store,
            identity: Arc::new(config.identity_store()),
            api_key: config.api_key.clone(),
            allow_anonymous_clients: config.allow_anonymous_clients,
            start_time: Instant::now(),
        }))
    }
}
