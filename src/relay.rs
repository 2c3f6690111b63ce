//! Command relay routing engine.
//!
//! Classifies inbound frames by origin role and fans them out to the opposite
//! registry set. Every failure mode here is recovered locally: malformed
//! frames are answered to the sender, an empty target set is answered to the
//! sender, and a delivery failure to one peer never touches the others.
//! Nothing in this module tears down the relay loop.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::protocol::{ack_frame, Envelope};
use crate::registry::{Registry, Role};

/// What happened to one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Fanned out to `delivered` members of the target set.
    Forwarded { delivered: usize },
    /// Target set was empty; the sender was told, nothing was queued.
    NoPeer,
    /// Frame was not a valid envelope; the sender was told, nothing was
    /// forwarded.
    Malformed,
}

#[derive(Debug, Clone)]
pub struct Relay {
    registry: Arc<Registry>,
}

impl Relay {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Route a frame received from a client connection to the agent set.
    ///
    /// Delivery is at-most-once, best-effort, immediate only: with no agent
    /// connected the client gets an error envelope and the command is gone.
    pub fn route_from_client(&self, origin_id: &str, raw: &str) -> RouteOutcome {
        let envelope = match Envelope::parse(raw) {
            Ok(env) => env,
            Err(err) => {
                debug!(conn_id = %origin_id, error = %err, "malformed client frame");
                self.registry
                    .send_to(Role::Client, origin_id, &Envelope::error("Invalid JSON message"));
                return RouteOutcome::Malformed;
            }
        };

        if self.registry.count(Role::Agent) == 0 {
            self.registry
                .send_to(Role::Client, origin_id, &Envelope::error("No agent connected"));
            return RouteOutcome::NoPeer;
        }

        let frame = envelope.encode_frame();
        let delivered = self.registry.broadcast_frame(Role::Agent, &frame);
        debug!(
            conn_id = %origin_id,
            kind = envelope.type_name(),
            delivered = delivered,
            "client frame relayed to agents"
        );
        RouteOutcome::Forwarded { delivered }
    }

    /// Route a frame received from an agent connection to the client set and
    /// acknowledge it to the originating agent.
    pub fn route_from_agent(&self, origin_id: &str, raw: &str) -> RouteOutcome {
        let envelope = match Envelope::parse(raw) {
            Ok(env) => env,
            Err(err) => {
                debug!(conn_id = %origin_id, error = %err, "malformed agent frame");
                self.registry
                    .send_to(Role::Agent, origin_id, &Envelope::error("Invalid JSON message"));
                return RouteOutcome::Malformed;
            }
        };

        let frame = envelope.encode_frame();
        let delivered = self.registry.broadcast_frame(Role::Client, &frame);

        // Terminal download states also surface as a status_update broadcast
        // so dashboards need not understand the agent-side vocabulary.
        match &envelope {
            Envelope::DownloadComplete { file } => {
                info!(file = %file, "download completed");
                self.broadcast_status("done", file);
            }
            Envelope::DownloadFailed { file, error } => {
                warn!(file = %file, error = %error, "download failed");
                self.broadcast_status("failed", file);
            }
            _ => {}
        }

        self.registry
            .send_frame_to(Role::Agent, origin_id, &ack_frame());
        RouteOutcome::Forwarded { delivered }
    }

    /// Broadcast an agent connect/disconnect notification to all clients.
    pub fn broadcast_agent_status(&self, connected: bool) -> usize {
        self.registry
            .broadcast(Role::Client, &Envelope::AgentStatus { connected })
    }

    fn broadcast_status(&self, status: &str, file: &str) {
        self.registry.broadcast(
            Role::Client,
            &Envelope::StatusUpdate {
                status: status.to_string(),
                file: file.to_string(),
            },
        );
    }
}
