//! Connection registry.
//!
//! Thread-safe sets of active agent and client connections, partitioned by
//! role. All mutation goes through a `parking_lot::Mutex`; broadcasts clone a
//! snapshot of the outbound senders and iterate it outside the lock, so a
//! remove racing a broadcast is safe and a slow peer never holds the lock.
//!
//! Outbound frames travel over a per-connection unbounded channel drained by
//! that connection's sender task. A send here never blocks; a closed channel
//! means the peer's handler has exited and the entry is pruned.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::Identity;
use crate::protocol::Envelope;

/// Which registry set a connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Agent,
    Client,
}

/// A live duplex endpoint tracked by the registry. One entry per physical
/// connection; destroyed on disconnect, never reused.
#[derive(Debug)]
pub struct Connection {
    pub id: String,
    pub role: Role,
    /// Mandatory for agents; absent only for anonymous clients.
    pub identity: Option<Identity>,
    sender: mpsc::UnboundedSender<String>,
}

impl Connection {
    pub fn new(
        role: Role,
        identity: Option<Identity>,
        sender: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            identity,
            sender,
        }
    }

    fn send_frame(&self, frame: String) -> bool {
        self.sender.send(frame).is_ok()
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    agents: Mutex<HashMap<String, Connection>>,
    clients: Mutex<HashMap<String, Connection>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self, role: Role) -> &Mutex<HashMap<String, Connection>> {
        match role {
            Role::Agent => &self.agents,
            Role::Client => &self.clients,
        }
    }

    /// Add a connection to the set matching its role.
    ///
    /// The caller must have run the identity gate first; the registry itself
    /// performs no authentication.
    pub fn admit(&self, conn: Connection) {
        let role = conn.role;
        self.set(role).lock().insert(conn.id.clone(), conn);
    }

    /// Remove a connection. Idempotent: removing an absent id is a no-op.
    /// Returns whether an entry was actually removed, so disconnect
    /// notifications fire at most once per connection.
    pub fn remove(&self, role: Role, id: &str) -> bool {
        self.set(role).lock().remove(id).is_some()
    }

    pub fn count(&self, role: Role) -> usize {
        self.set(role).lock().len()
    }

    /// Send one envelope to a single connection. Returns false (and prunes
    /// the entry) if the peer's channel is gone.
    pub fn send_to(&self, role: Role, id: &str, envelope: &Envelope) -> bool {
        self.send_frame_to(role, id, &envelope.encode_frame())
    }

    /// Send a pre-encoded frame to a single connection.
    pub fn send_frame_to(&self, role: Role, id: &str, frame: &str) -> bool {
        let ok = {
            let set = self.set(role).lock();
            match set.get(id) {
                Some(conn) => conn.send_frame(frame.to_string()),
                None => return false,
            }
        };
        if !ok {
            self.remove(role, id);
        }
        ok
    }

    /// Fan an envelope out to every member of a set.
    ///
    /// Iterates a detached snapshot: members removed concurrently simply miss
    /// the frame, and a failed send to one member never aborts delivery to
    /// the rest. Dead members are pruned after the pass. Returns the number
    /// of successful deliveries.
    pub fn broadcast(&self, role: Role, envelope: &Envelope) -> usize {
        let frame = envelope.encode_frame();
        self.broadcast_frame(role, &frame)
    }

    /// Fan a pre-encoded frame out to every member of a set. Used by the
    /// relay to serialize (and size-check) once per fan-out.
    pub fn broadcast_frame(&self, role: Role, frame: &str) -> usize {
        let snapshot: Vec<(String, mpsc::UnboundedSender<String>)> = {
            let set = self.set(role).lock();
            set.values()
                .map(|c| (c.id.clone(), c.sender.clone()))
                .collect()
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, sender) in snapshot {
            if sender.send(frame.to_string()).is_ok() {
                delivered += 1;
            } else {
                dead.push(id);
            }
        }
        for id in dead {
            self.remove(role, &id);
        }
        delivered
    }
}
