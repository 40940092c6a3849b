use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use parley_proto::{ConnectionId, ServerMessage};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::RelayError;

/// Queue feeding a connection's writer task.
pub type Outbound = mpsc::UnboundedSender<ServerMessage>;

/// Live endpoint tracked by the relay
struct EndpointRecord {
    id: ConnectionId,
    display_name: Option<String>,
    outbound: Outbound,
}

impl EndpointRecord {
    /// Name the endpoint is addressed and listed by
    fn identity(&self) -> String {
        self.display_name
            .clone()
            .unwrap_or_else(|| self.id.to_string())
    }

    /// A record stays registered until its socket task unregisters it, but once the writer
    /// task has gone away nothing can be delivered to it.
    fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    fn answers_to(&self, target: &str) -> bool {
        self.display_name.as_deref() == Some(target) || self.id.to_string() == target
    }

    fn push(&self, message: ServerMessage) {
        if self.outbound.send(message).is_err() {
            debug!(connection_id = self.id, "dropping message for closed connection");
        }
    }
}

struct RegistryInner {
    next_id: ConnectionId,
    endpoints: BTreeMap<ConnectionId, EndpointRecord>,
}

impl RegistryInner {
    fn roster(&self) -> Vec<String> {
        self.endpoints
            .values()
            .filter(|record| record.is_open())
            .map(EndpointRecord::identity)
            .collect()
    }

    fn broadcast_roster(&self) {
        let users = self.roster();
        debug!(count = users.len(), "broadcasting roster");
        for record in self.endpoints.values().filter(|record| record.is_open()) {
            record.push(ServerMessage::UserList {
                users: users.clone(),
            });
        }
    }

    fn name_taken(&self, candidate: &str, requester: ConnectionId) -> bool {
        self.endpoints.values().any(|record| {
            record.id != requester && record.display_name.as_deref() == Some(candidate)
        })
    }
}

/// Process-wide set of connected endpoints.
///
/// Every read used for routing and every mutation runs under one lock, and roster broadcasts
/// are queued while that lock is held. Delivery goes through unbounded per-connection queues,
/// so the lock is never held across I/O.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl Registry {
    /// Identifiers start at `seed` and increase by one per connection.
    pub fn new(seed: ConnectionId) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                next_id: seed,
                endpoints: BTreeMap::new(),
            })),
        }
    }

    /// Seed identifiers from the wall clock so they do not repeat across restarts.
    pub fn seeded_from_clock() -> Self {
        let seed = chrono::Utc::now().timestamp_millis().max(0) as ConnectionId;
        Self::new(seed)
    }

    /// Store a new endpoint, tell it its id and broadcast the updated roster.
    pub fn register(&self, outbound: Outbound) -> ConnectionId {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;

        let record = EndpointRecord {
            id,
            display_name: None,
            outbound,
        };
        record.push(ServerMessage::Id { id });
        inner.endpoints.insert(id, record);
        info!(connection_id = id, total = inner.endpoints.len(), "endpoint registered");

        inner.broadcast_roster();
        id
    }

    /// Normalize and claim a display name, appending the smallest free numeric suffix on
    /// collision. Replies `username-accepted` to the requester and broadcasts the roster.
    pub fn set_username(&self, id: ConnectionId, proposed: &str) -> Result<String, RelayError> {
        let base = normalize_username(proposed).ok_or(RelayError::InvalidUsername)?;

        let mut inner = self.inner.lock();
        if !inner.endpoints.contains_key(&id) {
            warn!(connection_id = id, "username proposed by unregistered connection");
            return Err(RelayError::TargetUnavailable(id.to_string()));
        }

        let mut candidate = base.clone();
        let mut suffix: u64 = 1;
        while inner.name_taken(&candidate, id) {
            candidate = format!("{base}{suffix}");
            suffix += 1;
        }

        if let Some(record) = inner.endpoints.get_mut(&id) {
            record.display_name = Some(candidate.clone());
            record.push(ServerMessage::UsernameAccepted {
                username: candidate.clone(),
            });
        }
        info!(connection_id = id, username = %candidate, "username accepted");

        inner.broadcast_roster();
        Ok(candidate)
    }

    /// Deliver a message built from the sender's identity to the open endpoint named `target`.
    ///
    /// Returns the sender identity that was stamped on the message.
    pub fn deliver<F>(&self, from: ConnectionId, target: &str, build: F) -> Result<String, RelayError>
    where
        F: FnOnce(String) -> ServerMessage,
    {
        let inner = self.inner.lock();
        let sender_identity = inner
            .endpoints
            .get(&from)
            .map(EndpointRecord::identity)
            .unwrap_or_else(|| from.to_string());

        // A display name wins over a numeric id that happens to spell the same string.
        let open = || inner.endpoints.values().filter(|record| record.is_open());
        let recipient = open()
            .find(|record| record.display_name.as_deref() == Some(target))
            .or_else(|| open().find(|record| record.answers_to(target)))
            .ok_or_else(|| RelayError::TargetUnavailable(target.to_string()))?;

        recipient.push(build(sender_identity.clone()));
        Ok(sender_identity)
    }

    /// Queue a message for a single connection.
    pub fn send_to(&self, id: ConnectionId, message: ServerMessage) {
        if let Some(record) = self.inner.lock().endpoints.get(&id) {
            record.push(message);
        }
    }

    /// Remove an endpoint and broadcast the updated roster. Returns false if it was unknown.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let mut inner = self.inner.lock();
        let removed = inner.endpoints.remove(&id).is_some();
        if removed {
            info!(connection_id = id, total = inner.endpoints.len(), "endpoint unregistered");
            inner.broadcast_roster();
        }
        removed
    }

    /// Names (or ids, for unnamed endpoints) of every open endpoint, in connection order.
    pub fn roster(&self) -> Vec<String> {
        self.inner.lock().roster()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Trim and lowercase a proposed name; `None` when nothing is left.
pub fn normalize_username(proposed: &str) -> Option<String> {
    let normalized = proposed.trim().to_lowercase();
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}
