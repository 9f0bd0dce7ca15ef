//! Fan-out of one message to every live connection.

use bytes::Bytes;
use tracing::{debug, warn};

use crate::registry::{ConnectionId, DeliveryFailure, Registry};

pub const SERVER_TAG: &str = "SERVER";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Server,
    User(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub origin: Origin,
    pub payload: Bytes,
}

impl Message {
    pub fn server(text: impl Into<String>) -> Self {
        Self {
            origin: Origin::Server,
            payload: Bytes::from(text.into()),
        }
    }

    pub fn from_user(name: impl Into<String>, payload: Bytes) -> Self {
        Self {
            origin: Origin::User(name.into()),
            payload,
        }
    }

    pub fn joined(name: &str) -> Self {
        Self::server(format!("{name} has joined the chat"))
    }

    pub fn left(name: &str) -> Self {
        Self::server(format!("{name} has left the chat"))
    }

    /// Bytes as they go out on the wire: `[<tag>]: <text>`.
    ///
    /// User payloads that are not valid UTF-8 are sent untouched.
    pub fn render(&self) -> Bytes {
        let tag = match &self.origin {
            Origin::Server => SERVER_TAG,
            Origin::User(name) => name.as_str(),
        };

        match std::str::from_utf8(&self.payload) {
            Ok(text) => Bytes::from(format!("[{tag}]: {text}")),
            Err(err) => {
                warn!(from = tag, error = %err, "payload is not valid utf-8, relaying as is");
                self.payload.clone()
            }
        }
    }
}

/// Queues `message` for every live connection except `exclude`.
///
/// Server notices ignore `exclude` and reach everyone. A connection whose
/// queue is closed or full is evicted from the registry and closed; delivery
/// to the rest continues. Returns how many connections the message was queued to.
pub fn broadcast(registry: &Registry, message: &Message, exclude: Option<ConnectionId>) -> usize {
    let exclude = match message.origin {
        Origin::Server => None,
        Origin::User(_) => exclude,
    };
    let payload = message.render();
    let mut delivered = 0;

    for (id, entry) in registry.snapshot() {
        if Some(id) == exclude {
            continue;
        }

        match entry.handle.send(payload.clone()) {
            Ok(()) => delivered += 1,
            Err(failure) => evict(registry, id, failure),
        }
    }

    delivered
}

fn evict(registry: &Registry, id: ConnectionId, failure: DeliveryFailure) {
    // Concurrent broadcasts may both see the failure; only one wins the removal.
    let Some(entry) = registry.remove(id) else {
        return;
    };
    entry.handle.close();

    let name = entry.info.map(|info| info.name);
    match failure {
        DeliveryFailure::Closed => debug!(%id, ?name, "dropping connection whose writer has stopped"),
        DeliveryFailure::Backlogged => warn!(%id, ?name, "dropping connection that stopped reading"),
    }
}
