//! Live observer sessions and best-effort fan-out.
//!
//! Each session gets a bounded outbound channel drained by its own socket
//! task. Publishing never awaits a slow observer: a session whose channel
//! is full or closed is removed on the spot and the publish carries on with
//! the rest.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use dronelink_types::{Envelope, Protocol};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identifier of one observer session.
pub type SessionId = Uuid;

/// Per-session outbound buffer depth.
pub const SESSION_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
struct Session {
    peer: SocketAddr,
    protocol: Protocol,
    tx: mpsc::Sender<String>,
}

/// Set of authenticated observer sessions.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    sessions: Mutex<HashMap<SessionId, Session>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session and return its id plus the receiving end of its
    /// outbound channel.
    pub fn register(
        &self,
        peer: SocketAddr,
        protocol: Protocol,
    ) -> (SessionId, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
        let id = Uuid::new_v4();
        let total = {
            let mut sessions = self.lock();
            sessions.insert(id, Session { peer, protocol, tx });
            sessions.len()
        };
        info!(session = %id, %peer, ?protocol, clients = total, "observer registered");
        (id, rx)
    }

    /// Remove a session. Returns `false` if it was already gone.
    pub fn deregister(&self, id: SessionId) -> bool {
        let removed = self.lock().remove(&id);
        match removed {
            Some(session) => {
                info!(session = %id, peer = %session.peer, "observer deregistered");
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Serialise `envelope` once and hand it to every session.
    ///
    /// Sessions that cannot accept the message are removed. Returns the
    /// number of sessions that received it.
    pub fn publish(&self, envelope: &Envelope) -> usize {
        let text = match envelope.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(kind = envelope.kind(), error = %e, "envelope not serialisable; skipped");
                return 0;
            }
        };

        let mut sessions = self.lock();
        let before = sessions.len();
        sessions.retain(|id, session| match session.tx.try_send(text.clone()) {
            Ok(()) => true,
            Err(e) => {
                debug!(
                    session = %id,
                    peer = %session.peer,
                    protocol = ?session.protocol,
                    error = %e,
                    "dropping unreachable observer"
                );
                false
            }
        });
        let delivered = sessions.len();
        if delivered < before {
            info!(
                removed = before - delivered,
                clients = delivered,
                kind = envelope.kind(),
                "removed failed observers during publish"
            );
        }
        delivered
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
