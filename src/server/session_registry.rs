use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::server::server_session::SessionHandle;

#[derive(Debug)]
pub enum Admission {
    /// the identity is known - the transport connection continues an existing session
    Resume(SessionHandle),
    /// a new session was created for the identity
    Create(SessionHandle),
    /// the identity is unknown, but the initiator claims to have received data in it
    Reject,
}

/// Sessions of the responding side by identity. Entries outlive transport connections, they
///  are removed only when the session is over.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<FxHashMap<String, SessionHandle>>,
}

impl SessionRegistry {
    /// Looks up the session for an identity, creating one if the initiator starts from
    ///  scratch. Lookup and creation are atomic with regard to concurrent handshakes with the
    ///  same identity.
    pub async fn admit(&self, identity: &str, peer_last_received: u64, create: impl FnOnce() -> SessionHandle) -> Admission {
        let mut sessions = self.sessions.write().await;

        if let Some(handle) = sessions.get(identity) {
            if !handle.is_closed() {
                return Admission::Resume(handle.clone());
            }
            debug!("session {} is over, but was not unregistered yet", identity);
            sessions.remove(identity);
        }

        if peer_last_received != 0 {
            return Admission::Reject;
        }

        let handle = create();
        sessions.insert(identity.to_string(), handle.clone());
        Admission::Create(handle)
    }

    pub async fn remove(&self, identity: &str) {
        self.sessions.write().await.remove(identity);
    }

    #[cfg(test)]
    pub async fn contains(&self, identity: &str) -> bool {
        self.sessions.read().await.contains_key(identity)
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    #[cfg(test)]
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
