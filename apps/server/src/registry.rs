//! Session registry
//!
//! Maps tunnel identifiers to live sessions. Lookups only hold the read lock long
//! enough to clone an `Arc`, so traffic on unrelated sessions never waits on
//! registration or teardown of another.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};
use warren_common::validation::validate_subdomain;
use warren_common::{Result, TunnelError};

use crate::multiplexer::Session;

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the session's identifier to it
    ///
    /// Fails with `DuplicateIdentifier` while another session holds the identifier;
    /// that session is left untouched.
    pub async fn register(&self, session: Arc<Session>) -> Result<()> {
        validate_subdomain(session.id())
            .map_err(|e| TunnelError::InvalidIdentifier(e.to_string()))?;

        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(session.id()) {
            return Err(TunnelError::DuplicateIdentifier(session.id().to_string()));
        }

        info!(
            "Registered tunnel {} (connection {})",
            session.id(),
            session.connection_id()
        );
        sessions.insert(session.id().to_string(), session);
        Ok(())
    }

    pub async fn lookup(&self, id: &str) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| TunnelError::NotFound(id.to_string()))
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    /// Remove the session and fail its pending requests with `ConnectionLost`
    ///
    /// The registry entry is only removed if it still belongs to this session, so a
    /// late teardown can never evict a newer session holding the same identifier.
    /// Returns whether the entry was removed.
    pub async fn deregister(&self, session: &Session) -> bool {
        let removed = {
            let mut sessions = self.sessions.write().await;
            let owned = sessions
                .get(session.id())
                .is_some_and(|s| s.connection_id() == session.connection_id());
            if owned {
                sessions.remove(session.id());
            }
            owned
        };

        let failed = session.close();
        if removed {
            info!(
                "Deregistered tunnel {} ({} pending requests failed)",
                session.id(),
                failed
            );
        } else {
            debug!(
                "Tunnel {} connection {} was no longer registered",
                session.id(),
                session.connection_id()
            );
        }
        removed
    }

    /// Remove and close every session
    pub async fn close_all(&self) -> Vec<Arc<Session>> {
        let drained: Vec<Arc<Session>> = self
            .sessions
            .write()
            .await
            .drain()
            .map(|(_, s)| s)
            .collect();
        for session in &drained {
            session.close();
        }
        drained
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
