//! Session registry.
//!
//! Maps identities to live sessions. A session that starts being destroyed
//! is replaced for new connections at once but stays tracked until its
//! teardown settles, so shutdown cleanup still waits for it.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::join_all;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::Session;
use crate::config::SessionConfig;
use crate::sandbox::SandboxProvider;

/// Outcome of [`SessionRegistry::cleanup_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Sessions that were destroyed.
    pub sessions: usize,
    /// Sessions whose sandbox failed to tear down.
    pub failed: usize,
}

impl CleanupReport {
    /// Whether every teardown succeeded.
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

/// Thread-safe registry of sessions.
pub struct SessionRegistry {
    provider: Arc<dyn SandboxProvider>,
    config: SessionConfig,
    /// Live sessions by identity.
    active: Arc<DashMap<String, Arc<Session>>>,
    /// Every session not yet fully destroyed, including replaced ones.
    tracked: Arc<DashMap<Uuid, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new(provider: Arc<dyn SandboxProvider>, config: SessionConfig) -> Self {
        Self {
            provider,
            config,
            active: Arc::new(DashMap::new()),
            tracked: Arc::new(DashMap::new()),
        }
    }

    /// Returns the live session for `identity`, creating one if there is
    /// none or the current one is being destroyed.
    pub fn session_for(&self, identity: &str) -> Arc<Session> {
        let created = match self.active.entry(identity.to_string()) {
            Entry::Occupied(entry) if !entry.get().is_destroying() => {
                return entry.get().clone();
            }
            Entry::Occupied(mut entry) => {
                debug!(identity = %identity, "Replacing session that is being destroyed");
                let session = self.create(identity);
                entry.insert(session.clone());
                session
            }
            Entry::Vacant(entry) => {
                let session = self.create(identity);
                entry.insert(session.clone());
                session
            }
        };

        self.watch(created.clone());
        created
    }

    /// Returns the live session for `identity`, if any.
    pub fn get(&self, identity: &str) -> Option<Arc<Session>> {
        self.active
            .get(identity)
            .map(|entry| entry.value().clone())
            .filter(|session| !session.is_destroying())
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Number of sessions not yet fully destroyed.
    pub fn tracked(&self) -> usize {
        self.tracked.len()
    }

    fn create(&self, identity: &str) -> Arc<Session> {
        info!(identity = %identity, "Creating session");
        Session::new(identity, self.provider.clone(), self.config.clone())
    }

    fn watch(&self, session: Arc<Session>) {
        let key = Uuid::new_v4();
        self.tracked.insert(key, session.clone());

        let active = self.active.clone();
        let tracked = self.tracked.clone();
        tokio::spawn(async move {
            session.destroying().await;
            active.remove_if(session.identity(), |_, current| Arc::ptr_eq(current, &session));

            session.destroyed().await;
            tracked.remove(&key);
            debug!(identity = %session.identity(), "Session removed");
        });
    }

    /// Destroys every session, waiting for all teardowns to settle.
    pub async fn cleanup_all(&self, reason: &str) -> CleanupReport {
        let sessions: Vec<Arc<Session>> = self
            .tracked
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        info!(sessions = sessions.len(), reason = %reason, "Cleaning up sessions");
        let results = join_all(sessions.iter().map(|session| session.destroy(reason))).await;

        let failed = results.iter().filter(|result| result.is_err()).count();
        if failed > 0 {
            warn!(failed, "Some sessions failed to clean up");
        }
        CleanupReport {
            sessions: sessions.len(),
            failed,
        }
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("active", &self.active.len())
            .field("tracked", &self.tracked.len())
            .finish()
    }
}
