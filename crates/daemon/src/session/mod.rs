//! Sessions.
//!
//! A session groups every connection that authenticated with the same
//! identity. It owns at most one sandbox, created lazily by the first call
//! or exec that needs it, and tears everything down when it is destroyed:
//! because sandbox creation failed, because it sat without connections for
//! the idle timeout, or because the server is shutting down.

mod dispatch;
pub mod registry;

pub use registry::{CleanupReport, SessionRegistry};

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use dashmap::DashMap;
use protocol::{Connection, ConnectionId, ErrorObject, Link, Message, ProcessId};
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::process::ProcessHandle;
use crate::request::ValidationError;
use crate::sandbox::{Sandbox, SandboxError, SandboxProvider};

/// Reason sent to clients when sandbox creation fails.
pub const REASON_INTERNAL_ERROR: &str = "internal server error";

/// Reason sent when the idle timeout fires.
pub const REASON_TIMEOUT: &str = "time out";

/// Errors surfaced by session operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session destroyed")]
    Destroyed,

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl SessionError {
    /// Converts to the wire error carried by acks and process events.
    pub fn to_error_object(&self) -> ErrorObject {
        match self {
            SessionError::Destroyed => ErrorObject::new(self.to_string()),
            SessionError::Sandbox(e) => e.to_error_object(),
            SessionError::Validation(e) => e.to_error_object(),
        }
    }
}

type ProcessKey = (ConnectionId, ProcessId);

/// All connections of one identity plus the sandbox they share.
pub struct Session {
    identity: String,
    provider: Arc<dyn SandboxProvider>,
    config: SessionConfig,
    me: Weak<Session>,
    sandbox: OnceCell<Result<Arc<dyn Sandbox>, SessionError>>,
    connections: DashMap<ConnectionId, Link>,
    processes: DashMap<ProcessKey, Arc<ProcessHandle>>,
    idle: Mutex<Option<CancellationToken>>,
    destroying: CancellationToken,
    destroyed: CancellationToken,
    outcome: OnceCell<Result<(), SessionError>>,
}

impl Session {
    /// Creates an empty session. No sandbox exists until one is needed.
    pub fn new(
        identity: impl Into<String>,
        provider: Arc<dyn SandboxProvider>,
        config: SessionConfig,
    ) -> Arc<Self> {
        let identity = identity.into();
        debug!(identity = %identity, "Created session");

        Arc::new_cyclic(|me| Self {
            identity,
            provider,
            config,
            me: me.clone(),
            sandbox: OnceCell::new(),
            connections: DashMap::new(),
            processes: DashMap::new(),
            idle: Mutex::new(None),
            destroying: CancellationToken::new(),
            destroyed: CancellationToken::new(),
            outcome: OnceCell::new(),
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    /// Whether a sandbox has been created successfully.
    pub fn has_sandbox(&self) -> bool {
        matches!(self.sandbox.get(), Some(Ok(_)))
    }

    /// Whether the idle timer is armed.
    pub fn is_idle(&self) -> bool {
        self.lock_idle().is_some()
    }

    /// Whether destruction has begun.
    pub fn is_destroying(&self) -> bool {
        self.destroying.is_cancelled()
    }

    /// Whether destruction has completed.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.is_cancelled()
    }

    /// Resolves once destruction has begun.
    pub async fn destroying(&self) {
        self.destroying.cancelled().await
    }

    /// Resolves once destruction has completed.
    pub async fn destroyed(&self) {
        self.destroyed.cancelled().await
    }

    fn lock_idle(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the sandbox, creating it on first use.
    ///
    /// Creation happens once; every caller shares its outcome, so all
    /// callers waiting on a failed creation see the same error. A failed
    /// creation destroys the session.
    pub async fn sandbox(&self) -> Result<Arc<dyn Sandbox>, SessionError> {
        if self.is_destroying() {
            return Err(SessionError::Destroyed);
        }

        let created = self
            .sandbox
            .get_or_init(|| async {
                let result = self.provider.create().await;
                match &result {
                    Ok(sandbox) => {
                        info!(identity = %self.identity, sandbox = sandbox.name(), "Created sandbox");
                    }
                    Err(e) => {
                        warn!(identity = %self.identity, error = %e, "Failed to create sandbox");
                        if let Some(session) = self.me.upgrade() {
                            tokio::spawn(async move {
                                let _ = session.destroy(REASON_INTERNAL_ERROR).await;
                            });
                        }
                    }
                }
                result.map_err(SessionError::from)
            })
            .await;

        match created {
            Ok(_) if self.is_destroying() => Err(SessionError::Destroyed),
            outcome => outcome.clone(),
        }
    }

    /// Adds an authenticated connection and starts serving it.
    ///
    /// A session that is already being destroyed hands the connection back
    /// so the caller can attach it elsewhere.
    pub fn attach_connection(&self, connection: Connection) -> Result<(), Connection> {
        let Some(session) = self.me.upgrade() else {
            return Err(connection);
        };
        if connection.link.is_closed() {
            debug!(identity = %self.identity, connection_id = %connection.id(), "Ignoring closed connection");
            let mut idle = self.lock_idle();
            if self.connections.is_empty() && idle.is_none() && !self.is_destroying() {
                *idle = Some(self.arm_idle_timer());
            }
            return Ok(());
        }

        {
            let mut idle = self.lock_idle();
            if self.is_destroying() {
                return Err(connection);
            }
            self.connections
                .insert(connection.id().clone(), connection.link.clone());
            if let Some(timer) = idle.take() {
                timer.cancel();
            }
        }

        info!(
            identity = %self.identity,
            connection_id = %connection.id(),
            connections = self.connections.len(),
            "Attached connection"
        );
        tokio::spawn(dispatch::serve(session, connection));
        Ok(())
    }

    /// Removes a connection and hangs up the processes it started.
    ///
    /// The idle timer is armed when this was the last connection.
    pub fn detach_connection(&self, connection_id: &ConnectionId) {
        let removed = {
            let mut idle = self.lock_idle();
            let removed = self.connections.remove(connection_id);
            if removed.is_some() && self.connections.is_empty() && !self.is_destroying() {
                *idle = Some(self.arm_idle_timer());
            }
            removed
        };
        let Some((_, link)) = removed else {
            return;
        };

        debug!(identity = %self.identity, connection_id = %connection_id, "Detached connection");
        self.orphan_processes(connection_id);
        link.release_streams();
    }

    fn arm_idle_timer(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let timeout = self.config.session_timeout();
        debug!(identity = %self.identity, timeout_ms = timeout.as_millis() as u64, "Session idle");

        let Some(session) = self.me.upgrade() else {
            return token;
        };
        let timer = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    {
                        let idle = session.lock_idle();
                        if timer.is_cancelled() || idle.is_none() {
                            return;
                        }
                    }
                    let _ = session.destroy(REASON_TIMEOUT).await;
                }
            }
        });
        token
    }

    fn orphan_processes(&self, connection_id: &ConnectionId) {
        let keys: Vec<ProcessKey> = self
            .processes
            .iter()
            .filter(|entry| &entry.key().0 == connection_id)
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            if let Some((_, handle)) = self.processes.remove(&key) {
                handle.orphan();
            }
        }
    }

    /// Tracks a process until it finishes.
    fn track_process(&self, key: ProcessKey, handle: Arc<ProcessHandle>) {
        self.processes.insert(key.clone(), handle.clone());

        let Some(session) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            handle.finished().await;
            session
                .processes
                .remove_if(&key, |_, tracked| Arc::ptr_eq(tracked, &handle));
        });
    }

    /// Destroys the session.
    ///
    /// Every connection receives `fatal(reason)` and is dropped, then the
    /// sandbox is destroyed, waiting for an in-flight creation first.
    /// Repeated calls share the outcome of the first.
    pub async fn destroy(&self, reason: &str) -> Result<(), SessionError> {
        self.outcome
            .get_or_init(|| self.teardown(reason.to_string()))
            .await
            .clone()
    }

    async fn teardown(&self, reason: String) -> Result<(), SessionError> {
        {
            let mut idle = self.lock_idle();
            self.destroying.cancel();
            if let Some(timer) = idle.take() {
                timer.cancel();
            }
        }
        info!(identity = %self.identity, reason = %reason, "Destroying session");

        let connections: Vec<(ConnectionId, Link)> = self
            .connections
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        for (connection_id, link) in connections {
            link.send(Message::fatal(reason.as_str()));
            link.disconnect();
            self.connections.remove(&connection_id);
            self.orphan_processes(&connection_id);
            link.release_streams();
        }

        // Either waits for a creation already in flight or makes sure none
        // starts from now on.
        let created = self
            .sandbox
            .get_or_init(|| async { Err(SessionError::Destroyed) })
            .await;

        let result = match created {
            Ok(sandbox) => match sandbox.destroy().await {
                Ok(()) => {
                    info!(identity = %self.identity, sandbox = sandbox.name(), "Destroyed sandbox");
                    Ok(())
                }
                Err(e) => {
                    warn!(
                        identity = %self.identity,
                        sandbox = sandbox.name(),
                        error = %e,
                        "Failed to destroy sandbox"
                    );
                    Err(SessionError::Sandbox(e))
                }
            },
            Err(_) => Ok(()),
        };

        self.destroyed.cancel();
        result
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.identity)
            .field("connections", &self.connections.len())
            .field("processes", &self.processes.len())
            .field("destroying", &self.is_destroying())
            .finish()
    }
}
