//! Authentication gate.
//!
//! Every new connection must send `auth` within the configured deadline.
//! The credential is resolved to an identity by an [`Authenticator`] and
//! the connection is attached to that identity's session. Anything else the
//! client sends before authenticating is dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use protocol::{Connection, Link, Message};
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::sandbox::SandboxProvider;
use crate::session::{Session, SessionRegistry};

/// Why a connection failed to authenticate.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("authentication timed out")]
    Timeout,

    #[error("{0}")]
    Rejected(String),

    #[error("invalid auth id")]
    InvalidIdentity,

    #[error("connection closed")]
    Disconnected,
}

/// Resolves an `auth` credential to a session identity.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, link: &Link, credential: Value) -> Result<String, AuthError>;
}

/// Every connection is its own identity; the credential is ignored.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConnectionIdAuth;

#[async_trait]
impl Authenticator for ConnectionIdAuth {
    async fn authenticate(&self, link: &Link, _credential: Value) -> Result<String, AuthError> {
        Ok(link.id().clone())
    }
}

/// Static token table. The credential must be a known token string.
#[derive(Debug, Default, Clone)]
pub struct TokenAuth {
    tokens: HashMap<String, String>,
}

impl TokenAuth {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl Authenticator for TokenAuth {
    async fn authenticate(&self, _link: &Link, credential: Value) -> Result<String, AuthError> {
        let Value::String(token) = credential else {
            return Err(AuthError::Rejected("token must be a string".to_string()));
        };
        self.tokens
            .get(&token)
            .cloned()
            .ok_or_else(|| AuthError::Rejected("invalid token".to_string()))
    }
}

/// Authenticates connections and hands them to sessions.
pub struct ConnectionGate {
    registry: Arc<SessionRegistry>,
    authenticator: Arc<dyn Authenticator>,
    auth_timeout: Duration,
}

impl ConnectionGate {
    pub fn new(
        registry: Arc<SessionRegistry>,
        authenticator: Arc<dyn Authenticator>,
        auth_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            authenticator,
            auth_timeout,
        }
    }

    /// Builds a gate from configuration. Without configured tokens every
    /// connection gets its own session.
    pub fn from_config(config: &Config, provider: Arc<dyn SandboxProvider>) -> Self {
        let authenticator: Arc<dyn Authenticator> = if config.auth.tokens.is_empty() {
            Arc::new(ConnectionIdAuth)
        } else {
            Arc::new(TokenAuth::new(config.auth.tokens.clone()))
        };
        let registry = Arc::new(SessionRegistry::new(provider, config.session.clone()));
        Self::new(registry, authenticator, config.session.auth_timeout())
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Handles a new connection in the background.
    pub fn accept(self: &Arc<Self>, connection: Connection) -> JoinHandle<()> {
        let gate = Arc::clone(self);
        tokio::spawn(async move {
            let _ = gate.handle(connection).await;
        })
    }

    /// Authenticates `connection` and attaches it to its session.
    ///
    /// On failure the client receives `fatal("auth failed: <reason>")` and
    /// is disconnected.
    pub async fn handle(&self, mut connection: Connection) -> Result<Arc<Session>, AuthError> {
        let connection_id = connection.id().clone();
        debug!(connection_id = %connection_id, "Connection awaiting auth");

        let identity = match self.authenticate(&mut connection).await {
            Ok(identity) => identity,
            Err(AuthError::Disconnected) => {
                debug!(connection_id = %connection_id, "Disconnected before auth");
                return Err(AuthError::Disconnected);
            }
            Err(e) => {
                warn!(connection_id = %connection_id, error = %e, "Authentication failed");
                connection
                    .link
                    .send(Message::fatal(format!("auth failed: {}", e)));
                connection.link.disconnect();
                return Err(e);
            }
        };
        info!(connection_id = %connection_id, identity = %identity, "Authenticated");
        if connection.link.is_closed() {
            debug!(connection_id = %connection_id, "Disconnected during auth");
            return Err(AuthError::Disconnected);
        }

        loop {
            let session = self.registry.session_for(&identity);
            match session.attach_connection(connection) {
                Ok(()) => return Ok(session),
                Err(returned) => {
                    debug!(identity = %identity, "Session went away during attach, retrying");
                    connection = returned;
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    async fn authenticate(&self, connection: &mut Connection) -> Result<String, AuthError> {
        let identity = tokio::time::timeout(self.auth_timeout, async {
            let credential = loop {
                match connection.recv().await {
                    Some(Message::Auth(credential)) => break credential,
                    Some(message) => {
                        debug!(
                            connection_id = %connection.id(),
                            channel = %message.channel(),
                            "Dropping message before auth"
                        );
                    }
                    None => return Err(AuthError::Disconnected),
                }
            };
            self.authenticator
                .authenticate(&connection.link, credential)
                .await
        })
        .await
        .map_err(|_| AuthError::Timeout)??;

        if identity.is_empty() {
            return Err(AuthError::InvalidIdentity);
        }
        Ok(identity)
    }
}

impl std::fmt::Debug for ConnectionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionGate")
            .field("registry", &self.registry)
            .field("auth_timeout", &self.auth_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::testing::FakeProvider;
    use serde_json::json;

    fn gate(authenticator: Arc<dyn Authenticator>) -> ConnectionGate {
        let registry = Arc::new(SessionRegistry::new(
            FakeProvider::new(),
            SessionConfig::default(),
        ));
        ConnectionGate::new(registry, authenticator, Duration::from_millis(100))
    }

    fn tokens() -> Arc<dyn Authenticator> {
        let mut tokens = HashMap::new();
        tokens.insert("secret".to_string(), "alice".to_string());
        tokens.insert("empty".to_string(), String::new());
        Arc::new(TokenAuth::new(tokens))
    }

    #[tokio::test]
    async fn test_token_auth_attaches_to_identity() {
        let gate = gate(tokens());
        let (server, client) = Connection::pair();

        client.link.send(Message::Auth(json!("secret")));
        let session = gate.handle(server).await.unwrap();

        assert_eq!(session.identity(), "alice");
        assert_eq!(session.connection_count(), 1);
        assert!(Arc::ptr_eq(&session, &gate.registry().session_for("alice")));
    }

    #[tokio::test]
    async fn test_connections_with_same_token_share_session() {
        let gate = gate(tokens());
        let (server_a, client_a) = Connection::pair();
        let (server_b, client_b) = Connection::pair();

        client_a.link.send(Message::Auth(json!("secret")));
        client_b.link.send(Message::Auth(json!("secret")));
        let a = gate.handle(server_a).await.unwrap();
        let b = gate.handle(server_b).await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.connection_count(), 2);
    }

    #[tokio::test]
    async fn test_rejected_token_gets_fatal() {
        let gate = gate(tokens());
        let (server, mut client) = Connection::pair();

        client.link.send(Message::Auth(json!("wrong")));
        let result = gate.handle(server).await;

        assert_eq!(result.err(), Some(AuthError::Rejected("invalid token".to_string())));
        assert_eq!(client.recv().await, Some(Message::fatal("auth failed: invalid token")));
        assert_eq!(client.recv().await, None);
    }

    #[tokio::test]
    async fn test_empty_identity_is_rejected() {
        let gate = gate(tokens());
        let (server, mut client) = Connection::pair();

        client.link.send(Message::Auth(json!("empty")));
        let result = gate.handle(server).await;

        assert_eq!(result.err(), Some(AuthError::InvalidIdentity));
        assert_eq!(client.recv().await, Some(Message::fatal("auth failed: invalid auth id")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_timeout() {
        let gate = gate(Arc::new(ConnectionIdAuth));
        let (server, mut client) = Connection::pair();

        let result = gate.handle(server).await;

        assert_eq!(result.err(), Some(AuthError::Timeout));
        assert_eq!(
            client.recv().await,
            Some(Message::fatal("auth failed: authentication timed out"))
        );
        assert!(gate.registry().is_empty());
    }

    #[tokio::test]
    async fn test_messages_before_auth_are_dropped() {
        let gate = gate(Arc::new(ConnectionIdAuth));
        let (server, client) = Connection::pair();
        let server_id = server.id().clone();

        client.link.send(Message::Exec(protocol::ExecRequest {
            process_id: 1,
            command: json!("echo"),
            args: json!([]),
            options: json!({}),
        }));
        client.link.send(Message::Auth(json!(null)));
        let session = gate.handle(server).await.unwrap();

        assert_eq!(session.identity(), server_id);
        assert_eq!(session.process_count(), 0);
    }

    /// Disconnects the connection while resolving the credential.
    struct HangingUpAuth;

    #[async_trait]
    impl Authenticator for HangingUpAuth {
        async fn authenticate(&self, link: &Link, _credential: Value) -> Result<String, AuthError> {
            link.disconnect();
            Ok("ghost".to_string())
        }
    }

    #[tokio::test]
    async fn test_disconnect_during_auth_creates_no_session() {
        let gate = gate(Arc::new(HangingUpAuth));
        let (server, client) = Connection::pair();

        client.link.send(Message::Auth(json!("anything")));

        assert_eq!(gate.handle(server).await.err(), Some(AuthError::Disconnected));
        assert!(gate.registry().is_empty());
        assert_eq!(gate.registry().tracked(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_before_auth() {
        let gate = gate(Arc::new(ConnectionIdAuth));
        let (server, client) = Connection::pair();

        client.link.disconnect();

        assert_eq!(gate.handle(server).await.err(), Some(AuthError::Disconnected));
    }
}
