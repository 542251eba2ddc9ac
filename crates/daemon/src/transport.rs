//! Listener for client connections.
//!
//! Accepts TCP or Unix domain socket connections and hands each one, framed
//! as newline-delimited JSON, to the [`ConnectionGate`].

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use protocol::{spawn_connection, Connection, Endpoint};
use tokio::net::{TcpListener, UnixListener};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::gate::ConnectionGate;

enum Inner {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

/// A bound listening socket.
pub struct Listener {
    inner: Inner,
}

impl Listener {
    /// Binds to `endpoint`.
    ///
    /// For Unix sockets, missing parent directories are created and a stale
    /// socket file at the path is removed first.
    pub async fn bind(endpoint: &Endpoint) -> Result<Self, io::Error> {
        let inner = match endpoint {
            Endpoint::Tcp(addr) => Inner::Tcp(TcpListener::bind(addr).await?),
            Endpoint::Unix(path) => {
                prepare_socket_path(path)?;
                Inner::Unix {
                    listener: UnixListener::bind(path)?,
                    path: path.clone(),
                }
            }
        };
        Ok(Self { inner })
    }

    /// The address actually bound, with the port resolved for TCP.
    pub fn local_endpoint(&self) -> Result<Endpoint, io::Error> {
        match &self.inner {
            Inner::Tcp(listener) => Ok(Endpoint::Tcp(listener.local_addr()?.to_string())),
            Inner::Unix { path, .. } => Ok(Endpoint::Unix(path.clone())),
        }
    }

    /// Accepts the next connection.
    pub async fn accept(&self) -> Result<Connection, io::Error> {
        let connection = match &self.inner {
            Inner::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                let connection = spawn_connection(stream);
                debug!(connection_id = %connection.id(), peer = %peer, "Accepted TCP connection");
                connection
            }
            Inner::Unix { listener, .. } => {
                let (stream, _addr) = listener.accept().await?;
                let connection = spawn_connection(stream);
                debug!(connection_id = %connection.id(), "Accepted Unix connection");
                connection
            }
        };
        Ok(connection)
    }

    /// Accepts connections until `shutdown` is cancelled.
    pub async fn serve(self, gate: Arc<ConnectionGate>, shutdown: CancellationToken) {
        info!(endpoint = %self.describe(), "Accepting connections");

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.accept() => accepted,
            };
            match accepted {
                Ok(connection) => {
                    gate.accept(connection);
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                }
            }
        }

        debug!("Listener stopped");
    }

    fn describe(&self) -> String {
        self.local_endpoint()
            .map(|endpoint| endpoint.to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Inner::Unix { path, .. } = &self.inner {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn prepare_socket_path(path: &Path) -> Result<(), io::Error> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::gate::ConnectionIdAuth;
    use crate::session::SessionRegistry;
    use crate::testing::FakeProvider;
    use protocol::{connect, Message};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::tempdir;

    fn gate() -> Arc<ConnectionGate> {
        let registry = Arc::new(SessionRegistry::new(
            FakeProvider::new(),
            SessionConfig::default(),
        ));
        Arc::new(ConnectionGate::new(
            registry,
            Arc::new(ConnectionIdAuth),
            Duration::from_millis(200),
        ))
    }

    #[tokio::test]
    async fn test_bind_unix_creates_parent_dirs() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("nested").join("dir").join("boxwire.sock");

        let listener = Listener::bind(&Endpoint::Unix(socket_path.clone())).await.unwrap();
        assert!(socket_path.exists());

        drop(listener);
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn test_bind_unix_removes_stale_socket() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("boxwire.sock");
        std::fs::write(&socket_path, b"stale").unwrap();

        let _listener = Listener::bind(&Endpoint::Unix(socket_path.clone())).await.unwrap();
        assert!(socket_path.exists());
    }

    #[tokio::test]
    async fn test_tcp_port_is_resolved() {
        let listener = Listener::bind(&Endpoint::Tcp("127.0.0.1:0".to_string()))
            .await
            .unwrap();
        match listener.local_endpoint().unwrap() {
            Endpoint::Tcp(addr) => assert!(!addr.ends_with(":0")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unauthenticated_client_gets_fatal() {
        let listener = Listener::bind(&Endpoint::Tcp("127.0.0.1:0".to_string()))
            .await
            .unwrap();
        let endpoint = listener.local_endpoint().unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(listener.serve(gate(), shutdown.clone()));

        let mut client = connect(&endpoint).await.unwrap();
        assert_eq!(
            client.recv().await,
            Some(Message::fatal("auth failed: authentication timed out"))
        );
        assert_eq!(client.recv().await, None);

        shutdown.cancel();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_authenticated_client_is_attached() {
        let listener = Listener::bind(&Endpoint::Tcp("127.0.0.1:0".to_string()))
            .await
            .unwrap();
        let endpoint = listener.local_endpoint().unwrap();
        let gate = gate();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(listener.serve(gate.clone(), shutdown.clone()));

        let client = connect(&endpoint).await.unwrap();
        client.link.send(Message::Auth(json!(null)));

        tokio::time::timeout(Duration::from_secs(5), async {
            while gate.registry().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        server.await.unwrap();
    }
}
