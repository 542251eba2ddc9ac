//! Daemon server.
//!
//! Wires the sandbox provider, session registry, connection gate and
//! listener together and owns the shutdown sequence.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::gate::ConnectionGate;
use crate::sandbox::{LocalSandboxProvider, SandboxProvider};
use crate::session::CleanupReport;
use crate::transport::Listener;

/// Reason sent to every client when the daemon stops.
pub const REASON_SHUTDOWN: &str = "server shutting down";

/// The daemon: accepts connections until shut down, then destroys every
/// session.
pub struct Server {
    config: Config,
    gate: Arc<ConnectionGate>,
    shutdown: CancellationToken,
}

impl Server {
    /// Creates a server backed by local directory sandboxes.
    pub fn new(config: Config) -> Result<Self> {
        let provider = LocalSandboxProvider::from_config(&config);
        std::fs::create_dir_all(provider.root()).with_context(|| {
            format!(
                "Failed to create sandbox directory: {}",
                provider.root().display()
            )
        })?;
        info!(root = %provider.root().display(), "Using local sandboxes");
        Ok(Self::with_provider(config, Arc::new(provider)))
    }

    /// Creates a server with a custom sandbox provider.
    pub fn with_provider(config: Config, provider: Arc<dyn SandboxProvider>) -> Self {
        let gate = Arc::new(ConnectionGate::from_config(&config, provider));
        Self {
            config,
            gate,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn gate(&self) -> &Arc<ConnectionGate> {
        &self.gate
    }

    /// Token that stops [`Server::run`] when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Binds the configured listen address.
    pub async fn listen(&self) -> Result<Listener> {
        let endpoint = self.config.network.endpoint()?;
        Listener::bind(&endpoint)
            .await
            .with_context(|| format!("Failed to listen on {}", endpoint))
    }

    /// Serves `listener` until shutdown, then destroys every session.
    pub async fn run(&self, listener: Listener) -> CleanupReport {
        listener
            .serve(Arc::clone(&self.gate), self.shutdown.clone())
            .await;

        info!("Shutting down");
        let report = self.gate.registry().cleanup_all(REASON_SHUTDOWN).await;
        info!(
            sessions = report.sessions,
            failed = report.failed,
            "Shutdown complete"
        );
        report
    }

    /// Requests shutdown.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}
