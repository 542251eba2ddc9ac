//! # Boxwire Daemon Library
//!
//! This crate provides the server side of Boxwire: remote clients
//! authenticate, get a session bound to their identity, run file operations
//! against that session's sandbox and spawn processes whose stdio and
//! control signals are relayed live over the same connection.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           Server                                │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  Listener (TCP / Unix)  ──►  ConnectionGate (auth + timeout)    │
//! │                                     │                           │
//! │                              SessionRegistry                    │
//! │                                     │                           │
//! │  ┌──────────────────────────────────▼────────────────────────┐  │
//! │  │ Session: connections, lazy sandbox, idle timer, destroy   │  │
//! │  │   ├── file calls  ──►  FileOps                            │  │
//! │  │   └── exec ──► ProcessHandle ──► ProcessSpawner           │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, Server};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let server = Server::new(config)?;
//!     let listener = server.listen().await?;
//!
//!     // Call `server.stop()` from elsewhere to shut down.
//!     let report = server.run(listener).await;
//!     assert!(report.is_clean());
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`gate`]: Authentication of new connections
//! - [`session`]: Sessions and the session registry
//! - [`process`]: Server side of one spawned process
//! - [`request`]: Validation of call and exec arguments
//! - [`sandbox`]: Sandbox engine traits and the local backend
//! - [`transport`]: Socket listener
//! - [`server`]: Top-level wiring and shutdown

pub mod config;
pub mod gate;
pub mod process;
pub mod request;
pub mod sandbox;
pub mod server;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

// Re-export protocol for convenience
pub use protocol;

pub use config::{Config, ConfigError};
pub use gate::{AuthError, Authenticator, ConnectionGate, ConnectionIdAuth, TokenAuth};
pub use process::ProcessHandle;
pub use request::{ExecSpec, FileRequest, ValidationError};
pub use sandbox::{
    FileOps, FsOptions, LocalSandboxProvider, ProcessControl, ProcessFd, ProcessSpawner, Sandbox,
    SandboxError, SandboxProvider, SpawnRequest, SpawnedProcess,
};
pub use server::{Server, REASON_SHUTDOWN};
pub use session::{CleanupReport, Session, SessionError, SessionRegistry};
pub use transport::Listener;
