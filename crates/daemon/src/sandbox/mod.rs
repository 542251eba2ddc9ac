//! Sandbox engine boundary.
//!
//! A session never talks to an execution environment directly. It asks a
//! [`SandboxProvider`] for a [`Sandbox`] and uses the two capabilities the
//! sandbox exposes: [`FileOps`] for the acked file calls and
//! [`ProcessSpawner`] for `exec`.

pub mod local;

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use protocol::{ErrorObject, ExitStatus, StreamData};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

pub use local::LocalSandboxProvider;
pub use protocol::FsOptions;

/// Errors raised by a sandbox backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SandboxError {
    /// The sandbox could not be created.
    #[error("failed to create sandbox: {0}")]
    Creation(String),

    /// The sandbox could not be torn down.
    #[error("failed to destroy sandbox: {0}")]
    Destroy(String),

    /// A file operation failed.
    #[error("{message}")]
    Io {
        message: String,
        code: Option<String>,
    },

    /// A process could not be started.
    #[error("{message}")]
    Spawn {
        message: String,
        code: Option<String>,
    },

    /// Kill or resize failed.
    #[error("process control failed: {0}")]
    Control(String),

    /// The backend does not support the request.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl SandboxError {
    /// File operation error with an errno-like code.
    pub fn io(message: impl Into<String>, code: impl Into<String>) -> Self {
        SandboxError::Io {
            message: message.into(),
            code: Some(code.into()),
        }
    }

    /// Spawn error from an I/O failure.
    pub fn spawn(err: &io::Error) -> Self {
        SandboxError::Spawn {
            message: err.to_string(),
            code: errno_code(err),
        }
    }

    /// Errno-like code, when the backend supplied one.
    pub fn code(&self) -> Option<&str> {
        match self {
            SandboxError::Io { code, .. } | SandboxError::Spawn { code, .. } => code.as_deref(),
            SandboxError::Unsupported(_) => Some("ENOTSUP"),
            _ => None,
        }
    }

    /// Converts to the wire error carried by acks and process events.
    pub fn to_error_object(&self) -> ErrorObject {
        ErrorObject {
            message: self.to_string(),
            code: self.code().map(str::to_string),
        }
    }
}

impl From<io::Error> for SandboxError {
    fn from(err: io::Error) -> Self {
        SandboxError::Io {
            message: err.to_string(),
            code: errno_code(&err),
        }
    }
}

/// Maps an I/O error onto a symbolic errno name such as `ENOENT`.
pub fn errno_code(err: &io::Error) -> Option<String> {
    if let Some(raw) = err.raw_os_error() {
        return Some(format!("{:?}", nix::errno::Errno::from_raw(raw)));
    }
    let code = match err.kind() {
        io::ErrorKind::NotFound => "ENOENT",
        io::ErrorKind::PermissionDenied => "EACCES",
        io::ErrorKind::AlreadyExists => "EEXIST",
        io::ErrorKind::InvalidInput => "EINVAL",
        _ => return None,
    };
    Some(code.to_string())
}

/// File capability of a sandbox. Paths are interpreted by the sandbox.
#[async_trait]
pub trait FileOps: Send + Sync {
    /// Reads a whole file, failing if it is larger than `max_size` bytes.
    async fn read_file(&self, path: &str, max_size: u64) -> Result<Vec<u8>, SandboxError>;

    /// Replaces the contents of a file.
    async fn write_file(&self, path: &str, data: Vec<u8>) -> Result<(), SandboxError>;

    /// Creates directories.
    async fn mkdir(&self, paths: &[String], options: FsOptions) -> Result<(), SandboxError>;

    /// Removes files or directories.
    async fn rm(&self, paths: &[String], options: FsOptions) -> Result<(), SandboxError>;

    /// Copies `sources` to `dest`.
    async fn cp(&self, sources: &[String], dest: &str, options: FsOptions)
        -> Result<(), SandboxError>;

    /// Creates `link` pointing at `target`.
    async fn ln(&self, target: &str, link: &str, options: FsOptions) -> Result<(), SandboxError>;
}

/// What to run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnRequest {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    /// Full environment overrides, terminal defaults already merged in.
    pub env: HashMap<String, String>,
    /// Run under a pseudo-terminal with one combined stdio descriptor.
    pub term: bool,
    /// Descriptors beyond stdio, numbered from 3.
    pub extra_streams: usize,
}

/// One descriptor of a spawned process as seen from the daemon.
///
/// `input` carries data towards the process, `output` data it produced.
/// A closed `output` channel is end of stream; dropping `input` closes the
/// descriptor on the process side.
#[derive(Debug, Default)]
pub struct ProcessFd {
    pub input: Option<mpsc::Sender<StreamData>>,
    pub output: Option<mpsc::Receiver<StreamData>>,
}

impl ProcessFd {
    /// A descriptor the process reads from.
    pub fn readable(input: mpsc::Sender<StreamData>) -> Self {
        Self {
            input: Some(input),
            output: None,
        }
    }

    /// A descriptor the process writes to.
    pub fn writable(output: mpsc::Receiver<StreamData>) -> Self {
        Self {
            input: None,
            output: Some(output),
        }
    }

    /// A bidirectional descriptor.
    pub fn duplex(input: mpsc::Sender<StreamData>, output: mpsc::Receiver<StreamData>) -> Self {
        Self {
            input: Some(input),
            output: Some(output),
        }
    }
}

/// Control surface of a running process.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Delivers the named signal, e.g. `SIGTERM`.
    async fn kill(&self, signal: &str) -> Result<(), SandboxError>;

    /// Resizes the process terminal.
    async fn resize(&self, cols: u16, rows: u16) -> Result<(), SandboxError>;
}

/// A process the backend has started and attached.
pub struct SpawnedProcess {
    pub control: Arc<dyn ProcessControl>,
    /// Descriptors in fd order: one combined descriptor in terminal mode,
    /// otherwise stdin, stdout, stderr, then the extras.
    pub stdio: Vec<ProcessFd>,
    /// Resolves once with the termination status.
    pub exit: oneshot::Receiver<ExitStatus>,
}

impl std::fmt::Debug for SpawnedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnedProcess")
            .field("stdio", &self.stdio.len())
            .finish()
    }
}

/// Process capability of a sandbox.
#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    /// Starts a process. Resolving successfully means the process attached.
    async fn spawn(&self, request: SpawnRequest) -> Result<SpawnedProcess, SandboxError>;
}

/// An isolated execution environment.
#[async_trait]
pub trait Sandbox: FileOps + ProcessSpawner {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Releases every resource held by the sandbox.
    async fn destroy(&self) -> Result<(), SandboxError>;
}

/// Creates sandboxes on demand.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn Sandbox>, SandboxError>;
}
