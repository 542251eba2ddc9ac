//! Client connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use dashmap::DashMap;
use protocol::{
    Ack, AckId, Call, CallMethod, Connection, Endpoint, ExecOptions, ExecRequest, FsOptions, Link,
    Message, ProcessId, ProcessMessage,
};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ClientError, Result};
use crate::process::RemoteProcess;

/// A connection to a Boxwire server.
///
/// Cheap to clone; all clones share the connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    link: Link,
    next_ack: AtomicU64,
    next_process: AtomicU64,
    pending: DashMap<AckId, oneshot::Sender<Ack>>,
    processes: DashMap<ProcessId, mpsc::UnboundedSender<ProcessMessage>>,
    fatal: Mutex<Option<String>>,
    /// Cancelled once every inbound message has been handled.
    finished: CancellationToken,
}

impl ClientInner {
    pub(crate) fn link(&self) -> &Link {
        &self.link
    }

    fn fatal(&self) -> MutexGuard<'_, Option<String>> {
        self.fatal.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Why the connection is gone.
    pub(crate) fn closed_error(&self) -> ClientError {
        match self.fatal().clone() {
            Some(reason) => ClientError::Fatal(reason),
            None => ClientError::Disconnected,
        }
    }
}

impl Client {
    /// Authenticates over `connection` with `credential`.
    ///
    /// Authentication completes asynchronously on the server; requests made
    /// right away are queued behind it. A rejected credential surfaces as
    /// [`ClientError::Fatal`] on the first request.
    pub fn connect(connection: Connection, credential: Value) -> Self {
        let inner = Arc::new(ClientInner {
            link: connection.link.clone(),
            next_ack: AtomicU64::new(0),
            next_process: AtomicU64::new(0),
            pending: DashMap::new(),
            processes: DashMap::new(),
            fatal: Mutex::new(None),
            finished: CancellationToken::new(),
        });

        connection.link.send(Message::Auth(credential));
        tokio::spawn(receive_loop(Arc::clone(&inner), connection));

        Self { inner }
    }

    /// Opens a socket to `endpoint` and authenticates.
    pub async fn connect_to(endpoint: &Endpoint, credential: Value) -> Result<Self> {
        let connection = protocol::connect(endpoint).await?;
        Ok(Self::connect(connection, credential))
    }

    pub fn link(&self) -> &Link {
        &self.inner.link
    }

    /// Whether the connection is gone.
    pub fn is_closed(&self) -> bool {
        self.inner.link.is_closed()
    }

    /// Reason of the `fatal` message the server sent, if any.
    pub fn fatal_reason(&self) -> Option<String> {
        self.inner.fatal().clone()
    }

    /// Resolves once the connection is gone, with the reason.
    pub async fn closed(&self) -> ClientError {
        self.inner.finished.cancelled().await;
        self.inner.closed_error()
    }

    /// Closes the connection.
    pub fn disconnect(&self) {
        self.inner.link.disconnect();
    }

    async fn call(&self, method: CallMethod, args: Vec<Value>) -> Result<Option<Value>> {
        if self.is_closed() {
            return Err(self.inner.closed_error());
        }

        let ack = self.inner.next_ack.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(ack, tx);

        debug!(ack, method = %method, "Calling");
        if !self.inner.link.send(Message::Call(Call { ack, method, args })) {
            self.inner.pending.remove(&ack);
            return Err(self.inner.closed_error());
        }

        let reply = rx.await.map_err(|_| self.inner.closed_error())?;
        match reply.error {
            Some(error) => Err(ClientError::Remote(error)),
            None => Ok(reply.result),
        }
    }

    /// Reads a whole file.
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let result = self.call(CallMethod::ReadFile, vec![json!(path)]).await?;
        match result {
            Some(Value::String(data)) => BASE64
                .decode(data.as_bytes())
                .map_err(|e| ClientError::UnexpectedResponse(e.to_string())),
            other => Err(ClientError::UnexpectedResponse(format!(
                "readFile returned {:?}",
                other
            ))),
        }
    }

    /// Reads a whole file as UTF-8.
    pub async fn read_to_string(&self, path: &str) -> Result<String> {
        let data = self.read_file(path).await?;
        String::from_utf8(data).map_err(|e| ClientError::UnexpectedResponse(e.to_string()))
    }

    /// Replaces the contents of a file.
    pub async fn write_file(&self, path: &str, data: impl AsRef<[u8]>) -> Result<()> {
        let data = BASE64.encode(data.as_ref());
        self.call(
            CallMethod::WriteFile,
            vec![json!(path), json!(data), json!("base64")],
        )
        .await?;
        Ok(())
    }

    /// Creates directories.
    pub async fn mkdir(&self, paths: &[&str], options: FsOptions) -> Result<()> {
        self.call(CallMethod::Mkdir, vec![json!(paths), options_arg(options)])
            .await?;
        Ok(())
    }

    /// Removes files or directories.
    pub async fn rm(&self, paths: &[&str], options: FsOptions) -> Result<()> {
        self.call(CallMethod::Rm, vec![json!(paths), options_arg(options)])
            .await?;
        Ok(())
    }

    /// Copies `sources` to `dest`.
    pub async fn cp(&self, sources: &[&str], dest: &str, options: FsOptions) -> Result<()> {
        let mut paths: Vec<&str> = sources.to_vec();
        paths.push(dest);
        self.call(CallMethod::Cp, vec![json!(paths), options_arg(options)])
            .await?;
        Ok(())
    }

    /// Creates `link` pointing at `target`.
    pub async fn ln(&self, target: &str, link: &str, options: FsOptions) -> Result<()> {
        self.call(
            CallMethod::Ln,
            vec![json!([target, link]), options_arg(options)],
        )
        .await?;
        Ok(())
    }

    /// Starts a process.
    ///
    /// The returned handle exists immediately; its streams and control calls
    /// wait until the server reports the process attached.
    pub fn exec(&self, command: &str, args: &[&str], options: ExecOptions) -> RemoteProcess {
        let process_id = self.inner.next_process.fetch_add(1, Ordering::Relaxed);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.inner.processes.insert(process_id, events_tx);

        let process = RemoteProcess::new(Arc::clone(&self.inner), process_id, &options, events_rx);

        let options = serde_json::to_value(&options).unwrap_or(Value::Null);
        debug!(process_id, command, "Exec");
        let sent = self.inner.link.send(Message::Exec(ExecRequest {
            process_id,
            command: json!(command),
            args: json!(args),
            options,
        }));
        if !sent {
            // Dropping the sender reports the process as disconnected.
            self.inner.processes.remove(&process_id);
        }
        process
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("link", &self.inner.link)
            .field("pending", &self.inner.pending.len())
            .field("processes", &self.inner.processes.len())
            .finish()
    }
}

fn options_arg(options: FsOptions) -> Value {
    serde_json::to_value(options).unwrap_or(Value::Null)
}

async fn receive_loop(inner: Arc<ClientInner>, mut connection: Connection) {
    while let Some(message) = connection.recv().await {
        match message {
            Message::Ack(ack) => match inner.pending.remove(&ack.ack) {
                Some((_, tx)) => {
                    let _ = tx.send(ack);
                }
                None => debug!(ack = ack.ack, "Ack for unknown call"),
            },
            Message::Process(frame) => {
                let finished = matches!(
                    frame.message,
                    ProcessMessage::Exit { .. } | ProcessMessage::Error(_)
                );
                let delivered = inner
                    .processes
                    .get(&frame.process_id)
                    .map(|events| events.send(frame.message).is_ok())
                    .unwrap_or(false);
                if !delivered {
                    debug!(process_id = frame.process_id, "Event for unknown process");
                }
                if finished {
                    inner.processes.remove(&frame.process_id);
                }
            }
            Message::Stream(envelope) => {
                connection.link.route_stream(&envelope.stream_id, envelope.frame);
            }
            Message::Fatal(fatal) => {
                warn!(reason = %fatal.reason, "Server sent fatal");
                *inner.fatal() = Some(fatal.reason);
            }
            other => debug!(channel = %other.channel(), "Ignoring client-bound message"),
        }
    }

    debug!(connection_id = %connection.id(), "Disconnected");
    // Dropping the senders fails pending calls and tells each process its
    // connection is gone.
    inner.pending.clear();
    inner.processes.clear();
    connection.link.release_streams();
    inner.finished.cancel();
}
