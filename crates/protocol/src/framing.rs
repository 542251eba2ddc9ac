//! Byte-stream transport.
//!
//! Messages travel as newline-delimited JSON [`Envelope`]s over TCP or a
//! Unix domain socket. [`spawn_connection`] turns any such byte stream into
//! a [`Connection`] by running a reader and a writer task; either task
//! closing tears the whole connection down.
//!
//! # Wire format
//!
//! ```text
//! {"version":1,"payload":{"type":"auth","data":"secret"}}\n
//! ```
//!
//! Lines longer than [`MAX_LINE_SIZE`] close the connection.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::{ProtocolError, Result};
use crate::link::{Connection, Link};
use crate::messages::{Envelope, Message};

/// Maximum encoded message size (16 MB).
pub const MAX_LINE_SIZE: usize = 16 * 1024 * 1024;

/// Prefix selecting a Unix domain socket in an endpoint string.
pub const UNIX_PREFIX: &str = "unix:";

/// Where a server listens or a client connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `host:port`.
    Tcp(String),
    /// Filesystem path of a Unix socket.
    Unix(PathBuf),
}

impl FromStr for Endpoint {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(path) = s.strip_prefix(UNIX_PREFIX) {
            if path.is_empty() {
                return Err(ProtocolError::InvalidEndpoint(s.to_string()));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(Endpoint::Tcp(s.to_string()))
            }
            _ => Err(ProtocolError::InvalidEndpoint(s.to_string())),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => f.write_str(addr),
            Endpoint::Unix(path) => write!(f, "{}{}", UNIX_PREFIX, path.display()),
        }
    }
}

/// Connects to a server.
pub async fn connect(endpoint: &Endpoint) -> Result<Connection> {
    let connection = match endpoint {
        Endpoint::Tcp(addr) => {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            spawn_connection(stream)
        }
        Endpoint::Unix(path) => spawn_connection(UnixStream::connect(path).await?),
    };
    debug!(endpoint = %endpoint, connection_id = %connection.id(), "Connected");
    Ok(connection)
}

/// Runs the reader and writer tasks for `stream` and returns the
/// connection they serve.
pub fn spawn_connection<S>(stream: S) -> Connection
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let closed = CancellationToken::new();

    let link = Link::new(Uuid::new_v4().to_string(), out_tx, closed.clone());
    let id = link.id().clone();

    tokio::spawn(write_loop(id.clone(), write_half, out_rx, closed.clone()));
    tokio::spawn(read_loop(id, read_half, in_tx, closed));

    Connection::new(link, in_rx)
}

async fn write_loop<W>(
    id: String,
    writer: W,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    closed: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(writer, LinesCodec::new_with_max_length(MAX_LINE_SIZE));

    loop {
        let message = tokio::select! {
            message = outbound.recv() => message,
            _ = closed.cancelled() => {
                // Flush what was queued before the disconnect, e.g. `fatal`.
                while let Ok(message) = outbound.try_recv() {
                    if write_message(&id, &mut sink, message).await.is_err() {
                        break;
                    }
                }
                break;
            }
        };
        let Some(message) = message else {
            break;
        };
        if let Err(e) = write_message(&id, &mut sink, message).await {
            debug!(connection_id = %id, error = %e, "Write failed");
            break;
        }
    }

    let _ = SinkExt::<String>::close(&mut sink).await;
    closed.cancel();
    debug!(connection_id = %id, "Writer stopped");
}

async fn write_message<W>(
    id: &str,
    sink: &mut FramedWrite<W, LinesCodec>,
    message: Message,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    trace!(connection_id = %id, channel = %message.channel(), "Sending message");
    let line = Envelope::new(message).to_json()?;
    sink.send(line)
        .await
        .map_err(|e| ProtocolError::ConnectionClosed(e.to_string()))
}

async fn read_loop<R>(
    id: String,
    reader: R,
    inbound: mpsc::UnboundedSender<Message>,
    closed: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_SIZE));

    loop {
        let line = tokio::select! {
            line = lines.next() => line,
            _ = closed.cancelled() => break,
        };
        let line = match line {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                warn!(connection_id = %id, error = %e, "Closing connection on framing error");
                break;
            }
            None => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        match Envelope::from_json(&line) {
            Ok(envelope) => {
                if inbound.send(envelope.payload).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(connection_id = %id, error = %e, "Dropping malformed message");
            }
        }
    }

    closed.cancel();
    debug!(connection_id = %id, "Reader stopped");
}
