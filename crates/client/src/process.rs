//! Client side of a process channel.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use protocol::messages::{stdio_stream_id, terminal_stream_id};
use protocol::{
    ExecOptions, ExitStatus, Lifecycle, Link, Message, ProcessId, ProcessMessage, ProcessState,
    StreamData, StreamError, StreamMode, StreamMux,
};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::client::ClientInner;
use crate::error::{ClientError, Result};

/// Signal recorded for a process whose connection dropped.
pub const HANGUP: &str = "SIGHUP";

#[derive(Debug, Clone)]
struct Outcome {
    status: Option<ExitStatus>,
    error: Option<ClientError>,
}

/// A process started with [`Client::exec`](crate::Client::exec).
///
/// Control calls issued before the server confirms the process are buffered
/// and delivered in order once it attaches. In terminal mode stdin, stdout
/// and stderr are the same stream.
pub struct RemoteProcess {
    process_id: ProcessId,
    link: Link,
    lifecycle: Arc<Mutex<Lifecycle<ProcessMessage>>>,
    stdin: Arc<StreamMux>,
    stdout: Arc<StreamMux>,
    stderr: Arc<StreamMux>,
    extra: Vec<Arc<StreamMux>>,
    outcome: watch::Receiver<Option<Outcome>>,
}

impl RemoteProcess {
    pub(crate) fn new(
        client: Arc<ClientInner>,
        process_id: ProcessId,
        options: &ExecOptions,
        events: mpsc::UnboundedReceiver<ProcessMessage>,
    ) -> Self {
        let link = client.link().clone();
        let stream = |id: String, mode| StreamMux::new(link.clone(), id, mode, true);

        let (stdin, stdout, stderr) = if options.term {
            let tty = stream(terminal_stream_id(process_id), StreamMode::Raw);
            (Arc::clone(&tty), Arc::clone(&tty), tty)
        } else {
            (
                stream(stdio_stream_id(process_id, 0), StreamMode::Raw),
                stream(stdio_stream_id(process_id, 1), StreamMode::Raw),
                stream(stdio_stream_id(process_id, 2), StreamMode::Raw),
            )
        };
        let extra = (0..options.streams)
            .map(|i| {
                let object = options.streams_object_mode.get(i).copied().unwrap_or(false);
                let mode = if object {
                    StreamMode::Object
                } else {
                    StreamMode::Raw
                };
                stream(stdio_stream_id(process_id, 3 + i), mode)
            })
            .collect();

        let lifecycle = Arc::new(Mutex::new(Lifecycle::new()));
        let (outcome_tx, outcome) = watch::channel(None);

        let process = Self {
            process_id,
            link: link.clone(),
            lifecycle: Arc::clone(&lifecycle),
            stdin,
            stdout,
            stderr,
            extra,
            outcome,
        };

        tokio::spawn(handle_events(
            client,
            process_id,
            lifecycle,
            process.all_streams(),
            events,
            outcome_tx,
        ));
        process
    }

    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    pub fn state(&self) -> ProcessState {
        lock(&self.lifecycle).state()
    }

    pub fn stdin(&self) -> &Arc<StreamMux> {
        &self.stdin
    }

    pub fn stdout(&self) -> &Arc<StreamMux> {
        &self.stdout
    }

    pub fn stderr(&self) -> &Arc<StreamMux> {
        &self.stderr
    }

    /// Extra stream `index`, i.e. descriptor `3 + index`.
    pub fn stream(&self, index: usize) -> Option<&Arc<StreamMux>> {
        self.extra.get(index)
    }

    /// Writes one chunk to stdin.
    pub async fn write_stdin(&self, data: impl Into<Vec<u8>>) -> std::result::Result<(), StreamError> {
        self.stdin.write(StreamData::Bytes(data.into())).await
    }

    /// Ends stdin after any write still waiting for credit. In terminal mode
    /// this also stops reading output.
    pub fn close_stdin(&self) {
        self.stdin.finish();
    }

    /// Sends a signal, `SIGTERM` when `signal` is `None`.
    ///
    /// Returns false once the process has exited or failed.
    pub fn kill(&self, signal: Option<&str>) -> bool {
        self.control(ProcessMessage::Kill {
            signal: signal.map(str::to_string),
        })
    }

    /// Resizes the process terminal.
    pub fn resize(&self, cols: u16, rows: u16) -> bool {
        self.control(ProcessMessage::Resize { cols, rows })
    }

    fn control(&self, call: ProcessMessage) -> bool {
        let mut lifecycle = lock(&self.lifecycle);
        if !lifecycle.is_live() {
            return false;
        }
        if let Some(call) = lifecycle.submit(call) {
            self.link.send(Message::process(self.process_id, call));
        }
        true
    }

    /// Waits for the process to finish.
    ///
    /// Fails with the server's error if the process could not be started,
    /// and with the connection error if the connection dropped first.
    pub async fn wait(&self) -> Result<ExitStatus> {
        let mut outcome = self.outcome.clone();
        let finished = outcome
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ClientError::Disconnected)?
            .clone();

        match finished {
            Some(Outcome {
                error: Some(error), ..
            }) => Err(error),
            Some(Outcome {
                status: Some(status),
                ..
            }) => Ok(status),
            _ => Err(ClientError::Disconnected),
        }
    }

    /// Exit status, once known. A dropped connection reads as `SIGHUP`.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.outcome
            .borrow()
            .as_ref()
            .and_then(|outcome| outcome.status.clone())
    }

    /// Why the process failed, if it did.
    pub fn error(&self) -> Option<ClientError> {
        self.outcome
            .borrow()
            .as_ref()
            .and_then(|outcome| outcome.error.clone())
    }

    fn all_streams(&self) -> Vec<Arc<StreamMux>> {
        let mut streams = vec![Arc::clone(&self.stdin)];
        for stream in [&self.stdout, &self.stderr] {
            if !Arc::ptr_eq(stream, &self.stdin) {
                streams.push(Arc::clone(stream));
            }
        }
        streams.extend(self.extra.iter().cloned());
        streams
    }
}

impl std::fmt::Debug for RemoteProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteProcess")
            .field("process_id", &self.process_id)
            .field("state", &self.state())
            .finish()
    }
}

/// Reads `stream` to its end and concatenates the bytes.
pub async fn read_all(stream: &StreamMux) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(data) = stream.read().await {
        if let Some(bytes) = data.as_bytes() {
            out.extend_from_slice(bytes);
        }
    }
    out
}

fn lock(lifecycle: &Mutex<Lifecycle<ProcessMessage>>) -> MutexGuard<'_, Lifecycle<ProcessMessage>> {
    lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn handle_events(
    client: Arc<ClientInner>,
    process_id: ProcessId,
    lifecycle: Arc<Mutex<Lifecycle<ProcessMessage>>>,
    streams: Vec<Arc<StreamMux>>,
    mut events: mpsc::UnboundedReceiver<ProcessMessage>,
    outcome: watch::Sender<Option<Outcome>>,
) {
    let link = client.link().clone();

    while let Some(event) = events.recv().await {
        match event {
            ProcessMessage::Attach => {
                debug!(process_id, "Process attached");
                let mut lifecycle = lock(&lifecycle);
                if lifecycle.state() != ProcessState::Spawning {
                    continue;
                }
                let replay = lifecycle.attach();
                for stream in &streams {
                    stream.ready();
                }
                for call in replay.into_iter().chain(lifecycle.running()) {
                    link.send(Message::process(process_id, call));
                }
            }
            ProcessMessage::Error(error) => {
                debug!(process_id, error = %error, "Process failed");
                if !lock(&lifecycle).fail() {
                    continue;
                }
                for stream in &streams {
                    stream.abort();
                }
                outcome.send_replace(Some(Outcome {
                    status: None,
                    error: Some(ClientError::Remote(error)),
                }));
                return;
            }
            ProcessMessage::Exit {
                exit_code,
                signal_code,
            } => {
                let Some(status) = ExitStatus::from_parts(exit_code, signal_code) else {
                    debug!(process_id, "Exit event without status");
                    continue;
                };
                debug!(process_id, status = %status, "Process exited");
                if !lock(&lifecycle).exit(status.clone()) {
                    continue;
                }
                outcome.send_replace(Some(Outcome {
                    status: Some(status),
                    error: None,
                }));
                return;
            }
            ProcessMessage::Kill { .. } | ProcessMessage::Resize { .. } => {
                debug!(process_id, "Ignoring control call from server");
            }
        }
    }

    // Event channel closed without an outcome: the connection is gone.
    debug!(process_id, "Connection lost before exit");
    lock(&lifecycle).exit(ExitStatus::signal(HANGUP));
    for stream in &streams {
        stream.abort();
    }
    outcome.send_replace(Some(Outcome {
        status: Some(ExitStatus::signal(HANGUP)),
        error: Some(client.closed_error()),
    }));
}
