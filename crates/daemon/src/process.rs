//! Server side of a process channel.
//!
//! A [`ProcessHandle`] exists from the moment a client asks for `exec` until
//! the process fails to start or exits. It owns the process's streams, which
//! stay in the waiting state until the backend confirms attach, and buffers
//! the client's control calls until then.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use protocol::{
    ErrorObject, ExitStatus, Lifecycle, Link, Message, ProcessId, ProcessMessage, ProcessState,
    StreamMux,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::request::{Direction, ExecSpec};
use crate::sandbox::{ProcessControl, ProcessFd, ProcessSpawner, SandboxError, SpawnedProcess};

/// Signal delivered to processes whose client went away.
pub const HANGUP: &str = "SIGHUP";

/// Signal used by `kill` without an explicit signal.
pub const DEFAULT_KILL_SIGNAL: &str = "SIGTERM";

struct HandleState {
    lifecycle: Lifecycle<ProcessMessage>,
    orphaned: bool,
    control_rx: Option<mpsc::UnboundedReceiver<ProcessMessage>>,
}

/// One process as seen from the connection that started it.
pub struct ProcessHandle {
    process_id: ProcessId,
    link: Link,
    streams: Vec<(Arc<StreamMux>, Direction)>,
    stream_timeout: Duration,
    state: Mutex<HandleState>,
    control_tx: mpsc::UnboundedSender<ProcessMessage>,
    finished: CancellationToken,
}

impl ProcessHandle {
    /// Creates the handle and its streams in the waiting state.
    pub fn new(link: Link, spec: &ExecSpec, stream_timeout: Duration) -> Arc<Self> {
        let streams = spec
            .streams()
            .into_iter()
            .map(|stream| {
                (
                    StreamMux::new(link.clone(), stream.id, stream.mode, true),
                    stream.direction,
                )
            })
            .collect();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            process_id: spec.process_id,
            link,
            streams,
            stream_timeout,
            state: Mutex::new(HandleState {
                lifecycle: Lifecycle::new(),
                orphaned: false,
                control_rx: Some(control_rx),
            }),
            control_tx,
            finished: CancellationToken::new(),
        })
    }

    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    pub fn state(&self) -> ProcessState {
        self.lock().lifecycle.state()
    }

    pub fn is_orphaned(&self) -> bool {
        self.lock().orphaned
    }

    /// The process streams in descriptor order.
    pub fn streams(&self) -> impl Iterator<Item = &Arc<StreamMux>> {
        self.streams.iter().map(|(stream, _)| stream)
    }

    /// Resolves once the process failed to start or exited.
    pub async fn finished(&self) {
        self.finished.cancelled().await
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    fn lock(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, message: ProcessMessage) {
        self.link.send(Message::process(self.process_id, message));
    }

    /// Spawns the process and wires it up.
    pub async fn run<S>(self: &Arc<Self>, spawner: &S, spec: &ExecSpec)
    where
        S: ProcessSpawner + ?Sized,
    {
        match spawner.spawn(spec.spawn_request()).await {
            Ok(spawned) => self.attach(spawned),
            Err(e) => self.fail(&e),
        }
    }

    /// Handles a control call from the client.
    ///
    /// Lifecycle events sent by the client are ignored.
    pub fn handle_message(&self, message: ProcessMessage) {
        if !message.is_control() {
            debug!(process_id = self.process_id, "Ignoring non-control process message");
            return;
        }
        let mut state = self.lock();
        if let Some(call) = state.lifecycle.submit(message) {
            let _ = self.control_tx.send(call);
        }
    }

    /// Fails the process before it attached.
    pub fn fail(&self, error: &SandboxError) {
        self.fail_with(error.to_error_object());
    }

    pub(crate) fn fail_with(&self, error: ErrorObject) {
        {
            let mut state = self.lock();
            if !state.lifecycle.fail() {
                return;
            }
            state.control_rx = None;
        }

        info!(process_id = self.process_id, error = %error, "Process failed to start");
        self.send(ProcessMessage::Error(error));
        for (stream, _) in &self.streams {
            stream.abort();
        }
        self.finished.cancel();
    }

    /// The connection went away.
    ///
    /// A live process is hung up. One still spawning is marked so that it
    /// is hung up as soon as it attaches.
    pub fn orphan(&self) {
        let mut state = self.lock();
        if state.orphaned || !state.lifecycle.is_live() {
            return;
        }
        state.orphaned = true;
        debug!(process_id = self.process_id, state = %state.lifecycle.state(), "Orphaned process");

        if state.lifecycle.state() == ProcessState::Running {
            let _ = self.control_tx.send(ProcessMessage::Kill {
                signal: Some(HANGUP.to_string()),
            });
        }
    }

    fn attach(self: &Arc<Self>, spawned: SpawnedProcess) {
        let SpawnedProcess {
            control,
            stdio,
            exit,
        } = spawned;

        let orphaned = {
            let mut state = self.lock();
            if state.lifecycle.state() != ProcessState::Spawning {
                return;
            }
            let replay = state.lifecycle.attach();
            let orphaned = state.orphaned;

            if orphaned {
                // Queue order no longer matters; only the hangup is delivered.
                let _ = self.control_tx.send(ProcessMessage::Kill {
                    signal: Some(HANGUP.to_string()),
                });
            } else {
                for call in replay {
                    let _ = self.control_tx.send(call);
                }
            }
            for call in state.lifecycle.running() {
                let _ = self.control_tx.send(call);
            }

            if let Some(control_rx) = state.control_rx.take() {
                tokio::spawn(run_control(self.process_id, control.clone(), control_rx));
            }
            orphaned
        };

        if orphaned {
            info!(process_id = self.process_id, "Attached after disconnect, hanging up");
            drop(stdio);
        } else {
            info!(process_id = self.process_id, "Process attached");
            self.send(ProcessMessage::Attach);
            for ((stream, _), fd) in self.streams.iter().zip(stdio) {
                stream.ready();
                start_pumps(Arc::clone(stream), fd);
            }
        }

        let handle = Arc::clone(self);
        tokio::spawn(async move {
            let status = match exit.await {
                Ok(status) => status,
                Err(_) => {
                    warn!(process_id = handle.process_id, "Backend dropped exit status");
                    ExitStatus::code(-1)
                }
            };
            handle.exited(status);
        });
    }

    fn exited(&self, status: ExitStatus) {
        let orphaned = {
            let mut state = self.lock();
            if !state.lifecycle.exit(status.clone()) {
                return;
            }
            state.orphaned
        };

        info!(process_id = self.process_id, status = %status, "Process exited");
        if !orphaned {
            self.send(status.to_message());
        }

        for (stream, direction) in &self.streams {
            if direction.is_output() {
                stream.set_timeout(self.stream_timeout);
            } else {
                stream.finish();
            }
        }
        self.finished.cancel();
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("process_id", &self.process_id)
            .field("state", &self.state())
            .finish()
    }
}

/// Delivers control calls to the backend in queue order.
async fn run_control(
    process_id: ProcessId,
    control: Arc<dyn ProcessControl>,
    mut rx: mpsc::UnboundedReceiver<ProcessMessage>,
) {
    while let Some(call) = rx.recv().await {
        let result = match &call {
            ProcessMessage::Kill { signal } => {
                let signal = signal.as_deref().unwrap_or(DEFAULT_KILL_SIGNAL);
                debug!(process_id, signal, "Killing process");
                control.kill(signal).await
            }
            ProcessMessage::Resize { cols, rows } => {
                debug!(process_id, cols, rows, "Resizing process terminal");
                control.resize(*cols, *rows).await
            }
            _ => Ok(()),
        };
        if let Err(e) = result {
            warn!(process_id, error = %e, "Process control call failed");
        }
    }
}

/// Connects a ready stream to its backend descriptor.
fn start_pumps(stream: Arc<StreamMux>, fd: ProcessFd) {
    let ProcessFd { input, output } = fd;

    if let Some(mut output) = output {
        let stream = Arc::clone(&stream);
        tokio::spawn(async move {
            while let Some(data) = output.recv().await {
                if stream.write(data).await.is_err() {
                    break;
                }
            }
            stream.finish();
            // Keep the process from blocking on a stream nobody reads.
            while output.recv().await.is_some() {}
        });
    }

    if let Some(input) = input {
        tokio::spawn(async move {
            while let Some(data) = stream.read().await {
                if input.send(data).await.is_err() {
                    break;
                }
            }
        });
    }
}
