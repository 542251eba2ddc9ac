//! Process lifecycle state machine.
//!
//! Both ends of a process channel run the same lifecycle: control calls
//! issued before the backend confirms attach are buffered and replayed in
//! submission order exactly once; after an error or exit no further calls
//! are delivered.

use std::collections::VecDeque;
use std::fmt;

use crate::messages::ProcessMessage;

/// Lifecycle states of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Spawn requested, backend has not confirmed yet.
    Spawning,
    /// Backend confirmed; buffered calls are being replayed.
    Attached,
    /// Calls are delivered as they are issued.
    Running,
    /// The process terminated.
    Exited,
    /// The process could not be started or attached.
    Error,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessState::Spawning => "spawning",
            ProcessState::Attached => "attached",
            ProcessState::Running => "running",
            ProcessState::Exited => "exited",
            ProcessState::Error => "error",
        };
        f.write_str(name)
    }
}

/// How a process terminated. Exactly one field is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitStatus {
    exit_code: Option<i32>,
    signal_code: Option<String>,
}

impl ExitStatus {
    /// Normal exit with `code`.
    pub fn code(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            signal_code: None,
        }
    }

    /// Termination by the named signal.
    pub fn signal(signal: impl Into<String>) -> Self {
        Self {
            exit_code: None,
            signal_code: Some(signal.into()),
        }
    }

    /// Builds a status from wire fields. A signal takes precedence.
    ///
    /// Returns `None` when neither field is set.
    pub fn from_parts(exit_code: Option<i32>, signal_code: Option<String>) -> Option<Self> {
        match (exit_code, signal_code) {
            (_, Some(signal)) => Some(Self::signal(signal)),
            (Some(code), None) => Some(Self::code(code)),
            (None, None) => None,
        }
    }

    /// Exit code, for a normal exit.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Signal name, for a signalled exit.
    pub fn signal_code(&self) -> Option<&str> {
        self.signal_code.as_deref()
    }

    /// Whether the process exited normally with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// The `exit` event announcing this status.
    pub fn to_message(&self) -> ProcessMessage {
        ProcessMessage::Exit {
            exit_code: self.exit_code,
            signal_code: self.signal_code.clone(),
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.exit_code, &self.signal_code) {
            (_, Some(signal)) => write!(f, "signal {}", signal),
            (Some(code), None) => write!(f, "exit code {}", code),
            (None, None) => f.write_str("unknown"),
        }
    }
}

/// Lifecycle of one process with its buffer of early control calls.
#[derive(Debug)]
pub struct Lifecycle<C> {
    state: ProcessState,
    pending: VecDeque<C>,
    status: Option<ExitStatus>,
}

impl<C> Lifecycle<C> {
    /// A lifecycle in the `Spawning` state.
    pub fn new() -> Self {
        Self {
            state: ProcessState::Spawning,
            pending: VecDeque::new(),
            status: None,
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Whether the process has neither exited nor failed.
    pub fn is_live(&self) -> bool {
        matches!(
            self.state,
            ProcessState::Spawning | ProcessState::Attached | ProcessState::Running
        )
    }

    /// Number of buffered calls.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Submits a control call.
    ///
    /// Returns the call when it should be delivered now. While spawning or
    /// replaying, the call is buffered behind earlier ones; after
    /// exit or error it is dropped.
    pub fn submit(&mut self, call: C) -> Option<C> {
        match self.state {
            ProcessState::Spawning | ProcessState::Attached => {
                self.pending.push_back(call);
                None
            }
            ProcessState::Running => Some(call),
            ProcessState::Exited | ProcessState::Error => None,
        }
    }

    /// Moves `Spawning → Attached` and hands back the buffered calls in
    /// submission order.
    ///
    /// Any other state yields nothing; the buffer is only ever drained once.
    pub fn attach(&mut self) -> Vec<C> {
        if self.state != ProcessState::Spawning {
            return Vec::new();
        }
        self.state = ProcessState::Attached;
        self.pending.drain(..).collect()
    }

    /// Moves `Attached → Running`, returning calls buffered during replay.
    pub fn running(&mut self) -> Vec<C> {
        if self.state != ProcessState::Attached {
            return Vec::new();
        }
        self.state = ProcessState::Running;
        self.pending.drain(..).collect()
    }

    /// Enters `Error` from `Spawning` or `Attached`, discarding the buffer.
    ///
    /// Returns false if the transition is not allowed.
    pub fn fail(&mut self) -> bool {
        if !matches!(self.state, ProcessState::Spawning | ProcessState::Attached) {
            return false;
        }
        self.state = ProcessState::Error;
        self.pending.clear();
        true
    }

    /// Records termination. Only the first call has an effect.
    pub fn exit(&mut self, status: ExitStatus) -> bool {
        if !self.is_live() {
            return false;
        }
        self.state = ProcessState::Exited;
        self.pending.clear();
        self.status = Some(status);
        true
    }

    /// Exit status once exited.
    pub fn exit_status(&self) -> Option<&ExitStatus> {
        self.status.as_ref()
    }
}

impl<C> Default for Lifecycle<C> {
    fn default() -> Self {
        Self::new()
    }
}
