//! Protocol message definitions for Boxwire.
//!
//! Every message travels on a logical channel of one connection. The
//! channel is implied by the message variant: fixed channels (`auth`,
//! `fatal`, `exec`, the file-operation methods and their acks), one control
//! channel per process (`P<id>`) and one channel per logical byte stream
//! (`S<id>`).

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, Result};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Client-assigned process identifier, unique within one connection.
pub type ProcessId = u64;

/// Correlates a [`Call`] with its [`Ack`].
pub type AckId = u64;

/// Logical stream identifier (`"<pid>"` or `"<pid>.<fd>"`).
pub type StreamId = String;

/// Envelope wrapper used by byte-oriented transports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version for compatibility checking.
    pub version: u8,
    /// The actual message payload.
    pub payload: Message,
}

impl Envelope {
    /// Create a new envelope with the current protocol version.
    pub fn new(payload: Message) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            payload,
        }
    }

    /// Serialize the envelope to a single JSON line (without the newline).
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize an envelope, rejecting foreign protocol versions.
    pub fn from_json(line: &str) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(line)?;
        if envelope.version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(envelope.version));
        }
        Ok(envelope)
    }
}

/// Top-level message enum containing all message types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Message {
    /// Authentication credential, client to server. Opaque to the protocol.
    Auth(Value),
    /// The server is about to disconnect this client.
    Fatal(Fatal),
    /// File operation request, client to server, answered by an [`Ack`].
    Call(Call),
    /// Reply to a [`Call`].
    Ack(Ack),
    /// Spawn request, client to server. Answered on the process channel.
    Exec(ExecRequest),
    /// Process lifecycle/control channel message.
    Process(ProcessFrame),
    /// Byte stream flow-control channel message.
    Stream(StreamEnvelope),
}

impl Message {
    /// Returns the logical channel this message travels on.
    pub fn channel(&self) -> String {
        match self {
            Message::Auth(_) => "auth".to_string(),
            Message::Fatal(_) => "fatal".to_string(),
            Message::Call(call) => call.method.as_str().to_string(),
            Message::Ack(_) => "ack".to_string(),
            Message::Exec(_) => "exec".to_string(),
            Message::Process(frame) => process_channel(frame.process_id),
            Message::Stream(frame) => stream_channel(&frame.stream_id),
        }
    }

    /// Shorthand for a `fatal` message.
    pub fn fatal(reason: impl Into<String>) -> Self {
        Message::Fatal(Fatal {
            reason: reason.into(),
        })
    }

    /// Shorthand for a process channel message.
    pub fn process(process_id: ProcessId, message: ProcessMessage) -> Self {
        Message::Process(ProcessFrame {
            process_id,
            message,
        })
    }

    /// Shorthand for a stream channel message.
    pub fn stream(stream_id: impl Into<StreamId>, frame: StreamFrame) -> Self {
        Message::Stream(StreamEnvelope {
            stream_id: stream_id.into(),
            frame,
        })
    }
}

/// Channel name of a process control channel.
pub fn process_channel(process_id: ProcessId) -> String {
    format!("P{}", process_id)
}

/// Channel name of a stream channel.
pub fn stream_channel(stream_id: &str) -> String {
    format!("S{}", stream_id)
}

/// Reason sent before the server drops a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fatal {
    /// Human-readable reason.
    pub reason: String,
}

// ============================================================================
// File operation calls
// ============================================================================

/// File operations a client may call. Anything else fails to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CallMethod {
    /// Read a whole file.
    ReadFile,
    /// Write a whole file.
    WriteFile,
    /// Create directories.
    Mkdir,
    /// Remove files or directories.
    Rm,
    /// Copy files or directories.
    Cp,
    /// Create links.
    Ln,
}

impl CallMethod {
    /// Wire name of the method, which is also its channel name.
    pub fn as_str(&self) -> &'static str {
        match self {
            CallMethod::ReadFile => "readFile",
            CallMethod::WriteFile => "writeFile",
            CallMethod::Mkdir => "mkdir",
            CallMethod::Rm => "rm",
            CallMethod::Cp => "cp",
            CallMethod::Ln => "ln",
        }
    }
}

impl fmt::Display for CallMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file operation request.
///
/// The argument list is kept untyped on the wire so the receiver can
/// validate it and still answer the call when the shapes are wrong.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    /// Correlation id echoed in the [`Ack`].
    pub ack: AckId,
    /// Which operation to run.
    pub method: CallMethod,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Reply to a [`Call`]: `(error|null, result)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    /// Correlation id of the call.
    pub ack: AckId,
    /// Set when the call failed.
    #[serde(default)]
    pub error: Option<ErrorObject>,
    /// Operation result, if any.
    #[serde(default)]
    pub result: Option<Value>,
}

impl Ack {
    /// Successful reply.
    pub fn ok(ack: AckId, result: Option<Value>) -> Self {
        Self {
            ack,
            error: None,
            result,
        }
    }

    /// Failed reply.
    pub fn err(ack: AckId, error: ErrorObject) -> Self {
        Self {
            ack,
            error: Some(error),
            result: None,
        }
    }
}

/// Serializable error carried in acks and process `error` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Human-readable message.
    pub message: String,
    /// Optional errno-like code (`ENOENT`, `EINVAL`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorObject {
    /// Error without a code.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    /// Error with a code.
    pub fn with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: Some(code.into()),
        }
    }
}

impl fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} ({})", self.message, code),
            None => f.write_str(&self.message),
        }
    }
}

/// Flags accepted by `mkdir`, `rm`, `cp` and `ln`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsOptions {
    /// Descend into directories (`rm`, `cp`).
    pub recursive: bool,
    /// Ignore missing paths and overwrite existing ones.
    pub force: bool,
    /// Create missing parent directories (`mkdir`).
    pub parents: bool,
    /// Create a symbolic rather than a hard link (`ln`).
    pub symbolic: bool,
}

// ============================================================================
// Process messages
// ============================================================================

/// Request to spawn a process. Arguments are validated by the receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecRequest {
    /// Id of the process channel that will carry the outcome.
    pub process_id: ProcessId,
    /// Command to run.
    pub command: Value,
    /// Argument list.
    #[serde(default)]
    pub args: Value,
    /// [`ExecOptions`] as a JSON object.
    #[serde(default)]
    pub options: Value,
}

/// Options recognized by `exec`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExecOptions {
    /// Run in a terminal; stdio collapses onto one stream.
    pub term: bool,
    /// Working directory.
    pub cwd: Option<String>,
    /// Environment overrides.
    pub env: HashMap<String, String>,
    /// Number of extra descriptors beyond stdio.
    pub streams: usize,
    /// Per extra-stream flag selecting structured framing instead of bytes.
    pub streams_object_mode: Vec<bool>,
}

/// Message on a process channel `P<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessFrame {
    /// Process this frame belongs to.
    pub process_id: ProcessId,
    /// The event or control call.
    pub message: ProcessMessage,
}

/// Process channel payload.
///
/// `Attach`, `Error` and `Exit` flow server to client; `Kill` and `Resize`
/// flow client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProcessMessage {
    /// The backend confirmed the process is running; stdio may flow.
    Attach,
    /// The process could not be started.
    Error(ErrorObject),
    /// The process terminated. Exactly one field is set.
    Exit {
        /// Exit code for a normal exit.
        exit_code: Option<i32>,
        /// Signal name for a signalled exit.
        signal_code: Option<String>,
    },
    /// Deliver a signal (`SIGTERM` when absent).
    Kill {
        /// Signal name such as `SIGINT`.
        signal: Option<String>,
    },
    /// Resize the process terminal. Ignored outside terminal mode.
    Resize {
        /// Columns.
        cols: u16,
        /// Rows.
        rows: u16,
    },
}

impl ProcessMessage {
    /// Whether this is a client-issued control call.
    pub fn is_control(&self) -> bool {
        matches!(self, ProcessMessage::Kill { .. } | ProcessMessage::Resize { .. })
    }
}

// ============================================================================
// Stream messages
// ============================================================================

/// Message on a stream channel `S<id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEnvelope {
    /// Stream this frame belongs to.
    pub stream_id: StreamId,
    /// The frame.
    pub frame: StreamFrame,
}

/// Flow-control frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "payload")]
pub enum StreamFrame {
    /// Read request: grants the peer credit for one data frame.
    #[serde(rename = "R")]
    Read,
    /// Data, or end of stream when the payload is `null`.
    #[serde(rename = "W")]
    Write(Option<Value>),
}

/// Stream id for descriptor `fd` of a non-terminal process.
pub fn stdio_stream_id(process_id: ProcessId, fd: usize) -> StreamId {
    format!("{}.{}", process_id, fd)
}

/// Stream id of the combined stdio stream of a terminal process.
pub fn terminal_stream_id(process_id: ProcessId) -> StreamId {
    process_id.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_version() {
        let envelope = Envelope::new(Message::fatal("bye"));
        assert_eq!(envelope.version, PROTOCOL_VERSION);
    }

    #[test]
    fn test_envelope_rejects_foreign_version() {
        let line = r#"{"version":42,"payload":{"type":"auth","data":null}}"#;
        let result = Envelope::from_json(line);
        assert!(matches!(result, Err(ProtocolError::UnsupportedVersion(42))));
    }

    #[test]
    fn test_channel_names() {
        assert_eq!(Message::Auth(json!("token")).channel(), "auth");
        assert_eq!(Message::fatal("x").channel(), "fatal");
        assert_eq!(
            Message::Call(Call {
                ack: 1,
                method: CallMethod::ReadFile,
                args: vec![],
            })
            .channel(),
            "readFile"
        );
        assert_eq!(
            Message::process(7, ProcessMessage::Attach).channel(),
            "P7"
        );
        assert_eq!(
            Message::stream("7.1", StreamFrame::Read).channel(),
            "S7.1"
        );
    }

    #[test]
    fn test_stream_frame_wire_shape() {
        let read = serde_json::to_value(StreamFrame::Read).unwrap();
        assert_eq!(read, json!({"op": "R"}));

        let end = serde_json::to_value(StreamFrame::Write(None)).unwrap();
        assert_eq!(end, json!({"op": "W", "payload": null}));

        let decoded: StreamFrame = serde_json::from_value(json!({"op": "W", "payload": null})).unwrap();
        assert_eq!(decoded, StreamFrame::Write(None));
    }

    #[test]
    fn test_process_message_wire_shape() {
        let exit = ProcessMessage::Exit {
            exit_code: Some(0),
            signal_code: None,
        };
        let value = serde_json::to_value(&exit).unwrap();
        assert_eq!(
            value,
            json!({"event": "exit", "exit_code": 0, "signal_code": null})
        );

        let error = ProcessMessage::Error(ErrorObject::with_code("no such file", "ENOENT"));
        let value = serde_json::to_value(&error).unwrap();
        assert_eq!(
            value,
            json!({"event": "error", "message": "no such file", "code": "ENOENT"})
        );
    }

    #[test]
    fn test_unknown_call_method_fails_to_decode() {
        let value = json!({"type": "call", "data": {"ack": 1, "method": "chmod", "args": []}});
        assert!(serde_json::from_value::<Message>(value).is_err());
    }

    #[test]
    fn test_exec_options_camel_case() {
        let options: ExecOptions = serde_json::from_value(json!({
            "term": true,
            "streams": 2,
            "streamsObjectMode": [false, true],
        }))
        .unwrap();
        assert!(options.term);
        assert_eq!(options.streams, 2);
        assert_eq!(options.streams_object_mode, vec![false, true]);
        assert!(options.env.is_empty());
    }

    #[test]
    fn test_control_classification() {
        assert!(ProcessMessage::Kill { signal: None }.is_control());
        assert!(ProcessMessage::Resize { cols: 80, rows: 24 }.is_control());
        assert!(!ProcessMessage::Attach.is_control());
    }

    #[test]
    fn test_stream_ids() {
        assert_eq!(stdio_stream_id(3, 1), "3.1");
        assert_eq!(terminal_stream_id(3), "3");
    }

    #[test]
    fn test_error_object_display() {
        assert_eq!(ErrorObject::new("boom").to_string(), "boom");
        assert_eq!(
            ErrorObject::with_code("gone", "ENOENT").to_string(),
            "gone (ENOENT)"
        );
    }
}
