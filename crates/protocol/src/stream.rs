//! Credit-based duplex stream multiplexing.
//!
//! A [`StreamMux`] carries one logical stream over a shared [`Link`] using a
//! single-credit flow-control protocol:
//!
//! - To receive, the local side sends `R` and waits. The peer may send
//!   exactly one `W` per `R` it has seen.
//! - To send, the local side waits for the peer's `R`. A write issued
//!   without credit parks in a single pending slot and is flushed when the
//!   credit arrives.
//! - `W` with a `null` payload ends the stream in that direction.
//!
//! A stream constructed in the waiting state sends nothing until
//! [`StreamMux::ready`] is called; reads and the end signal requested in the
//! meantime are deferred and replayed at that point. The one exception is an
//! inactivity timeout, whose end signal goes out immediately.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ProtocolError, Result};
use crate::link::Link;
use crate::messages::{Message, StreamFrame, StreamId};

/// Framing of a stream's payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamMode {
    /// Byte chunks, base64 encoded on the wire.
    #[default]
    Raw,
    /// Structured JSON values, passed through untouched.
    Object,
}

impl StreamMode {
    /// Decodes an inbound payload for this mode.
    pub fn decode(self, payload: Value) -> Result<StreamData> {
        match self {
            StreamMode::Object => Ok(StreamData::Object(payload)),
            StreamMode::Raw => match payload {
                Value::String(text) => Ok(StreamData::Bytes(BASE64.decode(text.as_bytes())?)),
                Value::Array(items) => items
                    .into_iter()
                    .map(|item| {
                        item.as_u64()
                            .and_then(|byte| u8::try_from(byte).ok())
                            .ok_or_else(|| {
                                ProtocolError::InvalidPayload(format!("not a byte: {}", item))
                            })
                    })
                    .collect::<Result<Vec<u8>>>()
                    .map(StreamData::Bytes),
                other => Err(ProtocolError::InvalidPayload(format!(
                    "expected bytes, got {}",
                    json_kind(&other)
                ))),
            },
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// One chunk of stream data.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamData {
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// A structured message.
    Object(Value),
}

impl StreamData {
    /// Encodes this chunk as a wire payload.
    pub fn to_payload(&self) -> Value {
        match self {
            StreamData::Bytes(bytes) => Value::String(BASE64.encode(bytes)),
            StreamData::Object(value) => value.clone(),
        }
    }

    /// Byte length for raw chunks, 1 for structured ones.
    pub fn len(&self) -> usize {
        match self {
            StreamData::Bytes(bytes) => bytes.len(),
            StreamData::Object(_) => 1,
        }
    }

    /// Whether this is an empty byte chunk.
    pub fn is_empty(&self) -> bool {
        matches!(self, StreamData::Bytes(bytes) if bytes.is_empty())
    }

    /// Returns the bytes of a raw chunk.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            StreamData::Bytes(bytes) => Some(bytes),
            StreamData::Object(_) => None,
        }
    }
}

impl From<Vec<u8>> for StreamData {
    fn from(bytes: Vec<u8>) -> Self {
        StreamData::Bytes(bytes)
    }
}

impl From<&[u8]> for StreamData {
    fn from(bytes: &[u8]) -> Self {
        StreamData::Bytes(bytes.to_vec())
    }
}

/// Errors surfaced to the local owner of a stream.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    /// The writable side has ended, or the stream was unbound.
    #[error("stream closed: {0}")]
    Closed(StreamId),
}

#[derive(Debug, Default)]
struct MuxState {
    /// We sent `R` and are waiting for data.
    may_receive: bool,
    /// The peer sent `R` and is waiting for our data.
    may_send: bool,
    ready: bool,
    read_deferred: bool,
    end_deferred: bool,
    /// `finish` was called with a write still parked.
    end_after_pending: bool,
    end_sent: bool,
    pending: Option<StreamData>,
    inbox: Option<StreamData>,
    /// Number of data frames transmitted so far.
    sent: u64,
    readable_ended: bool,
    writable_ended: bool,
    unbound: bool,
    timeout: Option<Duration>,
    timer: Option<CancellationToken>,
}

/// One logical duplex stream over a shared [`Link`].
///
/// Single reader, any number of writers (serialized internally).
pub struct StreamMux {
    id: StreamId,
    mode: StreamMode,
    link: Link,
    me: Weak<StreamMux>,
    state: Mutex<MuxState>,
    readable: Notify,
    writable: Notify,
    write_gate: tokio::sync::Mutex<()>,
    done: CancellationToken,
}

impl StreamMux {
    /// Creates a stream and binds it to `link` for inbound frames on `id`.
    ///
    /// With `wait` set, the stream stays silent until [`StreamMux::ready`].
    pub fn new(link: Link, id: impl Into<StreamId>, mode: StreamMode, wait: bool) -> Arc<Self> {
        let id = id.into();
        let stream = Arc::new_cyclic(|me| StreamMux {
            id: id.clone(),
            mode,
            link: link.clone(),
            me: me.clone(),
            state: Mutex::new(MuxState {
                ready: !wait,
                ..MuxState::default()
            }),
            readable: Notify::new(),
            writable: Notify::new(),
            write_gate: tokio::sync::Mutex::new(()),
            done: CancellationToken::new(),
        });
        link.bind_stream(&id, Arc::downgrade(&stream));
        stream
    }

    /// Returns the stream ID.
    pub fn id(&self) -> &StreamId {
        &self.id
    }

    /// Returns the payload framing of this stream.
    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    fn state(&self) -> MutexGuard<'_, MuxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, frame: StreamFrame) {
        self.link.send(Message::stream(self.id.clone(), frame));
    }

    /// Whether the stream left the waiting state.
    pub fn is_ready(&self) -> bool {
        self.state().ready
    }

    /// Whether the stream is no longer bound to its link.
    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Resolves once the stream is unbound: finished, timed out, ended by
    /// the peer, or dropped with its connection.
    pub async fn done(&self) {
        self.done.cancelled().await
    }

    /// Leaves the waiting state, replaying a deferred end signal, a deferred
    /// read request and a parked write.
    pub fn ready(&self) {
        let mut state = self.state();
        if state.ready {
            return;
        }
        state.ready = true;

        if state.end_deferred {
            state.end_deferred = false;
            self.send_end(&mut state);
        }
        if state.read_deferred && !state.unbound {
            state.read_deferred = false;
            self.request_read(&mut state);
        }
        if state.may_send && !state.unbound {
            if let Some(data) = state.pending.take() {
                self.flush(&mut state, data);
            }
        }
    }

    /// Reads the next chunk, requesting credit from the peer as needed.
    ///
    /// Returns `None` once the readable side has ended.
    pub async fn read(&self) -> Option<StreamData> {
        loop {
            {
                let mut state = self.state();
                if let Some(data) = state.inbox.take() {
                    return Some(data);
                }
                if state.readable_ended {
                    return None;
                }
                self.request_read(&mut state);
            }
            self.readable.notified().await;
        }
    }

    fn request_read(&self, state: &mut MuxState) {
        if !state.ready {
            state.read_deferred = true;
            return;
        }
        if !state.may_receive {
            debug!(stream = %self.id, "Requesting data");
            state.may_receive = true;
            self.emit(StreamFrame::Read);
        }
    }

    /// Writes one chunk, waiting for the peer's read request if necessary.
    pub async fn write(&self, data: impl Into<StreamData>) -> std::result::Result<(), StreamError> {
        let data = data.into();
        let _gate = self.write_gate.lock().await;

        let ticket = {
            let mut state = self.state();
            if state.writable_ended || state.unbound {
                return Err(StreamError::Closed(self.id.clone()));
            }
            if state.ready && state.may_send {
                self.transmit(&mut state, data);
                return Ok(());
            }
            state.pending = Some(data);
            state.sent + 1
        };

        loop {
            self.writable.notified().await;
            let state = self.state();
            if state.sent >= ticket {
                return Ok(());
            }
            if state.writable_ended || state.unbound {
                return Err(StreamError::Closed(self.id.clone()));
            }
        }
    }

    fn transmit(&self, state: &mut MuxState, data: StreamData) {
        debug!(stream = %self.id, bytes = data.len(), "Writing data");
        state.may_send = false;
        state.sent += 1;
        self.emit(StreamFrame::Write(Some(data.to_payload())));
        self.arm_timer(state);
    }

    /// Transmits a parked write and completes a `finish` waiting on it.
    fn flush(&self, state: &mut MuxState, data: StreamData) {
        self.transmit(state, data);
        self.writable.notify_one();
        if state.end_after_pending {
            state.end_after_pending = false;
            self.end(state);
        }
    }

    /// Ends the writable side. Idempotent.
    ///
    /// A write parked waiting for credit is delivered first; the end signal
    /// follows it. The end signal goes out once the stream is ready, and the
    /// stream is unbound as soon as it has been issued.
    pub fn finish(&self) {
        let mut state = self.state();
        if state.writable_ended {
            return;
        }
        state.writable_ended = true;
        if state.pending.is_some() && !state.unbound {
            debug!(stream = %self.id, "Finishing after parked write");
            state.end_after_pending = true;
            return;
        }
        self.end(&mut state);
    }

    fn end(&self, state: &mut MuxState) {
        if state.ready {
            self.send_end(state);
        } else {
            state.end_deferred = true;
        }
        self.unbind(state);
    }

    fn send_end(&self, state: &mut MuxState) {
        if state.end_sent {
            return;
        }
        state.end_sent = true;
        self.emit(StreamFrame::Write(None));
    }

    /// Sets the inactivity timeout.
    ///
    /// While the peer holds no outstanding read request, the stream is
    /// finished if none arrives within `timeout`.
    pub fn set_timeout(&self, timeout: Duration) {
        let mut state = self.state();
        state.timeout = Some(timeout);
        if !state.may_send {
            self.arm_timer(&mut state);
        }
    }

    fn arm_timer(&self, state: &mut MuxState) {
        Self::clear_timer(state);
        let Some(timeout) = state.timeout else {
            return;
        };
        if state.unbound {
            return;
        }

        let token = CancellationToken::new();
        state.timer = Some(token.clone());
        let me = self.me.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    if let Some(stream) = me.upgrade() {
                        stream.on_timeout(&token);
                    }
                }
            }
        });
    }

    fn clear_timer(state: &mut MuxState) {
        if let Some(timer) = state.timer.take() {
            timer.cancel();
        }
    }

    fn on_timeout(&self, token: &CancellationToken) {
        let mut state = self.state();
        if token.is_cancelled() || state.unbound {
            return;
        }
        debug!(stream = %self.id, "Stream timed out");
        state.timer = None;
        state.pending = None;
        state.end_after_pending = false;
        state.writable_ended = true;
        // The peer learns of the timeout even if the stream never got ready.
        state.end_deferred = false;
        self.send_end(&mut state);
        self.unbind(&mut state);
    }

    /// Handles an inbound frame from the peer.
    pub fn handle_frame(&self, frame: StreamFrame) {
        match frame {
            StreamFrame::Read => self.on_read(),
            StreamFrame::Write(payload) => self.on_write(payload),
        }
    }

    fn on_read(&self) {
        let mut state = self.state();
        if state.unbound {
            return;
        }
        debug!(stream = %self.id, "Remote requested data");
        Self::clear_timer(&mut state);

        if state.ready && state.pending.is_some() {
            if let Some(data) = state.pending.take() {
                self.flush(&mut state, data);
            }
        } else {
            state.may_send = true;
        }
    }

    fn on_write(&self, payload: Option<Value>) {
        let mut state = self.state();
        if state.readable_ended {
            debug!(stream = %self.id, "Received data after end");
            return;
        }

        let Some(payload) = payload else {
            debug!(stream = %self.id, "Received end of stream");
            state.readable_ended = true;
            self.readable.notify_one();
            self.unbind(&mut state);
            return;
        };

        if !state.may_receive {
            debug!(stream = %self.id, "Received unrequested data");
            return;
        }

        match self.mode.decode(payload) {
            Ok(data) => {
                state.may_receive = false;
                debug!(stream = %self.id, bytes = data.len(), "Received data");
                state.inbox = Some(data);
                self.readable.notify_one();
            }
            Err(e) => {
                warn!(stream = %self.id, error = %e, "Dropping malformed stream data");
            }
        }
    }

    /// Drops the stream together with its connection.
    ///
    /// Undelivered local data is discarded.
    pub fn on_disconnect(&self) {
        self.abort();
    }

    /// Unbinds without signalling the peer, discarding undelivered data.
    pub fn abort(&self) {
        let mut state = self.state();
        state.pending = None;
        state.writable_ended = true;
        self.unbind(&mut state);
    }

    fn unbind(&self, state: &mut MuxState) {
        if state.unbound {
            return;
        }
        state.unbound = true;
        state.readable_ended = true;
        state.pending = None;
        Self::clear_timer(state);
        self.link.unbind_stream(&self.id, self);
        self.readable.notify_one();
        self.writable.notify_one();
        self.done.cancel();
    }
}

impl std::fmt::Debug for StreamMux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamMux")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .finish()
    }
}
