//! Transport boundary.
//!
//! A [`Connection`] is what a transport hands to the protocol layer: an
//! ordered, reliable inbound message queue plus a [`Link`] for sending and
//! for observing disconnects. The link also owns the routing table for the
//! stream channels bound on this connection.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::messages::{Message, StreamFrame, StreamId};
use crate::stream::StreamMux;

/// Unique identifier for a connection.
pub type ConnectionId = String;

/// Sending half of one connection.
///
/// Cheap to clone; all clones refer to the same connection.
#[derive(Clone)]
pub struct Link {
    inner: Arc<LinkInner>,
}

struct LinkInner {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Message>,
    closed: CancellationToken,
    streams: DashMap<StreamId, Weak<StreamMux>>,
}

impl Link {
    /// Creates a link around an outbound queue and a disconnect token.
    pub fn new(
        id: ConnectionId,
        tx: mpsc::UnboundedSender<Message>,
        closed: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(LinkInner {
                id,
                tx,
                closed,
                streams: DashMap::new(),
            }),
        }
    }

    /// Returns the connection ID.
    pub fn id(&self) -> &ConnectionId {
        &self.inner.id
    }

    /// Queues a message for the peer.
    ///
    /// Returns false when the connection is gone; the message is dropped.
    pub fn send(&self, message: Message) -> bool {
        if self.is_closed() {
            tracing::trace!(connection = %self.inner.id, channel = %message.channel(), "Dropping message for closed connection");
            return false;
        }
        self.inner.tx.send(message).is_ok()
    }

    /// Whether the connection has been closed by either side.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled() || self.inner.tx.is_closed()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    /// Closes the connection. Idempotent.
    pub fn disconnect(&self) {
        self.inner.closed.cancel();
    }

    /// Registers a stream for inbound frames on `id`.
    pub(crate) fn bind_stream(&self, id: &str, stream: Weak<StreamMux>) {
        if let Some(previous) = self.inner.streams.insert(id.to_string(), stream) {
            if previous.strong_count() > 0 {
                tracing::warn!(connection = %self.inner.id, stream = %id, "Replaced a live stream binding");
            }
        }
    }

    /// Removes the binding for `id` if it still points at `stream`.
    pub(crate) fn unbind_stream(&self, id: &str, stream: &StreamMux) {
        self.inner
            .streams
            .remove_if(id, |_, bound| std::ptr::eq(bound.as_ptr(), stream));
    }

    /// Delivers an inbound frame to the stream bound on `id`.
    ///
    /// Returns false when no live stream is bound there; the frame is dropped.
    pub fn route_stream(&self, id: &str, frame: StreamFrame) -> bool {
        // Clone out of the map first: handling the frame may unbind.
        let stream = self.inner.streams.get(id).and_then(|entry| entry.value().upgrade());
        match stream {
            Some(stream) => {
                stream.handle_frame(frame);
                true
            }
            None => {
                tracing::debug!(connection = %self.inner.id, stream = %id, "Frame for unknown stream");
                false
            }
        }
    }

    /// Unbinds every stream on this connection, dropping undelivered data.
    pub fn release_streams(&self) {
        let streams: Vec<Arc<StreamMux>> = self
            .inner
            .streams
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect();
        for stream in streams {
            stream.on_disconnect();
        }
        self.inner.streams.clear();
    }

    /// Number of streams currently bound.
    pub fn stream_count(&self) -> usize {
        self.inner
            .streams
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .count()
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// An accepted connection: a link plus its inbound message queue.
pub struct Connection {
    /// Sending half.
    pub link: Link,
    /// Messages from the peer, in order.
    pub inbound: mpsc::UnboundedReceiver<Message>,
}

impl Connection {
    /// Creates a connection from its parts.
    pub fn new(link: Link, inbound: mpsc::UnboundedReceiver<Message>) -> Self {
        Self { link, inbound }
    }

    /// Returns the connection ID.
    pub fn id(&self) -> &ConnectionId {
        self.link.id()
    }

    /// Creates two in-memory connections wired to each other.
    ///
    /// Both ends share one disconnect token, so closing either end is
    /// observed by both, like a socket.
    pub fn pair() -> (Connection, Connection) {
        let closed = CancellationToken::new();
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();

        let a = Connection::new(
            Link::new(Uuid::new_v4().to_string(), a_tx, closed.clone()),
            a_rx,
        );
        let b = Connection::new(Link::new(Uuid::new_v4().to_string(), b_tx, closed), b_rx);
        (a, b)
    }

    /// Receives the next inbound message, or `None` once disconnected.
    pub async fn recv(&mut self) -> Option<Message> {
        tokio::select! {
            biased;
            message = self.inbound.recv() => message,
            _ = self.link.closed() => None,
        }
    }
}
