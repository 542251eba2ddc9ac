//! # Boxwire Protocol Library
//!
//! This crate provides the message definitions and flow-control primitives
//! shared by the Boxwire daemon and its clients.
//!
//! ## Overview
//!
//! One persistent connection carries many logical channels:
//!
//! - **Fixed channels**: `auth`, `fatal`, `exec` and the acked file
//!   operations (`readFile`, `writeFile`, `mkdir`, `rm`, `cp`, `ln`)
//! - **Process channels** `P<id>`: attach/error/exit events and kill/resize
//!   control calls for one process
//! - **Stream channels** `S<id>`: credit-based byte streams for stdio and
//!   extra descriptors
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │   Lifecycle (P<id>)   StreamMux (S<id>)  │
//! ├─────────────────────────────────────────┤
//! │          Messages / Envelope            │
//! ├─────────────────────────────────────────┤
//! │    Link + Connection (transport edge)   │
//! ├─────────────────────────────────────────┤
//! │   Framing (JSON lines over TCP/Unix)    │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{Connection, StreamMode, StreamMux};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let (local, _remote) = Connection::pair();
//!
//! // A stdout endpoint that stays silent until the process attaches.
//! let stdout = StreamMux::new(local.link.clone(), "1.1", StreamMode::Raw, true);
//! stdout.ready();
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Wire message definitions
//! - [`link`]: Connection boundary and stream routing
//! - [`framing`]: Newline-delimited JSON transport
//! - [`stream`]: Credit-based duplex stream
//! - [`process`]: Process lifecycle state machine
//! - [`error`]: Error types

pub mod error;
pub mod framing;
pub mod link;
pub mod messages;
pub mod process;
pub mod stream;

pub use error::{ProtocolError, Result};
pub use framing::{connect, spawn_connection, Endpoint};
pub use link::{Connection, ConnectionId, Link};
pub use messages::{
    Ack, AckId, Call, CallMethod, Envelope, ErrorObject, ExecOptions, ExecRequest, FsOptions,
    Message, ProcessId, ProcessMessage, StreamFrame, StreamId, PROTOCOL_VERSION,
};
pub use process::{ExitStatus, Lifecycle, ProcessState};
pub use stream::{StreamData, StreamError, StreamMode, StreamMux};
