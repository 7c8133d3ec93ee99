//! The transport contract: a bidirectional, message-oriented byte
//! connection that emits `open`/`message`/`close`/`error`. This crate never
//! constructs a transport itself; it is handed a [`TransportFactory`] via
//! [`crate::client::ConnectConfig`] and drives whatever that factory
//! produces through [`TransportEvent`]s.
//!
//! `multisession-ws` implements this trait for a real WebSocket and for the
//! long-polling fallback; `multisession-core`'s tests implement it for an
//! in-memory fake (see [`crate::testing`]).

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;

/// One event emitted by a live transport connection.
#[derive(Debug)]
pub enum TransportEvent {
    /// The connection is established and ready to send/receive.
    Open,
    /// An inbound frame (a control frame or multiplexed channel payload).
    /// This crate does not interpret frame contents below the open/close
    /// control layer.
    Message(Bytes),
    /// The connection closed, expectedly or not. `None` means the remote
    /// end closed cleanly; `Some` carries a diagnostic reason.
    Closed(Option<String>),
    /// A transport-level error occurred. Treated the same as `Closed` by
    /// the session FSM: connect failure, disconnect, and error all drive
    /// the same reconnect transition, kept distinct here only for logging.
    Error(String),
}

/// A single open connection attempt. Implementations hand back a sender for
/// outbound frames and a receiver for [`TransportEvent`]s; both halves are
/// expected to be backed by a task the implementation spawned internally
/// (the session FSM never spawns transport I/O itself).
pub trait Connection: Send {
    /// Enqueue an outbound frame. Implementations should not block; a
    /// bounded/unbounded channel hand-off to the I/O task is expected.
    fn send(&mut self, frame: Bytes);

    /// Begin a graceful close of the underlying socket. Idempotent.
    fn close(&mut self);

    /// Take the event receiver. Panics if called more than once; this
    /// mirrors the single-consumer contract the session FSM relies on
    /// (only the FSM's event loop ever polls transport events).
    fn events(&mut self) -> tokio::sync::mpsc::UnboundedReceiver<TransportEvent>;
}

/// Produces [`Connection`]s for a given URL/token pair. `multisession-ws`
/// provides the real (`WebSocketClient`) and fallback (`PollingClient`)
/// implementations; the polling-fallback rule swaps which factory the
/// FSM calls, not how the FSM calls it.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Open a new connection to `url`, authenticating with `token`.
    async fn connect(&self, url: &str, token: &str) -> Result<Box<dyn Connection>, ConnectError>;
}

/// Failure to establish a transport-level connection (distinct from a
/// connection that opened and later closed).
#[derive(Debug)]
pub struct ConnectError(pub String);

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport connect failed: {}", self.0)
    }
}

impl std::error::Error for ConnectError {}
