//! Transport-agnostic client for a durable, multiplexed session over a
//! single bidirectional byte connection.
//!
//! A session carries many independent logical channels, each bound to a
//! named remote service, all sharing one underlying socket. This crate
//! owns the three hard problems that make that durable: refreshing
//! connection credentials against a user-supplied metadata endpoint,
//! driving the socket through connect/open/reconnect/close without losing
//! user intent, and re-driving channel requests made before connect,
//! during a reconnect storm, or after teardown.
//!
//! [`client::Client`] is the entry point. It owns a [`fsm::Session`] task
//! end to end and never exposes the state machine directly; callers see
//! `open`, `open_channel`, `close`, and the two callback-registration
//! methods.
//!
//! The wire-frame encoding below the open/close control layer, and any
//! concrete [`transport::Transport`]-equivalent, are out of scope here;
//! see the `multisession-ws` crate for a real WebSocket implementation.

pub mod backoff;
pub mod callback;
pub mod client;
pub mod control;
pub mod error;
pub mod fsm;
pub mod generation;
pub mod metadata;
pub mod mux;
pub mod registry;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use callback::{ChannelInfo, ChannelOptions, CloseHandle, CloseInitiator, CloseReason, OpenResult};
pub use client::{Client, ConnectConfig};
pub use error::{Error, MetadataErrorKind, Result, UnrecoverableError, FAILED_TO_OPEN};
pub use fsm::SessionState;
pub use registry::{ChannelId, ChannelState};
pub use transport::{Connection, ConnectError, TransportEvent, TransportFactory};

/// Install a `tracing` subscriber for this crate's own breadcrumb and
/// debug-level output, honoring `RUST_LOG` and defaulting to `info`.
/// Optional: this crate emits `tracing` events regardless of whether a
/// subscriber is ever installed. Call once, from a binary or test harness
/// that has none of its own.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}
