//! Error types surfaced across the session/channel lifecycle.

use thiserror::Error;

/// Result type alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by fallible, synchronous entry points (`open_channel`,
/// the request-id allocator, etc).
#[derive(Debug, Error)]
pub enum Error {
    /// Another non-closing channel request already holds this name: at
    /// most one `ChannelRequest` per name may sit outside
    /// `{closing, closed}` at a time.
    #[error("channel name {0:?} is already in use by a non-closing request")]
    DuplicateChannelName(String),

    /// The session has already been torn down; new requests are rejected.
    #[error("session is closed")]
    SessionClosed,

    /// A control frame from the transport failed to decode.
    #[error("failed to decode control frame: {0}")]
    Codec(#[from] bincode::Error),
}

/// Kinds a user's metadata-fetch function may report.
#[derive(Debug, Clone)]
pub enum MetadataErrorKind {
    /// Transient failure; the fetch is retried with backoff and is
    /// invisible to the user.
    Retriable,
    /// The session was closed while the fetch was outstanding.
    Aborted,
    /// Any other failure kind, treated as fatal.
    Fatal(String),
}

/// Routed to [`crate::client::Client::set_unrecoverable_error_handler`] for
/// fatal metadata failures and invariant violations.
#[derive(Debug, Error, Clone)]
pub enum UnrecoverableError {
    /// `fetchConnectionMetadata` resolved with a non-retriable,
    /// non-aborted error.
    #[error("metadata fetch failed fatally: {0}")]
    MetadataFatal(String),

    /// A session invariant was violated (currently: duplicate channel
    /// name), surfaced here instead of panicking.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}

/// The literal message delivered to chan0 when the session could not be
/// brought up (timeout, abort, or exhausted retries). Spelled out as a
/// constant so every call site uses identical wording.
pub const FAILED_TO_OPEN: &str = "Failed to open";
