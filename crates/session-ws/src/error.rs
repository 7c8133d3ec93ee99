//! Error types specific to the concrete transports in this crate. The FSM
//! never sees these directly; they are surfaced only through
//! `multisession_core::transport::ConnectError` and `TransportEvent::Error`.

use thiserror::Error;

/// A failure building a WebSocket connection.
#[derive(Debug, Error)]
pub enum WsError {
    #[error("failed to connect: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
}

/// A failure performing a long-poll request.
#[derive(Debug, Error)]
pub enum PollingError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {0}")]
    Status(reqwest::StatusCode),
}
