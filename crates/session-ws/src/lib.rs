//! Concrete [`multisession_core::transport::TransportFactory`] implementations:
//! a real WebSocket transport and a long-polling fallback, the pair
//! `multisession_core::client::ConnectConfig` expects a caller to wire up
//! together (the fallback is handed to
//! `Client::with_polling_fallback`, the primary to `ConnectConfig::transport_factory`).

pub mod error;
pub mod polling;
pub mod websocket;

pub use error::{PollingError, WsError};
pub use polling::PollingTransportFactory;
pub use websocket::WsTransportFactory;
