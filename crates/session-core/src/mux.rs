//! The channel multiplexer: owns the live [`crate::transport::Connection`]
//! while the session is `connected` and is the only component that calls
//! `Connection::send`. Encodes/decodes [`ControlFrame`]s and routes inbound
//! data frames back to the registry by id.

use crate::control::ControlFrame;
use crate::registry::ChannelId;
use crate::transport::{Connection, TransportEvent};
use bytes::Bytes;
use tracing::trace;

/// One decoded inbound event the FSM needs to act on, distinct from a raw
/// [`crate::transport::TransportEvent`]: the mux has already parsed the
/// control frame.
#[derive(Debug)]
pub enum MuxEvent {
    /// The server accepted or rejected an `Open` for `id`.
    OpenAck { id: ChannelId, result: Result<(), String> },
    /// The server acknowledged a `Close` for `id`.
    CloseAck { id: ChannelId },
    /// An application payload for an already-open channel, opaque beyond
    /// routing by id.
    Data { id: ChannelId, payload: Vec<u8> },
    /// A frame that failed to decode; logged and dropped by the caller.
    Malformed,
}

/// Owns the live connection and translates between [`ControlFrame`]s and
/// raw transport bytes.
pub struct ChannelMux {
    connection: Box<dyn Connection>,
    events: tokio::sync::mpsc::UnboundedReceiver<TransportEvent>,
}

impl ChannelMux {
    /// Take ownership of a newly-opened connection, claiming its event
    /// receiver; only one consumer may ever poll a connection's events.
    pub fn new(mut connection: Box<dyn Connection>) -> Self {
        let events = connection.events();
        Self { connection, events }
    }

    /// Await the next raw transport event.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    /// Send an `Open` control frame for `id`, bound to `service`.
    pub fn send_open(&mut self, id: ChannelId, service: String, name: Option<String>) {
        self.send(ControlFrame::Open { id, service, name });
    }

    /// Send a `Close` control frame for `id`.
    pub fn send_close(&mut self, id: ChannelId) {
        self.send(ControlFrame::Close { id });
    }

    /// Send an application payload for an already-open channel.
    pub fn send_data(&mut self, id: ChannelId, payload: Vec<u8>) {
        self.send(ControlFrame::Data { id, payload });
    }

    fn send(&mut self, frame: ControlFrame) {
        match frame.encode() {
            Ok(bytes) => self.connection.send(Bytes::from(bytes)),
            Err(err) => trace!(error = %err, "failed to encode control frame"),
        }
    }

    /// Decode an inbound transport message into a [`MuxEvent`].
    pub fn decode(&self, bytes: &Bytes) -> MuxEvent {
        match ControlFrame::decode(bytes) {
            Ok(ControlFrame::OpenAck { id, result }) => MuxEvent::OpenAck { id, result },
            Ok(ControlFrame::CloseAck { id }) => MuxEvent::CloseAck { id },
            Ok(ControlFrame::Data { id, payload }) => MuxEvent::Data { id, payload },
            Ok(ControlFrame::Open { .. } | ControlFrame::Close { .. }) => {
                trace!("ignoring client-directed control frame received from server");
                MuxEvent::Malformed
            }
            Err(err) => {
                trace!(error = %err, "failed to decode control frame");
                MuxEvent::Malformed
            }
        }
    }

    /// Begin a graceful close of the underlying connection.
    pub fn close(&mut self) {
        self.connection.close();
    }
}
