//! Open/close control framing. This is the lowest layer this crate
//! concerns itself with; everything below it (the payload carried once a
//! channel is open) is opaque application data as far as this crate is
//! concerned.

use crate::registry::ChannelId;
use serde::{Deserialize, Serialize};

/// A control-plane message exchanged over the single multiplexed
/// transport. [`crate::mux::ChannelMux`] is the only component that
/// encodes/decodes these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlFrame {
    /// Ask the server to open a channel bound to `service`.
    Open {
        /// Request-id this channel is addressed by for the rest of its
        /// lifetime (stable across reconnect incarnations).
        id: ChannelId,
        /// Target service name, resolved from [`crate::callback::ServiceSelector`]
        /// at the moment of sending.
        service: String,
        /// Optional stable name, echoed back in logs/diagnostics only;
        /// the wire protocol addresses channels by id.
        name: Option<String>,
    },
    /// Server acknowledgement of an `Open`.
    OpenAck {
        /// The id this ack responds to.
        id: ChannelId,
        /// `Ok(())` on success, `Err(reason)` if the server refused to
        /// open the channel (unknown service, auth failure, etc).
        result: Result<(), String>,
    },
    /// Ask the server to close a channel.
    Close {
        /// The id to close.
        id: ChannelId,
    },
    /// Server acknowledgement of a `Close`.
    CloseAck {
        /// The id this ack responds to.
        id: ChannelId,
    },
    /// An application payload for an already-open channel. Opaque to this
    /// crate beyond routing by `id`.
    Data {
        /// Destination/source channel id.
        id: ChannelId,
        /// Opaque payload bytes.
        payload: Vec<u8>,
    },
}

impl ControlFrame {
    /// Encode to the wire representation sent over the transport.
    pub fn encode(&self) -> bincode::Result<Vec<u8>> {
        bincode::serialize(self)
    }

    /// Decode a frame received from the transport.
    pub fn decode(bytes: &[u8]) -> bincode::Result<Self> {
        bincode::deserialize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_open_and_ack() {
        let id = ChannelId::from_raw(7);
        let frame = ControlFrame::Open {
            id,
            service: "chat".into(),
            name: Some("main-chat".into()),
        };
        let bytes = frame.encode().unwrap();
        let decoded = ControlFrame::decode(&bytes).unwrap();
        match decoded {
            ControlFrame::Open { id: got, service, name } => {
                assert_eq!(got, id);
                assert_eq!(service, "chat");
                assert_eq!(name.as_deref(), Some("main-chat"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn round_trips_data_payload() {
        let id = ChannelId::from_raw(3);
        let frame = ControlFrame::Data { id, payload: vec![1, 2, 3] };
        let bytes = frame.encode().unwrap();
        let decoded = ControlFrame::decode(&bytes).unwrap();
        match decoded {
            ControlFrame::Data { id: got, payload } => {
                assert_eq!(got, id);
                assert_eq!(payload, vec![1, 2, 3]);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
