//! A real [`TransportFactory`]/[`Connection`] pair over `tokio-tungstenite`,
//! split into a sender task and a receiver task draining the split
//! `WsStream` sink and stream independently, so a slow or stalled read
//! never blocks an outbound send (and vice versa).

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use multisession_core::transport::{Connection, ConnectError, TransportEvent, TransportFactory};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, warn};

use crate::error::WsError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Produces real WebSocket connections. `token` is carried as a `token`
/// query parameter on the connect URL (the simplest auth handshake that
/// works identically across plain `ws://` and TLS `wss://` without needing
/// a custom upgrade request builder).
#[derive(Debug, Default)]
pub struct WsTransportFactory;

impl WsTransportFactory {
    pub fn new() -> Self {
        Self
    }

    fn authenticated_url(url: &str, token: &str) -> String {
        let separator = if url.contains('?') { '&' } else { '?' };
        format!("{url}{separator}token={token}", token = urlencode(token))
    }
}

/// Minimal percent-encoding for the token query parameter; avoids pulling in
/// a dedicated URL-encoding crate for one field.
fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[async_trait]
impl TransportFactory for WsTransportFactory {
    async fn connect(&self, url: &str, token: &str) -> Result<Box<dyn Connection>, ConnectError> {
        let target = Self::authenticated_url(url, token);
        debug!(url = %url, "ws: connecting");

        let (ws_stream, _response) = connect_async(&target)
            .await
            .map_err(|e| ConnectError(WsError::Connect(e).to_string()))?;

        let (write, read) = ws_stream.split();

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        tokio::spawn(sender_task(write, out_rx));
        tokio::spawn(receiver_task(read, events_tx.clone()));

        // The upgrade handshake already succeeded by the time `connect_async`
        // returns, so the connection is open from the session FSM's point of
        // view the moment we hand it back.
        let _ = events_tx.send(TransportEvent::Open);

        Ok(Box::new(WsConnection { out: out_tx, events: Some(events_rx) }))
    }
}

async fn sender_task(
    mut write: futures::stream::SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = write.send(msg).await {
            error!(error = %e, "ws: send failed, closing sender task");
            break;
        }
    }
    let _ = write.close().await;
    debug!("ws: sender task terminated");
}

async fn receiver_task(
    mut read: futures::stream::SplitStream<WsStream>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    while let Some(msg_result) = read.next().await {
        match msg_result {
            Ok(Message::Binary(data)) => {
                let _ = events.send(TransportEvent::Message(Bytes::from(data)));
            }
            Ok(Message::Close(frame)) => {
                let reason = frame.map(|f| f.reason.to_string());
                let _ = events.send(TransportEvent::Closed(reason));
                debug!("ws: received close frame");
                return;
            }
            Ok(Message::Text(_) | Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {
                warn!("ws: ignoring non-binary frame");
            }
            Err(e) => {
                let _ = events.send(TransportEvent::Error(e.to_string()));
                return;
            }
        }
    }
    let _ = events.send(TransportEvent::Closed(None));
    debug!("ws: receiver task terminated");
}

struct WsConnection {
    out: mpsc::UnboundedSender<Message>,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
}

impl Connection for WsConnection {
    fn send(&mut self, frame: Bytes) {
        let _ = self.out.send(Message::Binary(frame.to_vec()));
    }

    fn close(&mut self) {
        let _ = self.out.send(Message::Close(None));
    }

    fn events(&mut self) -> mpsc::UnboundedReceiver<TransportEvent> {
        self.events.take().expect("events() called more than once on a WsConnection")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urlencode_leaves_unreserved_characters_alone() {
        assert_eq!(urlencode("abcXYZ019-_.~"), "abcXYZ019-_.~");
    }

    #[test]
    fn urlencode_escapes_everything_else() {
        assert_eq!(urlencode("a b+c/d"), "a%20b%2Bc%2Fd");
    }

    #[test]
    fn authenticated_url_appends_query_param_without_existing_query() {
        let url = WsTransportFactory::authenticated_url("wss://example/session", "a b");
        assert_eq!(url, "wss://example/session?token=a%20b");
    }

    #[test]
    fn authenticated_url_appends_to_an_existing_query_string() {
        let url = WsTransportFactory::authenticated_url("wss://example/session?room=1", "tok");
        assert_eq!(url, "wss://example/session?room=1&token=tok");
    }
}
