//! The long-polling fallback transport, swapped in once the connect
//! ceiling elapses without a successful WebSocket open. Reuses the same
//! sender-task/receiver-task channel-bridging split as
//! [`crate::websocket`], just over HTTP round-trips instead of a single
//! socket: one task drains outbound frames via `POST /send`, another polls
//! `GET /poll` on an interval and forwards whatever comes back.

use async_trait::async_trait;
use bytes::Bytes;
use multisession_core::transport::{Connection, ConnectError, TransportEvent, TransportFactory};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::error::PollingError;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Produces long-polling connections against a plain HTTP(S) base URL.
/// Two endpoints are assumed beneath it: `POST {url}/send` for outbound
/// frames and `GET {url}/poll` for inbound ones, both authenticated with a
/// bearer token.
pub struct PollingTransportFactory {
    client: reqwest::Client,
    poll_interval: Duration,
}

impl PollingTransportFactory {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new(), poll_interval: DEFAULT_POLL_INTERVAL }
    }

    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self { client: reqwest::Client::new(), poll_interval }
    }
}

impl Default for PollingTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportFactory for PollingTransportFactory {
    async fn connect(&self, url: &str, token: &str) -> Result<Box<dyn Connection>, ConnectError> {
        debug!(url = %url, "polling: opening fallback connection");

        let stop = Arc::new(AtomicBool::new(false));
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        tokio::spawn(sender_task(self.client.clone(), url.to_string(), token.to_string(), out_rx, events_tx.clone(), stop.clone()));
        tokio::spawn(receiver_task(self.client.clone(), url.to_string(), token.to_string(), self.poll_interval, events_tx.clone(), stop.clone()));

        // No handshake round-trip to wait on beyond what the caller already
        // paid for the real transport; the first successful poll is the
        // real signal, but the FSM only needs `open` once to move out of
        // `connecting`, and a send before any data exists is harmless.
        let _ = events_tx.send(TransportEvent::Open);

        Ok(Box::new(PollingConnection { out: out_tx, events: Some(events_rx), stop }))
    }
}

async fn sender_task(
    client: reqwest::Client,
    url: String,
    token: String,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::UnboundedSender<TransportEvent>,
    stop: Arc<AtomicBool>,
) {
    while let Some(frame) = rx.recv().await {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        let result = client
            .post(format!("{url}/send"))
            .bearer_auth(&token)
            .body(frame.to_vec())
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                let err = PollingError::Status(resp.status());
                let _ = events.send(TransportEvent::Error(err.to_string()));
                break;
            }
            Err(e) => {
                let _ = events.send(TransportEvent::Error(PollingError::Http(e).to_string()));
                break;
            }
        }
    }
    debug!("polling: sender task terminated");
}

async fn receiver_task(
    client: reqwest::Client,
    url: String,
    token: String,
    poll_interval: Duration,
    events: mpsc::UnboundedSender<TransportEvent>,
    stop: Arc<AtomicBool>,
) {
    loop {
        if stop.load(Ordering::Relaxed) {
            let _ = events.send(TransportEvent::Closed(None));
            break;
        }

        let result = client.get(format!("{url}/poll")).bearer_auth(&token).send().await;

        match result {
            Ok(resp) if resp.status() == reqwest::StatusCode::NO_CONTENT => {
                tokio::time::sleep(poll_interval).await;
            }
            Ok(resp) if resp.status().is_success() => match resp.bytes().await {
                Ok(body) if body.is_empty() => {
                    tokio::time::sleep(poll_interval).await;
                }
                Ok(body) => {
                    let _ = events.send(TransportEvent::Message(body));
                }
                Err(e) => {
                    let _ = events.send(TransportEvent::Error(PollingError::Http(e).to_string()));
                    break;
                }
            },
            Ok(resp) => {
                error!(status = %resp.status(), "polling: server returned error");
                let _ = events.send(TransportEvent::Error(PollingError::Status(resp.status()).to_string()));
                break;
            }
            Err(e) => {
                let _ = events.send(TransportEvent::Error(PollingError::Http(e).to_string()));
                break;
            }
        }
    }
    debug!("polling: receiver task terminated");
}

struct PollingConnection {
    out: mpsc::UnboundedSender<Bytes>,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    stop: Arc<AtomicBool>,
}

impl Connection for PollingConnection {
    fn send(&mut self, frame: Bytes) {
        let _ = self.out.send(frame);
    }

    fn close(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    fn events(&mut self) -> mpsc::UnboundedReceiver<TransportEvent> {
        self.events.take().expect("events() called more than once on a PollingConnection")
    }
}
