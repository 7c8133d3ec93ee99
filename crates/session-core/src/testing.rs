//! A scriptable fake [`crate::transport::Connection`]/[`crate::transport::TransportFactory`]
//! pair that the session FSM drives exactly like a real `Transport`, gated
//! behind the `test-util` feature so downstream transport crates can reuse
//! it in their own integration tests without depending on this crate's
//! `#[cfg(test)]` tree.

use crate::transport::{Connection, ConnectError, TransportEvent, TransportFactory};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// One scripted outcome for a single `connect()` call.
pub enum ConnectOutcome {
    /// Connect succeeds; the returned handle lets the test drive the
    /// connection's events and inspect what it sent.
    Open,
    /// Connect succeeds at the transport level but the connection never
    /// emits `TransportEvent::Open` (used for the connect-timeout /
    /// polling-fallback scenario).
    NeverOpens,
    /// `connect()` itself fails.
    Fail(String),
}

/// A fake transport factory, scripted with a queue of [`ConnectOutcome`]s
/// consumed one per `connect()` call; the last entry repeats once
/// exhausted, so a "fail N times then succeed" script naturally settles
/// on success for any further reconnect attempts in the same test.
pub struct FakeTransportFactory {
    outcomes: Mutex<VecDeque<ConnectOutcome>>,
    connections: Arc<Mutex<Vec<FakeConnectionHandle>>>,
}

impl FakeTransportFactory {
    /// Build a factory that yields `outcomes` in order, one per call to
    /// `connect`.
    pub fn new(outcomes: Vec<ConnectOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            connections: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every connection this factory has ever produced, in connect order;
    /// lets a test reach into a live `FakeTransport` to push events or
    /// inspect sent frames.
    pub fn connections(&self) -> Vec<FakeConnectionHandle> {
        self.connections.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn connect(&self, url: &str, token: &str) -> Result<Box<dyn Connection>, ConnectError> {
        let outcome = {
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.len() > 1 {
                outcomes.pop_front().unwrap()
            } else {
                match outcomes.front() {
                    Some(ConnectOutcome::Open) => ConnectOutcome::Open,
                    Some(ConnectOutcome::NeverOpens) => ConnectOutcome::NeverOpens,
                    Some(ConnectOutcome::Fail(reason)) => ConnectOutcome::Fail(reason.clone()),
                    None => ConnectOutcome::Fail("no scripted outcomes remain".into()),
                }
            }
        };

        match outcome {
            ConnectOutcome::Fail(reason) => Err(ConnectError(reason)),
            ConnectOutcome::Open | ConnectOutcome::NeverOpens => {
                let (connection, handle) = FakeConnection::new(url.to_string(), token.to_string());
                if matches!(outcome, ConnectOutcome::Open) {
                    handle.push(TransportEvent::Open);
                }
                self.connections.lock().unwrap().push(handle);
                Ok(Box::new(connection))
            }
        }
    }
}

struct Shared {
    sent: Vec<Bytes>,
    closed: bool,
}

/// A handle a test holds onto a [`FakeConnection`] it doesn't own (the
/// session does); lets the test push inbound events and inspect outbound
/// frames after handing the `Box<dyn Connection>` to the factory caller.
#[derive(Clone)]
pub struct FakeConnectionHandle {
    /// The URL this connection was created with.
    pub url: String,
    /// The token this connection was created with.
    pub token: String,
    shared: Arc<Mutex<Shared>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl FakeConnectionHandle {
    /// Push a [`TransportEvent`] the session will observe on its next poll.
    pub fn push(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// Every frame sent over this connection so far, in order.
    pub fn sent(&self) -> Vec<Bytes> {
        self.shared.lock().unwrap().sent.clone()
    }

    /// Whether the session has called `close()` on this connection.
    pub fn is_closed(&self) -> bool {
        self.shared.lock().unwrap().closed
    }
}

struct FakeConnection {
    shared: Arc<Mutex<Shared>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
}

impl FakeConnection {
    fn new(url: String, token: String) -> (Self, FakeConnectionHandle) {
        let shared = Arc::new(Mutex::new(Shared { sent: Vec::new(), closed: false }));
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = FakeConnectionHandle { url, token, shared: shared.clone(), events: tx.clone() };
        (Self { shared, events_tx: tx, events_rx: Some(rx) }, handle)
    }
}

impl Connection for FakeConnection {
    fn send(&mut self, frame: Bytes) {
        self.shared.lock().unwrap().sent.push(frame);
    }

    fn close(&mut self) {
        let mut shared = self.shared.lock().unwrap();
        shared.closed = true;
        drop(shared);
        let _ = self.events_tx.send(TransportEvent::Closed(None));
    }

    fn events(&mut self) -> mpsc::UnboundedReceiver<TransportEvent> {
        self.events_rx.take().expect("events() called more than once on a FakeConnection")
    }
}

/// Build a [`FakeTransportFactory`] that always succeeds and opens
/// immediately; the common case for tests that don't care about connect
/// failure paths.
pub fn always_open_factory() -> Arc<FakeTransportFactory> {
    Arc::new(FakeTransportFactory::new(vec![ConnectOutcome::Open]))
}
