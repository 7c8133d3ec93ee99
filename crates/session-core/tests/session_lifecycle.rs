//! Integration tests driving the whole `Client` -> `Session` -> fake
//! transport stack: happy-path connect, channels registered before open,
//! idempotent close, recovery from a bad token, and reconnect after an
//! unexpected disconnect. These use real `tokio::time::sleep`s rather than
//! a mocked clock (no clock-pausing dependency is declared in the
//! workspace).

use multisession_core::metadata::{ConnectionMetadata, FetchFn};
use multisession_core::testing::{always_open_factory, ConnectOutcome, FakeTransportFactory};
use multisession_core::{ChannelOptions, ChannelState, Client, CloseHandle, ConnectConfig, OpenResult};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn immediate_metadata_fetcher() -> FetchFn {
    Arc::new(move |_cancel: CancellationToken| {
        Box::pin(async move {
            Ok(ConnectionMetadata { url: "ws://fake".into(), token: "tok".into() })
        })
    })
}

/// Waits up to `timeout` for at least one message; panics otherwise.
fn recv_within(rx: &Receiver<OpenResult<()>>, timeout: Duration) -> OpenResult<()> {
    rx.recv_timeout(timeout).expect("expected a callback within the timeout")
}

fn chan0_reporter() -> (Sender<OpenResult<()>>, Receiver<OpenResult<()>>) {
    channel()
}

#[tokio::test]
async fn happy_connect_delivers_channel() {
    let factory = always_open_factory();
    let client: Client<()> = Client::new();
    let (tx, rx) = chan0_reporter();

    client.open(
        ConnectConfig {
            fetch_connection_metadata: immediate_metadata_fetcher(),
            transport_factory: factory.clone(),
            context: (),
            timeout: Some(Duration::from_secs(2)),
        },
        move |result| {
            let _ = tx.send(result);
            None
        },
    );

    let result = recv_within(&rx, Duration::from_secs(1));
    assert!(result.error.is_none());
    let channel = result.channel.expect("successful open carries a channel");
    assert_eq!(channel.status, ChannelState::Open);
}

#[tokio::test]
async fn channel_registered_before_open_opens_once_connected() {
    let factory = always_open_factory();
    let client: Client<()> = Client::new();
    let (tx, rx) = chan0_reporter();
    let (chan_tx, chan_rx) = chan0_reporter();

    // Registered before `open()` is ever called; must sit pending and open
    // once the session reaches `connected`.
    let _handle = client.open_channel(
        ChannelOptions { service: multisession_core::callback::ServiceSelector::Name("echo".into()), ..Default::default() },
        move |result| {
            let _ = chan_tx.send(result);
            None
        },
    );

    client.open(
        ConnectConfig {
            fetch_connection_metadata: immediate_metadata_fetcher(),
            transport_factory: factory,
            context: (),
            timeout: Some(Duration::from_secs(2)),
        },
        move |result| {
            let _ = tx.send(result);
            None
        },
    );

    recv_within(&rx, Duration::from_secs(1));
    let chan_result = recv_within(&chan_rx, Duration::from_secs(1));
    assert!(chan_result.error.is_none());
}

#[tokio::test]
async fn close_is_idempotent_and_silences_further_callbacks() {
    let factory = always_open_factory();
    let client: Client<()> = Client::new();
    let (tx, rx) = chan0_reporter();

    client.open(
        ConnectConfig {
            fetch_connection_metadata: immediate_metadata_fetcher(),
            transport_factory: factory,
            context: (),
            timeout: Some(Duration::from_secs(2)),
        },
        move |result| {
            let _ = tx.send(result);
            None
        },
    );
    recv_within(&rx, Duration::from_secs(1));

    client.close();
    client.close(); // idempotent, must not panic or deadlock

    // Give the session task a moment to process the close, then make sure
    // no further chan0 callback shows up.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn bad_token_recovered_after_retry() {
    // First connect attempt fails at the transport level; the session must
    // back off and retry rather than giving up.
    let factory = Arc::new(FakeTransportFactory::new(vec![
        ConnectOutcome::Fail("unauthorized".into()),
        ConnectOutcome::Open,
    ]));
    let client: Client<()> = Client::new();
    let (tx, rx) = chan0_reporter();

    client.open(
        ConnectConfig {
            fetch_connection_metadata: immediate_metadata_fetcher(),
            transport_factory: factory,
            context: (),
            timeout: Some(Duration::from_secs(5)),
        },
        move |result| {
            let _ = tx.send(result);
            None
        },
    );

    // Backoff base is 250ms; allow ample margin for the retry to land.
    let result = recv_within(&rx, Duration::from_secs(3));
    assert!(result.error.is_none(), "session should recover after the retry");
}

#[tokio::test]
async fn unexpected_disconnect_triggers_reconnect() {
    let factory = Arc::new(FakeTransportFactory::new(vec![ConnectOutcome::Open, ConnectOutcome::Open]));
    let client: Client<()> = Client::new();
    let (tx, rx) = chan0_reporter();

    client.open(
        ConnectConfig {
            fetch_connection_metadata: immediate_metadata_fetcher(),
            transport_factory: factory.clone(),
            context: (),
            timeout: Some(Duration::from_secs(5)),
        },
        move |result| {
            let _ = tx.send(result);
            None
        },
    );

    recv_within(&rx, Duration::from_secs(1));

    let live_connections = factory.connections();
    assert_eq!(live_connections.len(), 1);
    live_connections[0].push(multisession_core::transport::TransportEvent::Closed(Some("reset".into())));

    // The second `connected` delivery after the reconnect.
    let second = recv_within(&rx, Duration::from_secs(3));
    assert!(second.error.is_none());
    assert_eq!(factory.connections().len(), 2);
}

#[tokio::test]
async fn close_called_from_inside_its_own_open_callback_is_observed_immediately() {
    // A channel's own open callback can call `handle.close()` and then
    // check `handle.status()` before returning: the close must already be
    // visible, even though the session task hasn't had a chance to run
    // since it delivered this very callback.
    let factory = always_open_factory();
    let client: Client<()> = Client::new();
    let own_handle: Arc<Mutex<Option<CloseHandle>>> = Arc::new(Mutex::new(None));
    let (status_tx, status_rx) = channel::<ChannelState>();

    let handle_slot = own_handle.clone();
    let handle = client.open_channel(
        ChannelOptions {
            service: multisession_core::callback::ServiceSelector::Name("echo".into()),
            ..Default::default()
        },
        move |result| {
            if result.error.is_none() {
                let guard = handle_slot.lock().unwrap();
                let mine = guard.as_ref().expect("handle stored before the channel could open");
                mine.close();
                let _ = status_tx.send(mine.status());
            }
            None
        },
    );
    *own_handle.lock().unwrap() = Some(handle.clone());

    client.open(
        ConnectConfig {
            fetch_connection_metadata: immediate_metadata_fetcher(),
            transport_factory: factory,
            context: (),
            timeout: Some(Duration::from_secs(2)),
        },
        |_| None,
    );

    let status = status_rx.recv_timeout(Duration::from_secs(1)).expect("open callback should fire and close");
    assert_eq!(status, ChannelState::Closing);
    assert_eq!(handle.status(), ChannelState::Closing);
}
