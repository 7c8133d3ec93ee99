//! Wires the polling fallback transport into a real `Client` without a
//! live server behind it. `PollingTransportFactory::connect` never waits
//! on a network round trip itself; it spawns the send/poll tasks and
//! reports `Open` immediately, so the session reaches `connected` even
//! though the background tasks immediately fail against a refused port.

use multisession_core::metadata::{ConnectionMetadata, FetchFn};
use multisession_core::{ChannelState, Client, ConnectConfig, OpenResult};
use multisession_ws::PollingTransportFactory;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn immediate_metadata_fetcher() -> FetchFn {
    Arc::new(move |_cancel: CancellationToken| {
        Box::pin(async move {
            // Port 9 (discard) refuses connections on loopback almost
            // immediately, so the background send/poll tasks fail fast
            // instead of hanging on a DNS lookup or a connect timeout.
            Ok(ConnectionMetadata { url: "http://127.0.0.1:9".into(), token: "tok".into() })
        })
    })
}

fn recv_within(rx: &Receiver<OpenResult<()>>, timeout: Duration) -> OpenResult<()> {
    rx.recv_timeout(timeout).expect("expected a callback within the timeout")
}

#[tokio::test]
async fn polling_factory_opens_without_a_real_round_trip() {
    let client: Client<()> = Client::new();
    let (tx, rx): (Sender<OpenResult<()>>, Receiver<OpenResult<()>>) = channel();

    client.open(
        ConnectConfig {
            fetch_connection_metadata: immediate_metadata_fetcher(),
            transport_factory: Arc::new(PollingTransportFactory::new()),
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

    client.close();
}
