//! The public façade. `Client` is the only type most users construct
//! directly; everything else in this crate exists to implement its
//! contract.
//!
//! # Example
//!
//! Constructing a client and tearing it down without ever reaching
//! `connected` (a real `transport_factory` would come from
//! `multisession-ws` or another `Transport` implementation):
//!
//! ```
//! use multisession_core::{Client, ConnectConfig};
//! use multisession_core::transport::{Connection, ConnectError, TransportFactory};
//! use async_trait::async_trait;
//! use std::time::Duration;
//!
//! struct NeverConnects;
//!
//! #[async_trait]
//! impl TransportFactory for NeverConnects {
//!     async fn connect(&self, _url: &str, _token: &str) -> Result<Box<dyn Connection>, ConnectError> {
//!         Err(ConnectError("no network in this example".into()))
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let client: Client<()> = Client::new();
//! client.open(
//!     ConnectConfig {
//!         fetch_connection_metadata: std::sync::Arc::new(|_cancel| {
//!             Box::pin(async {
//!                 Ok(multisession_core::metadata::ConnectionMetadata {
//!                     url: "ws://example".into(),
//!                     token: "tok".into(),
//!                 })
//!             })
//!         }),
//!         transport_factory: std::sync::Arc::new(NeverConnects),
//!         context: (),
//!         timeout: Some(Duration::from_millis(50)),
//!     },
//!     |_result| None,
//! );
//! client.close();
//! # });
//! ```

use crate::callback::{ChannelOptions, CloseHandle, CleanupFn, OpenCallback, OpenResult};
use crate::error::UnrecoverableError;
use crate::fsm::{Event, Session};
use crate::metadata::FetchFn;
use crate::registry::{ChannelId, ChannelIdAllocator};
use crate::transport::TransportFactory;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Configuration for one `open()` call.
pub struct ConnectConfig<Ctx> {
    /// Fetches connection parameters, given a cancellation signal; resolves
    /// to either connection metadata or an error kind.
    pub fetch_connection_metadata: FetchFn,
    /// Produces the primary `Transport`; swapped for the polling-fallback
    /// factory internally once the connect ceiling elapses without a
    /// successful open.
    pub transport_factory: Arc<dyn TransportFactory>,
    /// Arbitrary user value threaded through every callback and service
    /// thunk.
    pub context: Ctx,
    /// Upper bound on time spent outside `connected` before chan0 is
    /// delivered a synthetic failure. Defaults to 30s.
    pub timeout: Option<Duration>,
}

/// The session client. Exclusively owns the underlying session task;
/// cheap to clone, since every clone addresses the same one.
pub struct Client<Ctx> {
    ids: Arc<ChannelIdAllocator>,
    events: mpsc::UnboundedSender<Event<Ctx>>,
}

impl<Ctx> Clone for Client<Ctx> {
    fn clone(&self) -> Self {
        Self { ids: self.ids.clone(), events: self.events.clone() }
    }
}

impl<Ctx> Client<Ctx>
where
    Ctx: Clone + Send + Sync + 'static,
{
    /// Construct a client and spawn its session task immediately, in
    /// `inert`, awaiting `open()`. Channels may be registered before
    /// `open()` is ever called; they simply wait in `pending` until the
    /// first `connected`.
    pub fn new() -> Self {
        Self::with_polling_fallback(None)
    }

    /// As [`Client::new`], but also wires a long-polling fallback
    /// transport factory to swap to once the connect ceiling elapses
    /// without a successful open. `multisession-ws` callers pass their
    /// `PollingClientFactory` here.
    pub fn with_polling_fallback(polling_factory: Option<Arc<dyn TransportFactory>>) -> Self {
        let ids = Arc::new(ChannelIdAllocator::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let session: Session<Ctx> = Session::new(ids.clone(), rx, polling_factory);
        tokio::task::spawn(session.run());
        Self { ids, events: tx }
    }

    /// Begin connecting, moving the session from `inert` toward
    /// `fetchingMetadata`. `chan0_cb` is the session-wide callback delivered
    /// on every
    /// `connected` and, on failure to ever connect, exactly once with
    /// [`crate::error::FAILED_TO_OPEN`].
    pub fn open(
        &self,
        cfg: ConnectConfig<Ctx>,
        chan0_cb: impl FnMut(OpenResult<Ctx>) -> Option<CleanupFn> + Send + 'static,
    ) {
        let _ = self.events.send(Event::Open(Box::new(cfg), Box::new(chan0_cb)));
    }

    /// Register a channel request. Legal in any session state; returns a
    /// [`CloseHandle`] immediately, before the request has even reached the
    /// registry: the id is allocated synchronously from the same
    /// [`ChannelIdAllocator`] the session task shares.
    pub fn open_channel(
        &self,
        options: ChannelOptions<Ctx>,
        cb: impl FnMut(OpenResult<Ctx>) -> Option<CleanupFn> + Send + 'static,
    ) -> CloseHandle {
        let id = self.ids.next();
        let state = crate::registry::SharedState::new(crate::registry::ChannelState::Pending);
        let close_requested = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let _ = self.events.send(Event::RegisterChannel {
            id,
            name: options.name,
            service: options.service,
            skip: options.skip,
            callback: Box::new(cb) as OpenCallback<Ctx>,
            state: state.clone(),
            close_requested: close_requested.clone(),
        });
        CloseHandle::for_channel(id, self.events.clone(), state, close_requested)
    }

    /// Idempotent teardown. No user callback fires after this call returns
    /// (cleanups may still run as part of teardown); safe to call multiple
    /// times or before `open()`.
    pub fn close(&self) {
        let _ = self.events.send(Event::Close);
    }

    /// Install a breadcrumb sink. Always supplementary to this crate's own
    /// `tracing` instrumentation, never a replacement for it.
    pub fn set_debug_func(&self, f: impl Fn(&str) + Send + Sync + 'static) {
        let _ = self.events.send(Event::SetDebugFunc(Arc::new(f)));
    }

    /// Install the fatal-error sink for non-retriable metadata failures
    /// and invariant violations.
    pub fn set_unrecoverable_error_handler(&self, f: impl Fn(UnrecoverableError) + Send + Sync + 'static) {
        let _ = self.events.send(Event::SetUnrecoverableErrorHandler(Arc::new(f)));
    }
}

impl<Ctx> Default for Client<Ctx>
where
    Ctx: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl CloseHandle {
    pub(crate) fn for_channel<Ctx>(
        id: ChannelId,
        events: mpsc::UnboundedSender<Event<Ctx>>,
        state: crate::registry::SharedState,
        close_requested: Arc<std::sync::atomic::AtomicBool>,
    ) -> Self
    where
        Ctx: Send + 'static,
    {
        // `CloseHandle` is deliberately not generic over `Ctx` (it is
        // handed back to plain user code that has no reason to know the
        // context type); erase it behind a boxed closure instead.
        let sender: Arc<dyn Fn(ChannelId) + Send + Sync> =
            Arc::new(move |id: ChannelId| {
                let _ = events.send(Event::CloseChannel(id));
            });
        Self::new(id, sender, state, close_requested)
    }
}
