//! The session state machine: the single task that owns the [`Session`]
//! and drives every transition from one `match (state, event)` loop.
//! `Client` never touches `Session` directly; it posts [`Event`]s down an
//! `mpsc::UnboundedSender` and the loop below processes them one at a time,
//! keeping the whole core single-threaded and cooperative.

use crate::backoff::{Backoff, BackoffConfig};
use crate::callback::{ChannelInfo, CloseInitiator, CloseReason, OpenCallback, OpenResult, ServiceSelector, SkipFn};
use crate::client::ConnectConfig;
use crate::error::{MetadataErrorKind, UnrecoverableError, FAILED_TO_OPEN};
use crate::generation::{Generation, GenerationAllocator};
use crate::metadata::MetadataFetcher;
use crate::mux::{ChannelMux, MuxEvent};
use crate::registry::{ChannelId, ChannelIdAllocator, ChannelRegistry, ChannelState, SharedState};
use crate::transport::{TransportEvent, TransportFactory};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Used when `cfg.timeout` is not supplied.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// The session's coarse lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Inert,
    FetchingMetadata,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

/// Inputs posted to the loop from `Client`'s public methods. The
/// metadata/transport/timer-driven inputs (`MetadataResolved`,
/// `TransportOpen`, etc.) are not represented here; the loop observes
/// those directly from the futures it polls in `tokio::select!`, rather
/// than routing them back through this channel.
pub enum Event<Ctx> {
    /// `open(cfg, chan0_cb)`.
    Open(Box<ConnectConfig<Ctx>>, OpenCallback<Ctx>),
    /// `open_channel(options, cb)`, with the request-id and name already
    /// validated/allocated by `Client`.
    RegisterChannel {
        id: ChannelId,
        name: Option<String>,
        service: ServiceSelector<Ctx>,
        skip: Option<SkipFn<Ctx>>,
        callback: OpenCallback<Ctx>,
        state: SharedState,
        close_requested: Arc<std::sync::atomic::AtomicBool>,
    },
    /// The `close` half of a `CloseHandle`.
    CloseChannel(ChannelId),
    /// `Client::close()`.
    Close,
    /// `set_debug_func`.
    SetDebugFunc(Arc<dyn Fn(&str) + Send + Sync>),
    /// `set_unrecoverable_error_handler`.
    SetUnrecoverableErrorHandler(Arc<dyn Fn(UnrecoverableError) + Send + Sync>),
}

/// The session: owns everything needed to drive one logical connection
/// attempt, including every channel request ever made against it.
pub struct Session<Ctx> {
    state: SessionState,
    cfg: Option<ConnectConfig<Ctx>>,
    chan0: Option<OpenCallback<Ctx>>,
    chan0_cleanup: Option<crate::callback::CleanupFn>,
    chan0_notified_failure: bool,
    chan0_opened: bool,
    generations: GenerationAllocator,
    generation: Generation,
    metadata: Option<MetadataFetcher>,
    registry: ChannelRegistry<Ctx>,
    mux: Option<ChannelMux>,
    backoff: Backoff,
    debug_sink: Arc<dyn Fn(&str) + Send + Sync>,
    unrecoverable_sink: Arc<dyn Fn(UnrecoverableError) + Send + Sync>,
    events: mpsc::UnboundedReceiver<Event<Ctx>>,
    using_polling_fallback: bool,
    polling_factory: Option<Arc<dyn TransportFactory>>,
    cancel: CancellationToken,
    ceiling_fired: bool,
    ceiling_deadline: Option<tokio::time::Instant>,
    timeout: Duration,
}

impl<Ctx> Session<Ctx>
where
    Ctx: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        ids: Arc<ChannelIdAllocator>,
        events: mpsc::UnboundedReceiver<Event<Ctx>>,
        polling_factory: Option<Arc<dyn TransportFactory>>,
    ) -> Self {
        Self {
            state: SessionState::Inert,
            cfg: None,
            chan0: None,
            chan0_cleanup: None,
            chan0_notified_failure: false,
            chan0_opened: false,
            generations: GenerationAllocator::default(),
            generation: Generation::NONE,
            metadata: None,
            registry: ChannelRegistry::new(ids),
            mux: None,
            backoff: Backoff::new(BackoffConfig::default()),
            debug_sink: Arc::new(|_| {}),
            unrecoverable_sink: Arc::new(|_| {}),
            events,
            using_polling_fallback: false,
            polling_factory,
            cancel: CancellationToken::new(),
            ceiling_fired: false,
            ceiling_deadline: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    fn breadcrumb(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        debug!(target: "multisession_core::session", "{message}");
        (self.debug_sink)(message);
    }

    fn active_factory(&self) -> Option<Arc<dyn TransportFactory>> {
        if self.using_polling_fallback {
            self.polling_factory.clone()
        } else {
            self.cfg.as_ref().map(|cfg| cfg.transport_factory.clone())
        }
    }

    /// Drive the session until `close()` is processed. Consumes `self`;
    /// intended to be the body of one `tokio::task::spawn`ed future.
    ///
    /// Each iteration takes the one piece of state its current
    /// [`SessionState`] needs exclusive access to (the metadata fetcher or
    /// the mux) out of `self`, selects over it alongside the event channel,
    /// then puts it back before handling whatever fired. This sidesteps
    /// holding two overlapping `&mut self` borrows across an `.await`:
    /// every branch body below runs with `self` fully available again.
    pub async fn run(mut self) {
        loop {
            match self.state {
                SessionState::Closed => break,

                SessionState::Inert => match self.events.recv().await {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },

                SessionState::FetchingMetadata => {
                    let mut metadata = match self.metadata.take() {
                        Some(metadata) => metadata,
                        None => break,
                    };
                    let cancel = self.cancel.clone();
                    let generation = self.generation;
                    let ceiling = self.ceiling_sleep();

                    tokio::select! {
                        biased;
                        Some(event) = self.events.recv() => {
                            self.metadata = Some(metadata);
                            self.handle_event(event).await;
                        }
                        result = metadata.fetch(cancel) => {
                            self.metadata = Some(metadata);
                            self.handle_metadata_result((generation, result)).await;
                        }
                        _ = ceiling, if self.ceiling_deadline.is_some() && !self.ceiling_fired => {
                            self.metadata = Some(metadata);
                            self.handle_ceiling().await;
                        }
                    }
                }

                SessionState::Connecting | SessionState::Connected => {
                    let mut mux = match self.mux.take() {
                        Some(mux) => mux,
                        None => break,
                    };
                    let generation = self.generation;
                    let ceiling = self.ceiling_sleep();
                    let ceiling_active = self.state == SessionState::Connecting
                        && self.ceiling_deadline.is_some()
                        && !self.ceiling_fired;

                    tokio::select! {
                        biased;
                        Some(event) = self.events.recv() => {
                            self.mux = Some(mux);
                            self.handle_event(event).await;
                        }
                        Some(event) = mux.next_event() => {
                            self.mux = Some(mux);
                            self.handle_transport_event((generation, event)).await;
                        }
                        _ = ceiling, if ceiling_active => {
                            self.mux = Some(mux);
                            self.handle_ceiling().await;
                        }
                        else => {
                            // Connection's event stream closed without a
                            // Closed/Error event; treat as an unexpected
                            // disconnect.
                            self.mux = Some(mux);
                            self.handle_disconnect();
                        }
                    }
                }

                SessionState::Reconnecting => {
                    let delay = self.backoff.next_delay();
                    let ceiling = self.ceiling_sleep();
                    let ceiling_active = self.ceiling_deadline.is_some() && !self.ceiling_fired;

                    tokio::select! {
                        biased;
                        Some(event) = self.events.recv() => {
                            self.handle_event(event).await;
                        }
                        _ = ceiling, if ceiling_active => {
                            self.handle_ceiling().await;
                        }
                        _ = tokio::time::sleep(delay) => {
                            // Backoff elapsed: fall back into fetchingMetadata
                            // under a fresh connect-generation.
                            self.begin_fetch(true).await;
                        }
                    }
                }
            }
        }
    }

    /// A sleep that resolves at the standing ceiling deadline, or never if
    /// none is armed. Using an absolute deadline (rather than re-arming a
    /// relative `sleep(self.timeout)` every loop iteration) means it fires
    /// exactly once, `self.timeout` after the single `OpenTimeout` timer is
    /// armed on the *first* `OpenRequested`. Takes the deadline by value so
    /// the returned future never borrows `self`; it runs alongside
    /// `self.events.recv()` in the same `select!`.
    fn ceiling_sleep(&self) -> impl std::future::Future<Output = ()> {
        let deadline = self.ceiling_deadline;
        async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        }
    }

    async fn handle_event(&mut self, event: Event<Ctx>) {
        match event {
            Event::Open(cfg, cb) => self.handle_open(*cfg, cb).await,
            Event::RegisterChannel { id, name, service, skip, callback, state, close_requested } => {
                self.handle_register_channel(id, name, service, skip, callback, state, close_requested)
            }
            Event::CloseChannel(id) => self.handle_close_channel(id).await,
            Event::Close => self.handle_close().await,
            Event::SetDebugFunc(f) => self.debug_sink = f,
            Event::SetUnrecoverableErrorHandler(f) => self.unrecoverable_sink = f,
        }
    }

    async fn handle_open(&mut self, cfg: ConnectConfig<Ctx>, cb: OpenCallback<Ctx>) {
        if self.state != SessionState::Inert {
            warn!("open() called while session already active; ignoring");
            return;
        }
        self.timeout = cfg.timeout.unwrap_or(DEFAULT_TIMEOUT);
        self.cfg = Some(cfg);
        self.chan0 = Some(cb);
        self.ceiling_deadline = Some(tokio::time::Instant::now() + self.timeout);
        self.metadata = self.cfg.as_ref().map(|cfg| MetadataFetcher::new(cfg.fetch_connection_metadata.clone()));
        self.begin_fetch(true).await;
    }

    /// Move into `fetchingMetadata`. `bump_generation` is `false` only for
    /// the retriable-metadata self-loop, which deliberately does not
    /// advance connect-generation; every other path into this state (the
    /// initial `open()`, and `reconnecting` falling back into
    /// `fetchingMetadata` after backoff) bumps it.
    async fn begin_fetch(&mut self, bump_generation: bool) {
        self.breadcrumb("connecting");
        if bump_generation {
            self.generation = self.generations.next();
        }
        self.cancel = CancellationToken::new();
        self.state = SessionState::FetchingMetadata;
    }

    fn handle_register_channel(
        &mut self,
        id: ChannelId,
        name: Option<String>,
        service: ServiceSelector<Ctx>,
        skip: Option<SkipFn<Ctx>>,
        callback: OpenCallback<Ctx>,
        state: SharedState,
        close_requested: Arc<std::sync::atomic::AtomicBool>,
    ) {
        if let Err(err) =
            self.registry.insert_with_id(id, name, service, skip, callback, state, close_requested)
        {
            (self.unrecoverable_sink)(UnrecoverableError::InvariantViolation(err.to_string()));
            return;
        }
        if self.state == SessionState::Connected {
            self.try_open_one(id);
        }
    }

    async fn handle_close_channel(&mut self, id: ChannelId) {
        let Some(request) = self.registry.get_mut(id) else { return };
        match request.state() {
            ChannelState::Open => {
                request.set_state(ChannelState::Closing);
                if let Some(mux) = self.mux.as_mut() {
                    mux.send_close(id);
                }
            }
            ChannelState::Opening => {
                request.set_state(ChannelState::Closing);
            }
            ChannelState::Pending => {
                self.registry.remove(id);
            }
            ChannelState::Closing | ChannelState::Closed => {}
        }
    }

    async fn handle_close(&mut self) {
        self.cancel.cancel();
        self.teardown_channels(false, CloseInitiator::Client);
        if let Some(mut mux) = self.mux.take() {
            mux.close();
        }
        if self.chan0_opened {
            // Already delivered at least one `connected`; close only runs
            // its cleanup, the open callback itself is not re-invoked.
            if let Some(cleanup) = self.chan0_cleanup.take() {
                cleanup(CloseReason { will_reconnect: false, initiator: CloseInitiator::Client });
            }
        } else {
            // close() raced ahead of ever reaching `connected`, e.g. a
            // metadata fetch that never resolves, closed out from under it;
            // chan0 is still owed exactly one delivery.
            self.notify_chan0_failure();
        }
        self.chan0 = None;
        self.breadcrumb("closed");
        self.state = SessionState::Closed;
    }

    /// Reset every tracked channel's current incarnation. `will_reconnect`
    /// selects the `CloseReason` delivered to each cleanup: `true` for an
    /// unexpected disconnect the session will automatically try to recover
    /// from, `false` for the terminal `* --> closed` catch-all.
    fn teardown_channels(&mut self, will_reconnect: bool, initiator: CloseInitiator) {
        for request in self.registry.iter_mut() {
            match request.state() {
                ChannelState::Closed => continue,
                ChannelState::Closing if will_reconnect => {
                    // A channel mid-close at the moment of an unexpected
                    // disconnect finalizes as closed and does not reopen.
                    request.run_cleanup(CloseReason { will_reconnect: false, initiator });
                    request.set_state(ChannelState::Closed);
                }
                _ => {
                    request.run_cleanup(CloseReason { will_reconnect, initiator });
                    request.set_state(if will_reconnect { ChannelState::Pending } else { ChannelState::Closed });
                }
            }
        }
    }

    async fn handle_metadata_result(
        &mut self,
        result: (Generation, Result<crate::metadata::ConnectionMetadata, MetadataErrorKind>),
    ) {
        let (generation, result) = result;
        if generation != self.generation {
            trace!("dropping stale metadata result from a superseded generation");
            return;
        }
        match result {
            Ok(meta) => self.handle_metadata_ok(meta).await,
            Err(MetadataErrorKind::Retriable) => {
                self.breadcrumb("retrying");
                let delay = self.backoff.next_delay();
                tokio::select! {
                    biased;
                    Some(event) = self.events.recv() => self.handle_event(event).await,
                    _ = tokio::time::sleep(delay) => self.begin_fetch(false).await,
                }
            }
            Err(MetadataErrorKind::Aborted) => {
                self.notify_chan0_failure();
                self.finish_close_after_terminal_failure().await;
            }
            Err(MetadataErrorKind::Fatal(reason)) => {
                (self.unrecoverable_sink)(UnrecoverableError::MetadataFatal(reason));
                self.notify_chan0_failure();
                self.finish_close_after_terminal_failure().await;
            }
        }
    }

    async fn handle_metadata_ok(&mut self, meta: crate::metadata::ConnectionMetadata) {
        let Some(factory) = self.active_factory() else { return };
        match factory.connect(&meta.url, &meta.token).await {
            Ok(connection) => {
                self.mux = Some(ChannelMux::new(connection));
                self.state = SessionState::Connecting;
            }
            Err(err) => {
                warn!(error = %err, "transport connect failed");
                if let Some(metadata) = self.metadata.as_mut() {
                    metadata.invalidate_cache();
                }
                self.enter_reconnecting();
            }
        }
    }

    async fn handle_transport_event(&mut self, event: (Generation, TransportEvent)) {
        let (generation, event) = event;
        if generation != self.generation {
            trace!("dropping stale transport event from a superseded generation");
            return;
        }
        match event {
            TransportEvent::Open if self.state == SessionState::Connecting => {
                self.enter_connected();
            }
            TransportEvent::Open => {}
            TransportEvent::Message(bytes) => self.handle_inbound(&bytes),
            TransportEvent::Closed(reason) => {
                self.breadcrumb(format!("transport closed: {reason:?}"));
                self.handle_disconnect();
            }
            TransportEvent::Error(reason) => {
                self.breadcrumb(format!("transport error: {reason}"));
                self.handle_disconnect();
            }
        }
    }

    fn enter_connected(&mut self) {
        self.breadcrumb("connected");
        self.backoff.reset();
        self.ceiling_fired = true; // ceiling only bounds the initial rise to `connected`
        self.state = SessionState::Connected;

        let Some(cfg) = self.cfg.as_ref() else { return };
        let context = cfg.context.clone();
        if let Some(mut cb) = self.chan0.take() {
            let cleanup = cb(OpenResult {
                channel: Some(ChannelInfo { id: ChannelId::from_raw(0), name: None, status: ChannelState::Open }),
                error: None,
                context,
            });
            self.chan0_cleanup = cleanup;
            self.chan0_opened = true;
            self.chan0 = Some(cb);
        }

        let ids: Vec<ChannelId> = self
            .registry
            .iter()
            .filter(|r| r.state() == ChannelState::Pending)
            .map(|r| r.id())
            .collect();
        for id in ids {
            self.try_open_one(id);
        }
    }

    fn try_open_one(&mut self, id: ChannelId) {
        let Some(cfg) = self.cfg.as_ref() else { return };
        let context = cfg.context.clone();
        let Some(request) = self.registry.get_mut(id) else { return };
        if request.state() != ChannelState::Pending {
            return;
        }
        if let Some(skip) = request.skip() {
            if skip(&context) {
                // Never materialized on the wire; re-evaluated next connect.
                return;
            }
        }
        let service = request.service().resolve(&context);
        let name = request.name().map(str::to_owned);
        request.set_state(ChannelState::Opening);
        if let Some(mux) = self.mux.as_mut() {
            mux.send_open(id, service, name);
        }
    }

    fn handle_inbound(&mut self, bytes: &bytes::Bytes) {
        let Some(mux) = self.mux.as_ref() else { return };
        match mux.decode(bytes) {
            MuxEvent::OpenAck { id, result } => self.handle_open_ack(id, result),
            MuxEvent::CloseAck { id } => self.handle_close_ack(id),
            MuxEvent::Data { .. } => {
                // Opaque application payload; a real deployment would fan
                // this out to a per-channel payload sink here.
            }
            MuxEvent::Malformed => {}
        }
    }

    fn handle_open_ack(&mut self, id: ChannelId, result: Result<(), String>) {
        let Some(cfg) = self.cfg.as_ref() else { return };
        let context = cfg.context.clone();
        let Some(request) = self.registry.get_mut(id) else { return };
        match request.state() {
            ChannelState::Opening => match result {
                Ok(()) => {
                    request.set_state(ChannelState::Open);
                    let name = request.name().map(str::to_owned);
                    request.fire_open(OpenResult {
                        channel: Some(ChannelInfo { id, name, status: ChannelState::Open }),
                        error: None,
                        context,
                    });
                }
                Err(reason) => {
                    request.set_state(ChannelState::Closed);
                    request.fire_open(OpenResult { channel: None, error: Some(reason), context });
                }
            },
            ChannelState::Closing => {
                // `close()` was called while this open was still in flight.
                // An `Ok` ack means the server actually opened it on its
                // end: send Close now so it doesn't leak there, and let the
                // CloseAck finalize it. An `Err` ack means the server never
                // opened it, so there's nothing to close, and no open
                // callback ever fired for this incarnation to clean up.
                match result {
                    Ok(()) => {
                        if let Some(mux) = self.mux.as_mut() {
                            mux.send_close(id);
                        }
                    }
                    Err(_) => request.set_state(ChannelState::Closed),
                }
            }
            _ => {}
        }
    }

    fn handle_close_ack(&mut self, id: ChannelId) {
        let Some(request) = self.registry.get_mut(id) else { return };
        if request.state() == ChannelState::Closing {
            request.set_state(ChannelState::Closed);
            request.run_cleanup(CloseReason { will_reconnect: false, initiator: CloseInitiator::Client });
        }
    }

    fn handle_disconnect(&mut self) {
        match self.state {
            SessionState::Connecting => self.enter_reconnecting(),
            SessionState::Connected => {
                self.teardown_channels(true, CloseInitiator::Client);
                if let Some(cleanup) = self.chan0_cleanup.take() {
                    cleanup(CloseReason { will_reconnect: true, initiator: CloseInitiator::Client });
                }
                self.enter_reconnecting();
            }
            _ => {}
        }
    }

    fn enter_reconnecting(&mut self) {
        self.breadcrumb("reconnecting");
        self.mux = None;
        self.state = SessionState::Reconnecting;
    }

    async fn handle_ceiling(&mut self) {
        self.ceiling_fired = true;
        if self.state == SessionState::Connected {
            return;
        }
        self.breadcrumb("polling fallback");
        self.using_polling_fallback = true;
        if matches!(self.state, SessionState::Connecting) {
            self.enter_reconnecting();
        }
        self.notify_chan0_failure();
    }

    fn notify_chan0_failure(&mut self) {
        if self.chan0_notified_failure {
            return;
        }
        self.chan0_notified_failure = true;
        let Some(cfg) = self.cfg.as_ref() else { return };
        let context = cfg.context.clone();
        if let Some(mut cb) = self.chan0.take() {
            let _ = cb(OpenResult { channel: None, error: Some(FAILED_TO_OPEN.to_string()), context });
            self.chan0 = Some(cb);
        }
    }

    async fn finish_close_after_terminal_failure(&mut self) {
        self.teardown_channels(false, CloseInitiator::Client);
        self.state = SessionState::Closed;
    }
}
