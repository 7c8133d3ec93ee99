//! The channel registry: the authoritative store of every channel request
//! the user has ever opened, keyed by a stable id that survives
//! reconnects.

use crate::callback::{CleanupFn, OpenCallback, ServiceSelector, SkipFn};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// A stable identifier for a channel request, assigned once at
/// `open_channel` time and unchanged across every reconnect incarnation.
/// Never reused, even after the request it named is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Wrap a raw id. Used by [`ChannelIdAllocator`] and by tests that need
    /// a `ChannelId` without going through a full registry.
    pub fn from_raw(raw: u64) -> Self {
        ChannelId(raw)
    }

    /// The underlying numeric value, exposed for logging/diagnostics.
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Hands out [`ChannelId`]s. Shared (via `Arc`) between [`crate::client::Client`]
/// and the [`ChannelRegistry`] living inside the FSM's task, so `open_channel`
/// can allocate a request-id synchronously, before the request has even
/// reached the registry, to construct the [`crate::callback::CloseHandle`]
/// it must return immediately.
#[derive(Debug, Default)]
pub struct ChannelIdAllocator(AtomicU64);

impl ChannelIdAllocator {
    /// A fresh allocator starting at id 1.
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Allocate the next id. Never reused.
    pub fn next(&self) -> ChannelId {
        ChannelId(self.0.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// Lifecycle state of one channel request's *current* incarnation:
/// pending → opening → open → closing → closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Created, not yet sent on the wire (waiting for the session to be
    /// connected, or for the next reconnect attempt).
    Pending,
    /// `Open` control frame sent, awaiting `OpenAck`.
    Opening,
    /// `OpenAck { result: Ok(()) }` received; the open callback has fired.
    Open,
    /// `close()` called or the server initiated close; awaiting `CloseAck`
    /// or transport teardown.
    Closing,
    /// Fully torn down. Per the Open Question resolution in
    /// [`crate::client`]'s module docs, a request that reaches this state
    /// via an explicit close is retired for good; one reached via an
    /// *unexpected* disconnect reverts to `Pending` instead, to be retried
    /// on the next connect.
    Closed,
}

impl ChannelState {
    fn to_u8(self) -> u8 {
        match self {
            ChannelState::Pending => 0,
            ChannelState::Opening => 1,
            ChannelState::Open => 2,
            ChannelState::Closing => 3,
            ChannelState::Closed => 4,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ChannelState::Pending,
            1 => ChannelState::Opening,
            2 => ChannelState::Open,
            3 => ChannelState::Closing,
            _ => ChannelState::Closed,
        }
    }
}

/// A [`ChannelState`] in a cell shared between the registry entry the FSM
/// owns and the [`crate::callback::CloseHandle`] handed back to the user.
/// Only the FSM calls [`SharedState::set`]; [`crate::callback::CloseHandle`]
/// only reads it, through [`SharedState::get`], so a status query never
/// waits on the session task to drain its event queue.
#[derive(Clone)]
pub struct SharedState(Arc<AtomicU8>);

impl SharedState {
    pub(crate) fn new(initial: ChannelState) -> Self {
        Self(Arc::new(AtomicU8::new(initial.to_u8())))
    }

    pub(crate) fn get(&self) -> ChannelState {
        ChannelState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: ChannelState) {
        self.0.store(state.to_u8(), Ordering::Release);
    }
}

/// One entry in the registry: everything needed to (re)open a channel and
/// to deliver results back to the user.
pub struct ChannelRequest<Ctx> {
    id: ChannelId,
    name: Option<String>,
    service: ServiceSelector<Ctx>,
    skip: Option<SkipFn<Ctx>>,
    callback: OpenCallback<Ctx>,
    cleanup: Option<CleanupFn>,
    state: SharedState,
    /// Shared with the `CloseHandle` returned to the user at registration
    /// time; set the moment `CloseHandle::close` is called, ahead of the
    /// session task processing the close.
    close_requested: Arc<AtomicBool>,
}

impl<Ctx> ChannelRequest<Ctx> {
    pub(crate) fn new(
        id: ChannelId,
        name: Option<String>,
        service: ServiceSelector<Ctx>,
        skip: Option<SkipFn<Ctx>>,
        callback: OpenCallback<Ctx>,
        state: SharedState,
        close_requested: Arc<AtomicBool>,
    ) -> Self {
        state.set(ChannelState::Pending);
        Self {
            id,
            name,
            service,
            skip,
            callback,
            cleanup: None,
            state,
            close_requested,
        }
    }

    /// This request's stable id.
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// This request's stable name, if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Current lifecycle state, as the FSM sees it. Not the same thing as
    /// what a [`crate::callback::CloseHandle`] reports through
    /// [`crate::callback::CloseHandle::status`]: that also folds in a
    /// `close()` the FSM hasn't gotten around to processing yet.
    pub fn state(&self) -> ChannelState {
        self.state.get()
    }

    /// The service selector this request was opened with.
    pub fn service(&self) -> &ServiceSelector<Ctx> {
        &self.service
    }

    /// The skip predicate, if any, re-evaluated on every (re)open.
    pub fn skip(&self) -> Option<&SkipFn<Ctx>> {
        self.skip.as_ref()
    }

    /// Invoke the open callback for this incarnation, stashing whatever
    /// cleanup closure it returns to bracket the incarnation's lifetime.
    /// Replaces any previously stored cleanup without calling it; the
    /// caller is responsible for having already run the prior incarnation's
    /// cleanup before reopening.
    pub fn fire_open(&mut self, result: crate::callback::OpenResult<Ctx>) {
        self.cleanup = (self.callback)(result);
    }

    /// Take and run this incarnation's cleanup, if the open callback
    /// supplied one. No-op if the channel never successfully opened.
    pub fn run_cleanup(&mut self, reason: crate::callback::CloseReason) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup(reason);
        }
    }

    /// Whether `CloseHandle::close` has ever been called for this
    /// incarnation or request.
    pub fn close_requested(&self) -> bool {
        self.close_requested.load(Ordering::Acquire)
    }

    pub(crate) fn set_state(&mut self, state: ChannelState) {
        self.state.set(state);
    }
}

impl<Ctx> fmt::Debug for ChannelRequest<Ctx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRequest")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

/// The store of all channel requests for one [`crate::fsm::Session`].
/// Enforces the at-most-one-non-closing-name invariant by scanning
/// existing entries sharing a name rather than a simple name -> id index;
/// a `closing` request and its replacement legitimately share a name for a
/// while, so the index can't be a 1:1 map.
pub struct ChannelRegistry<Ctx> {
    ids: Arc<ChannelIdAllocator>,
    requests: HashMap<ChannelId, ChannelRequest<Ctx>>,
}

impl<Ctx> ChannelRegistry<Ctx> {
    /// An empty registry sharing `ids` with whatever pre-allocates ids on
    /// its behalf (typically the owning `Client`).
    pub fn new(ids: Arc<ChannelIdAllocator>) -> Self {
        Self {
            ids,
            requests: HashMap::new(),
        }
    }

    /// Allocate a fresh id and insert a new request under it, enforcing the
    /// name-uniqueness invariant: duplicate names are rejected with
    /// [`Error::DuplicateChannelName`] rather than silently aliased. A
    /// convenience wrapper around [`ChannelRegistry::insert_with_id`] for
    /// callers that don't need to pre-allocate the id themselves.
    pub fn insert(
        &mut self,
        name: Option<String>,
        service: ServiceSelector<Ctx>,
        skip: Option<SkipFn<Ctx>>,
        callback: OpenCallback<Ctx>,
    ) -> Result<ChannelId> {
        let id = self.ids.next();
        let state = SharedState::new(ChannelState::Pending);
        let close_requested = Arc::new(AtomicBool::new(false));
        self.insert_with_id(id, name, service, skip, callback, state, close_requested)?;
        Ok(id)
    }

    /// Insert a request under an id allocated ahead of time: the path
    /// `Client::open_channel` uses so it can hand back a
    /// [`crate::callback::CloseHandle`] synchronously. `state` and
    /// `close_requested` are the same cells shared with that handle, so a
    /// `close()` called before the request even reaches the registry is
    /// still reflected by the entry created here.
    pub fn insert_with_id(
        &mut self,
        id: ChannelId,
        name: Option<String>,
        service: ServiceSelector<Ctx>,
        skip: Option<SkipFn<Ctx>>,
        callback: OpenCallback<Ctx>,
        state: SharedState,
        close_requested: Arc<AtomicBool>,
    ) -> Result<()> {
        if let Some(name) = &name {
            let held_non_closing = self.requests.values().any(|r| {
                r.name() == Some(name.as_str())
                    && !matches!(r.state(), ChannelState::Closing | ChannelState::Closed)
            });
            if held_non_closing {
                return Err(Error::DuplicateChannelName(name.clone()));
            }
        }
        self.requests.insert(
            id,
            ChannelRequest::new(id, name, service, skip, callback, state, close_requested),
        );
        Ok(())
    }

    /// Look up a request by id.
    pub fn get(&self, id: ChannelId) -> Option<&ChannelRequest<Ctx>> {
        self.requests.get(&id)
    }

    /// Look up a request by id, mutably.
    pub fn get_mut(&mut self, id: ChannelId) -> Option<&mut ChannelRequest<Ctx>> {
        self.requests.get_mut(&id)
    }

    /// Permanently remove a request (only valid once it has reached
    /// [`ChannelState::Closed`] via an explicit close; see the module
    /// docs on [`ChannelState::Closed`]). Frees its name for reuse by a
    /// non-closing request.
    pub fn remove(&mut self, id: ChannelId) -> Option<ChannelRequest<Ctx>> {
        self.requests.remove(&id)
    }

    /// Every request currently tracked, in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = &ChannelRequest<Ctx>> {
        self.requests.values()
    }

    /// Every request currently tracked, mutably, in unspecified order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ChannelRequest<Ctx>> {
        self.requests.values_mut()
    }

    /// Number of requests currently tracked.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::OpenResult;

    fn noop_callback<Ctx: Send + 'static>() -> OpenCallback<Ctx> {
        Box::new(|_: OpenResult<Ctx>| None)
    }

    fn registry<Ctx>() -> ChannelRegistry<Ctx> {
        ChannelRegistry::new(Arc::new(ChannelIdAllocator::new()))
    }

    #[test]
    fn rejects_duplicate_names() {
        let mut reg: ChannelRegistry<()> = registry();
        reg.insert(
            Some("chat".into()),
            ServiceSelector::Name("chat-svc".into()),
            None,
            noop_callback(),
        )
        .unwrap();
        let err = reg
            .insert(
                Some("chat".into()),
                ServiceSelector::Name("chat-svc".into()),
                None,
                noop_callback(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateChannelName(name) if name == "chat"));
    }

    #[test]
    fn allows_reuse_of_name_after_removal() {
        let mut reg: ChannelRegistry<()> = registry();
        let id = reg
            .insert(
                Some("chat".into()),
                ServiceSelector::Name("chat-svc".into()),
                None,
                noop_callback(),
            )
            .unwrap();
        reg.remove(id);
        reg.insert(
            Some("chat".into()),
            ServiceSelector::Name("chat-svc".into()),
            None,
            noop_callback(),
        )
        .unwrap();
    }

    #[test]
    fn allows_reuse_of_name_while_prior_request_is_closing() {
        let mut reg: ChannelRegistry<()> = registry();
        let first = reg
            .insert(
                Some("chat".into()),
                ServiceSelector::Name("chat-svc".into()),
                None,
                noop_callback(),
            )
            .unwrap();
        reg.get_mut(first).unwrap().set_state(ChannelState::Closing);

        // A second request under the same name is allowed to live alongside
        // the first while it finishes closing.
        let second = reg
            .insert(
                Some("chat".into()),
                ServiceSelector::Name("chat-svc".into()),
                None,
                noop_callback(),
            )
            .unwrap();
        assert_ne!(first, second);

        // But a third attempt is rejected: `second` now holds the name in a
        // non-closing state.
        let err = reg
            .insert(
                Some("chat".into()),
                ServiceSelector::Name("chat-svc".into()),
                None,
                noop_callback(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateChannelName(name) if name == "chat"));
    }

    #[test]
    fn ids_are_never_reused() {
        let mut reg: ChannelRegistry<()> = registry();
        let first = reg
            .insert(None, ServiceSelector::Name("a".into()), None, noop_callback())
            .unwrap();
        reg.remove(first);
        let second = reg
            .insert(None, ServiceSelector::Name("a".into()), None, noop_callback())
            .unwrap();
        assert_ne!(first, second);
    }
}
