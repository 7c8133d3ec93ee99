//! Shared callback/result vocabulary used by both chan0 and per-channel
//! callbacks; chan0 follows the same open/cleanup contract as any other
//! channel.

use crate::registry::ChannelId;
use std::fmt;
use std::sync::Arc;

/// A snapshot of a channel handed to a user callback on open.
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    /// Stable request-id, unchanged across reconnect incarnations.
    pub id: ChannelId,
    /// The stable name, if one was supplied to `openChannel`.
    pub name: Option<String>,
    /// Status at the moment this snapshot was taken, when the open
    /// callback was invoked. To observe a `close()` called synchronously
    /// from inside that same callback before it returns, poll
    /// [`CloseHandle::status`] instead; this field does not update after
    /// the snapshot is handed to the callback.
    pub status: crate::registry::ChannelState,
}

/// Delivered to a user open callback exactly once per successful open, or
/// as a synthetic failure when the session could not be brought up at
/// all.
pub struct OpenResult<Ctx> {
    /// `Some` on success, `None` on failure.
    pub channel: Option<ChannelInfo>,
    /// `Some("Failed to open")` on failure, `None` on success.
    pub error: Option<String>,
    /// The user's connect-time context, cloned for this callback.
    pub context: Ctx,
}

impl<Ctx> fmt::Debug for OpenResult<Ctx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenResult")
            .field("channel", &self.channel)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// Who ended the current incarnation, passed to cleanup callbacks
/// alongside `will_reconnect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseInitiator {
    /// The user (or the library, on their behalf) called `close()`.
    Client,
    /// The server acknowledged a close or tore the channel down itself.
    Server,
}

/// Passed to a cleanup callback when its incarnation ends.
#[derive(Debug, Clone, Copy)]
pub struct CloseReason {
    /// `true` iff the library intends to bring this channel back up
    /// automatically (an unexpected disconnect that will reconnect).
    pub will_reconnect: bool,
    /// Who initiated the end of this incarnation.
    pub initiator: CloseInitiator,
}

/// Returned by an open callback to bracket the incarnation's lifetime;
/// the "callback returns a cleanup closure" idiom. Invoked at most once,
/// when the incarnation that produced it ends.
pub type CleanupFn = Box<dyn FnOnce(CloseReason) + Send>;

/// A user's open callback. `FnMut` because it may fire again on a later
/// reconnect incarnation of the same request: at most once per successful
/// open, but potentially many times across reconnects.
pub type OpenCallback<Ctx> = Box<dyn FnMut(OpenResult<Ctx>) -> Option<CleanupFn> + Send>;

/// Resolves the remote service name a channel is bound to. Re-evaluated on
/// every (re)open attempt when dynamic: a service thunk is called every
/// time the channel is (re)opened, never cached.
#[derive(Clone)]
pub enum ServiceSelector<Ctx> {
    /// A fixed service name.
    Name(String),
    /// A function of the current user context, invoked afresh each open.
    Dynamic(Arc<dyn Fn(&Ctx) -> String + Send + Sync>),
}

impl<Ctx> ServiceSelector<Ctx> {
    /// Resolve to a concrete service name for this open attempt.
    pub fn resolve(&self, ctx: &Ctx) -> String {
        match self {
            ServiceSelector::Name(name) => name.clone(),
            ServiceSelector::Dynamic(f) => f(ctx),
        }
    }
}

impl<Ctx> fmt::Debug for ServiceSelector<Ctx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceSelector::Name(name) => f.debug_tuple("Name").field(name).finish(),
            ServiceSelector::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// A skip predicate re-evaluated on every reconnect; its result is never
/// cached.
pub type SkipFn<Ctx> = Arc<dyn Fn(&Ctx) -> bool + Send + Sync>;

/// Options passed to `open_channel`.
pub struct ChannelOptions<Ctx> {
    /// Target service, literal or resolved per-attempt.
    pub service: ServiceSelector<Ctx>,
    /// Optional stable name; rejected with
    /// [`crate::error::Error::DuplicateChannelName`] if another
    /// non-closing request already holds it.
    pub name: Option<String>,
    /// When this returns `true` at connect time, the channel is never
    /// materialized on the wire for that incarnation.
    pub skip: Option<SkipFn<Ctx>>,
}

impl<Ctx> Default for ChannelOptions<Ctx> {
    fn default() -> Self {
        Self {
            service: ServiceSelector::Name(String::new()),
            name: None,
            skip: None,
        }
    }
}

/// An opaque handle returned by `open_channel`. Dropping it does *not*
/// close the channel; the user holds this only to reference the request
/// by id, and calls [`CloseHandle::close`] explicitly. Erased over
/// the session's `Ctx` type parameter: a `CloseHandle` is plain user-facing
/// data with no reason to carry that generic along with it.
#[derive(Clone)]
pub struct CloseHandle {
    id: ChannelId,
    send: Arc<dyn Fn(ChannelId) + Send + Sync>,
    state: crate::registry::SharedState,
    close_requested: Arc<std::sync::atomic::AtomicBool>,
}

impl CloseHandle {
    pub(crate) fn new(
        id: ChannelId,
        send: Arc<dyn Fn(ChannelId) + Send + Sync>,
        state: crate::registry::SharedState,
        close_requested: Arc<std::sync::atomic::AtomicBool>,
    ) -> Self {
        Self { id, send, state, close_requested }
    }

    /// Request that this channel be closed. Idempotent: closing an
    /// already-closed or already-removed request is a no-op. Marks
    /// [`CloseHandle::status`] as `Closing` synchronously, before the
    /// request to actually tear the channel down has even reached the
    /// session task: calling this from inside the channel's own open
    /// callback must make the close visible to a `status()` call made
    /// later in that same callback, not just after the session has gotten
    /// around to processing the close.
    pub fn close(&self) {
        self.close_requested.store(true, std::sync::atomic::Ordering::Release);
        (self.send)(self.id);
    }

    /// The stable request-id this handle addresses.
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// This channel's lifecycle state as observed right now. Reflects a
    /// `close()` the instant it's called, synchronously, ahead of the
    /// session task actually processing it.
    pub fn status(&self) -> crate::registry::ChannelState {
        let real = self.state.get();
        let closing = self.close_requested.load(std::sync::atomic::Ordering::Acquire);
        if closing && real != crate::registry::ChannelState::Closed {
            crate::registry::ChannelState::Closing
        } else {
            real
        }
    }
}

impl fmt::Debug for CloseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseHandle").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ChannelState, SharedState};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn handle(state: ChannelState) -> (CloseHandle, Arc<AtomicUsize>) {
        let sends = Arc::new(AtomicUsize::new(0));
        let counted = sends.clone();
        let send: Arc<dyn Fn(ChannelId) + Send + Sync> = Arc::new(move |_id| {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        let shared = SharedState::new(state);
        let close_requested = Arc::new(AtomicBool::new(false));
        (CloseHandle::new(ChannelId::from_raw(0), send, shared, close_requested), sends)
    }

    #[test]
    fn status_reflects_open_before_close_is_called() {
        let (handle, _) = handle(ChannelState::Open);
        assert_eq!(handle.status(), ChannelState::Open);
    }

    #[test]
    fn close_marks_status_closing_synchronously() {
        // The defining scenario: a channel's own open callback calls
        // `close()` and then immediately checks `status()`, with no chance
        // for the session task to have processed anything in between.
        let (handle, sends) = handle(ChannelState::Open);
        handle.close();
        assert_eq!(handle.status(), ChannelState::Closing);
        assert_eq!(sends.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_is_idempotent_and_keeps_reporting_closing() {
        let (handle, sends) = handle(ChannelState::Open);
        handle.close();
        handle.close();
        assert_eq!(handle.status(), ChannelState::Closing);
        assert_eq!(sends.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn close_requested_does_not_mask_an_already_closed_channel() {
        let (handle, _) = handle(ChannelState::Closed);
        handle.close();
        assert_eq!(handle.status(), ChannelState::Closed);
    }
}
