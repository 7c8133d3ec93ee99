//! Connect-generation tagging.
//!
//! Every async outcome (a metadata resolution, a transport event) is tagged
//! with the [`Generation`] the attempt started under. The FSM only acts on
//! an outcome whose generation equals the session's current one; anything
//! else is a stale callback from a superseded attempt and is dropped.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonically increasing tag identifying one attempt to reach
/// `connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(u64);

impl Generation {
    /// The generation before the first connect attempt; never compares
    /// equal to any generation produced by [`GenerationAllocator::next`].
    pub const NONE: Generation = Generation(0);
}

/// Hands out fresh generations. Lives on [`crate::fsm::Session`]; bumped on
/// every `inert -> fetchingMetadata` and `reconnecting -> fetchingMetadata`
/// transition. The retriable-metadata self-loop (`fetchingMetadata ->
/// fetchingMetadata`) deliberately does not bump it.
#[derive(Debug, Default)]
pub struct GenerationAllocator(AtomicU64);

impl GenerationAllocator {
    /// Allocate and return the next generation.
    pub fn next(&self) -> Generation {
        Generation(self.0.fetch_add(1, Ordering::Relaxed) + 1)
    }
}
