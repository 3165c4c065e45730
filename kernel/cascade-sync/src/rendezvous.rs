//! SMP bring-up rendezvous counter.

use cascade_arch as arch;
use core::sync::atomic::{AtomicUsize, Ordering};

/// A monotonically increasing ready-counter for barrier-style rendezvous.
///
/// Writers [`signal`](Self::signal) with release ordering once their work
/// is published; waiters busy-wait with acquire loads, so everything a
/// signaler wrote before signaling is visible to whoever observes the
/// count.
///
/// The SMP bring-up uses one instance: every non-bootstrap executor
/// signals after its per-CPU configuration, the bootstrap executor waits
/// for `N - 1`, announces completion, signals once itself, and the peers
/// wait for `N` before proceeding.
pub struct Rendezvous {
    ready: AtomicUsize,
}

impl Rendezvous {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ready: AtomicUsize::new(0),
        }
    }

    /// Announce this participant as ready.
    pub fn signal(&self) {
        self.ready.fetch_add(1, Ordering::Release);
    }

    /// Spin until at least `count` participants have signaled.
    pub fn wait_for(&self, count: usize) {
        while self.ready.load(Ordering::Acquire) < count {
            arch::spin_hint();
        }
    }

    /// Current number of signaled participants.
    #[must_use]
    pub fn count(&self) -> usize {
        self.ready.load(Ordering::Acquire)
    }
}

impl Default for Rendezvous {
    fn default() -> Self {
        Self::new()
    }
}
