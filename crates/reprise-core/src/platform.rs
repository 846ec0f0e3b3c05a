//! Platform abstraction traits for Reprise runtime services.
//!
//! These traits let the rerun engine delegate wake-ups and timekeeping to
//! the host, so the same session driver runs under a thread-per-session
//! registry, an async executor, or a deterministic test harness.

use std::sync::atomic::{AtomicU64, Ordering};

/// Schedules work for a session.
///
/// Implementations are responsible for waking whatever drives
/// [`Session::run_pending`](crate::Session::run_pending). They must be safe
/// to use from multiple threads because interaction events arrive from the
/// transport's threads.
pub trait RuntimeScheduler: Send + Sync {
    /// Request that the host run the session's pending passes.
    fn schedule_pass(&self);
}

/// Provides timing information for the runtime.
pub trait Clock: Send + Sync {
    /// Milliseconds elapsed since an arbitrary, fixed origin.
    fn now_millis(&self) -> u64;

    fn elapsed_millis(&self, since: u64) -> u64 {
        self.now_millis().saturating_sub(since)
    }
}

/// Scheduler that does nothing; the owner polls the session itself.
#[derive(Debug, Default)]
pub struct DefaultScheduler;

impl RuntimeScheduler for DefaultScheduler {
    fn schedule_pass(&self) {}
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance_millis(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn set_millis(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
