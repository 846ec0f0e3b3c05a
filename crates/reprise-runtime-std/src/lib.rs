//! Standard runtime services backed by Rust's `std` library.
//!
//! This crate provides concrete implementations of the platform
//! abstraction traits defined in `reprise-core`, plus a
//! [`SessionRegistry`] that drives many sessions concurrently with one
//! worker thread per session.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use reprise_core::{Clock, RuntimeScheduler, Script, Session, SessionBuilder, Transport};

pub mod logging;
pub mod registry;

pub use registry::{RegistryError, SessionRegistry};

type Waker = Arc<dyn Fn() + Send + Sync + 'static>;

/// Scheduler that records pass requests and forwards them to a waker.
pub struct StdScheduler {
    pass_requested: AtomicBool,
    waker: RwLock<Option<Waker>>,
}

impl StdScheduler {
    pub fn new() -> Self {
        Self {
            pass_requested: AtomicBool::new(false),
            waker: RwLock::new(None),
        }
    }

    /// Returns whether a pass has been requested since the last call.
    pub fn take_pass_request(&self) -> bool {
        self.pass_requested.swap(false, Ordering::SeqCst)
    }

    /// Registers a waker that will be invoked whenever a pass is scheduled.
    pub fn set_waker(&self, waker: impl Fn() + Send + Sync + 'static) {
        *self.waker.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(waker));
    }

    pub fn clear_waker(&self) {
        *self.waker.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn wake(&self) {
        let waker = self
            .waker
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(waker) = waker {
            waker();
        }
    }
}

impl Default for StdScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StdScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StdScheduler")
            .field("pass_requested", &self.pass_requested.load(Ordering::SeqCst))
            .finish()
    }
}

impl RuntimeScheduler for StdScheduler {
    fn schedule_pass(&self) {
        self.pass_requested.store(true, Ordering::SeqCst);
        self.wake();
    }
}

/// Clock implementation backed by [`std::time::Instant`].
#[derive(Debug, Clone)]
pub struct StdClock {
    origin: Instant,
}

impl StdClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Time since the clock was created.
    pub fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }
}

impl Default for StdClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for StdClock {
    fn now_millis(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Convenience container bundling the standard scheduler and clock.
#[derive(Clone)]
pub struct StdRuntime {
    scheduler: Arc<StdScheduler>,
    clock: Arc<StdClock>,
}

impl StdRuntime {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(StdClock::default()))
    }

    /// A runtime with its own scheduler reading time from a shared clock.
    pub fn with_clock(clock: Arc<StdClock>) -> Self {
        Self {
            scheduler: Arc::new(StdScheduler::default()),
            clock,
        }
    }

    /// Starts building a session wired to this runtime's scheduler and clock.
    pub fn session_builder(&self, script: Arc<dyn Script>, transport: Arc<dyn Transport>) -> SessionBuilder {
        Session::builder(script, transport)
            .scheduler(self.scheduler.clone())
            .clock(self.clock.clone())
    }

    pub fn scheduler(&self) -> Arc<StdScheduler> {
        Arc::clone(&self.scheduler)
    }

    pub fn clock(&self) -> Arc<StdClock> {
        Arc::clone(&self.clock)
    }

    /// Returns whether a pass was requested since the last poll.
    pub fn take_pass_request(&self) -> bool {
        self.scheduler.take_pass_request()
    }

    pub fn set_waker(&self, waker: impl Fn() + Send + Sync + 'static) {
        self.scheduler.set_waker(waker);
    }

    pub fn clear_waker(&self) {
        self.scheduler.clear_waker();
    }
}

impl fmt::Debug for StdRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StdRuntime")
            .field("scheduler", &self.scheduler)
            .field("clock", &self.clock)
            .finish()
    }
}

impl Default for StdRuntime {
    fn default() -> Self {
        Self::new()
    }
}
