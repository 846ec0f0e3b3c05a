//! Inbound events and the generation counter passes watch for supersession.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::fragment::FragmentId;
use crate::identity::WidgetIdentity;
use crate::platform::RuntimeScheduler;
use crate::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The client changed a widget's value.
    WidgetChanged { identity: WidgetIdentity, value: Value },
    /// The client asked for a full rerun.
    Rerun,
    /// A periodic fragment became due.
    FragmentTick(FragmentId),
}

impl SessionEvent {
    /// Interactions supersede a running pass; timer ticks only queue.
    pub fn is_interaction(&self) -> bool {
        !matches!(self, SessionEvent::FragmentTick(_))
    }
}

pub(crate) struct EventInbox {
    queue: Mutex<VecDeque<SessionEvent>>,
    generation: AtomicU64,
    scheduler: Arc<dyn RuntimeScheduler>,
}

impl EventInbox {
    pub(crate) fn new(scheduler: Arc<dyn RuntimeScheduler>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            generation: AtomicU64::new(0),
            scheduler,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<SessionEvent>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn push(&self, event: SessionEvent) {
        {
            let mut queue = self.lock();
            if event.is_interaction() {
                self.generation.fetch_add(1, Ordering::SeqCst);
            }
            queue.push_back(event);
        }
        self.scheduler.schedule_pass();
    }

    /// Takes every queued event together with the generation they bring the
    /// session to. Both are read under the queue lock so a pass started from
    /// them is never superseded by an event it already includes.
    pub(crate) fn drain(&self) -> (Vec<SessionEvent>, u64) {
        let mut queue = self.lock();
        let events = queue.drain(..).collect();
        (events, self.generation.load(Ordering::SeqCst))
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.lock().is_empty()
    }
}

/// Cloneable handle through which transports deliver events to a session.
#[derive(Clone)]
pub struct EventSender {
    inbox: Arc<EventInbox>,
}

impl EventSender {
    pub(crate) fn new(inbox: Arc<EventInbox>) -> Self {
        Self { inbox }
    }

    pub fn submit_event(&self, identity: WidgetIdentity, value: Value) {
        log::trace!("event for {identity}");
        self.inbox
            .push(SessionEvent::WidgetChanged { identity, value });
    }

    pub fn request_rerun(&self) {
        self.inbox.push(SessionEvent::Rerun);
    }

    pub fn send(&self, event: SessionEvent) {
        self.inbox.push(event);
    }

    /// Current session generation; bumped by every interaction.
    pub fn generation(&self) -> u64 {
        self.inbox.generation()
    }
}

/// Snapshot of the generation a pass started from.
#[derive(Clone)]
pub(crate) struct InterruptToken {
    inbox: Arc<EventInbox>,
    generation: u64,
}

impl InterruptToken {
    pub(crate) fn new(inbox: Arc<EventInbox>, generation: u64) -> Self {
        Self { inbox, generation }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn is_superseded(&self) -> bool {
        self.inbox.generation() != self.generation
    }
}
