use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use reprise_core::{
    Delta, EventSender, PassReport, Payload, RuntimeConfig, ScriptContext, ScriptResult,
    Session, SessionId, Transport, Value, WidgetIdentity,
};

pub use reprise_core::ManualClock;

/// Transport that keeps every delivered pass, per session.
#[derive(Default)]
pub struct RecordingTransport {
    passes: Mutex<Vec<(SessionId, Vec<Delta>)>>,
    delivered: Condvar,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(SessionId, Vec<Delta>)>> {
        self.passes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every delivered pass of `session`, oldest first.
    pub fn passes_for(&self, session: &SessionId) -> Vec<Vec<Delta>> {
        self.lock()
            .iter()
            .filter(|(id, _)| id == session)
            .map(|(_, deltas)| deltas.clone())
            .collect()
    }

    pub fn last_for(&self, session: &SessionId) -> Option<Vec<Delta>> {
        self.lock()
            .iter()
            .rev()
            .find(|(id, _)| id == session)
            .map(|(_, deltas)| deltas.clone())
    }

    pub fn count_for(&self, session: &SessionId) -> usize {
        self.lock().iter().filter(|(id, _)| id == session).count()
    }

    pub fn total(&self) -> usize {
        self.lock().len()
    }

    /// Blocks until `session` has received at least `count` passes.
    pub fn wait_for_passes(&self, session: &SessionId, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut passes = self.lock();
        loop {
            if passes.iter().filter(|(id, _)| id == session).count() >= count {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            passes = self
                .delivered
                .wait_timeout(passes, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

impl Transport for RecordingTransport {
    fn on_pass_complete(&self, session_id: &SessionId, deltas: Vec<Delta>) {
        self.lock().push((*session_id, deltas));
        self.delivered.notify_all();
    }
}

/// Markdown bodies among `deltas`, in delivery order.
pub fn markdown_bodies(deltas: &[Delta]) -> Vec<String> {
    deltas
        .iter()
        .filter_map(|delta| match &delta.payload {
            Payload::Markdown { body } => Some(body.clone()),
            _ => None,
        })
        .collect()
}

/// Drives one session deterministically: passes run on the calling thread
/// and time only moves through [`ScriptHarness::advance`].
pub struct ScriptHarness {
    session: Session,
    transport: Arc<RecordingTransport>,
    clock: Arc<ManualClock>,
}

impl ScriptHarness {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&mut ScriptContext<'_>) -> ScriptResult + Send + Sync + 'static,
    {
        Self::with_config(RuntimeConfig::default(), script)
    }

    pub fn with_config<F>(config: RuntimeConfig, script: F) -> Self
    where
        F: Fn(&mut ScriptContext<'_>) -> ScriptResult + Send + Sync + 'static,
    {
        let transport = Arc::new(RecordingTransport::new());
        let clock = Arc::new(ManualClock::new());
        let session = Session::builder(Arc::new(script), transport.clone())
            .config(Arc::new(config))
            .clock(clock.clone())
            .build();
        Self {
            session,
            transport,
            clock,
        }
    }

    /// Runs the initial full pass.
    pub fn start(&mut self) -> Vec<PassReport> {
        self.rerun()
    }

    pub fn rerun(&mut self) -> Vec<PassReport> {
        self.session.request_rerun();
        self.session.run_pending()
    }

    /// Sets the widget labelled `label` and runs the resulting passes.
    ///
    /// # Panics
    ///
    /// Panics if no widget with that label is shown.
    pub fn set_value(&mut self, label: &str, value: impl Into<Value>) -> Vec<PassReport> {
        let identity = self
            .widget_identity(label)
            .unwrap_or_else(|| panic!("no widget labelled `{label}` is shown"));
        self.send(identity, value.into())
    }

    pub fn click(&mut self, label: &str) -> Vec<PassReport> {
        self.set_value(label, true)
    }

    pub fn send(&mut self, identity: WidgetIdentity, value: Value) -> Vec<PassReport> {
        self.session.submit_event(identity, value);
        self.session.run_pending()
    }

    /// Moves the clock forward and runs whatever periodic fragments fell due.
    pub fn advance(&mut self, millis: u64) -> Vec<PassReport> {
        self.clock.advance_millis(millis);
        self.session.tick();
        self.session.run_pending()
    }

    pub fn widget_identity(&self, label: &str) -> Option<WidgetIdentity> {
        self.session.tree().iter().find_map(|(_, payload)| {
            payload
                .widget()
                .filter(|widget| widget.args.get("label").and_then(Value::as_str) == Some(label))
                .map(|widget| widget.identity.clone())
        })
    }

    pub fn widget_value(&self, label: &str) -> Option<Value> {
        let identity = self.widget_identity(label)?;
        self.session.state().get(&identity).cloned()
    }

    /// Markdown currently shown, in tree order.
    pub fn markdown(&self) -> Vec<String> {
        self.session
            .tree()
            .iter()
            .filter_map(|(_, payload)| match payload {
                Payload::Markdown { body } => Some(body.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn last_deltas(&self) -> Vec<Delta> {
        self.transport
            .last_for(self.session.id())
            .unwrap_or_default()
    }

    pub fn delivered_passes(&self) -> usize {
        self.transport.count_for(self.session.id())
    }

    pub fn event_sender(&self) -> EventSender {
        self.session.event_sender()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn transport(&self) -> Arc<RecordingTransport> {
        Arc::clone(&self.transport)
    }

    pub fn clock(&self) -> Arc<ManualClock> {
        Arc::clone(&self.clock)
    }
}
