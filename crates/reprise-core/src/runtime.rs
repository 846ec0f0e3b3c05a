//! Per-session rerun scheduling.
//!
//! A [`Session`] owns the committed state of one client connection and runs
//! passes over the script in response to queued events. Passes are strictly
//! sequential; a pass that is superseded by a newer interaction is dropped
//! without leaving any state or deltas behind, and the scheduler restarts
//! with everything that is now queued.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::context::{PassOutput, PassSetup, ScriptContext};
use crate::delta::{Delta, DeltaId, DeltaPath, DeltaQueue, Payload};
use crate::error::{PassError, ScriptError, ScriptResult};
use crate::fragment::{FragmentId, FragmentRegistry, FragmentScope};
use crate::identity::WidgetIdentity;
use crate::inbox::{EventInbox, EventSender, InterruptToken, SessionEvent};
use crate::platform::{Clock, DefaultScheduler, ManualClock, RuntimeScheduler};
use crate::session_state::{ChangeCallback, PruneScope, SessionState};
use crate::tree::ElementTree;
use crate::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for SessionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The author's script, run top to bottom on every full pass.
pub trait Script: Send + Sync {
    fn run(&self, ctx: &mut ScriptContext<'_>) -> ScriptResult;
}

impl<F> Script for F
where
    F: Fn(&mut ScriptContext<'_>) -> ScriptResult + Send + Sync,
{
    fn run(&self, ctx: &mut ScriptContext<'_>) -> ScriptResult {
        self(ctx)
    }
}

/// Receives the deltas of every pass that completes.
pub trait Transport: Send + Sync {
    fn on_pass_complete(&self, session_id: &SessionId, deltas: Vec<Delta>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassKind {
    Full,
    Fragment(FragmentId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running(PassKind),
    Interrupted,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// The script ran to the end.
    Completed,
    /// The script failed; its output up to the failure was committed.
    Failed,
    /// A newer interaction superseded the pass; nothing was committed.
    Interrupted,
    /// A duplicate identity aborted the pass; only the error was delivered.
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub kind: PassKind,
    pub outcome: PassOutcome,
    /// Deltas handed to the transport.
    pub deltas: usize,
    /// Widgets dropped from the state because the pass did not declare them.
    pub pruned: usize,
    pub elapsed_millis: u64,
}

/// Work accumulated from events and not yet covered by a committed pass.
#[derive(Debug, Default)]
struct PendingWork {
    values: Vec<(WidgetIdentity, Value)>,
    full: bool,
    fragments: Vec<FragmentId>,
}

impl PendingWork {
    fn add_fragment(&mut self, id: FragmentId) {
        if !self.fragments.contains(&id) {
            self.fragments.push(id);
        }
    }

    fn complete(&mut self, kind: PassKind) {
        self.values.clear();
        match kind {
            PassKind::Full => {
                self.full = false;
                self.fragments.clear();
            }
            PassKind::Fragment(id) => self.fragments.retain(|pending| *pending != id),
        }
    }
}

pub struct SessionBuilder {
    id: SessionId,
    script: Arc<dyn Script>,
    transport: Arc<dyn Transport>,
    clock: Option<Arc<dyn Clock>>,
    scheduler: Option<Arc<dyn RuntimeScheduler>>,
    config: Arc<RuntimeConfig>,
}

impl SessionBuilder {
    pub fn id(mut self, id: SessionId) -> Self {
        self.id = id;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn RuntimeScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn config(mut self, config: Arc<RuntimeConfig>) -> Self {
        self.config = config;
        self
    }

    /// Without an explicit clock time stands still, which keeps streaming
    /// flushes and timers under the caller's control.
    pub fn build(self) -> Session {
        let scheduler = self
            .scheduler
            .unwrap_or_else(|| Arc::new(DefaultScheduler));
        let clock = self.clock.unwrap_or_else(|| Arc::new(ManualClock::new()));
        Session {
            id: self.id,
            script: self.script,
            transport: self.transport,
            clock,
            config: self.config,
            inbox: Arc::new(EventInbox::new(scheduler)),
            state: SessionState::new(),
            fragments: FragmentRegistry::new(),
            tree: ElementTree::new(),
            run_state: RunState::Idle,
            last_delta: None,
            pending: PendingWork::default(),
        }
    }
}

/// One client's view of the app: committed state, committed tree and the
/// queue of events still to be run.
pub struct Session {
    id: SessionId,
    script: Arc<dyn Script>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    config: Arc<RuntimeConfig>,
    inbox: Arc<EventInbox>,
    state: SessionState,
    fragments: FragmentRegistry,
    tree: ElementTree,
    run_state: RunState,
    last_delta: Option<DeltaId>,
    pending: PendingWork,
}

impl Session {
    pub fn builder(script: Arc<dyn Script>, transport: Arc<dyn Transport>) -> SessionBuilder {
        SessionBuilder {
            id: SessionId::new(),
            script,
            transport,
            clock: None,
            scheduler: None,
            config: Arc::new(RuntimeConfig::default()),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    /// Committed session state.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn tree(&self) -> &ElementTree {
        &self.tree
    }

    pub fn fragments(&self) -> &FragmentRegistry {
        &self.fragments
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn event_sender(&self) -> EventSender {
        EventSender::new(Arc::clone(&self.inbox))
    }

    pub fn submit_event(&self, identity: WidgetIdentity, value: Value) {
        self.event_sender().submit_event(identity, value);
    }

    pub fn request_rerun(&self) {
        self.event_sender().request_rerun();
    }

    pub fn has_pending_events(&self) -> bool {
        self.inbox.has_pending()
    }

    /// Queues a tick for every periodic fragment that is due.
    pub fn tick(&self) -> usize {
        let due = self.fragments.due(self.clock.now_millis());
        for id in &due {
            self.inbox.push(SessionEvent::FragmentTick(*id));
        }
        due.len()
    }

    /// When the next periodic fragment becomes due, in clock milliseconds.
    pub fn next_deadline_millis(&self) -> Option<u64> {
        self.fragments.next_deadline_millis()
    }

    /// Runs passes until no queued work is left.
    pub fn run_pending(&mut self) -> Vec<PassReport> {
        let mut reports = Vec::new();
        loop {
            let (events, generation) = self.inbox.drain();
            self.absorb(events);
            let Some((kind, scope)) = self.next_pass() else {
                break;
            };
            reports.push(self.run_pass(kind, scope, generation));
        }
        if !reports.is_empty() {
            log::trace!("session {}: idle after {} passes", self.id, reports.len());
        }
        self.run_state = RunState::Idle;
        reports
    }

    fn absorb(&mut self, events: Vec<SessionEvent>) {
        for event in events {
            match event {
                SessionEvent::WidgetChanged { identity, value } => match self.state.owner_of(&identity) {
                    None => {
                        log::warn!(
                            "session {}: dropping value for unknown widget {identity}",
                            self.id
                        );
                        self.pending.full = true;
                    }
                    Some(owner) => {
                        self.pending.values.push((identity, value));
                        match owner {
                            Some(fragment) if self.fragments.contains(fragment) => {
                                self.pending.add_fragment(fragment)
                            }
                            _ => self.pending.full = true,
                        }
                    }
                },
                SessionEvent::Rerun => self.pending.full = true,
                SessionEvent::FragmentTick(fragment) => {
                    if self.fragments.contains(fragment) {
                        self.pending.add_fragment(fragment);
                    }
                }
            }
        }
    }

    fn next_pass(&mut self) -> Option<(PassKind, Option<FragmentScope>)> {
        if self.pending.full {
            return Some((PassKind::Full, None));
        }
        while let Some(&id) = self.pending.fragments.first() {
            if let Some(scope) = self.fragments.get(id) {
                return Some((PassKind::Fragment(id), Some(scope.clone())));
            }
            self.pending.fragments.remove(0);
        }
        None
    }

    /// Applies queued widget values to the staged state, then runs the
    /// `on_change` callbacks of the widgets whose value actually changed.
    fn apply_pending(&self, staged: &mut SessionState) {
        let mut callbacks: Vec<ChangeCallback> = Vec::new();
        for (identity, value) in &self.pending.values {
            if staged.get(identity) == Some(value) {
                continue;
            }
            staged.set(identity, value.clone());
            if let Some(callback) = staged.on_change_for(identity) {
                callbacks.push(callback);
            }
        }
        for callback in callbacks {
            callback(staged);
        }
    }

    fn run_pass(&mut self, kind: PassKind, scope: Option<FragmentScope>, generation: u64) -> PassReport {
        let started = self.clock.now_millis();
        self.run_state = RunState::Running(kind);
        log::debug!("session {}: starting {kind:?} pass", self.id);

        let base = scope
            .as_ref()
            .map_or_else(DeltaPath::root, |scope| scope.mount_path().clone());
        let fragments = match kind {
            PassKind::Full => FragmentRegistry::new(),
            PassKind::Fragment(_) => self.fragments.begin_pass(),
        };
        let mut staged = self.state.begin_pass();
        self.apply_pending(&mut staged);

        let script = Arc::clone(&self.script);
        let (result, output) = {
            let mut ctx = ScriptContext::new(PassSetup {
                session_id: &self.id,
                kind,
                state: staged,
                fragments,
                committed: &self.tree,
                token: InterruptToken::new(Arc::clone(&self.inbox), generation),
                clock: &*self.clock,
                config: &self.config,
                last_delta: self.last_delta,
                base: base.clone(),
            });
            let run = panic::catch_unwind(AssertUnwindSafe(|| match &scope {
                None => script.run(&mut ctx),
                Some(scope) => (scope.body())(&mut ctx),
            }));
            let result = run.unwrap_or_else(|payload| {
                Err(PassError::Script(ScriptError::from_panic(&*payload)))
            });
            (result, ctx.finish())
        };

        let (outcome, deltas, pruned) = match result {
            Err(PassError::Interrupted) => {
                log::debug!("session {}: {kind:?} pass interrupted", self.id);
                self.run_state = RunState::Interrupted;
                (PassOutcome::Interrupted, 0, 0)
            }
            Err(err @ PassError::DuplicateIdentity { .. }) => {
                let deltas = self.abort(kind, &base, &err, started);
                (PassOutcome::Aborted, deltas, 0)
            }
            other => {
                let failure = other.err();
                let outcome = if failure.is_some() {
                    PassOutcome::Failed
                } else {
                    PassOutcome::Completed
                };
                let (deltas, pruned) = self.commit(kind, &base, output, failure, started);
                (outcome, deltas, pruned)
            }
        };

        let elapsed_millis = self.clock.elapsed_millis(started);
        log::debug!(
            "session {}: {kind:?} pass {outcome:?} in {elapsed_millis}ms ({deltas} deltas)",
            self.id
        );
        PassReport {
            kind,
            outcome,
            deltas,
            pruned,
            elapsed_millis,
        }
    }

    /// Drops everything the pass produced and delivers only the error.
    /// A fragment is re-armed from `started` so its timer does not fire
    /// again at once.
    fn abort(&mut self, kind: PassKind, base: &DeltaPath, err: &PassError, started: u64) -> usize {
        log::error!("session {}: {err}", self.id);
        if let PassKind::Fragment(id) = kind {
            self.fragments.mark_ran(id, started);
        }
        let mut queue = DeltaQueue::starting_after(self.last_delta);
        if let Some(exception) = err.to_exception(
            self.config.client.show_error_details,
            &self.config.runner.user_frame_prefix,
        ) {
            queue.enqueue(base.child(0), Payload::Exception { exception });
        }
        self.pending.complete(kind);
        self.deliver(kind, base, queue)
    }

    fn commit(
        &mut self,
        kind: PassKind,
        base: &DeltaPath,
        output: PassOutput,
        failure: Option<PassError>,
        started: u64,
    ) -> (usize, usize) {
        let PassOutput {
            mut state,
            mut queue,
            mut fragments,
            tail,
        } = output;

        if let Some(err) = failure {
            log::error!("session {}: script failed: {err}", self.id);
            if let Some(exception) = err.to_exception(
                self.config.client.show_error_details,
                &self.config.runner.user_frame_prefix,
            ) {
                queue.enqueue(tail, Payload::Exception { exception });
            }
        }

        let pruned = match kind {
            PassKind::Full => state.prune_unseen(PruneScope::All),
            PassKind::Fragment(id) => {
                fragments.mark_ran(id, started);
                // Taken before the prune so widgets of dropped fragments go too.
                let owners = fragments.ids_within(base);
                let dropped = fragments.prune_unseen_under(base);
                if !dropped.is_empty() {
                    log::trace!(
                        "session {}: dropped {} fragments no longer mounted",
                        self.id,
                        dropped.len()
                    );
                }
                owners
                    .into_iter()
                    .flat_map(|owner| state.prune_unseen(PruneScope::Fragment(owner)))
                    .collect::<Vec<_>>()
            }
        };
        if !pruned.is_empty() {
            log::trace!("session {}: pruned {} stale widgets", self.id, pruned.len());
        }
        state.reset_triggers();

        self.state = state;
        self.fragments = fragments;
        self.pending.complete(kind);
        (self.deliver(kind, base, queue), pruned.len())
    }

    fn deliver(&mut self, kind: PassKind, base: &DeltaPath, mut queue: DeltaQueue) -> usize {
        if let Some(last) = queue.last_id() {
            self.last_delta = Some(last);
        }
        let deltas = queue.drain();
        match kind {
            PassKind::Full => self.tree.replace_all(&deltas),
            PassKind::Fragment(_) => self.tree.replace_under(base, &deltas),
        }
        let count = deltas.len();
        self.run_state = RunState::Completed;
        self.transport.on_pass_complete(&self.id, deltas);
        count
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("run_state", &self.run_state)
            .field("state", &self.state)
            .field("fragments", &self.fragments.len())
            .field("elements", &self.tree.len())
            .finish()
    }
}
