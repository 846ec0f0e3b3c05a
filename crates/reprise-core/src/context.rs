//! The per-pass context every element and widget call goes through.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Map;

use crate::config::RuntimeConfig;
use crate::delta::{BlockKind, DeltaId, DeltaPath, DeltaQueue, Payload, Table, WidgetElement};
use crate::error::{ExceptionPayload, PassError, ScriptError, ScriptResult};
use crate::fragment::{parse_run_every, FragmentBody, FragmentId, FragmentRegistry, FragmentScope};
use crate::identity::{self, CallSite, Fingerprint, IdentityInputs, IdentitySet, WidgetIdentity};
use crate::inbox::InterruptToken;
use crate::platform::Clock;
use crate::render::Renderable;
use crate::runtime::{PassKind, SessionId};
use crate::session_state::{ChangeCallback, SessionState, WidgetRegistration};
use crate::stream::{self, Producer, StreamItem, StreamOutput, StreamToken};
use crate::tree::ElementTree;
use crate::Value;

/// Declaration of one widget call.
#[derive(Clone)]
pub struct WidgetSpec {
    kind: String,
    key: Option<String>,
    args: Map<String, Value>,
    default: Value,
    trigger: bool,
    on_change: Option<ChangeCallback>,
}

impl WidgetSpec {
    pub fn new(kind: impl Into<String>, default: impl Into<Value>) -> Self {
        Self {
            kind: kind.into(),
            key: None,
            args: Map::new(),
            default: default.into(),
            trigger: false,
            on_change: None,
        }
    }

    pub fn button(label: &str) -> Self {
        Self::new("button", false).arg("label", label).trigger()
    }

    pub fn text_input(label: &str, default: &str) -> Self {
        Self::new("text_input", default).arg("label", label)
    }

    pub fn checkbox(label: &str, default: bool) -> Self {
        Self::new("checkbox", default).arg("label", label)
    }

    pub fn number_input(label: &str, default: f64) -> Self {
        Self::new("number_input", default).arg("label", label)
    }

    /// Explicit key; it alone decides the widget's identity.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(name.into(), value.into());
        self
    }

    /// The value holds for a single pass and then resets to the default.
    pub fn trigger(mut self) -> Self {
        self.trigger = true;
        self
    }

    /// Runs before the next pass whenever the client changes this widget.
    pub fn on_change(mut self, callback: impl Fn(&mut SessionState) + Send + Sync + 'static) -> Self {
        self.on_change = Some(Arc::new(callback));
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }
}

impl fmt::Debug for WidgetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WidgetSpec")
            .field("kind", &self.kind)
            .field("key", &self.key)
            .field("args", &self.args)
            .field("default", &self.default)
            .field("trigger", &self.trigger)
            .field("on_change", &self.on_change.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
struct Frame {
    path: DeltaPath,
    next_child: usize,
}

impl Frame {
    fn at(path: DeltaPath) -> Self {
        Self { path, next_child: 0 }
    }
}

pub(crate) struct PassSetup<'a> {
    pub session_id: &'a SessionId,
    pub kind: PassKind,
    pub state: SessionState,
    pub fragments: FragmentRegistry,
    pub committed: &'a ElementTree,
    pub token: InterruptToken,
    pub clock: &'a dyn Clock,
    pub config: &'a RuntimeConfig,
    pub last_delta: Option<DeltaId>,
    /// Container the pass writes into: the root, or a fragment's mount.
    pub base: DeltaPath,
}

/// Everything a finished pass leaves behind for the scheduler.
pub(crate) struct PassOutput {
    pub state: SessionState,
    pub queue: DeltaQueue,
    pub fragments: FragmentRegistry,
    /// Next free position in the pass's base container.
    pub tail: DeltaPath,
}

/// Context of one pass over the script.
///
/// Calls append to the current container in order; each call first checks
/// whether a newer interaction superseded the pass and bails out with
/// [`PassError::Interrupted`] if so.
pub struct ScriptContext<'a> {
    session_id: &'a SessionId,
    kind: PassKind,
    state: SessionState,
    queue: DeltaQueue,
    current: Frame,
    parents: Vec<Frame>,
    fragment: Option<FragmentId>,
    identities: IdentitySet,
    fragments: FragmentRegistry,
    committed: &'a ElementTree,
    token: InterruptToken,
    clock: &'a dyn Clock,
    config: &'a RuntimeConfig,
    started_millis: u64,
}

impl<'a> ScriptContext<'a> {
    pub(crate) fn new(setup: PassSetup<'a>) -> Self {
        let mut queue = DeltaQueue::starting_after(setup.last_delta);
        let fragment = match setup.kind {
            PassKind::Full => None,
            PassKind::Fragment(id) => {
                queue.mount_fragment(id, setup.base.clone());
                Some(id)
            }
        };
        Self {
            session_id: setup.session_id,
            kind: setup.kind,
            state: setup.state,
            queue,
            current: Frame::at(setup.base),
            parents: Vec::new(),
            fragment,
            identities: IdentitySet::new(),
            fragments: setup.fragments,
            committed: setup.committed,
            token: setup.token,
            clock: setup.clock,
            config: setup.config,
            started_millis: setup.clock.now_millis(),
        }
    }

    pub(crate) fn finish(self) -> PassOutput {
        let tail = match self.parents.first() {
            Some(base) => base.path.child(base.next_child),
            None => self.current.path.child(self.current.next_child),
        };
        PassOutput {
            state: self.state,
            queue: self.queue,
            fragments: self.fragments,
            tail,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        self.session_id
    }

    pub fn pass_kind(&self) -> PassKind {
        self.kind
    }

    /// Innermost fragment the current call runs in.
    pub fn current_fragment(&self) -> Option<FragmentId> {
        self.fragment
    }

    pub fn config(&self) -> &RuntimeConfig {
        self.config
    }

    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    /// Path of the container calls currently append to.
    pub fn current_path(&self) -> &DeltaPath {
        &self.current.path
    }

    /// The staged session state of this pass.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut SessionState {
        &mut self.state
    }

    pub fn is_interrupted(&self) -> bool {
        self.token.is_superseded()
    }

    pub fn check_interrupted(&self) -> ScriptResult {
        if self.token.is_superseded() {
            Err(PassError::Interrupted)
        } else {
            Ok(())
        }
    }

    pub(crate) fn stream_token(&self) -> StreamToken {
        StreamToken::new(self.token.clone())
    }

    pub(crate) fn allocate_path(&mut self) -> DeltaPath {
        let path = self.current.path.child(self.current.next_child);
        self.current.next_child += 1;
        path
    }

    pub(crate) fn emit_at(&mut self, path: DeltaPath, payload: Payload) -> DeltaId {
        self.queue.enqueue(path, payload)
    }

    fn emit(&mut self, payload: Payload) -> ScriptResult<DeltaPath> {
        self.check_interrupted()?;
        let path = self.allocate_path();
        self.queue.enqueue(path.clone(), payload);
        Ok(path)
    }

    fn enter(&mut self, path: DeltaPath) {
        let parent = std::mem::replace(&mut self.current, Frame::at(path));
        self.parents.push(parent);
    }

    fn leave(&mut self) {
        if let Some(parent) = self.parents.pop() {
            self.current = parent;
        }
    }

    pub fn markdown(&mut self, body: impl Into<String>) -> ScriptResult {
        self.emit(Payload::Markdown { body: body.into() }).map(drop)
    }

    pub fn text(&mut self, body: impl Into<String>) -> ScriptResult {
        self.emit(Payload::Text { body: body.into() }).map(drop)
    }

    pub fn html(&mut self, content: impl Into<Renderable>) -> ScriptResult {
        let body = content.into().into_html();
        self.emit(Payload::Html { body }).map(drop)
    }

    /// Writes any renderable value using the best capability it offers.
    pub fn write(&mut self, content: impl Into<Renderable>) -> ScriptResult {
        self.emit(content.into().into_payload()).map(drop)
    }

    pub fn table(&mut self, table: Table) -> ScriptResult {
        self.emit(Payload::Table { table }).map(drop)
    }

    /// Shows an error the author chose to display; the pass continues.
    pub fn exception(&mut self, err: &ScriptError) -> ScriptResult {
        self.emit(Payload::Exception {
            exception: ExceptionPayload::explicit(err),
        })
        .map(drop)
    }

    /// Declares a widget and returns its current value.
    pub fn widget(&mut self, spec: WidgetSpec) -> ScriptResult<Value> {
        self.check_interrupted()?;
        let path = self.allocate_path();
        let call_site = CallSite::new(path.clone());
        let args = Value::Object(spec.args);
        let identity = identity::assign(&IdentityInputs {
            kind: &spec.kind,
            call_site: &call_site,
            key: spec.key.as_deref(),
            fingerprint: Fingerprint::of(&args),
        });
        self.identities.claim(&identity, &call_site)?;
        self.check_owner(&identity, &call_site)?;

        let value = self.state.register_widget(
            &identity,
            WidgetRegistration {
                default: spec.default,
                trigger: spec.trigger,
                owner: self.fragment,
                on_change: spec.on_change,
            },
        );
        self.queue.enqueue(
            path,
            Payload::Widget {
                widget: WidgetElement {
                    identity,
                    kind: spec.kind,
                    args,
                    value: value.clone(),
                },
            },
        );
        Ok(value)
    }

    /// A fragment pass only sees its own calls, so a collision with a widget
    /// outside the fragment has to be found through the committed tree.
    fn check_owner(&self, identity: &WidgetIdentity, call_site: &CallSite) -> ScriptResult {
        if self.kind == PassKind::Full {
            return Ok(());
        }
        match self.state.owner_of(identity) {
            Some(owner) if owner != self.fragment => Err(PassError::DuplicateIdentity {
                identity: identity.clone(),
                first: CallSite::new(
                    self.committed
                        .find_widget(identity)
                        .cloned()
                        .unwrap_or_default(),
                ),
                second: call_site.clone(),
            }),
            _ => Ok(()),
        }
    }

    pub fn button(&mut self, label: &str) -> ScriptResult<bool> {
        let value = self.widget(WidgetSpec::button(label))?;
        Ok(value.as_bool().unwrap_or(false))
    }

    pub fn text_input(&mut self, label: &str, default: &str) -> ScriptResult<String> {
        let value = self.widget(WidgetSpec::text_input(label, default))?;
        Ok(match value {
            Value::String(text) => text,
            Value::Null => String::new(),
            other => other.to_string(),
        })
    }

    pub fn checkbox(&mut self, label: &str, default: bool) -> ScriptResult<bool> {
        let value = self.widget(WidgetSpec::checkbox(label, default))?;
        Ok(value.as_bool().unwrap_or(default))
    }

    pub fn number_input(&mut self, label: &str, default: f64) -> ScriptResult<f64> {
        let value = self.widget(WidgetSpec::number_input(label, default))?;
        Ok(value.as_f64().unwrap_or(default))
    }

    /// Runs `body` with calls appended inside a new container element.
    pub fn container<R>(
        &mut self,
        key: Option<&str>,
        body: impl FnOnce(&mut Self) -> ScriptResult<R>,
    ) -> ScriptResult<R> {
        let path = self.emit(Payload::Block {
            block: BlockKind::Container {
                key: key.map(str::to_string),
            },
        })?;
        self.enter(path);
        let result = body(self);
        self.leave();
        result
    }

    /// Mounts a fragment here and runs it. Later interactions with widgets
    /// inside it, and its `run_every` timer, rerun only `body`.
    pub fn fragment<F>(&mut self, name: &str, run_every: Option<Duration>, body: F) -> ScriptResult
    where
        F: Fn(&mut ScriptContext<'_>) -> ScriptResult + Send + Sync + 'static,
    {
        self.check_interrupted()?;
        let path = self.allocate_path();
        let body: FragmentBody = Arc::new(body);
        let scope = self
            .fragments
            .register_fragment(name, path.clone(), run_every, body, self.started_millis);
        self.queue.enqueue(
            path.clone(),
            Payload::Block {
                block: BlockKind::Fragment {
                    id: scope.id(),
                    name: name.to_string(),
                },
            },
        );
        self.queue.mount_fragment(scope.id(), path);
        log::trace!("mounted {} `{}` at {}", scope.id(), name, scope.mount_path());
        self.run_fragment(&scope)
    }

    /// Like [`fragment`](Self::fragment) with the interval given as text,
    /// e.g. `"1s"` or `"500ms"`.
    pub fn fragment_every<F>(&mut self, name: &str, run_every: &str, body: F) -> ScriptResult
    where
        F: Fn(&mut ScriptContext<'_>) -> ScriptResult + Send + Sync + 'static,
    {
        let interval = parse_run_every(run_every)?;
        self.fragment(name, Some(interval), body)
    }

    fn run_fragment(&mut self, scope: &FragmentScope) -> ScriptResult {
        self.enter(scope.mount_path().clone());
        let outer = self.fragment.replace(scope.id());
        let body = scope.body();
        let result = body(self);
        self.fragment = outer;
        self.leave();
        result
    }

    /// Streams a producer's output into the page; see [`stream`](crate::stream).
    pub fn write_stream<P: Producer>(&mut self, producer: P) -> ScriptResult<StreamOutput> {
        stream::write_stream(self, producer)
    }

    /// Writes previously streamed output again without a producer.
    pub fn replay(&mut self, output: &StreamOutput) -> ScriptResult {
        for item in output.items() {
            self.write_item(item.clone())?;
        }
        Ok(())
    }

    pub(crate) fn write_item(&mut self, item: StreamItem) -> ScriptResult {
        match item {
            StreamItem::Text(text) => self.markdown(text),
            StreamItem::Table(table) => self.table(table),
            StreamItem::Object(renderable) => self.write(renderable),
        }
    }
}

impl fmt::Debug for ScriptContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptContext")
            .field("session_id", &self.session_id)
            .field("kind", &self.kind)
            .field("current", &self.current.path)
            .field("fragment", &self.fragment)
            .field("queued", &self.queue.len())
            .finish()
    }
}
