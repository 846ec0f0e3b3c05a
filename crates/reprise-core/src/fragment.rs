//! Independently rerunnable subtrees of a script.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::context::ScriptContext;
use crate::delta::DeltaPath;
use crate::error::{PassError, ScriptError, ScriptResult};
use crate::hash::hash_parts;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FragmentId(u64);

impl FragmentId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Same name at the same mount point gives the same id on every pass.
    pub fn derive(name: &str, mount_path: &DeltaPath) -> Self {
        Self(hash_parts(&[&"fragment", &name, &mount_path.as_slice()]))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FragmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fragment-{:016x}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunEveryError {
    #[error("`run_every` must not be empty")]
    Empty,
    #[error("`run_every` value `{0}` is not a duration (try `1s`, `500ms`, `2m` or `1h`)")]
    Malformed(String),
    #[error("`run_every` must be greater than zero")]
    Zero,
}

impl From<RunEveryError> for PassError {
    #[track_caller]
    fn from(err: RunEveryError) -> Self {
        PassError::Script(ScriptError::api(err.to_string()))
    }
}

/// Parses a `run_every` interval: a bare number of seconds or a number with
/// an `ms`, `s`, `m` or `h` suffix.
pub fn parse_run_every(raw: &str) -> Result<Duration, RunEveryError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(RunEveryError::Empty);
    }
    let split = trimmed
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let amount: f64 = number
        .trim()
        .parse()
        .map_err(|_| RunEveryError::Malformed(raw.to_string()))?;
    if !amount.is_finite() || amount < 0.0 {
        return Err(RunEveryError::Malformed(raw.to_string()));
    }
    let seconds = match unit.trim() {
        "ms" => amount / 1000.0,
        "" | "s" => amount,
        "m" => amount * 60.0,
        "h" => amount * 3600.0,
        _ => return Err(RunEveryError::Malformed(raw.to_string())),
    };
    let interval = Duration::from_secs_f64(seconds);
    if interval.is_zero() {
        return Err(RunEveryError::Zero);
    }
    Ok(interval)
}

/// Body of a fragment, re-invoked on every rerun of its subtree.
pub type FragmentBody = Arc<dyn Fn(&mut ScriptContext<'_>) -> ScriptResult + Send + Sync>;

/// A registered fragment: where it is mounted and how to rerun it.
#[derive(Clone)]
pub struct FragmentScope {
    id: FragmentId,
    name: String,
    mount_path: DeltaPath,
    run_every: Option<Duration>,
    body: FragmentBody,
    last_run_millis: u64,
}

impl FragmentScope {
    pub fn id(&self) -> FragmentId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mount_path(&self) -> &DeltaPath {
        &self.mount_path
    }

    pub fn run_every(&self) -> Option<Duration> {
        self.run_every
    }

    pub fn last_run_millis(&self) -> u64 {
        self.last_run_millis
    }

    pub(crate) fn body(&self) -> FragmentBody {
        Arc::clone(&self.body)
    }

    fn deadline_millis(&self) -> Option<u64> {
        self.run_every
            .map(|every| self.last_run_millis.saturating_add(every.as_millis() as u64))
    }
}

impl fmt::Debug for FragmentScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FragmentScope")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("mount_path", &self.mount_path)
            .field("run_every", &self.run_every)
            .field("last_run_millis", &self.last_run_millis)
            .finish()
    }
}

/// Fragments known to a session.
#[derive(Debug, Clone, Default)]
pub struct FragmentRegistry {
    scopes: BTreeMap<FragmentId, FragmentScope>,
    seen: BTreeSet<FragmentId>,
}

impl FragmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy a fragment pass starts from; no scope is marked registered yet.
    pub fn begin_pass(&self) -> Self {
        Self {
            scopes: self.scopes.clone(),
            seen: BTreeSet::new(),
        }
    }

    /// Registers (or re-registers) the fragment mounted at `mount_path`.
    pub fn register_fragment(
        &mut self,
        name: &str,
        mount_path: DeltaPath,
        run_every: Option<Duration>,
        body: FragmentBody,
        now_millis: u64,
    ) -> FragmentScope {
        let scope = FragmentScope {
            id: FragmentId::derive(name, &mount_path),
            name: name.to_string(),
            mount_path,
            run_every,
            body,
            last_run_millis: now_millis,
        };
        self.seen.insert(scope.id);
        self.scopes.insert(scope.id, scope.clone());
        scope
    }

    /// Drops fragments nested inside `mount` that were not registered again
    /// since [`begin_pass`](Self::begin_pass), returning their ids.
    pub fn prune_unseen_under(&mut self, mount: &DeltaPath) -> Vec<FragmentId> {
        let stale: Vec<FragmentId> = self
            .scopes
            .values()
            .filter(|scope| scope.mount_path.is_nested_under(mount) && !self.seen.contains(&scope.id))
            .map(|scope| scope.id)
            .collect();
        for id in &stale {
            self.scopes.remove(id);
        }
        stale
    }

    /// Fragments mounted at `mount` or anywhere inside it.
    pub fn ids_within(&self, mount: &DeltaPath) -> Vec<FragmentId> {
        self.scopes
            .values()
            .filter(|scope| scope.mount_path == *mount || scope.mount_path.is_nested_under(mount))
            .map(|scope| scope.id)
            .collect()
    }

    pub fn get(&self, id: FragmentId) -> Option<&FragmentScope> {
        self.scopes.get(&id)
    }

    pub fn contains(&self, id: FragmentId) -> bool {
        self.scopes.contains_key(&id)
    }

    pub fn mark_ran(&mut self, id: FragmentId, now_millis: u64) {
        if let Some(scope) = self.scopes.get_mut(&id) {
            scope.last_run_millis = now_millis;
        }
    }

    /// Fragments whose `run_every` interval has elapsed at `now_millis`.
    pub fn due(&self, now_millis: u64) -> Vec<FragmentId> {
        self.scopes
            .values()
            .filter(|scope| scope.deadline_millis().is_some_and(|deadline| deadline <= now_millis))
            .map(|scope| scope.id)
            .collect()
    }

    /// Earliest time any periodic fragment becomes due.
    pub fn next_deadline_millis(&self) -> Option<u64> {
        self.scopes
            .values()
            .filter_map(FragmentScope::deadline_millis)
            .min()
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FragmentScope> {
        self.scopes.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_body() -> FragmentBody {
        Arc::new(|_ctx: &mut ScriptContext<'_>| Ok(()))
    }

    #[test]
    fn run_every_accepts_common_forms() {
        assert_eq!(parse_run_every("1s"), Ok(Duration::from_secs(1)));
        assert_eq!(parse_run_every("500ms"), Ok(Duration::from_millis(500)));
        assert_eq!(parse_run_every("2m"), Ok(Duration::from_secs(120)));
        assert_eq!(parse_run_every("1h"), Ok(Duration::from_secs(3600)));
        assert_eq!(parse_run_every(" 1.5 "), Ok(Duration::from_millis(1500)));
    }

    #[test]
    fn run_every_rejects_garbage() {
        assert_eq!(parse_run_every(""), Err(RunEveryError::Empty));
        assert_eq!(parse_run_every("0s"), Err(RunEveryError::Zero));
        assert!(matches!(parse_run_every("soon"), Err(RunEveryError::Malformed(_))));
        assert!(matches!(parse_run_every("5 parsecs"), Err(RunEveryError::Malformed(_))));
        assert!(matches!(parse_run_every("-1s"), Err(RunEveryError::Malformed(_))));
    }

    #[test]
    fn invalid_run_every_is_a_markdown_api_error() {
        match PassError::from(RunEveryError::Zero) {
            PassError::Script(err) => assert!(err.message_is_markdown()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn fragment_id_is_stable_per_name_and_mount() {
        let mount = DeltaPath::from(vec![2]);
        assert_eq!(FragmentId::derive("clock", &mount), FragmentId::derive("clock", &mount));
        assert_ne!(
            FragmentId::derive("clock", &mount),
            FragmentId::derive("clock", &DeltaPath::from(vec![3]))
        );
    }

    #[test]
    fn due_fragments_follow_their_interval() {
        let mut registry = FragmentRegistry::new();
        let periodic = registry.register_fragment(
            "ticker",
            DeltaPath::from(vec![0]),
            Some(Duration::from_secs(1)),
            noop_body(),
            0,
        );
        registry.register_fragment("manual", DeltaPath::from(vec![1]), None, noop_body(), 0);

        assert!(registry.due(999).is_empty());
        assert_eq!(registry.due(1000), vec![periodic.id()]);
        assert_eq!(registry.next_deadline_millis(), Some(1000));

        registry.mark_ran(periodic.id(), 1000);
        assert!(registry.due(1500).is_empty());
        assert_eq!(registry.next_deadline_millis(), Some(2000));
    }

    #[test]
    fn unregistered_nested_fragments_are_pruned() {
        let mut registry = FragmentRegistry::new();
        let outer = registry.register_fragment("outer", DeltaPath::from(vec![1]), None, noop_body(), 0);
        let kept = registry.register_fragment("kept", DeltaPath::from(vec![1, 0]), None, noop_body(), 0);
        let gone = registry.register_fragment(
            "gone",
            DeltaPath::from(vec![1, 1]),
            Some(Duration::from_secs(1)),
            noop_body(),
            0,
        );
        let sibling = registry.register_fragment("sibling", DeltaPath::from(vec![2]), None, noop_body(), 0);

        let mut next = registry.begin_pass();
        next.register_fragment("kept", DeltaPath::from(vec![1, 0]), None, noop_body(), 10);
        assert_eq!(next.prune_unseen_under(outer.mount_path()), vec![gone.id()]);

        assert!(next.contains(outer.id()));
        assert!(next.contains(kept.id()));
        assert!(next.contains(sibling.id()));
        assert!(!next.contains(gone.id()));
        assert_eq!(next.next_deadline_millis(), None);
        assert!(registry.contains(gone.id()), "committed registry untouched");
    }

    #[test]
    fn ids_within_includes_the_mount_itself() {
        let mut registry = FragmentRegistry::new();
        let outer = registry.register_fragment("outer", DeltaPath::from(vec![1]), None, noop_body(), 0);
        let inner = registry.register_fragment("inner", DeltaPath::from(vec![1, 3]), None, noop_body(), 0);
        registry.register_fragment("other", DeltaPath::from(vec![2]), None, noop_body(), 0);

        let mut within = registry.ids_within(outer.mount_path());
        within.sort();
        let mut expected = vec![outer.id(), inner.id()];
        expected.sort();
        assert_eq!(within, expected);
    }
}
