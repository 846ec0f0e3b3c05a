//! Per-session widget values and author-keyed state.
//!
//! The store has a single writer: the pass currently running for its session.
//! A pass works on a staged copy (see [`SessionState::begin_pass`]) which the
//! scheduler commits when the pass ends and drops when the pass is aborted,
//! so an interrupted pass never leaves a mutation behind.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::collections::map::{HashMap, HashSet};
use crate::fragment::FragmentId;
use crate::identity::WidgetIdentity;
use crate::Value;

/// Callback run when the client changes a widget, before the next pass.
pub type ChangeCallback = Arc<dyn Fn(&mut SessionState) + Send + Sync>;

#[derive(Clone)]
struct WidgetEntry {
    value: Value,
    default: Value,
    trigger: bool,
    owner: Option<FragmentId>,
    on_change: Option<ChangeCallback>,
}

/// How a widget call registers itself in the store.
#[derive(Clone, Default)]
pub struct WidgetRegistration {
    pub default: Value,
    /// Trigger values hold for one pass, then fall back to `default`.
    pub trigger: bool,
    pub owner: Option<FragmentId>,
    pub on_change: Option<ChangeCallback>,
}

/// Which entries a prune may remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneScope {
    All,
    Fragment(FragmentId),
}

#[derive(Clone, Default)]
pub struct SessionState {
    widgets: HashMap<WidgetIdentity, WidgetEntry>,
    user: BTreeMap<String, Value>,
    seen: HashSet<WidgetIdentity>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Staged copy a pass mutates; nothing is marked seen yet.
    pub fn begin_pass(&self) -> Self {
        Self {
            widgets: self.widgets.clone(),
            user: self.user.clone(),
            seen: HashSet::default(),
        }
    }

    pub fn get(&self, identity: &WidgetIdentity) -> Option<&Value> {
        self.widgets.get(identity).map(|entry| &entry.value)
    }

    /// Sets a widget's value; unknown identities get an entry defaulting to
    /// `Value::Null` until a widget call registers them.
    pub fn set(&mut self, identity: &WidgetIdentity, value: Value) {
        match self.widgets.get_mut(identity) {
            Some(entry) => entry.value = value,
            None => {
                self.widgets.insert(
                    identity.clone(),
                    WidgetEntry {
                        value,
                        default: Value::Null,
                        trigger: false,
                        owner: None,
                        on_change: None,
                    },
                );
            }
        }
    }

    pub fn mark_seen(&mut self, identity: &WidgetIdentity) {
        self.seen.insert(identity.clone());
    }

    pub fn was_seen(&self, identity: &WidgetIdentity) -> bool {
        self.seen.contains(identity)
    }

    /// Removes every widget in `scope` that was not marked seen.
    pub fn prune_unseen(&mut self, scope: PruneScope) -> Vec<WidgetIdentity> {
        let stale: Vec<WidgetIdentity> = self
            .widgets
            .iter()
            .filter(|(identity, entry)| {
                let in_scope = match scope {
                    PruneScope::All => true,
                    PruneScope::Fragment(fragment) => entry.owner == Some(fragment),
                };
                in_scope && !self.seen.contains(*identity)
            })
            .map(|(identity, _)| identity.clone())
            .collect();
        for identity in &stale {
            self.widgets.remove(identity);
        }
        stale
    }

    /// Registers a widget call and returns its current value.
    ///
    /// A fresh identity takes the registration's default; a known one keeps
    /// its stored value but picks up the call's latest metadata.
    pub fn register_widget(&mut self, identity: &WidgetIdentity, registration: WidgetRegistration) -> Value {
        self.mark_seen(identity);
        let entry = self
            .widgets
            .entry(identity.clone())
            .or_insert_with(|| WidgetEntry {
                value: registration.default.clone(),
                default: Value::Null,
                trigger: false,
                owner: None,
                on_change: None,
            });
        entry.default = registration.default;
        entry.trigger = registration.trigger;
        entry.owner = registration.owner;
        entry.on_change = registration.on_change;
        entry.value.clone()
    }

    /// Resets trigger widgets to their defaults once a pass has observed them.
    pub fn reset_triggers(&mut self) {
        for entry in self.widgets.values_mut() {
            if entry.trigger {
                entry.value = entry.default.clone();
            }
        }
    }

    pub fn contains_widget(&self, identity: &WidgetIdentity) -> bool {
        self.widgets.contains_key(identity)
    }

    /// Fragment owning the widget; `Some(None)` for widgets outside fragments.
    pub fn owner_of(&self, identity: &WidgetIdentity) -> Option<Option<FragmentId>> {
        self.widgets.get(identity).map(|entry| entry.owner)
    }

    pub fn on_change_for(&self, identity: &WidgetIdentity) -> Option<ChangeCallback> {
        self.widgets
            .get(identity)
            .and_then(|entry| entry.on_change.clone())
    }

    pub fn widget_count(&self) -> usize {
        self.widgets.len()
    }

    pub fn widget_identities(&self) -> impl Iterator<Item = &WidgetIdentity> {
        self.widgets.keys()
    }

    pub fn user_value(&self, name: &str) -> Option<&Value> {
        self.user.get(name)
    }

    pub fn set_user_value(&mut self, name: impl Into<String>, value: Value) {
        self.user.insert(name.into(), value);
    }

    pub fn remove_user_value(&mut self, name: &str) -> Option<Value> {
        self.user.remove(name)
    }

    pub fn contains_user_value(&self, name: &str) -> bool {
        self.user.contains_key(name)
    }

    pub fn user_keys(&self) -> impl Iterator<Item = &str> {
        self.user.keys().map(String::as_str)
    }
}

impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let widgets: BTreeMap<&str, &Value> = self
            .widgets
            .iter()
            .map(|(identity, entry)| (identity.as_str(), &entry.value))
            .collect();
        f.debug_struct("SessionState")
            .field("widgets", &widgets)
            .field("user", &self.user)
            .field("seen", &self.seen.len())
            .finish()
    }
}
