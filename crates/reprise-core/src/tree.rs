//! The committed UI of a session.

use std::collections::BTreeMap;

use crate::delta::{Delta, DeltaPath, Payload};
use crate::identity::WidgetIdentity;

/// Path-ordered view of the elements the client currently shows.
///
/// A full pass rebuilds it from scratch; a fragment pass only replaces what
/// lies under the fragment's mount point.
#[derive(Debug, Default, Clone)]
pub struct ElementTree {
    elements: BTreeMap<DeltaPath, Payload>,
}

impl ElementTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace_all(&mut self, deltas: &[Delta]) {
        self.elements.clear();
        self.apply(deltas);
    }

    pub fn replace_under(&mut self, mount: &DeltaPath, deltas: &[Delta]) {
        self.elements.retain(|path, _| !path.is_nested_under(mount));
        self.apply(deltas);
    }

    fn apply(&mut self, deltas: &[Delta]) {
        for delta in deltas {
            self.elements.insert(delta.path.clone(), delta.payload.clone());
        }
    }

    pub fn get(&self, path: &DeltaPath) -> Option<&Payload> {
        self.elements.get(path)
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DeltaPath, &Payload)> {
        self.elements.iter()
    }

    /// Path of the widget currently shown with `identity`.
    pub fn find_widget(&self, identity: &WidgetIdentity) -> Option<&DeltaPath> {
        self.elements.iter().find_map(|(path, payload)| {
            payload
                .widget()
                .filter(|widget| &widget.identity == identity)
                .map(|_| path)
        })
    }
}
