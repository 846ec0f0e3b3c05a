//! Ordered UI mutation records produced by a pass.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ExceptionPayload;
use crate::fragment::FragmentId;
use crate::identity::WidgetIdentity;
use crate::Value;

/// Position of an element: the index path through nested containers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeltaPath(Vec<usize>);

impl DeltaPath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn child(&self, index: usize) -> Self {
        let mut indices = Vec::with_capacity(self.0.len() + 1);
        indices.extend_from_slice(&self.0);
        indices.push(index);
        Self(indices)
    }

    pub fn last(&self) -> Option<usize> {
        self.0.last().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }

    /// Whether `self` lies strictly inside the container at `ancestor`.
    pub fn is_nested_under(&self, ancestor: &DeltaPath) -> bool {
        self.0.len() > ancestor.0.len() && self.0.starts_with(&ancestor.0)
    }
}

impl From<Vec<usize>> for DeltaPath {
    fn from(indices: Vec<usize>) -> Self {
        Self(indices)
    }
}

impl fmt::Display for DeltaPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// Sequence number of a delta inside its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeltaId(pub u64);

/// Layout containers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockKind {
    Container { key: Option<String> },
    Fragment { id: FragmentId, name: String },
}

/// Tabular payload; written whole, never coalesced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn with_row(mut self, row: impl IntoIterator<Item = Value>) -> Self {
        self.rows.push(row.into_iter().collect());
        self
    }
}

/// A widget as shown to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetElement {
    pub identity: WidgetIdentity,
    pub kind: String,
    pub args: Value,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Block { block: BlockKind },
    Markdown { body: String },
    Text { body: String },
    Html { body: String },
    Json { value: Value },
    Table { table: Table },
    Widget { widget: WidgetElement },
    Exception { exception: ExceptionPayload },
}

impl Payload {
    pub fn markdown(body: impl Into<String>) -> Self {
        Payload::Markdown { body: body.into() }
    }

    pub fn widget(&self) -> Option<&WidgetElement> {
        match self {
            Payload::Widget { widget } => Some(widget),
            _ => None,
        }
    }

    pub fn exception(&self) -> Option<&ExceptionPayload> {
        match self {
            Payload::Exception { exception } => Some(exception),
            _ => None,
        }
    }
}

/// One UI mutation. A later delta at the same path replaces the element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub id: DeltaId,
    pub path: DeltaPath,
    pub payload: Payload,
    /// Set when `path` is nested under a fragment's mount point.
    pub fragment: Option<FragmentId>,
}

/// Append-only log of the deltas of one pass.
///
/// The queue is owned by the pass's [`ScriptContext`](crate::ScriptContext)
/// and only handed out once the pass has finished, so a drain can never
/// observe a half-built pass.
#[derive(Debug, Default)]
pub struct DeltaQueue {
    deltas: Vec<Delta>,
    next_id: u64,
    mounts: Vec<(DeltaPath, FragmentId)>,
}

impl DeltaQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continues numbering after `last` so ids stay unique across passes.
    pub fn starting_after(last: Option<DeltaId>) -> Self {
        Self {
            next_id: last.map_or(0, |id| id.0 + 1),
            ..Self::default()
        }
    }

    /// Tags every later delta nested under `path` with `fragment`.
    pub fn mount_fragment(&mut self, fragment: FragmentId, path: DeltaPath) {
        self.mounts.push((path, fragment));
    }

    pub fn enqueue(&mut self, path: DeltaPath, payload: Payload) -> DeltaId {
        let id = DeltaId(self.next_id);
        self.next_id += 1;
        let fragment = self
            .mounts
            .iter()
            .filter(|(mount, _)| path.is_nested_under(mount))
            .max_by_key(|(mount, _)| mount.len())
            .map(|(_, fragment)| *fragment);
        self.deltas.push(Delta {
            id,
            path,
            payload,
            fragment,
        });
        id
    }

    /// Takes every queued delta in enqueue order.
    pub fn drain(&mut self) -> Vec<Delta> {
        std::mem::take(&mut self.deltas)
    }

    /// Drops every queued delta.
    pub fn discard(&mut self) {
        self.deltas.clear();
    }

    pub fn last_id(&self) -> Option<DeltaId> {
        self.next_id.checked_sub(1).map(DeltaId)
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Delta> {
        self.deltas.iter()
    }
}
