#![doc = r"Core of the Reprise script-rerun engine."]

extern crate self as reprise_core;

pub mod collections;
pub mod config;
pub mod context;
pub mod delta;
pub mod error;
pub mod fragment;
pub mod hash;
pub mod identity;
pub mod inbox;
pub mod platform;
pub mod render;
pub mod runtime;
pub mod session_state;
pub mod stream;
pub mod tree;

pub use config::{ConfigError, ErrorDetails, RuntimeConfig};
pub use context::{ScriptContext, WidgetSpec};
pub use delta::{BlockKind, Delta, DeltaId, DeltaPath, DeltaQueue, Payload, Table, WidgetElement};
pub use error::{ExceptionPayload, PassError, ScriptError, ScriptResult};
pub use fragment::{parse_run_every, FragmentId, FragmentRegistry, FragmentScope, RunEveryError};
pub use identity::{assign, CallSite, Fingerprint, IdentityInputs, IdentitySet, WidgetIdentity};
pub use inbox::{EventSender, SessionEvent};
pub use platform::{Clock, DefaultScheduler, ManualClock, RuntimeScheduler};
pub use render::{ReprHtml, Renderable};
pub use runtime::{
    PassKind, PassOutcome, PassReport, RunState, Script, Session, SessionBuilder, SessionId, Transport,
};
pub use session_state::{PruneScope, SessionState};
pub use stream::{Chunk, Producer, StreamItem, StreamOutput, StreamToken};
pub use tree::ElementTree;

/// Dynamic value of widgets, arguments and plain payloads.
pub use serde_json::Value;
