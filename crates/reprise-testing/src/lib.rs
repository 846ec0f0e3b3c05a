//! Testing utilities and harness for Reprise

pub mod testing;

// Re-export testing utilities
pub use testing::*;

pub mod prelude {
    pub use crate::testing::*;
    pub use reprise_core::{PassKind, PassOutcome, Payload, ScriptContext, ScriptResult};
}
