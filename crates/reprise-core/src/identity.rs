//! Stable widget identities.
//!
//! An identity is derived from plain data only: the call site (the element's
//! path, i.e. its container path plus its ordinal inside that container), the
//! widget kind, an optional author key and a fingerprint of the widget's
//! arguments. No caller frames are inspected.
//!
//! When an explicit key is given it alone decides the identity, so an author
//! can keep a widget's state while changing its label or moving it. Without a
//! key, any change to kind, position or arguments produces a new widget.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::collections::map::HashMap;
use crate::delta::DeltaPath;
use crate::error::PassError;
use crate::hash::{hash_one, hash_parts};
use crate::Value;

const IDENTITY_PREFIX: &str = "$$WID-";

/// Where in the script's output a call landed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallSite {
    path: DeltaPath,
}

impl CallSite {
    pub fn new(path: DeltaPath) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &DeltaPath {
        &self.path
    }

    /// Index of the call inside its container.
    pub fn ordinal(&self) -> usize {
        self.path.last().unwrap_or(0)
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call site {}", self.path)
    }
}

/// Hash of a widget's declared arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(u64);

impl Fingerprint {
    /// Fingerprints the canonical JSON text of `args`; object keys are sorted,
    /// so field order in the caller does not matter.
    pub fn of(args: &Value) -> Self {
        Self(hash_one(args.to_string().as_str()))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Inputs of [`assign`].
#[derive(Debug, Clone)]
pub struct IdentityInputs<'a> {
    pub kind: &'a str,
    pub call_site: &'a CallSite,
    pub key: Option<&'a str>,
    pub fingerprint: Fingerprint,
}

/// Identity used to reattach a widget's value across passes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WidgetIdentity(String);

impl WidgetIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The author-supplied key, if the identity was derived from one.
    pub fn user_key(&self) -> Option<&str> {
        self.0
            .strip_prefix(IDENTITY_PREFIX)
            .and_then(|rest| rest.split_once('-'))
            .map(|(_, key)| key)
    }
}

impl fmt::Display for WidgetIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WidgetIdentity {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl From<String> for WidgetIdentity {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

/// Computes the identity of one widget call.
pub fn assign(inputs: &IdentityInputs<'_>) -> WidgetIdentity {
    match inputs.key {
        Some(key) => {
            let hash = hash_parts(&[&"user-key", &key]);
            WidgetIdentity(format!("{IDENTITY_PREFIX}{hash:016x}-{key}"))
        }
        None => {
            let hash = hash_parts(&[
                &"auto",
                &inputs.kind,
                &inputs.call_site.path().as_slice(),
                &inputs.fingerprint.raw(),
            ]);
            WidgetIdentity(format!("{IDENTITY_PREFIX}{hash:016x}"))
        }
    }
}

/// Identities claimed during one pass, used to detect collisions.
#[derive(Debug, Default, Clone)]
pub struct IdentitySet {
    claimed: HashMap<WidgetIdentity, CallSite>,
}

impl IdentitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `identity` for `call_site`; a second claim from anywhere else
    /// is a duplicate-identity error.
    pub fn claim(&mut self, identity: &WidgetIdentity, call_site: &CallSite) -> Result<(), PassError> {
        match self.claimed.get(identity) {
            Some(first) if first == call_site => Ok(()),
            Some(first) => Err(PassError::DuplicateIdentity {
                identity: identity.clone(),
                first: first.clone(),
                second: call_site.clone(),
            }),
            None => {
                self.claimed.insert(identity.clone(), call_site.clone());
                Ok(())
            }
        }
    }

    pub fn contains(&self, identity: &WidgetIdentity) -> bool {
        self.claimed.contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.claimed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claimed.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WidgetIdentity> {
        self.claimed.keys()
    }
}
