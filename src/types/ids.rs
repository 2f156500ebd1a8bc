//! Newtype wrapper for request identifiers.
//!
//! Request ids are opaque strings, generated lazily on first access and
//! immutable thereafter. Using a newtype prevents accidental mixing with
//! other string-shaped data (comments, paths, hook names).

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// An opaque, unique maintenance request id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    /// Generates a fresh random id (dashless v4 UUID).
    pub fn generate() -> Self {
        RequestId(Uuid::new_v4().simple().to_string())
    }

    pub fn new(s: impl Into<String>) -> Self {
        RequestId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a short (7-character) version of the id for listings.
    pub fn short(&self) -> &str {
        self.0.get(..7).unwrap_or(&self.0)
    }

    /// Returns true if this id starts with the given prefix.
    ///
    /// Used for operator-facing commands that accept the shortened form.
    pub fn matches_prefix(&self, prefix: &str) -> bool {
        !prefix.is_empty() && self.0.starts_with(prefix)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        RequestId(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId(s.to_string())
    }
}
