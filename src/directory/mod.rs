//! The Directory: the remote scheduling authority.
//!
//! The Directory assigns real execution windows, records fleet-visible
//! outcomes, and tracks whether a node is in service. The engine only
//! consumes the four calls below; everything else about the Directory is
//! out of scope.
//!
//! Errors are categorized as transient (worth retrying on the next agent
//! run) or permanent, the same distinction the engine applies to activity
//! exit codes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::types::RequestId;

pub mod client;

pub use client::{DirectoryClient, DirectoryEndpoint};

/// Scheduling submission for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleItem {
    /// Estimated duration in seconds.
    pub estimate: u64,
    pub comment: String,
}

/// The Directory's answer for one scheduled request.
///
/// A `null` time (or an id missing from the response entirely) means the
/// Directory no longer knows the request: it was deleted fleet-side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledWindow {
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
}

/// Postponement submission for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostponeItem {
    /// Requested delay in seconds.
    pub postpone_by: u64,
}

/// Final outcome report for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,

    /// Final state name ("success", "error", "deleted").
    pub result: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimate: Option<u64>,
}

/// How a Directory call failed, categorized for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryErrorKind {
    /// Network trouble or a 5xx answer; the next agent run may succeed.
    Transient,

    /// The Directory rejected the call; retrying the same call is useless.
    Permanent,
}

#[derive(Debug, Error)]
#[error("directory call {call} failed: {message}")]
pub struct DirectoryError {
    pub kind: DirectoryErrorKind,
    pub call: &'static str,
    pub message: String,
}

impl DirectoryError {
    pub fn transient(call: &'static str, message: impl Into<String>) -> Self {
        DirectoryError {
            kind: DirectoryErrorKind::Transient,
            call,
            message: message.into(),
        }
    }

    pub fn permanent(call: &'static str, message: impl Into<String>) -> Self {
        DirectoryError {
            kind: DirectoryErrorKind::Permanent,
            call,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == DirectoryErrorKind::Transient
    }
}

pub type Result<T> = std::result::Result<T, DirectoryError>;

/// The RPC surface the engine consumes.
pub trait Directory {
    /// Submits estimates and comments; returns assigned due times.
    fn schedule_maintenance(
        &self,
        requests: &BTreeMap<RequestId, ScheduleItem>,
    ) -> Result<BTreeMap<RequestId, ScheduledWindow>>;

    /// Asks for requests to be delayed by the given number of seconds.
    fn postpone_maintenance(&self, requests: &BTreeMap<RequestId, PostponeItem>) -> Result<()>;

    /// Reports final outcomes for archived requests.
    fn end_maintenance(&self, requests: &BTreeMap<RequestId, EndItem>) -> Result<()>;

    /// Flips the node's fleet-visible service flag.
    fn mark_node_service_status(&self, node: &str, in_service: bool) -> Result<()>;
}
