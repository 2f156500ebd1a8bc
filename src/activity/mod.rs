//! Maintenance activities: the polymorphic units of work inside requests.
//!
//! An [`Activity`] is a closed tagged union over the built-in variants.
//! Each variant carries only its durable fields; the wrapper holds the
//! outcome of the most recent run (stdout, stderr, returncode, duration).
//! Persistence uses an explicit `kind` tag, never runtime type
//! introspection.
//!
//! Activities are created once and run possibly several times (once per
//! attempt) until their request reaches a terminal state. When a new
//! proposal collides with a queued activity of the same kind, the queued
//! one absorbs it via [`Activity::merge`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::types::{Estimate, EXIT_SOFTWARE, RequestId};

pub mod probes;
pub mod reboot;
pub mod shell_script;
pub mod system_update;
pub mod vm_change;

pub use probes::{
    CommandPlatform, LiveProbes, PlatformCommands, PlatformError, SystemProbes,
    UnconfiguredPlatform, UpdatePlatform,
};
pub use reboot::RebootActivity;
pub use shell_script::ShellScriptActivity;
pub use system_update::{SystemUpdateActivity, UnitChanges};
pub use vm_change::VmChangeActivity;

/// Which kind of reboot an activity needs to take effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebootType {
    /// Regular reboot of the running system.
    Warm,

    /// Full power-off, needed when the virtualization environment must
    /// re-create the machine (memory/core changes, hypervisor updates).
    Cold,
}

impl fmt::Display for RebootType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebootType::Warm => write!(f, "reboot"),
            RebootType::Cold => write!(f, "poweroff"),
        }
    }
}

/// A changed scalar setting, recorded in merge change sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange<T> {
    pub before: Option<T>,
    pub after: T,
}

/// What a merge altered, per variant. Reported to operators when a merge
/// is significant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MergeChanges {
    None,
    Reboot {
        before: RebootType,
        after: RebootType,
    },
    VmChange {
        memory: Option<FieldChange<u64>>,
        cores: Option<FieldChange<u32>>,
    },
    SystemUpdate {
        added_unit_changes: UnitChanges,
        removed_unit_changes: UnitChanges,
    },
}

/// Result of merging another activity into this one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeResult {
    /// False means the kinds are incompatible and nothing was merged.
    pub merged: bool,

    /// Does the merged activity still change anything on this host?
    pub is_effective: bool,

    /// Does the merge alter externally visible behavior enough to warrant
    /// operator notice (and a fresh notice window)?
    pub is_significant: bool,

    pub changes: MergeChanges,
}

impl MergeResult {
    /// The two activities are of incompatible kinds; nothing happened.
    pub fn no_merge() -> Self {
        MergeResult {
            merged: false,
            is_effective: false,
            is_significant: false,
            changes: MergeChanges::None,
        }
    }

    pub fn merged(is_effective: bool, is_significant: bool, changes: MergeChanges) -> Self {
        MergeResult {
            merged: true,
            is_effective,
            is_significant,
            changes,
        }
    }
}

/// Context injected into [`Activity::run`].
///
/// Activities never reach for global state: the scratch directory, system
/// probes, update platform, and the relevant slice of queue knowledge are
/// passed in explicitly.
pub struct RunContext<'a> {
    /// The request's scratch directory (preserved between attempts).
    pub dir: &'a Path,

    pub probes: &'a dyn SystemProbes,

    pub platform: &'a dyn UpdatePlatform,

    /// Id of another queued request holding a pending cold boot, if any.
    /// A warm reboot defers to it (cold boot wins regardless of order).
    pub pending_cold_boot: Option<RequestId>,
}

/// Outcome of one activity run, recorded into the wrapper's post-run
/// fields by [`Activity::run`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOutcome {
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub returncode: i32,

    /// Set when the logical transaction spans several attempts (e.g.
    /// reboots) and the activity knows better than wall-clock timing.
    pub duration: Option<f64>,
}

impl RunOutcome {
    pub fn success() -> Self {
        RunOutcome {
            returncode: 0,
            ..RunOutcome::default()
        }
    }

    pub fn with_stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = Some(stdout.into());
        self
    }
}

/// Errors from activity execution that never produced an exit code.
///
/// These are captured by [`Activity::run`] as returncode 70 with the error
/// text as stderr; they never abort the surrounding execution pass.
#[derive(Debug, thiserror::Error)]
pub enum ActivityError {
    #[error("IO error in activity scratch dir: {0}")]
    Io(#[from] std::io::Error),

    #[error("system probe failed: {0}")]
    Probe(String),

    #[error("{0}")]
    Other(String),
}

/// The per-variant durable payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActivityPayload {
    ShellScript(ShellScriptActivity),
    Reboot(RebootActivity),
    VmChange(VmChangeActivity),
    SystemUpdate(SystemUpdateActivity),
}

/// A maintenance activity: variant payload plus the outcome of the most
/// recent run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    #[serde(flatten)]
    pub payload: ActivityPayload,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returncode: Option<i32>,

    /// Duration of the last run in seconds, when the activity overrides
    /// the caller's wall-clock timing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

impl Activity {
    pub fn new(payload: ActivityPayload) -> Self {
        Activity {
            payload,
            stdout: None,
            stderr: None,
            returncode: None,
            duration: None,
        }
    }

    pub fn shell_script(script: impl Into<String>) -> Self {
        Activity::new(ActivityPayload::ShellScript(ShellScriptActivity::new(
            script,
        )))
    }

    pub fn reboot(action: RebootType, boot_time: Option<DateTime<Utc>>) -> Self {
        Activity::new(ActivityPayload::Reboot(RebootActivity::new(
            action, boot_time,
        )))
    }

    pub fn vm_change(vm_change: VmChangeActivity) -> Self {
        Activity::new(ActivityPayload::VmChange(vm_change))
    }

    pub fn system_update(update: SystemUpdateActivity) -> Self {
        Activity::new(ActivityPayload::SystemUpdate(update))
    }

    /// Variant name for logging and display.
    pub fn kind_name(&self) -> &'static str {
        match &self.payload {
            ActivityPayload::ShellScript(_) => "shell_script",
            ActivityPayload::Reboot(_) => "reboot",
            ActivityPayload::VmChange(_) => "vm_change",
            ActivityPayload::SystemUpdate(_) => "system_update",
        }
    }

    /// Which reboot (if any) this activity currently asks for.
    pub fn reboot_needed(&self) -> Option<RebootType> {
        match &self.payload {
            ActivityPayload::ShellScript(_) => None,
            ActivityPayload::Reboot(a) => a.reboot_needed,
            ActivityPayload::VmChange(a) => a.reboot_needed,
            ActivityPayload::SystemUpdate(a) => a.reboot_needed,
        }
    }

    /// Do we predict that running this activity will actually change
    /// anything?
    pub fn is_effective(&self) -> bool {
        match &self.payload {
            ActivityPayload::ShellScript(_) => true,
            ActivityPayload::Reboot(_) => true,
            ActivityPayload::VmChange(a) => a.is_effective(),
            ActivityPayload::SystemUpdate(a) => a.is_effective(),
        }
    }

    /// The activity's own comment, used when the request has none.
    pub fn comment(&self) -> String {
        match &self.payload {
            ActivityPayload::ShellScript(a) => a.comment(),
            ActivityPayload::Reboot(a) => a.comment(),
            ActivityPayload::VmChange(a) => a.comment(),
            ActivityPayload::SystemUpdate(a) => a.comment(),
        }
    }

    /// The activity's own duration estimate, used when the request has
    /// none.
    pub fn estimate(&self) -> Estimate {
        match &self.payload {
            ActivityPayload::ShellScript(a) => a.estimate(),
            ActivityPayload::Reboot(a) => a.estimate(),
            ActivityPayload::VmChange(a) => a.estimate(),
            ActivityPayload::SystemUpdate(a) => a.estimate(),
        }
    }

    /// Executes the activity in the request's scratch directory.
    ///
    /// A run that fails without producing an exit code is captured as
    /// returncode 70 (EX_SOFTWARE) with the error text as stderr, so the
    /// surrounding pass keeps executing sibling requests.
    pub fn run(&mut self, ctx: &RunContext<'_>) {
        let result = match &mut self.payload {
            ActivityPayload::ShellScript(a) => a.run(ctx),
            ActivityPayload::Reboot(a) => a.run(ctx),
            ActivityPayload::VmChange(a) => a.run(ctx),
            ActivityPayload::SystemUpdate(a) => a.run(ctx),
        };
        match result {
            Ok(outcome) => {
                self.stdout = outcome.stdout;
                self.stderr = outcome.stderr;
                self.returncode = Some(outcome.returncode);
                self.duration = outcome.duration;
            }
            Err(err) => {
                tracing::error!(kind = self.kind_name(), error = %err, "activity-run-failed");
                self.stdout = None;
                self.stderr = Some(err.to_string());
                self.returncode = Some(EXIT_SOFTWARE);
                self.duration = None;
            }
        }
    }

    /// Reconciles auxiliary on-disk state after deserialization.
    pub fn load(&mut self, dir: &Path) -> std::io::Result<()> {
        match &mut self.payload {
            ActivityPayload::ShellScript(a) => a.load(dir),
            _ => Ok(()),
        }
    }

    /// Saves auxiliary on-disk state during serialization.
    pub fn dump(&self, dir: &Path) -> std::io::Result<()> {
        match &self.payload {
            ActivityPayload::ShellScript(a) => a.dump(dir),
            _ => Ok(()),
        }
    }

    /// Merges `other` into this activity. Settings from `other` take
    /// precedence. Incompatible kinds merge to nothing.
    pub fn merge(&mut self, other: &Activity) -> MergeResult {
        let self_kind = self.kind_name();
        let other_kind = other.kind_name();
        match (&mut self.payload, &other.payload) {
            (ActivityPayload::Reboot(a), ActivityPayload::Reboot(b)) => a.merge(b),
            (ActivityPayload::VmChange(a), ActivityPayload::VmChange(b)) => a.merge(b),
            (ActivityPayload::SystemUpdate(a), ActivityPayload::SystemUpdate(b)) => a.merge(b),
            // Scripts never merge: concatenating arbitrary code is how you
            // run something nobody asked for.
            (ActivityPayload::ShellScript(_), _) => MergeResult::no_merge(),
            _ => {
                tracing::debug!(self_kind, other_kind, "merge-incompatible-skip");
                MergeResult::no_merge()
            }
        }
    }
}
