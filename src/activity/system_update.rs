//! Platform system updates.
//!
//! The activity is prepared ahead of time: the target system is built and
//! dry-activated to learn which units the update would start, stop,
//! restart or reload. Two queued updates merge by adopting the newer
//! target; the unit-change diff decides whether operators need a fresh
//! notice window (reload-only changes do not).

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::probes::{PlatformError, UpdatePlatform};
use super::{ActivityError, MergeChanges, MergeResult, RebootType, RunContext, RunOutcome};
use crate::types::{Estimate, EXIT_TEMPFAIL};

/// Units affected by activating a target system, per category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitChanges {
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub start: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub stop: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub restart: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub reload: BTreeSet<String>,
}

impl UnitChanges {
    pub fn is_empty(&self) -> bool {
        self.start.is_empty()
            && self.stop.is_empty()
            && self.restart.is_empty()
            && self.reload.is_empty()
    }

    /// True when any unit falls into a category users notice (anything but
    /// a pure reload).
    pub fn is_significant(&self) -> bool {
        !self.start.is_empty() || !self.stop.is_empty() || !self.restart.is_empty()
    }

    /// Units present in `newer` but not in `self`, per category.
    pub fn added_in(&self, newer: &UnitChanges) -> UnitChanges {
        UnitChanges {
            start: newer.start.difference(&self.start).cloned().collect(),
            stop: newer.stop.difference(&self.stop).cloned().collect(),
            restart: newer.restart.difference(&self.restart).cloned().collect(),
            reload: newer.reload.difference(&self.reload).cloned().collect(),
        }
    }

    /// Human-readable lines ("Restart: telegraf, nginx") for changelogs.
    pub fn summary_lines(&self) -> Vec<String> {
        fn line(category: &str, units: &BTreeSet<String>) -> Option<String> {
            if units.is_empty() {
                return None;
            }
            let names: Vec<&str> = units
                .iter()
                .map(|u| u.strip_suffix(".service").unwrap_or(u))
                .collect();
            Some(format!("{}: {}", category, names.join(", ")))
        }
        [
            line("Stop", &self.stop),
            line("Restart", &self.restart),
            line("Start", &self.start),
            line("Reload", &self.reload),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemUpdateActivity {
    pub next_channel_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_environment: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_system: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_kernel: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_channel_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_environment: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_system: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_kernel: Option<String>,

    #[serde(default, skip_serializing_if = "UnitChanges::is_empty")]
    pub unit_changes: UnitChanges,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reboot_needed: Option<RebootType>,
}

impl SystemUpdateActivity {
    pub fn new(next_channel_url: impl Into<String>, next_environment: Option<String>) -> Self {
        SystemUpdateActivity {
            next_channel_url: next_channel_url.into(),
            next_version: None,
            next_environment,
            next_system: None,
            next_kernel: None,
            current_channel_url: None,
            current_version: None,
            current_environment: None,
            current_system: None,
            current_kernel: None,
            unit_changes: UnitChanges::default(),
            reboot_needed: None,
        }
    }

    /// Does this actually change anything?
    pub fn is_effective(&self) -> bool {
        self.current_channel_url.as_deref() != Some(self.next_channel_url.as_str())
    }

    /// Builds the target system and predicts its impact.
    ///
    /// Fills `next_system`, `unit_changes` and the kernel pair; a kernel
    /// change registers a warm reboot.
    pub fn prepare(&mut self, platform: &dyn UpdatePlatform) -> Result<(), PlatformError> {
        tracing::debug!(
            current_version = ?self.current_version,
            next_channel = %self.next_channel_url,
            "update-prepare-start"
        );
        self.current_system = Some(platform.current_system()?);
        let next_system = platform.build(&self.next_channel_url)?;
        self.unit_changes = platform.dry_activate(&next_system)?;

        let current_kernel = match &self.current_system {
            Some(system) => Some(platform.kernel_version(system)?),
            None => None,
        };
        let next_kernel = platform.kernel_version(&next_system)?;
        if current_kernel.as_deref() != Some(next_kernel.as_str()) {
            tracing::info!(
                current_kernel = ?current_kernel,
                next_kernel = %next_kernel,
                "update-kernel-changed"
            );
            self.reboot_needed = Some(RebootType::Warm);
        } else {
            tracing::debug!("update-kernel-unchanged");
        }
        self.current_kernel = current_kernel;
        self.next_kernel = Some(next_kernel);
        self.next_system = Some(next_system);
        Ok(())
    }

    pub fn run(&mut self, ctx: &RunContext<'_>) -> Result<RunOutcome, ActivityError> {
        if let Err(err) = ctx.platform.set_channel(&self.next_channel_url) {
            return Ok(run_failure(1, err));
        }

        match ctx.platform.current_system() {
            Ok(running) if self.next_system.as_deref() == Some(running.as_str()) => {
                tracing::info!(system = %running, "update-run-skip");
                return Ok(RunOutcome::success()
                    .with_stdout("already running the target system, skipped build"));
            }
            _ => {}
        }

        let system = match ctx.platform.build(&self.next_channel_url) {
            Ok(system) => system,
            Err(err) => return Ok(run_failure(2, err)),
        };

        if let Err(err) = ctx.platform.switch(&system) {
            // A failed switch often succeeds on retry once transient unit
            // restarts have settled.
            tracing::warn!(error = %err, "update-run-tempfail");
            return Ok(run_failure(EXIT_TEMPFAIL, err));
        }

        tracing::info!(
            next_version = ?self.next_version,
            "update-run-succeeded"
        );
        Ok(RunOutcome::success())
    }

    /// Merges a newer update proposal into this one.
    ///
    /// The newer target wins wholesale; the merge is significant iff the
    /// newer target adds units beyond pure reloads.
    pub fn merge(&mut self, other: &SystemUpdateActivity) -> MergeResult {
        if self.next_channel_url == other.next_channel_url
            && self.unit_changes == other.unit_changes
        {
            tracing::debug!("merge-update-identical");
            return MergeResult::merged(self.is_effective(), false, MergeChanges::None);
        }

        let added = self.unit_changes.added_in(&other.unit_changes);
        let removed = other.unit_changes.added_in(&self.unit_changes);
        let is_significant = added.is_significant();

        self.next_channel_url = other.next_channel_url.clone();
        self.next_version = other.next_version.clone();
        self.next_environment = other.next_environment.clone();
        self.next_system = other.next_system.clone();
        self.next_kernel = other.next_kernel.clone();
        self.unit_changes = other.unit_changes.clone();
        self.reboot_needed = match (self.reboot_needed, other.reboot_needed) {
            (Some(RebootType::Cold), _) | (_, Some(RebootType::Cold)) => Some(RebootType::Cold),
            (Some(RebootType::Warm), _) | (_, Some(RebootType::Warm)) => Some(RebootType::Warm),
            (None, None) => None,
        };

        MergeResult::merged(
            self.is_effective(),
            is_significant,
            MergeChanges::SystemUpdate {
                added_unit_changes: added,
                removed_unit_changes: removed,
            },
        )
    }

    /// Operator-facing summary of what this update will do.
    pub fn changelog(&self) -> String {
        let mut msg = vec![format!(
            "System update: {} -> {}",
            self.current_version.as_deref().unwrap_or("unknown"),
            self.next_version.as_deref().unwrap_or("unknown")
        )];
        match (&self.current_environment, &self.next_environment) {
            (Some(current), Some(next)) if current != next => {
                msg.push(format!("Environment: {} -> {}", current, next));
            }
            (Some(current), _) => {
                msg.push(format!("Environment: {} (unchanged)", current));
            }
            _ => {}
        }
        msg.push(String::new());
        if self.reboot_needed.is_some() {
            msg.push("Will reboot after the update.".to_string());
        }
        let unit_lines = self.unit_changes.summary_lines();
        if !unit_lines.is_empty() {
            msg.extend(unit_lines);
            msg.push(String::new());
        }
        msg.push(format!("Channel URL: {}", self.next_channel_url));
        msg.join("\n")
    }

    pub fn comment(&self) -> String {
        self.changelog()
    }

    pub fn estimate(&self) -> Estimate {
        Estimate::default()
    }
}

fn run_failure(returncode: i32, err: PlatformError) -> RunOutcome {
    tracing::error!(returncode, error = %err, "update-run-error");
    let (stdout, stderr) = match err {
        PlatformError::ChannelUpdateFailed { stdout, stderr } => (stdout, stderr),
        PlatformError::BuildFailed { stdout, stderr } => (stdout, stderr),
        PlatformError::SwitchFailed { stdout } => (stdout, String::new()),
        other => (String::new(), other.to_string()),
    };
    RunOutcome {
        stdout: Some(stdout),
        stderr: Some(stderr),
        returncode,
        duration: None,
    }
}
