//! Scheduled machine reboots.
//!
//! The activity records the boot time at creation. If the machine has been
//! rebooted for another reason between creation and execution, running it
//! succeeds without requesting another reboot. The actual reboot is
//! performed by the manager at the end of the execution pass, while the
//! host is still marked out of service.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{ActivityError, MergeChanges, MergeResult, RebootType, RunContext, RunOutcome};
use crate::types::Estimate;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebootActivity {
    pub action: RebootType,

    /// Boot time observed when the request was created, with a small
    /// allowance for VM clock skew. A later boot time at run time means
    /// the reboot already happened.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_boot_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reboot_needed: Option<RebootType>,
}

impl RebootActivity {
    pub fn new(action: RebootType, boot_time: Option<DateTime<Utc>>) -> Self {
        RebootActivity {
            action,
            initial_boot_time: boot_time.map(|t| t + Duration::seconds(1)),
            reboot_needed: Some(action),
        }
    }

    pub fn comment(&self) -> String {
        match self.action {
            RebootType::Cold => "Scheduled cold boot".to_string(),
            RebootType::Warm => "Scheduled reboot".to_string(),
        }
    }

    pub fn estimate(&self) -> Estimate {
        match self.action {
            RebootType::Cold => Estimate::from_secs(15 * 60),
            RebootType::Warm => Estimate::from_secs(5 * 60),
        }
    }

    pub fn run(&mut self, ctx: &RunContext<'_>) -> Result<RunOutcome, ActivityError> {
        if self.action == RebootType::Warm {
            if let Some(cold) = &ctx.pending_cold_boot {
                // Cold boot wins regardless of issue order; let that
                // request do the rebooting.
                self.reboot_needed = None;
                return Ok(RunOutcome::success()
                    .with_stdout(format!("cold boot pending ({}), skipped", cold)));
            }
        }

        let booted = ctx
            .probes
            .boot_time()
            .map_err(|e| ActivityError::Probe(e.to_string()))?;
        if let Some(initial) = self.initial_boot_time {
            if booted > initial {
                self.reboot_needed = None;
                return Ok(RunOutcome::success()
                    .with_stdout(format!("booted at {} UTC", booted.format("%Y-%m-%d %H:%M:%S"))));
            }
        }

        self.reboot_needed = Some(self.action);
        Ok(RunOutcome::success())
    }

    /// Merges another reboot request into this one.
    ///
    /// Identical kinds collapse. A cold boot absorbs a warm one without
    /// change; a warm boot escalating to cold is a significant change.
    pub fn merge(&mut self, other: &RebootActivity) -> MergeResult {
        if self.action == other.action {
            tracing::debug!("merge-reboot-identical");
            MergeResult::merged(true, false, MergeChanges::None)
        } else if self.action == RebootType::Cold {
            tracing::debug!("merge-reboot-cold-absorbs-warm");
            MergeResult::merged(true, false, MergeChanges::None)
        } else {
            tracing::debug!("merge-reboot-warm-to-cold");
            self.action = RebootType::Cold;
            self.reboot_needed = Some(RebootType::Cold);
            MergeResult::merged(
                true,
                true,
                MergeChanges::Reboot {
                    before: RebootType::Warm,
                    after: RebootType::Cold,
                },
            )
        }
    }
}
