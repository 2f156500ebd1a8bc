//! VM resource changes that need a cold reboot to take effect.
//!
//! Wanted values come from the management plane; current values are probed
//! from the live system at creation time and re-probed before each run, so
//! a change that has meanwhile been applied by other means cancels out.

use serde::{Deserialize, Serialize};

use super::probes::SystemProbes;
use super::{
    ActivityError, FieldChange, MergeChanges, MergeResult, RebootType, RunContext, RunOutcome,
};
use crate::types::Estimate;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmChangeActivity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wanted_memory: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wanted_cores: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_memory: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_cores: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reboot_needed: Option<RebootType>,
}

impl VmChangeActivity {
    pub fn new(wanted_memory: Option<u64>, wanted_cores: Option<u32>) -> Self {
        VmChangeActivity {
            wanted_memory,
            wanted_cores,
            current_memory: None,
            current_cores: None,
            reboot_needed: None,
        }
    }

    /// Builds the activity against the live system, returning it only when
    /// it would actually change something.
    pub fn from_system_if_changed(
        wanted_memory: Option<u64>,
        wanted_cores: Option<u32>,
        probes: &dyn SystemProbes,
    ) -> Result<Option<Self>, ActivityError> {
        let mut activity = Self::new(wanted_memory, wanted_cores);
        activity.update_from_system_state(probes)?;
        Ok(if activity.is_effective() {
            Some(activity)
        } else {
            None
        })
    }

    pub fn update_from_system_state(
        &mut self,
        probes: &dyn SystemProbes,
    ) -> Result<(), ActivityError> {
        self.current_memory = Some(
            probes
                .memory_mib()
                .map_err(|e| ActivityError::Probe(e.to_string()))?,
        );
        self.current_cores = Some(
            probes
                .cpu_cores()
                .map_err(|e| ActivityError::Probe(e.to_string()))?,
        );
        self.update_reboot_needed();
        Ok(())
    }

    /// Does this actually change anything?
    pub fn is_effective(&self) -> bool {
        if self
            .wanted_memory
            .is_some_and(|wanted| self.current_memory != Some(wanted))
        {
            return true;
        }
        if self
            .wanted_cores
            .is_some_and(|wanted| self.current_cores != Some(wanted))
        {
            return true;
        }
        false
    }

    pub fn comment(&self) -> String {
        let mut msgs = Vec::new();
        if let Some(wanted) = self.wanted_memory {
            if self.current_memory != Some(wanted) {
                msgs.push(format!(
                    "Memory {} MiB -> {} MiB.",
                    self.current_memory.map_or("?".to_string(), |m| m.to_string()),
                    wanted
                ));
            }
        }
        if let Some(wanted) = self.wanted_cores {
            if self.current_cores != Some(wanted) {
                msgs.push(format!(
                    "CPU cores {} -> {}.",
                    self.current_cores.map_or("?".to_string(), |c| c.to_string()),
                    wanted
                ));
            }
        }
        if msgs.is_empty() {
            "VM change without effect".to_string()
        } else {
            format!("Reboot to activate VM changes: {}", msgs.join(" "))
        }
    }

    pub fn estimate(&self) -> Estimate {
        Estimate::from_secs(5 * 60)
    }

    fn update_reboot_needed(&mut self) {
        self.reboot_needed = if self.is_effective() {
            Some(RebootType::Cold)
        } else {
            None
        };
    }

    pub fn run(&mut self, ctx: &RunContext<'_>) -> Result<RunOutcome, ActivityError> {
        // Re-probe: the change may have been applied (or widened) since the
        // request was created.
        self.update_from_system_state(ctx.probes)?;
        Ok(RunOutcome::success())
    }

    /// Merges another VM change into this one. Non-null wanted values from
    /// `other` override; the merge is significant iff it turns a previously
    /// ineffective activity effective.
    pub fn merge(&mut self, other: &VmChangeActivity) -> MergeResult {
        let was_effective = self.is_effective();
        let mut memory_change = None;
        let mut cores_change = None;

        if other.wanted_memory != self.wanted_memory {
            if let Some(wanted) = other.wanted_memory {
                memory_change = Some(FieldChange {
                    before: self.wanted_memory,
                    after: wanted,
                });
                self.wanted_memory = Some(wanted);
            }
        }
        if other.wanted_cores != self.wanted_cores {
            if let Some(wanted) = other.wanted_cores {
                cores_change = Some(FieldChange {
                    before: self.wanted_cores,
                    after: wanted,
                });
                self.wanted_cores = Some(wanted);
            }
        }

        self.update_reboot_needed();
        let is_effective = self.is_effective();
        let changes = if memory_change.is_some() || cores_change.is_some() {
            MergeChanges::VmChange {
                memory: memory_change,
                cores: cores_change,
            }
        } else {
            MergeChanges::None
        };
        MergeResult::merged(is_effective, is_effective && !was_effective, changes)
    }
}
