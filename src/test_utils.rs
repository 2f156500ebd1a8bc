//! Shared test doubles: fixed system probes, scripted update platforms,
//! and a recording Directory.

use chrono::{DateTime, Duration, Utc};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::path::Path;

use crate::activity::probes::ProbeError;
use crate::activity::system_update::UnitChanges;
use crate::activity::{PlatformError, RunContext, SystemProbes, UpdatePlatform};
use crate::directory::{
    Directory, DirectoryError, EndItem, PostponeItem, ScheduleItem, ScheduledWindow,
};
use crate::types::RequestId;

/// Builds a [`RunContext`] with no pending cold boot.
pub fn run_context<'a>(
    dir: &'a Path,
    probes: &'a dyn SystemProbes,
    platform: &'a dyn UpdatePlatform,
) -> RunContext<'a> {
    RunContext {
        dir,
        probes,
        platform,
        pending_cold_boot: None,
    }
}

/// Probes answering with fixed values.
#[derive(Debug, Clone)]
pub struct FixedProbes {
    pub memory_mib: u64,
    pub cpu_cores: u32,
    pub boot_time: DateTime<Utc>,
}

impl FixedProbes {
    pub fn new(memory_mib: u64, cpu_cores: u32) -> Self {
        FixedProbes {
            memory_mib,
            cpu_cores,
            boot_time: Utc::now() - Duration::days(1),
        }
    }

    pub fn with_boot_time(boot_time: DateTime<Utc>) -> Self {
        FixedProbes {
            boot_time,
            ..FixedProbes::default()
        }
    }
}

impl Default for FixedProbes {
    fn default() -> Self {
        FixedProbes::new(2048, 2)
    }
}

impl SystemProbes for FixedProbes {
    fn memory_mib(&self) -> Result<u64, ProbeError> {
        Ok(self.memory_mib)
    }

    fn cpu_cores(&self) -> Result<u32, ProbeError> {
        Ok(self.cpu_cores)
    }

    fn boot_time(&self) -> Result<DateTime<Utc>, ProbeError> {
        Ok(self.boot_time)
    }
}

/// A platform for tests that must never be reached.
pub use crate::activity::probes::UnconfiguredPlatform as NullPlatform;

/// A platform answering from a fixed script of results.
#[derive(Debug, Default)]
pub struct ScriptedPlatform {
    current_system: String,
    built_system: String,
    unit_changes: UnitChanges,
    kernels: BTreeMap<String, String>,
    switch_failure: Option<String>,
    build_failure: Option<String>,
}

impl ScriptedPlatform {
    pub fn new() -> Self {
        ScriptedPlatform {
            current_system: "/sys/current".into(),
            built_system: "/sys/built".into(),
            ..ScriptedPlatform::default()
        }
    }

    pub fn current_system(mut self, path: &str) -> Self {
        self.current_system = path.into();
        self
    }

    pub fn built_system(mut self, path: &str) -> Self {
        self.built_system = path.into();
        self
    }

    pub fn unit_changes(mut self, changes: UnitChanges) -> Self {
        self.unit_changes = changes;
        self
    }

    pub fn kernel(mut self, system: &str, version: &str) -> Self {
        self.kernels.insert(system.into(), version.into());
        self
    }

    pub fn fail_switch(mut self, stdout: &str) -> Self {
        self.switch_failure = Some(stdout.into());
        self
    }

    pub fn fail_build(mut self, stderr: &str) -> Self {
        self.build_failure = Some(stderr.into());
        self
    }
}

impl UpdatePlatform for ScriptedPlatform {
    fn set_channel(&self, _channel_url: &str) -> Result<(), PlatformError> {
        Ok(())
    }

    fn build(&self, _channel_url: &str) -> Result<String, PlatformError> {
        match &self.build_failure {
            Some(stderr) => Err(PlatformError::BuildFailed {
                stdout: String::new(),
                stderr: stderr.clone(),
            }),
            None => Ok(self.built_system.clone()),
        }
    }

    fn dry_activate(&self, _system: &str) -> Result<UnitChanges, PlatformError> {
        Ok(self.unit_changes.clone())
    }

    fn kernel_version(&self, system: &str) -> Result<String, PlatformError> {
        Ok(self
            .kernels
            .get(system)
            .cloned()
            .unwrap_or_else(|| "0.0".into()))
    }

    fn current_system(&self) -> Result<String, PlatformError> {
        Ok(self.current_system.clone())
    }

    fn switch(&self, _system: &str) -> Result<(), PlatformError> {
        match &self.switch_failure {
            Some(stdout) => Err(PlatformError::SwitchFailed {
                stdout: stdout.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// One recorded Directory call.
#[derive(Debug, Clone, PartialEq)]
pub enum DirectoryCall {
    Schedule(BTreeMap<RequestId, ScheduleItem>),
    Postpone(BTreeMap<RequestId, PostponeItem>),
    End(BTreeMap<RequestId, EndItem>),
    MarkService { node: String, in_service: bool },
}

/// A Directory that records every call and answers schedules from a
/// configurable table.
#[derive(Debug, Default)]
pub struct RecordingDirectory {
    pub calls: RefCell<Vec<DirectoryCall>>,
    pub schedule_response: RefCell<BTreeMap<RequestId, ScheduledWindow>>,
    pub fail_mark_service: Cell<bool>,
}

impl RecordingDirectory {
    pub fn new() -> Self {
        RecordingDirectory::default()
    }

    pub fn answer_schedule(&self, id: &RequestId, time: Option<DateTime<Utc>>) {
        self.schedule_response
            .borrow_mut()
            .insert(id.clone(), ScheduledWindow { time });
    }

    pub fn calls(&self) -> Vec<DirectoryCall> {
        self.calls.borrow().clone()
    }

    pub fn service_flips(&self) -> Vec<bool> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|call| match call {
                DirectoryCall::MarkService { in_service, .. } => Some(*in_service),
                _ => None,
            })
            .collect()
    }

    pub fn end_calls(&self) -> Vec<BTreeMap<RequestId, EndItem>> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|call| match call {
                DirectoryCall::End(map) => Some(map.clone()),
                _ => None,
            })
            .collect()
    }
}

impl Directory for RecordingDirectory {
    fn schedule_maintenance(
        &self,
        requests: &BTreeMap<RequestId, ScheduleItem>,
    ) -> Result<BTreeMap<RequestId, ScheduledWindow>, DirectoryError> {
        self.calls
            .borrow_mut()
            .push(DirectoryCall::Schedule(requests.clone()));
        // The full configured table: answers may include ids the caller
        // never submitted (requests deleted fleet-side).
        Ok(self.schedule_response.borrow().clone())
    }

    fn postpone_maintenance(
        &self,
        requests: &BTreeMap<RequestId, PostponeItem>,
    ) -> Result<(), DirectoryError> {
        self.calls
            .borrow_mut()
            .push(DirectoryCall::Postpone(requests.clone()));
        Ok(())
    }

    fn end_maintenance(&self, requests: &BTreeMap<RequestId, EndItem>) -> Result<(), DirectoryError> {
        self.calls
            .borrow_mut()
            .push(DirectoryCall::End(requests.clone()));
        Ok(())
    }

    fn mark_node_service_status(&self, node: &str, in_service: bool) -> Result<(), DirectoryError> {
        if self.fail_mark_service.get() {
            return Err(DirectoryError::transient(
                "mark_node_service_status",
                "connection refused",
            ));
        }
        self.calls.borrow_mut().push(DirectoryCall::MarkService {
            node: node.to_string(),
            in_service,
        });
        Ok(())
    }
}
