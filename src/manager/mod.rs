//! Request manager: scan, add/merge, schedule, execute, postpone, archive.
//!
//! All invasive operations run under the process-wide spool lock and (for
//! anything that talks to the fleet) an established Directory connection.
//! Both preconditions are checked explicitly at the top of each method;
//! collaborators receive their dependencies via injection, never from
//! global state.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::process::Command;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

use crate::activity::{
    ActivityPayload, CommandPlatform, LiveProbes, RebootType, RunContext, SystemProbes,
    UnconfiguredPlatform, UpdatePlatform,
};
use crate::directory::{
    Directory, DirectoryClient, DirectoryEndpoint, DirectoryError, EndItem, PostponeItem,
    ScheduleItem,
};
use crate::request::{Request, RequestMergeResult};
use crate::store::{RequestStore, RequestSummary, RunSummary, SpoolLock, StoreError};
use crate::types::{RequestId, State, ARCHIVE};

pub mod config;
pub mod hooks;

pub use config::{Config, ConfigError, DEFAULT_CONFIG_FILE, DEFAULT_SPOOLDIR};
pub use hooks::{run_hooks, HookError, HookSignal};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("operation requires the process-wide spool lock")]
    NotLocked,

    #[error("no Directory connection available")]
    DirectoryUnavailable,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Hook(#[from] HookError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("reboot command {command:?} failed with exit code {returncode}")]
    RebootFailed { command: String, returncode: i32 },
}

pub type Result<T> = std::result::Result<T, ManagerError>;

/// What an `execute()` pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecuteOutcome {
    /// Requests that got an attempt, in execution order.
    pub executed: Vec<RequestId>,

    /// Set when a reboot/poweroff was initiated; the process should exit
    /// without leaving maintenance mode.
    pub reboot: Option<RebootType>,
}

/// Orchestrates the local maintenance request queue.
pub struct ReqManager {
    config: Config,
    store: RequestStore,
    requests: BTreeMap<RequestId, Request>,
    lock: Option<SpoolLock>,
    directory: Option<Arc<dyn Directory>>,
    node: String,
    probes: Arc<dyn SystemProbes>,
    platform: Arc<dyn UpdatePlatform>,
}

impl ReqManager {
    /// Opens the spool. No lock is taken and no Directory connection is
    /// made yet.
    pub fn new(config: Config) -> Result<Self> {
        let store = RequestStore::open(&config.spooldir)?;
        let platform: Arc<dyn UpdatePlatform> = match &config.platform {
            Some(commands) => Arc::new(CommandPlatform::new(commands.clone())),
            None => Arc::new(UnconfiguredPlatform),
        };
        Ok(ReqManager {
            config,
            store,
            requests: BTreeMap::new(),
            lock: None,
            directory: None,
            node: String::new(),
            probes: Arc::new(LiveProbes),
            platform,
        })
    }

    /// Injects a Directory connection (tests use a recording double).
    pub fn with_directory(mut self, directory: Arc<dyn Directory>, node: impl Into<String>) -> Self {
        self.directory = Some(directory);
        self.node = node.into();
        self
    }

    pub fn with_probes(mut self, probes: Arc<dyn SystemProbes>) -> Self {
        self.probes = probes;
        self
    }

    pub fn with_platform(mut self, platform: Arc<dyn UpdatePlatform>) -> Self {
        self.platform = platform;
        self
    }

    /// Establishes the Directory connection from the config (explicit
    /// `[directory]` section, falling back to the enclave file).
    pub fn connect(&mut self) -> Result<()> {
        if self.directory.is_some() {
            return Ok(());
        }
        let endpoint = match (&self.config.directory, &self.config.enc_path) {
            (Some(endpoint), _) => endpoint.clone(),
            (None, Some(enc_path)) => DirectoryEndpoint::from_enc_file(enc_path)
                .map_err(|_| ManagerError::DirectoryUnavailable)?,
            (None, None) => return Err(ManagerError::DirectoryUnavailable),
        };
        self.node = endpoint.node.clone();
        self.directory = Some(Arc::new(DirectoryClient::new(endpoint)?));
        Ok(())
    }

    /// Acquires the process lock (blocking) and scans the spool.
    pub fn lock(&mut self) -> Result<()> {
        if self.lock.is_none() {
            self.lock = Some(self.store.lock()?);
        }
        self.scan()
    }

    /// Releases the process lock.
    pub fn release(&mut self) {
        self.lock = None;
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &RequestStore {
        &self.store
    }

    pub fn requests(&self) -> &BTreeMap<RequestId, Request> {
        &self.requests
    }

    /// The update platform (for preparing update activities).
    pub fn platform(&self) -> &dyn UpdatePlatform {
        &*self.platform
    }

    fn require_lock(&self) -> Result<()> {
        if self.lock.is_some() {
            Ok(())
        } else {
            Err(ManagerError::NotLocked)
        }
    }

    fn require_directory(&self) -> Result<Arc<dyn Directory>> {
        self.directory
            .clone()
            .ok_or(ManagerError::DirectoryUnavailable)
    }

    /// Reloads all records from the spool, quarantining corrupt ones.
    pub fn scan(&mut self) -> Result<()> {
        self.require_lock()?;
        self.requests = self.store.scan()?;
        tracing::debug!(count = self.requests.len(), "scan-loaded-requests");
        Ok(())
    }

    /// Adds a request to the local queue, merging against queued work.
    ///
    /// Existing active requests are scanned most-recently-added first so
    /// rapid superseding updates collapse into one entry. Returns the id
    /// of the surviving request, or `None` when the proposal was absorbed
    /// into nothing (cancelled out or ineffective).
    pub fn add(&mut self, mut request: Request, add_always: bool) -> Result<Option<RequestId>> {
        self.require_lock()?;

        if !add_always {
            // Most recently added first.
            let mut candidates: Vec<RequestId> = self
                .requests
                .values()
                .filter(|r| !r.state.is_terminal())
                .map(|r| r.id.clone())
                .collect();
            candidates.sort_by_key(|id| {
                let r = &self.requests[id];
                (r.added_at, id.clone())
            });
            candidates.reverse();

            for id in candidates {
                let Some(candidate) = self.requests.get_mut(&id) else {
                    continue;
                };
                match candidate.merge(&request) {
                    RequestMergeResult::NoMerge => continue,
                    RequestMergeResult::Remove => {
                        tracing::info!(
                            request = %id,
                            "add-merge-cancels-existing-request"
                        );
                        candidate.state = State::Deleted;
                        self.store.save(candidate)?;
                        return Ok(None);
                    }
                    RequestMergeResult::Update => {
                        tracing::info!(request = %id, "add-merged-into-existing-request");
                        self.store.save(candidate)?;
                        return Ok(Some(id));
                    }
                    RequestMergeResult::SignificantUpdate => {
                        tracing::info!(request = %id, "add-merged-significant-update");
                        self.store.save(candidate)?;
                        self.postpone_for_notice(&id)?;
                        return Ok(Some(id));
                    }
                }
            }
        }

        if !request.activity.is_effective() {
            // Never create no-op entries.
            tracing::info!(
                kind = request.activity.kind_name(),
                "add-skip-ineffective-activity"
            );
            return Ok(None);
        }

        self.store.save(&mut request)?;
        let id = request.id.clone();
        tracing::info!(request = %id, comment = %request.effective_comment(), "add-created");
        self.requests.insert(id.clone(), request);
        Ok(Some(id))
    }

    /// Requests the configured operator notice window after a significant
    /// merge. Best effort without a Directory connection; the next
    /// schedule pass assigns a fresh time anyway.
    fn postpone_for_notice(&self, id: &RequestId) -> Result<()> {
        let Some(directory) = &self.directory else {
            tracing::warn!(
                request = %id,
                "significant-merge-without-directory-skipping-notice-postpone"
            );
            return Ok(());
        };
        let items = BTreeMap::from([(
            id.clone(),
            PostponeItem {
                postpone_by: self.config.significant_notice_secs,
            },
        )]);
        directory.postpone_maintenance(&items)?;
        Ok(())
    }

    /// Submits every pending request for scheduling and applies the
    /// Directory's answers.
    pub fn schedule(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.require_lock()?;
        let directory = self.require_directory()?;
        let grace = self.config.overdue_grace();

        let submission: BTreeMap<RequestId, ScheduleItem> = self
            .requests
            .values()
            .filter(|r| r.state == State::Pending)
            .map(|r| {
                (
                    r.id.clone(),
                    ScheduleItem {
                        estimate: r.effective_estimate().as_secs(),
                        comment: r.effective_comment(),
                    },
                )
            })
            .collect();
        if submission.is_empty() {
            tracing::debug!("schedule-nothing-pending");
            return Ok(());
        }

        let windows = directory.schedule_maintenance(&submission)?;

        for id in submission.keys() {
            let Some(request) = self.requests.get_mut(id) else {
                continue;
            };
            match windows.get(id).and_then(|w| w.time) {
                Some(time) => {
                    if request.update_due(Some(time), now, grace) {
                        tracing::info!(request = %id, due = %time, "schedule-new-due-time");
                    }
                    request.last_scheduled_at = Some(now);
                    self.store.save(request)?;
                }
                None => {
                    // The Directory no longer knows this request; it was
                    // deleted fleet-side. Archived and reported on the
                    // next archive pass.
                    tracing::warn!(request = %id, "schedule-request-vanished-marking-deleted");
                    request.state = State::Deleted;
                    self.store.save(request)?;
                }
            }
        }

        // Ids the Directory still tracks but we no longer have a record
        // for: report them as deleted right away.
        let unknown: BTreeMap<RequestId, EndItem> = windows
            .keys()
            .filter(|id| !self.requests.contains_key(id))
            .map(|id| {
                (
                    id.clone(),
                    EndItem {
                        duration: None,
                        result: State::Deleted.to_string(),
                        comment: None,
                        estimate: None,
                    },
                )
            })
            .collect();
        if !unknown.is_empty() {
            tracing::warn!(count = unknown.len(), "schedule-reporting-unknown-ids-deleted");
            directory.end_maintenance(&unknown)?;
        }
        Ok(())
    }

    /// Walks requests in `(next_due, added_at, id)` order and applies the
    /// state machine.
    ///
    /// After a request becomes due the evaluation cursor advances past its
    /// estimated duration plus a buffer, so chained scheduled requests
    /// become due together in one pass instead of needing separate
    /// windows.
    pub fn update_states(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.require_lock()?;
        let grace = self.config.overdue_grace();
        let buffer = self.config.due_chain_buffer();

        let mut cursor = now;
        for id in self.sorted_ids() {
            let Some(request) = self.requests.get_mut(&id) else {
                continue;
            };
            let before = request.state;
            let after = request.update_state(cursor, grace);
            if after != before {
                tracing::debug!(request = %id, from = %before, to = %after, "update-state");
                self.store.save(request)?;
            }
            if after == State::Due {
                if let Some(due) = request.next_due {
                    let window_end = due + request.effective_estimate().as_chrono() + buffer;
                    if window_end > cursor {
                        cursor = window_end;
                    }
                }
            }
        }
        Ok(())
    }

    fn sorted_ids(&self) -> Vec<RequestId> {
        let mut ids: Vec<RequestId> = self.requests.keys().cloned().collect();
        ids.sort_by_key(|id| self.requests[id].sort_key());
        ids
    }

    fn runnable_ids(&self, run_all_now: bool, force_run: bool) -> Vec<RequestId> {
        self.sorted_ids()
            .into_iter()
            .filter(|id| {
                let state = self.requests[id].state;
                match (run_all_now, force_run) {
                    (false, _) => matches!(state, State::Due | State::Running),
                    (true, false) => {
                        matches!(state, State::Pending | State::Due | State::Running)
                    }
                    // Everything still live.
                    (true, true) => !state.is_terminal(),
                }
            })
            .collect()
    }

    /// Executes runnable requests inside a maintenance window.
    ///
    /// See the enter-maintenance decision table in the module docs of
    /// [`hooks`]: postpone/tempfail signals from enter hooks stop the pass
    /// unless `force_run` overrides them.
    pub fn execute(&mut self, run_all_now: bool, force_run: bool) -> Result<ExecuteOutcome> {
        self.require_lock()?;
        let directory = self.require_directory()?;

        let runnable = self.runnable_ids(run_all_now, force_run);
        if runnable.is_empty() {
            tracing::info!("execute-nothing-runnable");
            return Ok(ExecuteOutcome::default());
        }

        self.enter_maintenance(&*directory)?;
        let signal = match run_hooks(&self.config.maintenance_enter, "enter") {
            Ok(signal) => signal,
            Err(err) => {
                // Unknown host state: do not run anything, but do not
                // leave the node silently out of service either.
                self.abort_maintenance(&*directory);
                return Err(err.into());
            }
        };

        match &signal {
            HookSignal::Proceed => {}
            _ if force_run => {
                tracing::warn!(signal = ?signal, "enter-signal-ignored-force-run");
            }
            HookSignal::Postpone { hook } => {
                tracing::info!(hook = %hook, run_all_now, "enter-postpone-signal");
                if !run_all_now {
                    for id in &runnable {
                        let Some(request) = self.requests.get_mut(id) else {
                            continue;
                        };
                        request.state = State::Postpone;
                        self.store.save(request)?;
                    }
                }
                self.leave_maintenance(&*directory);
                return Ok(ExecuteOutcome::default());
            }
            HookSignal::Tempfail { hook } => {
                tracing::info!(hook = %hook, run_all_now, "enter-tempfail-signal");
                if run_all_now {
                    self.leave_maintenance(&*directory);
                } else {
                    // Stay in maintenance; the next run retries.
                    tracing::info!("staying-in-maintenance-for-retry");
                }
                return Ok(ExecuteOutcome::default());
            }
        }

        let started = Instant::now();
        let mut outcome = ExecuteOutcome::default();
        let mut summaries = BTreeMap::new();

        for id in &runnable {
            let pending_cold_boot = self.pending_cold_boot(id);
            let Some(request) = self.requests.get_mut(id) else {
                continue;
            };
            tracing::info!(request = %id, "execute-request-start");
            request.state = State::Running;
            self.store.save(request)?;
            let dir = request
                .dir
                .clone()
                .ok_or_else(|| StoreError::NoDirectory(id.clone()))?;

            let ctx = RunContext {
                dir: &dir,
                probes: &*self.probes,
                platform: &*self.platform,
                pending_cold_boot,
            };
            let state = request.execute(&ctx);
            if state == State::Error {
                tracing::error!(
                    request = %id,
                    stderr = request.activity.stderr.as_deref().unwrap_or(""),
                    "execute-request-finished-error"
                );
            } else {
                tracing::info!(request = %id, state = %state, "execute-request-finished");
            }
            if let Err(err) = self.store.save(request) {
                // Not critical for the rest of the pass; the state is
                // re-derived on the next scan.
                tracing::debug!(request = %id, error = %err, "execute-save-request-failed");
            }

            if state == State::Success {
                if let Some(kind) = request.activity.reboot_needed() {
                    outcome.reboot = Some(match (outcome.reboot, kind) {
                        (Some(RebootType::Cold), _) | (_, RebootType::Cold) => RebootType::Cold,
                        _ => RebootType::Warm,
                    });
                }
            }
            summaries.insert(
                id.clone(),
                RequestSummary {
                    state,
                    duration: request.duration(),
                },
            );
            outcome.executed.push(id.clone());
        }

        let summary = RunSummary {
            finished_at: Utc::now(),
            runtime: started.elapsed().as_secs_f64(),
            reboot: outcome.reboot,
            requests: summaries,
        };
        self.store.write_summary(&summary)?;

        if let Some(kind) = outcome.reboot {
            // Reboot while still in maintenance; the caller exits the
            // process and the next boot's agent run leaves maintenance.
            tracing::info!(kind = %kind, "maintenance-reboot");
            self.perform_reboot(kind)?;
            return Ok(outcome);
        }

        self.leave_maintenance(&*directory);
        Ok(outcome)
    }

    /// Another live request holding a pending cold boot, if any.
    fn pending_cold_boot(&self, current: &RequestId) -> Option<RequestId> {
        self.requests
            .values()
            .filter(|r| &r.id != current && !r.state.is_terminal())
            .find(|r| {
                matches!(
                    &r.activity.payload,
                    ActivityPayload::Reboot(a) if a.action == RebootType::Cold
                )
            })
            .map(|r| r.id.clone())
    }

    fn enter_maintenance(&self, directory: &dyn Directory) -> Result<()> {
        tracing::info!("enter-maintenance");
        directory.mark_node_service_status(&self.node, false)?;
        self.store.set_maintenance_marker()?;
        Ok(())
    }

    /// Normal leave path: leave hooks, marker, service flag. Best effort;
    /// a failed leave must not fail an otherwise successful pass.
    fn leave_maintenance(&self, directory: &dyn Directory) {
        tracing::info!("leave-maintenance");
        if let Err(err) = run_hooks(&self.config.maintenance_leave, "leave") {
            tracing::error!(error = %err, "leave-hook-failed");
        }
        if let Err(err) = self.store.clear_maintenance_marker() {
            tracing::error!(error = %err, "leave-marker-failed");
        }
        if let Err(err) = directory.mark_node_service_status(&self.node, true) {
            tracing::error!(error = %err, "leave-service-status-failed");
        }
    }

    /// Leave path after a failed enter hook: the enter chain never
    /// completed, so leave hooks are not run.
    fn abort_maintenance(&self, directory: &dyn Directory) {
        if let Err(err) = self.store.clear_maintenance_marker() {
            tracing::error!(error = %err, "abort-marker-failed");
        }
        if let Err(err) = directory.mark_node_service_status(&self.node, true) {
            tracing::error!(error = %err, "abort-service-status-failed");
        }
    }

    fn perform_reboot(&self, kind: RebootType) -> Result<()> {
        let command = match kind {
            RebootType::Cold => &self.config.poweroff_cmd,
            RebootType::Warm => &self.config.reboot_cmd,
        };
        let status = Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .status()
            .map_err(StoreError::Io)?;
        if status.success() {
            Ok(())
        } else {
            Err(ManagerError::RebootFailed {
                command: command.clone(),
                returncode: status.code().unwrap_or(-1),
            })
        }
    }

    /// Asks the Directory to delay every postponed request by twice its
    /// estimate and clears the stale due time (the request goes back to
    /// pending until the next schedule pass).
    pub fn postpone(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.require_lock()?;
        let directory = self.require_directory()?;
        let grace = self.config.overdue_grace();

        let postponed: Vec<RequestId> = self
            .requests
            .values()
            .filter(|r| r.state == State::Postpone)
            .map(|r| r.id.clone())
            .collect();
        if postponed.is_empty() {
            return Ok(());
        }

        let items: BTreeMap<RequestId, PostponeItem> = postponed
            .iter()
            .map(|id| {
                let request = &self.requests[id];
                (
                    id.clone(),
                    PostponeItem {
                        postpone_by: 2 * request.effective_estimate().as_secs(),
                    },
                )
            })
            .collect();
        tracing::info!(count = items.len(), "postpone-requests");
        directory.postpone_maintenance(&items)?;

        for id in &postponed {
            let Some(request) = self.requests.get_mut(id) else {
                continue;
            };
            request.update_due(None, now, grace);
            self.store.save(request)?;
        }
        Ok(())
    }

    /// Reports final outcomes to the Directory and relocates finished
    /// records into the archive.
    pub fn archive(&mut self, _now: DateTime<Utc>) -> Result<()> {
        self.require_lock()?;
        let directory = self.require_directory()?;

        let archived: Vec<RequestId> = self
            .requests
            .values()
            .filter(|r| ARCHIVE.contains(&r.state))
            .map(|r| r.id.clone())
            .collect();
        if archived.is_empty() {
            return Ok(());
        }

        let report: BTreeMap<RequestId, EndItem> = archived
            .iter()
            .map(|id| {
                let request = &self.requests[id];
                (
                    id.clone(),
                    EndItem {
                        duration: request.duration(),
                        result: request.state.to_string(),
                        comment: Some(request.effective_comment()),
                        estimate: Some(request.effective_estimate().as_secs()),
                    },
                )
            })
            .collect();
        tracing::info!(count = report.len(), "archive-requests");
        directory.end_maintenance(&report)?;

        for id in &archived {
            let Some(mut request) = self.requests.remove(id) else {
                continue;
            };
            tracing::info!(request = %id, state = %request.state, "archive-request");
            self.store.archive(&mut request)?;
        }
        Ok(())
    }

    /// Marks the request matching the id prefix as deleted. Reported and
    /// archived on the next archive pass.
    pub fn delete(&mut self, prefix: &str) -> Result<bool> {
        self.require_lock()?;
        let id = self
            .sorted_ids()
            .into_iter()
            .find(|id| id.matches_prefix(prefix));
        let Some(id) = id else {
            tracing::warn!(prefix, "delete-no-matching-request");
            return Ok(false);
        };
        let Some(request) = self.requests.get_mut(&id) else {
            return Ok(false);
        };
        request.state = State::Deleted;
        self.store.save(request)?;
        tracing::info!(request = %id, "delete-marked");
        Ok(true)
    }

    /// Human-readable listing of active requests.
    ///
    /// Works without the lock on an independently loaded (possibly stale)
    /// snapshot.
    pub fn list(&self) -> Result<String> {
        let snapshot;
        let requests = if self.lock.is_some() {
            &self.requests
        } else {
            snapshot = self.store.peek()?;
            &snapshot
        };
        if requests.is_empty() {
            return Ok(String::new());
        }
        let mut ids: Vec<&RequestId> = requests.keys().collect();
        ids.sort_by_key(|id| requests[*id].sort_key());
        let mut out = String::from("St Id       Scheduled             Estimate  Comment\n");
        out.push_str(
            &ids.iter()
                .map(|id| requests[*id].list_line())
                .collect::<Vec<_>>()
                .join("\n"),
        );
        Ok(out)
    }

    /// Detailed dump of one request (matched by id prefix).
    pub fn show(&self, prefix: &str) -> Result<Option<String>> {
        let snapshot;
        let requests = if self.lock.is_some() {
            &self.requests
        } else {
            snapshot = self.store.peek()?;
            &snapshot
        };
        let request = requests
            .values()
            .find(|r| r.id.matches_prefix(prefix) || prefix.is_empty());
        match request {
            Some(request) => {
                let mut out = request.list_line();
                out.push('\n');
                out.push_str(&serde_json::to_string_pretty(request).map_err(StoreError::Json)?);
                Ok(Some(out))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests;
