use super::*;
use crate::activity::{Activity, VmChangeActivity};
use crate::directory::ScheduledWindow;
use crate::test_utils::{DirectoryCall, FixedProbes, RecordingDirectory};
use crate::types::Estimate;
use chrono::Duration;
use std::sync::Arc;
use tempfile::{tempdir, TempDir};

struct Fixture {
    _guard: TempDir,
    rm: ReqManager,
    directory: Arc<RecordingDirectory>,
}

fn fixture() -> Fixture {
    fixture_with(|_| {})
}

fn fixture_with(tweak: impl FnOnce(&mut Config)) -> Fixture {
    let guard = tempdir().unwrap();
    let mut config = Config::default().with_spooldir(guard.path().join("spool"));
    config.reboot_cmd = "true".into();
    config.poweroff_cmd = "true".into();
    tweak(&mut config);
    let directory = Arc::new(RecordingDirectory::new());
    let mut rm = ReqManager::new(config)
        .unwrap()
        .with_directory(directory.clone(), "node00")
        .with_probes(Arc::new(FixedProbes::new(2048, 2)));
    rm.lock().unwrap();
    Fixture {
        _guard: guard,
        rm,
        directory,
    }
}

fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    chrono::NaiveDate::from_ymd_opt(2023, 6, 1)
        .unwrap()
        .and_hms_opt(hour, minute, 0)
        .unwrap()
        .and_utc()
}

fn script_request(rm: &mut ReqManager, script: &str) -> RequestId {
    rm.add(Request::new(Activity::shell_script(script)), false)
        .unwrap()
        .expect("script request should be added")
}

fn vm_request(rm: &mut ReqManager, wanted_memory: u64) -> Option<RequestId> {
    let probes = FixedProbes::new(2048, 2);
    let mut vm = VmChangeActivity::new(Some(wanted_memory), None);
    vm.update_from_system_state(&probes).unwrap();
    rm.add(Request::new(Activity::vm_change(vm)), false).unwrap()
}

fn make_due(rm: &mut ReqManager, id: &RequestId, due: DateTime<Utc>) {
    let request = rm.requests.get_mut(id).unwrap();
    request.state = State::Due;
    request.next_due = Some(due);
}

// ─── Preconditions ───

#[test]
fn invasive_methods_require_lock() {
    let mut fx = fixture();
    fx.rm.release();
    let request = Request::new(Activity::shell_script("true\n"));
    assert!(matches!(
        fx.rm.add(request, false),
        Err(ManagerError::NotLocked)
    ));
    assert!(matches!(
        fx.rm.schedule(at(12, 0)),
        Err(ManagerError::NotLocked)
    ));
    assert!(matches!(
        fx.rm.update_states(at(12, 0)),
        Err(ManagerError::NotLocked)
    ));
    assert!(matches!(
        fx.rm.execute(false, false),
        Err(ManagerError::NotLocked)
    ));
    assert!(matches!(
        fx.rm.postpone(at(12, 0)),
        Err(ManagerError::NotLocked)
    ));
    assert!(matches!(
        fx.rm.archive(at(12, 0)),
        Err(ManagerError::NotLocked)
    ));
}

#[test]
fn directory_methods_require_connection() {
    let guard = tempdir().unwrap();
    let config = Config::default().with_spooldir(guard.path().join("spool"));
    let mut rm = ReqManager::new(config).unwrap();
    rm.lock().unwrap();
    assert!(matches!(
        rm.schedule(at(12, 0)),
        Err(ManagerError::DirectoryUnavailable)
    ));
    assert!(matches!(
        rm.execute(false, false),
        Err(ManagerError::DirectoryUnavailable)
    ));
}

// ─── Add / merge ───

#[test]
fn add_persists_and_survives_rescan() {
    let mut fx = fixture();
    let id = script_request(&mut fx.rm, "echo hi\n");
    fx.rm.scan().unwrap();
    assert!(fx.rm.requests().contains_key(&id));
    assert!(fx.rm.requests()[&id].added_at.is_some());
}

#[test]
fn shell_scripts_never_merge_with_each_other() {
    let mut fx = fixture();
    let first = script_request(&mut fx.rm, "echo one\n");
    let second = script_request(&mut fx.rm, "echo one\n");
    assert_ne!(first, second);
    assert_eq!(fx.rm.requests().len(), 2);
}

#[test]
fn add_merges_same_kind_reboots() {
    let mut fx = fixture();
    let first = fx
        .rm
        .add(Request::new(Activity::reboot(RebootType::Warm, None)), false)
        .unwrap()
        .unwrap();
    let second = fx
        .rm
        .add(Request::new(Activity::reboot(RebootType::Warm, None)), false)
        .unwrap()
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(fx.rm.requests().len(), 1);
    // An identical merge is not significant, so no notice postponement.
    assert!(fx
        .directory
        .calls()
        .iter()
        .all(|c| !matches!(c, DirectoryCall::Postpone(_))));
}

#[test]
fn significant_merge_requests_notice_window() {
    let mut fx = fixture();
    let first = fx
        .rm
        .add(Request::new(Activity::reboot(RebootType::Warm, None)), false)
        .unwrap()
        .unwrap();
    let merged = fx
        .rm
        .add(Request::new(Activity::reboot(RebootType::Cold, None)), false)
        .unwrap()
        .unwrap();
    assert_eq!(first, merged);

    let postpones: Vec<_> = fx
        .directory
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            DirectoryCall::Postpone(map) => Some(map),
            _ => None,
        })
        .collect();
    assert_eq!(postpones.len(), 1);
    assert_eq!(postpones[0][&first].postpone_by, 8 * 3600);
}

#[test]
fn add_merge_cancellation_deletes_candidate() {
    let mut fx = fixture();
    // Current memory is 2048: wanting 4096 is effective.
    let id = vm_request(&mut fx.rm, 4096).unwrap();
    // Going back to 2048 cancels the pending request out.
    let result = vm_request(&mut fx.rm, 2048);
    assert_eq!(result, None);
    assert_eq!(fx.rm.requests()[&id].state, State::Deleted);
    // No second request was created.
    assert_eq!(fx.rm.requests().len(), 1);
}

#[test]
fn add_skips_ineffective_new_request() {
    let mut fx = fixture();
    assert_eq!(vm_request(&mut fx.rm, 2048), None);
    assert!(fx.rm.requests().is_empty());
}

#[test]
fn add_always_skips_merging() {
    let mut fx = fixture();
    let first = fx
        .rm
        .add(Request::new(Activity::reboot(RebootType::Warm, None)), false)
        .unwrap()
        .unwrap();
    let second = fx
        .rm
        .add(Request::new(Activity::reboot(RebootType::Warm, None)), true)
        .unwrap()
        .unwrap();
    assert_ne!(first, second);
    assert_eq!(fx.rm.requests().len(), 2);
}

#[test]
fn add_merges_most_recent_candidate_first() {
    let mut fx = fixture();
    let older = fx
        .rm
        .add(Request::new(Activity::reboot(RebootType::Warm, None)), false)
        .unwrap()
        .unwrap();
    // Force distinct added_at stamps.
    std::thread::sleep(std::time::Duration::from_millis(5));
    let newer = fx
        .rm
        .add(Request::new(Activity::reboot(RebootType::Warm, None)), true)
        .unwrap()
        .unwrap();
    let merged = fx
        .rm
        .add(Request::new(Activity::reboot(RebootType::Warm, None)), false)
        .unwrap()
        .unwrap();
    assert_eq!(merged, newer);
    assert_ne!(merged, older);
}

// ─── Schedule ───

#[test]
fn schedule_submits_estimates_and_applies_due_times() {
    let mut fx = fixture();
    let id = fx
        .rm
        .add(
            Request::new(Activity::shell_script("true\n"))
                .with_comment("comment")
                .with_estimate(Estimate::from_secs(1)),
            false,
        )
        .unwrap()
        .unwrap();
    let due = at(15, 12);
    fx.directory.answer_schedule(&id, Some(due));

    fx.rm.schedule(at(11, 0)).unwrap();

    let schedules: Vec<_> = fx
        .directory
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            DirectoryCall::Schedule(map) => Some(map),
            _ => None,
        })
        .collect();
    assert_eq!(schedules.len(), 1);
    assert_eq!(schedules[0][&id].estimate, 1);
    assert_eq!(schedules[0][&id].comment, "comment");

    let request = &fx.rm.requests()[&id];
    assert_eq!(request.next_due, Some(due));
    assert_eq!(request.last_scheduled_at, Some(at(11, 0)));
    assert_eq!(request.state, State::Pending);
}

#[test]
fn schedule_promotes_to_due_when_time_reached() {
    let mut fx = fixture();
    let id = script_request(&mut fx.rm, "true\n");
    fx.directory.answer_schedule(&id, Some(at(10, 0)));
    fx.rm.schedule(at(10, 5)).unwrap();
    assert_eq!(fx.rm.requests()[&id].state, State::Due);
}

#[test]
fn schedule_marks_vanished_requests_deleted() {
    let mut fx = fixture();
    let id = script_request(&mut fx.rm, "true\n");
    // The directory answers nothing for this id.
    fx.rm.schedule(at(11, 0)).unwrap();
    assert_eq!(fx.rm.requests()[&id].state, State::Deleted);
}

#[test]
fn schedule_reports_unknown_ids_as_deleted() {
    let mut fx = fixture();
    let id = script_request(&mut fx.rm, "true\n");
    fx.directory.answer_schedule(&id, Some(at(15, 0)));
    let foreign = RequestId::new("123abc");
    fx.directory
        .schedule_response
        .borrow_mut()
        .insert(foreign.clone(), ScheduledWindow { time: None });

    fx.rm.schedule(at(11, 0)).unwrap();

    let ends = fx.directory.end_calls();
    assert_eq!(ends.len(), 1);
    assert_eq!(ends[0][&foreign].result, "deleted");
    assert!(!ends[0].contains_key(&id));
}

// ─── update_states ───

#[test]
fn update_states_promotes_due_requests() {
    let mut fx = fixture();
    let id = script_request(&mut fx.rm, "true\n");
    fx.rm.requests.get_mut(&id).unwrap().next_due = Some(at(10, 0));
    fx.rm.update_states(at(10, 0)).unwrap();
    assert_eq!(fx.rm.requests()[&id].state, State::Due);
    // Persisted, not just in memory.
    fx.rm.scan().unwrap();
    assert_eq!(fx.rm.requests()[&id].state, State::Due);
}

#[test]
fn update_states_chains_scheduled_requests_into_one_window() {
    let mut fx = fixture();
    let t = at(10, 0);
    let first = script_request(&mut fx.rm, "echo 1\n");
    let second = fx
        .rm
        .add(
            Request::new(Activity::shell_script("echo 2\n"))
                .with_estimate(Estimate::from_secs(20 * 60)),
            false,
        )
        .unwrap()
        .unwrap();
    let third = fx
        .rm
        .add(
            Request::new(Activity::shell_script("echo 3\n"))
                .with_estimate(Estimate::from_secs(10 * 60)),
            false,
        )
        .unwrap()
        .unwrap();
    fx.rm.requests.get_mut(&first).unwrap().next_due = Some(t);
    fx.rm.requests.get_mut(&second).unwrap().next_due = Some(t + Duration::minutes(20));
    fx.rm.requests.get_mut(&third).unwrap().next_due = Some(t + Duration::minutes(35));

    // One pass at T: the cursor advances past each due request's window
    // (estimate + buffer), so all three become due together.
    fx.rm.update_states(t).unwrap();
    assert_eq!(fx.rm.requests()[&first].state, State::Due);
    assert_eq!(fx.rm.requests()[&second].state, State::Due);
    assert_eq!(fx.rm.requests()[&third].state, State::Due);
}

#[test]
fn update_states_leaves_far_future_requests_pending() {
    let mut fx = fixture();
    let id = script_request(&mut fx.rm, "true\n");
    fx.rm.requests.get_mut(&id).unwrap().next_due = Some(at(12, 0));
    fx.rm.update_states(at(10, 0)).unwrap();
    assert_eq!(fx.rm.requests()[&id].state, State::Pending);
}

#[test]
fn update_states_postpones_overdue_requests() {
    let mut fx = fixture();
    let id = script_request(&mut fx.rm, "true\n");
    make_due(&mut fx.rm, &id, at(10, 0));
    fx.rm.update_states(at(10, 31)).unwrap();
    assert_eq!(fx.rm.requests()[&id].state, State::Postpone);
}

// ─── Execute ───

#[test]
fn execute_nothing_runnable_makes_no_directory_calls() {
    let mut fx = fixture();
    script_request(&mut fx.rm, "true\n");
    let outcome = fx.rm.execute(false, false).unwrap();
    assert!(outcome.executed.is_empty());
    assert!(fx.directory.calls().is_empty());
}

#[test]
fn execute_runs_due_requests_and_marks_service_status_twice() {
    let mut fx = fixture();
    let id = script_request(&mut fx.rm, "echo done\n");
    make_due(&mut fx.rm, &id, at(10, 0));

    let outcome = fx.rm.execute(false, false).unwrap();

    assert_eq!(outcome.executed, vec![id.clone()]);
    assert_eq!(outcome.reboot, None);
    assert_eq!(fx.directory.service_flips(), vec![false, true]);
    let request = &fx.rm.requests()[&id];
    assert_eq!(request.state, State::Success);
    assert_eq!(request.attempts.len(), 1);
    assert!(fx.rm.store().maintenance_marker().is_none());
}

#[test]
fn execute_runs_requests_in_due_order() {
    let mut fx = fixture();
    let late = script_request(&mut fx.rm, "true\n");
    let early = script_request(&mut fx.rm, "true\n");
    make_due(&mut fx.rm, &late, at(11, 0));
    make_due(&mut fx.rm, &early, at(10, 0));

    let outcome = fx.rm.execute(false, false).unwrap();
    assert_eq!(outcome.executed, vec![early, late]);
}

#[test]
fn execute_default_skips_pending_requests() {
    let mut fx = fixture();
    script_request(&mut fx.rm, "true\n");
    let due = script_request(&mut fx.rm, "true\n");
    make_due(&mut fx.rm, &due, at(10, 0));

    let outcome = fx.rm.execute(false, false).unwrap();
    assert_eq!(outcome.executed, vec![due]);
}

#[test]
fn execute_run_all_now_includes_pending() {
    let mut fx = fixture();
    let pending = script_request(&mut fx.rm, "true\n");
    let outcome = fx.rm.execute(true, false).unwrap();
    assert_eq!(outcome.executed, vec![pending]);
}

#[test]
fn execute_failure_does_not_block_siblings() {
    let mut fx = fixture();
    let failing = script_request(&mut fx.rm, "echo broken >&2\nexit 1\n");
    let fine = script_request(&mut fx.rm, "true\n");
    make_due(&mut fx.rm, &failing, at(10, 0));
    make_due(&mut fx.rm, &fine, at(11, 0));

    let outcome = fx.rm.execute(false, false).unwrap();
    assert_eq!(outcome.executed.len(), 2);
    assert_eq!(fx.rm.requests()[&failing].state, State::Error);
    assert_eq!(fx.rm.requests()[&fine].state, State::Success);
    assert_eq!(
        fx.rm.requests()[&failing].attempts[0].stderr.as_deref(),
        Some("broken\n")
    );
}

#[test]
fn execute_writes_run_summary() {
    let mut fx = fixture();
    let id = script_request(&mut fx.rm, "true\n");
    make_due(&mut fx.rm, &id, at(10, 0));
    fx.rm.execute(false, false).unwrap();

    let summary = fx.rm.store().read_summary().unwrap().unwrap();
    assert_eq!(summary.reboot, None);
    assert_eq!(summary.requests[&id].state, State::Success);
    assert!(summary.requests[&id].duration.is_some());
}

#[test]
fn execute_enter_postpone_marks_runnable_postponed() {
    let mut fx = fixture_with(|config| {
        config
            .maintenance_enter
            .insert("veto".into(), "exit 69".into());
    });
    let id = script_request(&mut fx.rm, "true\n");
    make_due(&mut fx.rm, &id, at(10, 0));

    let outcome = fx.rm.execute(false, false).unwrap();

    assert!(outcome.executed.is_empty());
    assert_eq!(fx.rm.requests()[&id].state, State::Postpone);
    assert!(fx.rm.requests()[&id].attempts.is_empty());
    // Enter and leave: exactly two service status flips.
    assert_eq!(fx.directory.service_flips(), vec![false, true]);
    assert!(fx.rm.store().maintenance_marker().is_none());
}

#[test]
fn execute_enter_postpone_with_run_all_now_leaves_without_marking() {
    let mut fx = fixture_with(|config| {
        config
            .maintenance_enter
            .insert("veto".into(), "exit 69".into());
    });
    let id = script_request(&mut fx.rm, "true\n");
    make_due(&mut fx.rm, &id, at(10, 0));

    let outcome = fx.rm.execute(true, false).unwrap();
    assert!(outcome.executed.is_empty());
    assert_eq!(fx.rm.requests()[&id].state, State::Due);
    assert_eq!(fx.directory.service_flips(), vec![false, true]);
}

#[test]
fn execute_enter_tempfail_stays_in_maintenance() {
    let mut fx = fixture_with(|config| {
        config
            .maintenance_enter
            .insert("busy".into(), "exit 75".into());
    });
    let id = script_request(&mut fx.rm, "true\n");
    make_due(&mut fx.rm, &id, at(10, 0));

    let outcome = fx.rm.execute(false, false).unwrap();

    assert!(outcome.executed.is_empty());
    assert_eq!(fx.rm.requests()[&id].state, State::Due);
    // Only the enter flip: the node stays out of service for the retry.
    assert_eq!(fx.directory.service_flips(), vec![false]);
    assert!(fx.rm.store().maintenance_marker().is_some());
}

#[test]
fn execute_enter_tempfail_with_run_all_now_leaves() {
    let mut fx = fixture_with(|config| {
        config
            .maintenance_enter
            .insert("busy".into(), "exit 75".into());
    });
    let id = script_request(&mut fx.rm, "true\n");
    make_due(&mut fx.rm, &id, at(10, 0));

    fx.rm.execute(true, false).unwrap();
    assert_eq!(fx.directory.service_flips(), vec![false, true]);
    assert!(fx.rm.store().maintenance_marker().is_none());
}

#[test]
fn execute_force_run_ignores_enter_signals() {
    let mut fx = fixture_with(|config| {
        config
            .maintenance_enter
            .insert("veto".into(), "exit 69".into());
    });
    let id = script_request(&mut fx.rm, "true\n");
    make_due(&mut fx.rm, &id, at(10, 0));

    let outcome = fx.rm.execute(true, true).unwrap();
    assert_eq!(outcome.executed, vec![id.clone()]);
    assert_eq!(fx.rm.requests()[&id].state, State::Success);
}

#[test]
fn execute_hard_enter_hook_failure_aborts() {
    let mut fx = fixture_with(|config| {
        config
            .maintenance_enter
            .insert("broken".into(), "exit 1".into());
    });
    let id = script_request(&mut fx.rm, "true\n");
    make_due(&mut fx.rm, &id, at(10, 0));

    let result = fx.rm.execute(false, false);
    assert!(matches!(result, Err(ManagerError::Hook(_))));
    assert!(fx.rm.requests()[&id].attempts.is_empty());
    // Best-effort abort: back in service, marker cleared.
    assert_eq!(fx.directory.service_flips(), vec![false, true]);
    assert!(fx.rm.store().maintenance_marker().is_none());
}

#[test]
fn execute_aborts_when_service_status_fails() {
    let mut fx = fixture();
    let id = script_request(&mut fx.rm, "true\n");
    make_due(&mut fx.rm, &id, at(10, 0));
    fx.directory.fail_mark_service.set(true);

    let result = fx.rm.execute(false, false);
    assert!(matches!(result, Err(ManagerError::Directory(_))));
    assert!(fx.rm.requests()[&id].attempts.is_empty());
}

#[test]
fn execute_collects_reboot_and_stays_in_maintenance() {
    let mut fx = fixture();
    let id = fx
        .rm
        .add(Request::new(Activity::reboot(RebootType::Warm, None)), false)
        .unwrap()
        .unwrap();
    make_due(&mut fx.rm, &id, at(10, 0));

    let outcome = fx.rm.execute(false, false).unwrap();

    assert_eq!(outcome.reboot, Some(RebootType::Warm));
    // No leave: only the enter flip, marker still present.
    assert_eq!(fx.directory.service_flips(), vec![false]);
    assert!(fx.rm.store().maintenance_marker().is_some());
    let summary = fx.rm.store().read_summary().unwrap().unwrap();
    assert_eq!(summary.reboot, Some(RebootType::Warm));
}

#[test]
fn execute_cold_boot_wins_over_warm() {
    let mut fx = fixture();
    let warm = fx
        .rm
        .add(Request::new(Activity::reboot(RebootType::Warm, None)), false)
        .unwrap()
        .unwrap();
    let cold = fx
        .rm
        .add(Request::new(Activity::reboot(RebootType::Cold, None)), true)
        .unwrap()
        .unwrap();
    make_due(&mut fx.rm, &warm, at(10, 0));
    make_due(&mut fx.rm, &cold, at(11, 0));

    let outcome = fx.rm.execute(false, false).unwrap();
    assert_eq!(outcome.reboot, Some(RebootType::Cold));
    // The warm reboot deferred to the pending cold boot.
    let stdout = fx.rm.requests()[&warm].attempts[0]
        .stdout
        .clone()
        .unwrap_or_default();
    assert!(stdout.contains("cold boot pending"));
}

// ─── Postpone / archive / delete ───

#[test]
fn postpone_delays_by_twice_the_estimate_and_resets() {
    let mut fx = fixture();
    let id = fx
        .rm
        .add(
            Request::new(Activity::shell_script("true\n")).with_estimate(Estimate::from_secs(90)),
            false,
        )
        .unwrap()
        .unwrap();
    {
        let request = fx.rm.requests.get_mut(&id).unwrap();
        request.state = State::Postpone;
        request.next_due = Some(at(10, 0));
    }

    fx.rm.postpone(at(11, 0)).unwrap();

    let postpones: Vec<_> = fx
        .directory
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            DirectoryCall::Postpone(map) => Some(map),
            _ => None,
        })
        .collect();
    assert_eq!(postpones.len(), 1);
    assert_eq!(postpones[0][&id].postpone_by, 180);

    let request = &fx.rm.requests()[&id];
    assert_eq!(request.next_due, None);
    // Cleared due time resets the request to pending; the next schedule
    // pass assigns a fresh window.
    assert_eq!(request.state, State::Pending);
}

#[test]
fn postpone_without_postponed_requests_is_quiet() {
    let mut fx = fixture();
    script_request(&mut fx.rm, "true\n");
    fx.rm.postpone(at(11, 0)).unwrap();
    assert!(fx.directory.calls().is_empty());
}

#[test]
fn archive_reports_and_relocates_finished_requests() {
    let mut fx = fixture();
    let id = fx
        .rm
        .add(
            Request::new(Activity::shell_script("true\n"))
                .with_comment("archived work")
                .with_estimate(Estimate::from_secs(60)),
            false,
        )
        .unwrap()
        .unwrap();
    make_due(&mut fx.rm, &id, at(10, 0));
    fx.rm.execute(false, false).unwrap();
    assert_eq!(fx.rm.requests()[&id].state, State::Success);

    fx.rm.archive(at(12, 0)).unwrap();

    let ends = fx.directory.end_calls();
    assert_eq!(ends.len(), 1);
    let item = &ends[0][&id];
    assert_eq!(item.result, "success");
    assert!(item.duration.is_some());
    assert_eq!(item.comment.as_deref(), Some("archived work"));
    assert_eq!(item.estimate, Some(60));

    assert!(!fx.rm.requests().contains_key(&id));
    assert!(fx
        .rm
        .store()
        .archive_dir()
        .join(id.as_str())
        .join("request.json")
        .is_file());
}

#[test]
fn archive_with_nothing_finished_is_quiet() {
    let mut fx = fixture();
    script_request(&mut fx.rm, "true\n");
    fx.rm.archive(at(12, 0)).unwrap();
    assert!(fx.directory.calls().is_empty());
}

#[test]
fn delete_marks_by_prefix_and_archives_as_deleted() {
    let mut fx = fixture();
    let id = script_request(&mut fx.rm, "true\n");
    assert!(fx.rm.delete(&id.as_str()[..7]).unwrap());
    assert_eq!(fx.rm.requests()[&id].state, State::Deleted);

    fx.rm.archive(at(12, 0)).unwrap();
    let ends = fx.directory.end_calls();
    assert_eq!(ends[0][&id].result, "deleted");
}

#[test]
fn delete_unknown_prefix_reports_false() {
    let mut fx = fixture();
    script_request(&mut fx.rm, "true\n");
    assert!(!fx.rm.delete("zzzzzzz").unwrap());
}

// ─── Listing ───

#[test]
fn list_empty_spool_is_empty() {
    let fx = fixture();
    assert_eq!(fx.rm.list().unwrap(), "");
}

#[test]
fn list_orders_by_schedule_and_formats_header() {
    let mut fx = fixture();
    let pending = fx
        .rm
        .add(
            Request::new(Activity::shell_script("true\n")).with_comment("pending request"),
            false,
        )
        .unwrap()
        .unwrap();
    let due = fx
        .rm
        .add(
            Request::new(Activity::shell_script("true\n")).with_comment("due request"),
            false,
        )
        .unwrap()
        .unwrap();
    make_due(&mut fx.rm, &due, at(12, 0));

    let listing = fx.rm.list().unwrap();
    let lines: Vec<&str> = listing.lines().collect();
    assert_eq!(lines[0], "St Id       Scheduled             Estimate  Comment");
    // Scheduled requests come before unscheduled ones.
    assert!(lines[1].contains("due request"));
    assert!(lines[1].contains("2023-06-01 12:00 UTC"));
    assert!(lines[2].contains("pending request"));
    assert!(lines[2].contains("--- TBA ---"));
    assert!(lines[1].contains(&due.as_str()[..7]));
    assert!(lines[2].contains(&pending.as_str()[..7]));
}

#[test]
fn list_without_lock_reads_a_fresh_snapshot() {
    let mut fx = fixture();
    let id = script_request(&mut fx.rm, "true\n");
    fx.rm.release();
    let listing = fx.rm.list().unwrap();
    assert!(listing.contains(&id.as_str()[..7]));
}

#[test]
fn show_dumps_request_details() {
    let mut fx = fixture();
    let id = fx
        .rm
        .add(
            Request::new(Activity::shell_script("true\n")).with_comment("inspect me"),
            false,
        )
        .unwrap()
        .unwrap();
    let shown = fx.rm.show(&id.as_str()[..7]).unwrap().unwrap();
    assert!(shown.contains("inspect me"));
    assert!(shown.contains("\"kind\": \"shell_script\""));
    assert_eq!(fx.rm.show("zzzzzzz").unwrap(), None);
}
