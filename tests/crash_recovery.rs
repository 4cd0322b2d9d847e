//! Crash-window recovery: stale snapshots, torn tails, append-only logs.

mod support;

use std::fs;

use lattice::doctor;
use lattice::rebuild;
use lattice::task::CreateSpec;

use support::TestTracker;

fn create(tracker: &TestTracker, title: &str) -> Result<String, Box<dyn std::error::Error>> {
    Ok(tracker
        .tasks()?
        .create(
            CreateSpec {
                title: title.to_string(),
                ..Default::default()
            },
            "human:a",
        )?
        .into_snapshot()
        .id)
}

#[test]
fn scenario_d_crash_between_append_and_rename() -> Result<(), Box<dyn std::error::Error>> {
    let tracker = TestTracker::init(Some("LAT"))?;
    let tasks = tracker.tasks()?;
    let task_id = create(&tracker, "T")?;

    let stale = tracker.snapshot_bytes(&task_id)?;
    tasks.comment(&task_id, "durable but unseen", None, "agent:c")?;
    let fresh = tracker.snapshot_bytes(&task_id)?;

    // Simulate the crash: event appended, snapshot rename never happened.
    fs::write(tracker.store().task_snapshot_path(&task_id), &stale)?;

    // The event is the last log line; the snapshot predates it.
    let events = tracker.read_events(&task_id)?;
    let last = events.last().unwrap();
    assert_eq!(last.event_type.as_str(), "comment_added");
    let on_disk = tracker.store().read_snapshot(&task_id)?;
    assert_ne!(on_disk.last_event_id, last.id);

    // Doctor reports the drift; rebuild repairs it exactly.
    let report = doctor::check(tracker.store())?;
    assert!(report.findings.iter().any(|f| f.code == "DRIFT"));

    rebuild::rebuild_one(tracker.store(), &task_id)?;
    assert_eq!(fresh, tracker.snapshot_bytes(&task_id)?);

    let report = doctor::check(tracker.store())?;
    assert!(report.is_clean(), "{:?}", report.findings);

    Ok(())
}

#[test]
fn event_log_grows_append_only() -> Result<(), Box<dyn std::error::Error>> {
    let tracker = TestTracker::init(None)?;
    let tasks = tracker.tasks()?;
    let task_id = create(&tracker, "T")?;
    let log_path = tracker.store().task_events_path(&task_id);

    let mut previous = fs::read_to_string(&log_path)?;
    for (i, status) in ["in_planning", "planned", "in_progress"].iter().enumerate() {
        tasks.change_status(&task_id, status, "agent:c", false, None)?;
        tasks.comment(&task_id, &format!("step {i}"), None, "agent:c")?;

        let current = fs::read_to_string(&log_path)?;
        assert!(
            current.starts_with(&previous),
            "log at t1 must be a prefix of the log at t2"
        );
        previous = current;
    }

    // Event ids are strictly increasing in ULID order.
    let ids: Vec<String> = tracker
        .read_events(&task_id)?
        .iter()
        .map(|e| e.id.clone())
        .collect();
    let mut sorted = ids.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(ids, sorted);

    Ok(())
}

#[test]
fn torn_tail_is_recoverable_and_appendable() -> Result<(), Box<dyn std::error::Error>> {
    let tracker = TestTracker::init(None)?;
    let tasks = tracker.tasks()?;
    let task_id = create(&tracker, "T")?;
    let log_path = tracker.store().task_events_path(&task_id);

    // A writer died mid-append.
    let mut content = fs::read_to_string(&log_path)?;
    let intact = content.clone();
    content.push_str("{\"id\":\"ev_half");
    fs::write(&log_path, &content)?;

    // Reads see everything up to the last complete line.
    assert_eq!(tracker.read_events(&task_id)?.len(), 1);

    // doctor --fix drops the fragment without losing events.
    let report = doctor::fix(tracker.store())?;
    assert!(report.is_clean(), "{:?}", report.findings);
    assert_eq!(fs::read_to_string(&log_path)?, intact);

    // Subsequent appends restore full consistency.
    tasks.comment(&task_id, "after repair", None, "agent:c")?;
    assert_eq!(tracker.read_events(&task_id)?.len(), 2);
    let report = doctor::check(tracker.store())?;
    assert!(report.is_clean(), "{:?}", report.findings);

    Ok(())
}

#[test]
fn write_path_repairs_torn_tail_before_appending() -> Result<(), Box<dyn std::error::Error>> {
    let tracker = TestTracker::init(None)?;
    let tasks = tracker.tasks()?;
    let task_id = create(&tracker, "T")?;
    let log_path = tracker.store().task_events_path(&task_id);

    let mut content = fs::read_to_string(&log_path)?;
    content.push_str("{\"id\":\"ev_half");
    fs::write(&log_path, &content)?;

    // Writing without running doctor first drops the fragment under the
    // lock; the new record never merges with it.
    tasks.comment(&task_id, "after torn tail", None, "agent:c")?;
    let events = tracker.read_events(&task_id)?;
    assert_eq!(events.len(), 2);
    assert_eq!(events.last().unwrap().event_type.as_str(), "comment_added");
    assert!(!fs::read_to_string(&log_path)?.contains("ev_half"));

    let report = doctor::check(tracker.store())?;
    assert!(report.is_clean(), "{:?}", report.findings);

    Ok(())
}

#[test]
fn deleted_snapshot_is_regenerated_from_the_log() -> Result<(), Box<dyn std::error::Error>> {
    let tracker = TestTracker::init(Some("LAT"))?;
    let tasks = tracker.tasks()?;
    let task_id = create(&tracker, "T")?;
    tasks.change_status(&task_id, "in_planning", "agent:c", false, None)?;

    let good = tracker.snapshot_bytes(&task_id)?;
    fs::remove_file(tracker.store().task_snapshot_path(&task_id))?;

    let report = doctor::fix(tracker.store())?;
    assert!(report.is_clean(), "{:?}", report.findings);
    assert_eq!(good, tracker.snapshot_bytes(&task_id)?);

    Ok(())
}
