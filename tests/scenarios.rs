//! End-to-end scenarios over the library surface.

mod support;

use lattice::archive;
use lattice::config::CompletionPolicy;
use lattice::event::EventType;
use lattice::id;
use lattice::rebuild;
use lattice::task::CreateSpec;
use lattice::writer::WriteOutcome;

use support::TestTracker;

fn spec(title: &str) -> CreateSpec {
    CreateSpec {
        title: title.to_string(),
        ..Default::default()
    }
}

#[test]
fn scenario_a_create_status_archive() -> Result<(), Box<dyn std::error::Error>> {
    let tracker = TestTracker::init(Some("LAT"))?;
    let tasks = tracker.tasks()?;

    let task_id = id::new_id(id::TASK_PREFIX);
    let created = tasks
        .create(
            CreateSpec {
                task_id: Some(task_id.clone()),
                title: "First".to_string(),
                status: Some("backlog".to_string()),
                ..Default::default()
            },
            "human:a",
        )?
        .into_snapshot();
    assert_eq!(created.short_id.as_deref(), Some("LAT-1"));

    // backlog -> in_progress is not on the workflow graph.
    let err = tasks
        .change_status("LAT-1", "in_progress", "agent:c", false, None)
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_TRANSITION");

    tasks.change_status("LAT-1", "in_planning", "agent:c", false, None)?;
    tasks.change_status("LAT-1", "planned", "agent:c", false, None)?;
    tasks.change_status("LAT-1", "in_progress", "agent:c", false, None)?;

    archive::archive(tracker.store(), tasks.config(), "LAT-1", "human:a")?;

    let events = tracker.read_events(&task_id)?;
    assert_eq!(events.len(), 5);
    assert_eq!(events[0].event_type, EventType::TaskCreated);
    assert_eq!(
        events.last().unwrap().event_type,
        EventType::TaskArchived
    );

    let lifecycle = tracker.read_lifecycle()?;
    let types: Vec<&str> = lifecycle.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types, vec!["task_created", "task_archived"]);

    let snapshot = tracker.store().read_snapshot(&task_id)?;
    assert_eq!(snapshot.status, "in_progress");
    assert!(tracker.store().archived_snapshot_path(&task_id).exists());

    // rebuild_all is byte-idempotent on a healthy store.
    let snapshot_before = tracker.snapshot_bytes(&task_id)?;
    let lifecycle_before = std::fs::read_to_string(tracker.store().lifecycle_path())?;
    let ids_before = std::fs::read_to_string(tracker.store().ids_path())?;

    let report = rebuild::rebuild_all(tracker.store())?;
    assert_eq!(report.tasks_changed, 0);
    assert_eq!(snapshot_before, tracker.snapshot_bytes(&task_id)?);
    assert_eq!(
        lifecycle_before,
        std::fs::read_to_string(tracker.store().lifecycle_path())?
    );
    assert_eq!(
        ids_before,
        std::fs::read_to_string(tracker.store().ids_path())?
    );

    Ok(())
}

#[test]
fn scenario_b_idempotent_create_with_conflict() -> Result<(), Box<dyn std::error::Error>> {
    let tracker = TestTracker::init(None)?;
    let tasks = tracker.tasks()?;

    let task_id = id::new_id(id::TASK_PREFIX);
    let with_id = |title: &str| CreateSpec {
        task_id: Some(task_id.clone()),
        ..spec(title)
    };

    tasks.create(with_id("X"), "human:a")?;
    let events_before = tracker.read_events(&task_id)?;

    // Same id and payload: success, no new event.
    let outcome = tasks.create(with_id("X"), "human:a")?;
    assert!(matches!(outcome, WriteOutcome::Idempotent(_)));
    assert_eq!(events_before.len(), tracker.read_events(&task_id)?.len());

    // Same id, different payload: conflict, store unchanged.
    let before = tracker.snapshot_bytes(&task_id)?;
    let err = tasks.create(with_id("Y"), "human:a").unwrap_err();
    assert_eq!(err.code(), "IDEMPOTENCY_CONFLICT");
    assert_eq!(before, tracker.snapshot_bytes(&task_id)?);
    assert_eq!(events_before.len(), tracker.read_events(&task_id)?.len());

    Ok(())
}

#[test]
fn scenario_c_relationship_invariants() -> Result<(), Box<dyn std::error::Error>> {
    let tracker = TestTracker::init(None)?;
    let tasks = tracker.tasks()?;

    let t1 = tasks.create(spec("T1"), "human:a")?.into_snapshot().id;
    let t2 = tasks.create(spec("T2"), "human:a")?.into_snapshot().id;

    tasks.link(&t1, "blocks", &t2, None, "agent:c")?;

    let err = tasks.link(&t1, "blocks", &t2, None, "agent:c").unwrap_err();
    assert!(err.to_string().contains("duplicate edge"));

    let err = tasks.link(&t1, "blocks", &t1, None, "agent:c").unwrap_err();
    assert!(err.to_string().contains("itself"));

    let snapshot = tasks.unlink(&t1, "blocks", &t2, "agent:c")?;
    assert!(snapshot.relationships_out.is_empty());

    let rel_events: Vec<_> = tracker
        .read_events(&t1)?
        .into_iter()
        .filter(|e| {
            matches!(
                e.event_type,
                EventType::RelationshipAdded | EventType::RelationshipRemoved
            )
        })
        .collect();
    assert_eq!(rel_events.len(), 2);

    Ok(())
}

#[test]
fn scenario_e_review_gate() -> Result<(), Box<dyn std::error::Error>> {
    let tracker = TestTracker::init(None)?;
    tracker.update_config(|config| {
        config
            .workflow
            .transitions
            .insert("in_progress".to_string(), vec!["review".to_string()]);
        config
            .workflow
            .transitions
            .insert("review".to_string(), vec!["done".to_string()]);
        config.workflow.completion_policies.insert(
            "done".to_string(),
            CompletionPolicy {
                require_roles: vec!["review".to_string()],
                ..Default::default()
            },
        );
    })?;
    let tasks = tracker.tasks()?;

    let task_id = tasks.create(spec("Gated"), "human:a")?.into_snapshot().id;
    for status in ["in_planning", "planned", "in_progress", "review"] {
        tasks.change_status(&task_id, status, "agent:c", false, None)?;
    }

    let err = tasks
        .change_status(&task_id, "done", "agent:c", false, None)
        .unwrap_err();
    assert_eq!(err.code(), "COMPLETION_BLOCKED");
    let message = err.to_string();
    assert!(message.contains("Missing role: review"));
    assert!(message.contains("comment --role review"));
    assert!(message.contains("--force --reason"));

    tasks.comment(&task_id, "looks good", Some("review"), "human:a")?;
    let snapshot = tasks.change_status(&task_id, "done", "agent:c", false, None)?;
    assert_eq!(snapshot.status, "done");
    assert!(snapshot.done_at.is_some());

    Ok(())
}

#[test]
fn scenario_f_review_cycle_limit() -> Result<(), Box<dyn std::error::Error>> {
    let tracker = TestTracker::init(None)?;
    tracker.update_config(|config| {
        config.workflow.completion_policies.insert(
            "review".to_string(),
            CompletionPolicy {
                review_cycle_limit: Some(3),
                ..Default::default()
            },
        );
    })?;
    let tasks = tracker.tasks()?;

    let task_id = tasks.create(spec("Churny"), "human:a")?.into_snapshot().id;
    for status in ["in_planning", "planned", "in_progress", "review"] {
        tasks.change_status(&task_id, status, "agent:c", false, None)?;
    }

    // Three full rework cycles.
    for _ in 0..3 {
        tasks.change_status(&task_id, "in_progress", "agent:c", false, None)?;
        tasks.change_status(&task_id, "review", "agent:c", false, None)?;
    }

    let err = tasks
        .change_status(&task_id, "in_progress", "agent:c", false, None)
        .unwrap_err();
    assert_eq!(err.code(), "REVIEW_CYCLE_EXCEEDED");

    // Force with a reason overrides; the reason lands in the event.
    let snapshot = tasks.change_status(
        &task_id,
        "in_progress",
        "agent:c",
        true,
        Some("final polish round"),
    )?;
    assert_eq!(snapshot.status, "in_progress");

    let events = tracker.read_events(&task_id)?;
    let last = events.last().unwrap();
    assert_eq!(last.data["reason"], serde_json::json!("final polish round"));
    assert_eq!(
        last.provenance.as_ref().unwrap().reason.as_deref(),
        Some("final polish round")
    );

    Ok(())
}

#[test]
fn archive_then_unarchive_round_trip() -> Result<(), Box<dyn std::error::Error>> {
    let tracker = TestTracker::init(None)?;
    let tasks = tracker.tasks()?;

    let task_id = tasks.create(spec("Boomerang"), "human:a")?.into_snapshot().id;
    tasks.change_status(&task_id, "in_planning", "agent:c", false, None)?;
    let before = tracker.store().read_snapshot(&task_id)?;

    archive::archive(tracker.store(), tasks.config(), &task_id, "human:a")?;
    let restored = archive::unarchive(tracker.store(), tasks.config(), &task_id, "human:a")?;

    // Same domain state, two more lifecycle events in the log.
    assert_eq!(before.status, restored.status);
    assert_eq!(before.title, restored.title);
    let types: Vec<String> = tracker
        .read_events(&task_id)?
        .iter()
        .map(|e| e.event_type.to_string())
        .collect();
    assert!(types.contains(&"task_archived".to_string()));
    assert!(types.contains(&"task_unarchived".to_string()));

    // Rebuild reproduces the restored snapshot byte for byte.
    let bytes_before = tracker.snapshot_bytes(&task_id)?;
    rebuild::rebuild_one(tracker.store(), &task_id)?;
    assert_eq!(bytes_before, tracker.snapshot_bytes(&task_id)?);

    Ok(())
}
