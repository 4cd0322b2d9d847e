//! Rebuild: replay event logs into snapshots and regenerate derived files.
//!
//! Rebuild is the recovery path for every crash window the write path leaves
//! open. It is deterministic: snapshot timestamps come from event `ts`,
//! serialization is canonical, and the reducer is pure, so rebuilding an
//! intact store is a byte-for-byte no-op.

use std::fs;

use serde::Serialize;
use tracing::{debug, info};

use crate::canon;
use crate::error::{Error, Result};
use crate::event::{Event, EventType};
use crate::fsio;
use crate::id::{ShortId, RESOURCE_PREFIX, TASK_PREFIX};
use crate::lock;
use crate::resource;
use crate::snapshot;
use crate::store::{Store, ShortIdIndex};

/// Summary of a full rebuild.
#[derive(Debug, Default, Serialize)]
pub struct RebuildReport {
    pub tasks_rebuilt: usize,
    pub tasks_changed: usize,
    pub resources_rebuilt: usize,
    pub lifecycle_entries: usize,
    pub short_ids: usize,
}

/// Replay one task's log and rewrite its snapshot. Returns whether the
/// snapshot bytes changed.
pub fn rebuild_one(store: &Store, task_id: &str) -> Result<bool> {
    let keys = vec![lock::events_key(task_id), lock::tasks_key(task_id)];
    let _locks = store.multi_lock(&keys)?;
    rebuild_one_locked(store, task_id)
}

fn rebuild_one_locked(store: &Store, task_id: &str) -> Result<bool> {
    let active_log = store.task_events_path(task_id);
    let (log_path, snapshot_path) = if active_log.exists() {
        (active_log, store.task_snapshot_path(task_id))
    } else {
        let archived_log = store.archived_events_path(task_id);
        if !archived_log.exists() {
            return Err(Error::NotFound(format!("event log for task {task_id}")));
        }
        (archived_log, store.archived_snapshot_path(task_id))
    };

    let events: Vec<Event> = fsio::read_jsonl(&log_path)?;
    let rebuilt = snapshot::replay(&events)?;
    let doc = canon::to_pretty_document(&rebuilt)?;

    let prior = fs::read_to_string(&snapshot_path).unwrap_or_default();
    let changed = prior != doc;
    if changed {
        fsio::atomic_write(&snapshot_path, doc.as_bytes())?;
        debug!(task_id, "snapshot rebuilt");
    }
    Ok(changed)
}

/// Rebuild every snapshot and regenerate the lifecycle and short-id indexes.
pub fn rebuild_all(store: &Store) -> Result<RebuildReport> {
    let mut report = RebuildReport::default();

    for task_id in all_task_log_ids(store)? {
        report.tasks_rebuilt += 1;
        if rebuild_one(store, &task_id)? {
            report.tasks_changed += 1;
        }
    }

    for resource_log in resource_log_ids(store)? {
        rebuild_resource(store, &resource_log)?;
        report.resources_rebuilt += 1;
    }

    report.lifecycle_entries = rebuild_lifecycle(store)?;
    report.short_ids = rebuild_short_index(store)?;

    info!(
        tasks = report.tasks_rebuilt,
        changed = report.tasks_changed,
        "rebuild complete"
    );
    Ok(report)
}

/// Regenerate `events/_lifecycle.jsonl` from every per-task log, sorted by
/// `(ts, id)`.
pub fn rebuild_lifecycle(store: &Store) -> Result<usize> {
    let _lock = store.lock(lock::LIFECYCLE_KEY)?;

    let mut lifecycle: Vec<Event> = Vec::new();
    for task_id in all_task_log_ids(store)? {
        for event in store.read_events(&task_id)? {
            if event.event_type.is_lifecycle() {
                lifecycle.push(event);
            }
        }
    }
    lifecycle.sort_by(|a, b| (a.ts.as_str(), a.id.as_str()).cmp(&(b.ts.as_str(), b.id.as_str())));

    let mut body = String::new();
    for event in &lifecycle {
        body.push_str(&event.to_canonical_line()?);
    }
    fsio::atomic_write(&store.lifecycle_path(), body.as_bytes())?;
    Ok(lifecycle.len())
}

/// Regenerate `ids.json` by replaying short-id assignments in `(ts, id)`
/// order; `next_seq` becomes max observed sequence + 1.
pub fn rebuild_short_index(store: &Store) -> Result<usize> {
    let _lock = store.lock(lock::IDS_KEY)?;

    let mut assignments: Vec<(String, String, String, String)> = Vec::new();
    for task_id in all_task_log_ids(store)? {
        for event in store.read_events(&task_id)? {
            let relevant = matches!(
                event.event_type,
                EventType::TaskCreated | EventType::TaskShortIdAssigned
            );
            if !relevant {
                continue;
            }
            if let Some(short_id) = event.data.get("short_id").and_then(|v| v.as_str()) {
                assignments.push((
                    event.ts.clone(),
                    event.id.clone(),
                    short_id.to_string(),
                    task_id.clone(),
                ));
            }
        }
    }
    assignments.sort();

    let mut index = ShortIdIndex::default();
    let mut max_seq = 0u64;
    for (_ts, _id, short_id, task_id) in &assignments {
        index.short_ids.insert(short_id.clone(), task_id.clone());
        if let Some(short) = ShortId::parse(short_id) {
            max_seq = max_seq.max(short.seq);
        }
    }
    index.next_seq = max_seq + 1;

    let count = index.short_ids.len();
    index.save(&store.ids_path())?;
    Ok(count)
}

fn rebuild_resource(store: &Store, resource_id: &str) -> Result<()> {
    let events: Vec<Event> = fsio::read_jsonl(&store.resource_events_path(resource_id))?;
    if events.is_empty() {
        return Ok(());
    }
    let snapshot = resource::replay_resource(&events)?;

    let _lock = store.lock(&lock::resource_key(&snapshot.name))?;
    let doc = canon::to_pretty_document(&snapshot)?;
    fsio::atomic_write(
        &store.resource_snapshot_path(&snapshot.name),
        doc.as_bytes(),
    )?;
    Ok(())
}

/// Every task id with a log, active tree first, then archive.
fn all_task_log_ids(store: &Store) -> Result<Vec<String>> {
    let mut ids = log_ids_in(store, false)?;
    ids.extend(log_ids_in(store, true)?);
    ids.sort();
    ids.dedup();
    Ok(ids)
}

fn resource_log_ids(store: &Store) -> Result<Vec<String>> {
    let dir = store.events_dir();
    let mut ids = Vec::new();
    if !dir.exists() {
        return Ok(ids);
    }
    for entry in fs::read_dir(&dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            if stem.starts_with(&format!("{RESOURCE_PREFIX}_")) {
                ids.push(stem.to_string());
            }
        }
    }
    ids.sort();
    Ok(ids)
}

fn log_ids_in(store: &Store, archived: bool) -> Result<Vec<String>> {
    let dir = if archived {
        store.archive_events_dir()
    } else {
        store.events_dir()
    };
    let mut ids = Vec::new();
    if !dir.exists() {
        return Ok(ids);
    }
    for entry in fs::read_dir(&dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            if stem.starts_with(&format!("{TASK_PREFIX}_")) {
                ids.push(stem.to_string());
            }
        }
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{CreateSpec, Tasks};
    use tempfile::TempDir;

    fn setup() -> (TempDir, Tasks) {
        let temp = TempDir::new().unwrap();
        let store = Store::init(temp.path(), Some("LAT"), None).unwrap();
        let tasks = Tasks::open(store).unwrap();
        (temp, tasks)
    }

    fn create(tasks: &Tasks, title: &str) -> String {
        tasks
            .create(
                CreateSpec {
                    title: title.to_string(),
                    ..Default::default()
                },
                "human:ana",
            )
            .unwrap()
            .into_snapshot()
            .id
    }

    #[test]
    fn rebuild_is_a_noop_on_an_intact_store() {
        let (_temp, tasks) = setup();
        let task_id = create(&tasks, "First");
        tasks
            .change_status(&task_id, "in_planning", "agent:c", false, None)
            .unwrap();

        let before = fs::read_to_string(tasks.store().task_snapshot_path(&task_id)).unwrap();
        let before_lifecycle = fs::read_to_string(tasks.store().lifecycle_path()).unwrap();
        let before_ids = fs::read_to_string(tasks.store().ids_path()).unwrap();

        let report = rebuild_all(tasks.store()).unwrap();
        assert_eq!(report.tasks_rebuilt, 1);
        assert_eq!(report.tasks_changed, 0);
        assert_eq!(report.lifecycle_entries, 1);
        assert_eq!(report.short_ids, 1);

        assert_eq!(
            before,
            fs::read_to_string(tasks.store().task_snapshot_path(&task_id)).unwrap()
        );
        assert_eq!(
            before_lifecycle,
            fs::read_to_string(tasks.store().lifecycle_path()).unwrap()
        );
        assert_eq!(
            before_ids,
            fs::read_to_string(tasks.store().ids_path()).unwrap()
        );
    }

    #[test]
    fn rebuild_repairs_a_stale_snapshot() {
        let (_temp, tasks) = setup();
        let task_id = create(&tasks, "First");
        let good = fs::read_to_string(tasks.store().task_snapshot_path(&task_id)).unwrap();

        // Simulate the crash window: event appended, snapshot rename lost.
        fs::write(
            tasks.store().task_snapshot_path(&task_id),
            "{\"schema_version\": 1}\n",
        )
        .unwrap();

        assert!(rebuild_one(tasks.store(), &task_id).unwrap());
        let repaired = fs::read_to_string(tasks.store().task_snapshot_path(&task_id)).unwrap();
        assert_eq!(good, repaired);
    }

    #[test]
    fn rebuild_regenerates_deleted_indexes() {
        let (_temp, tasks) = setup();
        create(&tasks, "First");
        let second = create(&tasks, "Second");

        let lifecycle_before = fs::read_to_string(tasks.store().lifecycle_path()).unwrap();
        fs::remove_file(tasks.store().lifecycle_path()).unwrap();
        fs::remove_file(tasks.store().ids_path()).unwrap();

        let report = rebuild_all(tasks.store()).unwrap();
        assert_eq!(report.lifecycle_entries, 2);
        assert_eq!(report.short_ids, 2);

        assert_eq!(
            lifecycle_before,
            fs::read_to_string(tasks.store().lifecycle_path()).unwrap()
        );

        let index = tasks.store().short_index().unwrap();
        assert_eq!(index.next_seq, 3);
        assert_eq!(index.lookup("LAT-2"), Some(second.as_str()));
    }

    #[test]
    fn rebuild_ignores_a_truncated_tail() {
        let (_temp, tasks) = setup();
        let task_id = create(&tasks, "First");
        let good = fs::read_to_string(tasks.store().task_snapshot_path(&task_id)).unwrap();

        // Torn final append: the fragment must not affect the rebuild.
        let log_path = tasks.store().task_events_path(&task_id);
        let mut log = fs::read_to_string(&log_path).unwrap();
        log.push_str("{\"id\":\"ev_torn");
        fs::write(&log_path, log).unwrap();

        assert!(!rebuild_one(tasks.store(), &task_id).unwrap());
        assert_eq!(
            good,
            fs::read_to_string(tasks.store().task_snapshot_path(&task_id)).unwrap()
        );
    }
}
