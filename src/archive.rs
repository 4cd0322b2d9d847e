//! Archive and unarchive: moving a task between the active and archived
//! trees.
//!
//! The event is appended (and the lifecycle index updated) before any file
//! moves, so a crash mid-move leaves durable intent; `rebuild` plus `doctor`
//! recover the store. Lock ordering is the same as any other task mutation,
//! so an archive cannot race a concurrent write to the same task.

use std::fs;
use std::path::Path;

use serde_json::Map;
use tracing::debug;

use crate::canon;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::{Event, EventType};
use crate::fsio;
use crate::hooks;
use crate::id;
use crate::lock;
use crate::snapshot::{self, TaskSnapshot};
use crate::store::{Store, TaskLocation};

/// Move a task to the archive tree.
pub fn archive(store: &Store, config: &Config, task_ref: &str, actor: &str) -> Result<TaskSnapshot> {
    id::validate_actor(actor)?;
    let task_id = store.resolve_task(task_ref)?;

    let event = {
        let keys = vec![
            lock::events_key(&task_id),
            lock::tasks_key(&task_id),
            lock::LIFECYCLE_KEY.to_string(),
        ];
        let _locks = store.multi_lock(&keys)?;

        match store.task_location(&task_id) {
            Some(TaskLocation::Active) => {}
            Some(TaskLocation::Archived) => {
                return Err(Error::Validation(format!(
                    "task {task_id} is already archived"
                )))
            }
            None => return Err(Error::NotFound(format!("task {task_id}"))),
        }

        let log_path = store.task_events_path(&task_id);
        fsio::drop_torn_tail(&log_path)?;
        let events: Vec<Event> = fsio::read_jsonl(&log_path)?;
        let event = Event::new_task(
            EventType::TaskArchived,
            task_id.clone(),
            actor,
            Map::new(),
        )
        .with_id(crate::writer::next_event_id(
            events.last().map(|event| event.id.as_str()),
        ));

        let mut folded = snapshot::replay(&events)?;
        folded = snapshot::apply_event(Some(folded), &event)?;

        // Event first, then snapshot, then the moves.
        let line = event.to_canonical_line()?;
        fsio::jsonl_append(&log_path, &line)?;
        fsio::jsonl_append(&store.lifecycle_path(), &line)?;
        let doc = canon::to_pretty_document(&folded)?;
        fsio::atomic_write(&store.task_snapshot_path(&task_id), doc.as_bytes())?;

        move_file(
            &store.task_snapshot_path(&task_id),
            &store.archived_snapshot_path(&task_id),
        )?;
        move_file(&log_path, &store.archived_events_path(&task_id))?;
        move_if_present(
            &store.plan_path(&task_id),
            &store.archive_plans_dir().join(format!("{task_id}.md")),
        )?;
        move_if_present(
            &store.note_path(&task_id),
            &store.archive_notes_dir().join(format!("{task_id}.md")),
        )?;

        debug!(task_id = %task_id, "task archived");
        event
    };

    hooks::run_post_write(store, config, std::slice::from_ref(&event));
    store.read_snapshot(&task_id)
}

/// Move an archived task back to the active tree.
pub fn unarchive(
    store: &Store,
    config: &Config,
    task_ref: &str,
    actor: &str,
) -> Result<TaskSnapshot> {
    id::validate_actor(actor)?;
    let task_id = store.resolve_task(task_ref)?;

    let event = {
        let keys = vec![
            lock::events_key(&task_id),
            lock::tasks_key(&task_id),
            lock::LIFECYCLE_KEY.to_string(),
        ];
        let _locks = store.multi_lock(&keys)?;

        match store.task_location(&task_id) {
            Some(TaskLocation::Archived) => {}
            Some(TaskLocation::Active) => {
                return Err(Error::Validation(format!(
                    "task {task_id} is not archived"
                )))
            }
            None => return Err(Error::NotFound(format!("task {task_id}"))),
        }

        let log_path = store.archived_events_path(&task_id);
        fsio::drop_torn_tail(&log_path)?;
        let events: Vec<Event> = fsio::read_jsonl(&log_path)?;
        let event = Event::new_task(
            EventType::TaskUnarchived,
            task_id.clone(),
            actor,
            Map::new(),
        )
        .with_id(crate::writer::next_event_id(
            events.last().map(|event| event.id.as_str()),
        ));

        let mut folded = snapshot::replay(&events)?;
        folded = snapshot::apply_event(Some(folded), &event)?;

        let line = event.to_canonical_line()?;
        fsio::jsonl_append(&log_path, &line)?;
        fsio::jsonl_append(&store.lifecycle_path(), &line)?;
        let doc = canon::to_pretty_document(&folded)?;
        fsio::atomic_write(&store.archived_snapshot_path(&task_id), doc.as_bytes())?;

        move_file(
            &store.archived_snapshot_path(&task_id),
            &store.task_snapshot_path(&task_id),
        )?;
        move_file(&log_path, &store.task_events_path(&task_id))?;
        move_if_present(
            &store.archive_plans_dir().join(format!("{task_id}.md")),
            &store.plan_path(&task_id),
        )?;
        move_if_present(
            &store.archive_notes_dir().join(format!("{task_id}.md")),
            &store.note_path(&task_id),
        )?;

        debug!(task_id = %task_id, "task unarchived");
        event
    };

    hooks::run_post_write(store, config, std::slice::from_ref(&event));
    store.read_snapshot(&task_id)
}

fn move_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(from, to)?;
    Ok(())
}

fn move_if_present(from: &Path, to: &Path) -> Result<()> {
    if from.exists() {
        move_file(from, to)?;
    }
    Ok(())
}
