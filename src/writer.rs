//! The write path: one durable, lock-ordered mutation of a single task.
//!
//! Order of operations inside the critical section is the crash contract:
//! events are appended (and fsynced) before the snapshot is atomically
//! renamed. A crash in between leaves a durable event and a stale snapshot,
//! which `rebuild` repairs; a crash before the append leaves no state change.
//!
//! The final snapshot is recomputed under the lock by replaying the on-disk
//! log plus the new events, so `last_event_id` always matches the log tail
//! no matter how writers interleave.

use serde_json::{json, Value};
use tracing::debug;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::{Event, EventType};
use crate::fsio;
use crate::hooks;
use crate::id::{EVENT_PREFIX, TASK_PREFIX};
use crate::lock;
use crate::snapshot::{self, TaskSnapshot};
use crate::store::{Store, TaskLocation};
use crate::{canon, id};

/// One logical mutation of one task.
#[derive(Debug)]
pub struct WriteRequest {
    pub task_id: String,
    /// Events to append, in order. May be empty only when `assign_short_id`
    /// is set.
    pub events: Vec<Event>,
    /// Allocate the next short-id under the `ids` lock and append a
    /// `task_short_id_assigned` event in the same mutation.
    pub assign_short_id: bool,
    /// Actor attributed to writer-generated events (short-id assignment).
    pub actor: String,
}

/// Result of a write: either a durable new state, or proof that an
/// idempotent create already happened.
#[derive(Debug)]
pub enum WriteOutcome {
    Written(TaskSnapshot),
    Idempotent(TaskSnapshot),
}

impl WriteOutcome {
    pub fn snapshot(&self) -> &TaskSnapshot {
        match self {
            WriteOutcome::Written(snapshot) | WriteOutcome::Idempotent(snapshot) => snapshot,
        }
    }

    pub fn into_snapshot(self) -> TaskSnapshot {
        match self {
            WriteOutcome::Written(snapshot) | WriteOutcome::Idempotent(snapshot) => snapshot,
        }
    }
}

/// Snapshot fields compared when deciding whether a repeated create is the
/// same logical request.
const IDEMPOTENCY_FIELDS: [&str; 8] = [
    "title",
    "type",
    "priority",
    "urgency",
    "status",
    "description",
    "tags",
    "assigned_to",
];

/// Apply one logical mutation durably. The single entry point for all
/// active-tree task writes.
pub fn write_task_mutation(
    store: &Store,
    config: &Config,
    mut request: WriteRequest,
) -> Result<WriteOutcome> {
    validate_request(&request)?;

    let task_id = request.task_id.clone();
    let mut keys = vec![lock::events_key(&task_id), lock::tasks_key(&task_id)];
    let mut wants_lifecycle = request
        .events
        .iter()
        .any(|event| event.event_type.is_lifecycle());
    if wants_lifecycle {
        keys.push(lock::LIFECYCLE_KEY.to_string());
    }
    let wants_ids = request.assign_short_id
        || request
            .events
            .iter()
            .any(|event| event.event_type == EventType::TaskShortIdAssigned);
    if wants_ids {
        keys.push(lock::IDS_KEY.to_string());
    }

    let outcome = {
        let _locks = store.multi_lock(&keys)?;

        // Idempotency: a repeated create with the same payload is success
        // without a new event; a different payload is a conflict.
        let is_create = request
            .events
            .first()
            .map(|event| event.event_type == EventType::TaskCreated)
            .unwrap_or(false);
        if is_create {
            if let Some(location) = store.task_location(&task_id) {
                return idempotency_check(store, &request, location);
            }
        }

        let log_path = store.task_events_path(&task_id);
        // A torn tail from a crashed writer is loss-free to remove; doing it
        // here keeps the log parseable for every later reader.
        fsio::drop_torn_tail(&log_path)?;
        let existing: Vec<Event> = fsio::read_jsonl(&log_path)?;
        if existing.is_empty() && !is_create {
            return Err(Error::NotFound(format!("task {task_id}")));
        }

        // Short-id allocation happens inside the critical section; the
        // counter is never cached across lock boundaries. On create the
        // alias rides in the task_created data; later assignments get their
        // own task_short_id_assigned event.
        let mut index_update = None;
        if request.assign_short_id {
            if let Some(project) = config.project_code.clone() {
                let mut index = store.short_index()?;
                let short = index.assign(&project, config.subproject_code.as_deref(), &task_id);
                match request.events.first_mut() {
                    Some(created) if created.event_type == EventType::TaskCreated => {
                        created
                            .data
                            .insert("short_id".to_string(), json!(short.to_string()));
                    }
                    _ => {
                        let mut data = serde_json::Map::new();
                        data.insert("short_id".to_string(), json!(short.to_string()));
                        request.events.push(Event::new_task(
                            EventType::TaskShortIdAssigned,
                            task_id.clone(),
                            request.actor.clone(),
                            data,
                        ));
                    }
                }
                index_update = Some(index);
            }
        }

        if request.events.is_empty() {
            return Err(Error::Validation("mutation carries no events".to_string()));
        }

        // Ids and timestamps are stamped under the lock so the order in the
        // log is also ULID order (commit order).
        let mut last_id = existing.last().map(|event| event.id.clone());
        for event in request.events.iter_mut() {
            let fresh = next_event_id(last_id.as_deref());
            event.id = fresh.clone();
            event.ts = crate::event::now_ts();
            last_id = Some(fresh);
        }

        let mut folded = if existing.is_empty() {
            None
        } else {
            Some(snapshot::replay(&existing)?)
        };
        for event in &request.events {
            folded = Some(snapshot::apply_event(folded, event)?);
        }
        let final_snapshot =
            folded.ok_or_else(|| Error::Validation("mutation carries no events".to_string()))?;

        wants_lifecycle = request
            .events
            .iter()
            .any(|event| event.event_type.is_lifecycle());
        debug_assert!(!wants_lifecycle || keys.contains(&lock::LIFECYCLE_KEY.to_string()));

        // Step 4: events first. Each append is fsynced before we move on.
        for event in &request.events {
            let line = event.to_canonical_line()?;
            fsio::jsonl_append(&log_path, &line)?;
            if event.event_type.is_lifecycle() {
                fsio::jsonl_append(&store.lifecycle_path(), &line)?;
            }
        }

        // Step 5: snapshot, atomically.
        let doc = canon::to_pretty_document(&final_snapshot)?;
        fsio::atomic_write(&store.task_snapshot_path(&task_id), doc.as_bytes())?;

        // Derived index last; rebuild regenerates it from events on a crash.
        if let Some(index) = index_update {
            index.save(&store.ids_path())?;
        }

        debug!(task_id = %task_id, events = request.events.len(), "mutation committed");
        WriteOutcome::Written(final_snapshot)
    };

    // Step 7: hooks run outside the locks; durability precedes notification.
    hooks::run_post_write(store, config, &request.events);

    Ok(outcome)
}

/// A fresh event id strictly greater than the log tail. ULIDs embed the
/// millisecond, so at most a few draws are needed when the clock has not
/// advanced past the previous commit.
pub(crate) fn next_event_id(last: Option<&str>) -> String {
    loop {
        let candidate = id::new_id(EVENT_PREFIX);
        match last {
            Some(last) if candidate.as_str() <= last => continue,
            _ => return candidate,
        }
    }
}

fn validate_request(request: &WriteRequest) -> Result<()> {
    id::validate_id(&request.task_id, TASK_PREFIX)?;

    if request.events.is_empty() && !request.assign_short_id {
        return Err(Error::Validation("mutation carries no events".to_string()));
    }

    for event in &request.events {
        if event.task_id.as_deref() != Some(request.task_id.as_str()) {
            return Err(Error::Validation(format!(
                "event '{}' targets {:?}, expected {}",
                event.id, event.task_id, request.task_id
            )));
        }
        id::validate_id(&event.id, EVENT_PREFIX)?;
        id::validate_actor(&event.actor)?;
        if let EventType::Custom(name) = &event.event_type {
            crate::event::validate_custom_event_type(name)?;
        }
    }

    Ok(())
}

fn idempotency_check(
    store: &Store,
    request: &WriteRequest,
    location: TaskLocation,
) -> Result<WriteOutcome> {
    let _ = location;
    let existing = store.read_snapshot(&request.task_id)?;
    let created = request
        .events
        .first()
        .ok_or_else(|| Error::Validation("mutation carries no events".to_string()))?;

    let existing_doc = canon::to_pretty_document(&existing)?;
    let existing_value: Value = serde_json::from_str(&existing_doc)?;

    for field in IDEMPOTENCY_FIELDS {
        let requested = normalized(created.data.get(field));
        let current = normalized(existing_value.get(field));
        if requested != current {
            return Err(Error::IdempotencyConflict(format!(
                "task {} exists with different '{}' ({} != {})",
                request.task_id, field, current, requested
            )));
        }
    }

    debug!(task_id = %request.task_id, "idempotent create, no new event");
    Ok(WriteOutcome::Idempotent(existing))
}

fn normalized(value: Option<&Value>) -> Value {
    match value {
        None | Some(Value::Null) => Value::Null,
        Some(Value::Array(items)) if items.is_empty() => Value::Null,
        Some(other) => other.clone(),
    }
}
