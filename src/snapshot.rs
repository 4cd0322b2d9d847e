//! Task snapshots and the reducer that materializes them.
//!
//! A snapshot is a pure function of its event log. The reducer does no I/O
//! and never reads the clock: `created_at`, `updated_at`, `done_at` and
//! `last_status_changed_at` all come from event timestamps, which is what
//! makes rebuilds byte-identical.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::event::{Event, EventType};

/// Schema version stamped on every task snapshot.
pub const TASK_SCHEMA_VERSION: u32 = 1;

/// Priorities accepted on tasks.
pub const PRIORITIES: [&str; 4] = ["critical", "high", "medium", "low"];

/// Relationship types; storage is outgoing edges only.
pub const RELATION_TYPES: [&str; 7] = [
    "blocks",
    "depends_on",
    "subtask_of",
    "related_to",
    "spawned_by",
    "duplicate_of",
    "supersedes",
];

/// Snapshot fields that `field_updated` may never touch.
pub const PROTECTED_FIELDS: [&str; 5] =
    ["id", "short_id", "schema_version", "created_at", "last_event_id"];

/// Scalar fields `field_updated` may set directly.
pub const UPDATABLE_FIELDS: [&str; 7] = [
    "title",
    "description",
    "priority",
    "urgency",
    "type",
    "complexity",
    "assigned_to",
];

/// An outgoing relationship edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    #[serde(rename = "type")]
    pub rel_type: String,
    pub target_task_id: String,
    pub created_at: String,
    pub created_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// A link from a task to a VCS branch. Metadata only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchLink {
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    pub linked_at: String,
    pub linked_by: String,
}

/// Materialized task state, derived from the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub schema_version: u32,
    pub id: String,
    pub title: String,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
    pub last_event_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urgency: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relationships_out: Vec<Relationship>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifact_refs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branch_links: Vec<BranchLink>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status_changed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub custom_fields: Map<String, Value>,
    /// Unknown top-level fields from newer writers, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskSnapshot {
    /// Find an outgoing edge by (type, target).
    pub fn relationship(&self, rel_type: &str, target: &str) -> Option<&Relationship> {
        self.relationships_out
            .iter()
            .find(|rel| rel.rel_type == rel_type && rel.target_task_id == target)
    }
}

/// Apply one event to an optional prior snapshot. Pure.
pub fn apply_event(prior: Option<TaskSnapshot>, event: &Event) -> Result<TaskSnapshot> {
    let mut snapshot = match (prior, &event.event_type) {
        (_, EventType::TaskCreated) => init_from_created(event),
        (Some(snapshot), _) => snapshot,
        (None, other) => {
            return Err(Error::Validation(format!(
                "event '{}' ({}) has no preceding task_created",
                event.id, other
            )))
        }
    };

    match &event.event_type {
        EventType::TaskCreated => {}
        EventType::StatusChanged => {
            let status = data_str(event, "status").unwrap_or_default();
            snapshot.status = status.to_string();
            snapshot.last_status_changed_at = Some(event.ts.clone());
            if status == "done" {
                snapshot.done_at = Some(event.ts.clone());
            }
        }
        EventType::AssignmentChanged => {
            snapshot.assigned_to = data_str(event, "assigned_to").map(str::to_string);
        }
        EventType::FieldUpdated => apply_field_update(&mut snapshot, event),
        EventType::RelationshipAdded => {
            let rel_type = data_str(event, "type").unwrap_or_default().to_string();
            let target = data_str(event, "target_task_id")
                .unwrap_or_default()
                .to_string();
            if snapshot.relationship(&rel_type, &target).is_none() {
                snapshot.relationships_out.push(Relationship {
                    rel_type,
                    target_task_id: target,
                    created_at: event.ts.clone(),
                    created_by: event.actor.clone(),
                    note: data_str(event, "note").map(str::to_string),
                });
            }
        }
        EventType::RelationshipRemoved => {
            let rel_type = data_str(event, "type").unwrap_or_default();
            let target = data_str(event, "target_task_id").unwrap_or_default();
            snapshot
                .relationships_out
                .retain(|rel| !(rel.rel_type == rel_type && rel.target_task_id == target));
        }
        EventType::ArtifactAttached => {
            if let Some(artifact_id) = data_str(event, "artifact_id") {
                if !snapshot.artifact_refs.iter().any(|id| id.as_str() == artifact_id) {
                    snapshot.artifact_refs.push(artifact_id.to_string());
                }
            }
        }
        EventType::BranchLinked => {
            let branch = data_str(event, "branch").unwrap_or_default().to_string();
            let repo = data_str(event, "repo").map(str::to_string);
            let exists = snapshot
                .branch_links
                .iter()
                .any(|link| link.branch == branch && link.repo == repo);
            if !exists {
                snapshot.branch_links.push(BranchLink {
                    branch,
                    repo,
                    linked_at: event.ts.clone(),
                    linked_by: event.actor.clone(),
                });
            }
        }
        EventType::BranchUnlinked => {
            let branch = data_str(event, "branch").unwrap_or_default();
            let repo = data_str(event, "repo");
            snapshot.branch_links.retain(|link| {
                link.branch != branch || (repo.is_some() && link.repo.as_deref() != repo)
            });
        }
        EventType::TaskShortIdAssigned => {
            let short_id = data_str(event, "short_id").unwrap_or_default();
            match &snapshot.short_id {
                Some(existing) if existing != short_id => {
                    return Err(Error::Validation(format!(
                        "short id already assigned: {} (event '{}' carries {})",
                        existing, event.id, short_id
                    )));
                }
                _ => snapshot.short_id = Some(short_id.to_string()),
            }
        }
        // Metadata-only reductions: comments live in the event log, archive
        // moves files, git events carry no snapshot state, custom types are
        // opaque.
        EventType::CommentAdded
        | EventType::TaskArchived
        | EventType::TaskUnarchived
        | EventType::GitEvent
        | EventType::Custom(_) => {}
        other if other.is_resource_type() => {
            return Err(Error::Validation(format!(
                "resource event '{}' in a task log",
                other
            )));
        }
        _ => {}
    }

    snapshot.updated_at = event.ts.clone();
    snapshot.last_event_id = event.id.clone();
    Ok(snapshot)
}

/// Fold a full event sequence into a snapshot.
pub fn replay<'a>(events: impl IntoIterator<Item = &'a Event>) -> Result<TaskSnapshot> {
    let mut snapshot = None;
    for event in events {
        snapshot = Some(apply_event(snapshot, event)?);
    }
    snapshot.ok_or_else(|| Error::Validation("empty event log".to_string()))
}

fn init_from_created(event: &Event) -> TaskSnapshot {
    TaskSnapshot {
        schema_version: TASK_SCHEMA_VERSION,
        id: event.task_id.clone().unwrap_or_default(),
        title: data_str(event, "title").unwrap_or_default().to_string(),
        status: data_str(event, "status").unwrap_or_default().to_string(),
        created_at: event.ts.clone(),
        updated_at: event.ts.clone(),
        last_event_id: event.id.clone(),
        short_id: data_str(event, "short_id").map(str::to_string),
        description: data_str(event, "description").map(str::to_string),
        priority: data_str(event, "priority").map(str::to_string),
        urgency: data_str(event, "urgency").map(str::to_string),
        task_type: data_str(event, "type").map(str::to_string),
        complexity: data_str(event, "complexity").map(str::to_string),
        tags: data_tags(event),
        assigned_to: data_str(event, "assigned_to").map(str::to_string),
        created_by: Some(
            data_str(event, "created_by")
                .unwrap_or(&event.actor)
                .to_string(),
        ),
        relationships_out: Vec::new(),
        artifact_refs: Vec::new(),
        branch_links: Vec::new(),
        done_at: None,
        last_status_changed_at: None,
        custom_fields: Map::new(),
        extra: Map::new(),
    }
}

fn apply_field_update(snapshot: &mut TaskSnapshot, event: &Event) {
    let Some(field) = data_str(event, "field").map(str::to_string) else {
        return;
    };
    if PROTECTED_FIELDS.contains(&field.as_str()) {
        return;
    }
    let value = event.data.get("value").cloned().unwrap_or(Value::Null);

    match field.as_str() {
        "title" => {
            if let Value::String(title) = value {
                snapshot.title = title;
            }
        }
        "description" => snapshot.description = value_as_opt_string(value),
        "priority" => snapshot.priority = value_as_opt_string(value),
        "urgency" => snapshot.urgency = value_as_opt_string(value),
        "type" => snapshot.task_type = value_as_opt_string(value),
        "complexity" => snapshot.complexity = value_as_opt_string(value),
        "assigned_to" => snapshot.assigned_to = value_as_opt_string(value),
        "tags" => snapshot.tags = dedup_tags(value),
        _ => {
            if let Some(path) = field.strip_prefix("custom_fields.") {
                set_dotted(&mut snapshot.custom_fields, path, value);
            }
            // Unknown top-level fields are ignored; the write path rejects
            // them before an event ever exists.
        }
    }
}

fn set_dotted(fields: &mut Map<String, Value>, path: &str, value: Value) {
    let mut segments = path.split('.').peekable();
    let mut current = fields;

    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            if value.is_null() {
                current.remove(segment);
            } else {
                current.insert(segment.to_string(), value);
            }
            return;
        }

        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        let Some(next) = entry.as_object_mut() else {
            return;
        };
        current = next;
    }
}

fn data_str<'a>(event: &'a Event, key: &str) -> Option<&'a str> {
    event.data.get(key).and_then(Value::as_str)
}

fn data_tags(event: &Event) -> Vec<String> {
    dedup_tags(event.data.get("tags").cloned().unwrap_or(Value::Null))
}

fn dedup_tags(value: Value) -> Vec<String> {
    let Value::Array(items) = value else {
        return Vec::new();
    };
    let mut tags = Vec::new();
    for item in items {
        if let Value::String(tag) = item {
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }
    }
    tags
}

fn value_as_opt_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        _ => None,
    }
}
