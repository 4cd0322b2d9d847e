//! Task operations for lattice.
//!
//! The `Tasks` facade validates input against config and current state,
//! builds events, and hands them to the write path. Reads are lock-free and
//! come straight from snapshots; comments come from the event log.

use serde_json::{json, Map, Value};
use tracing::warn;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::{self, Event, EventType};
use crate::id::{self, ARTIFACT_PREFIX, TASK_PREFIX};
use crate::snapshot::{TaskSnapshot, PRIORITIES, RELATION_TYPES, UPDATABLE_FIELDS};
use crate::store::{Store, TaskLocation};
use crate::workflow::{self, TransitionRequest};
use crate::writer::{self, WriteOutcome, WriteRequest};

/// Inputs for creating a task.
#[derive(Debug, Clone, Default)]
pub struct CreateSpec {
    /// Caller-supplied id for idempotent creates; generated when absent.
    pub task_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub status: Option<String>,
    pub priority: Option<String>,
    pub urgency: Option<String>,
    pub task_type: Option<String>,
    pub complexity: Option<String>,
    pub tags: Vec<String>,
    pub assigned_to: Option<String>,
}

/// A comment read back from the event log.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Comment {
    pub event_id: String,
    pub ts: String,
    pub actor: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// Read-side filter for task listing.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub status: Option<String>,
    pub assigned_to: Option<String>,
    pub tag: Option<String>,
}

/// High-level task operations over one store.
#[derive(Debug, Clone)]
pub struct Tasks {
    store: Store,
    config: Config,
}

impl Tasks {
    pub fn open(store: Store) -> Result<Self> {
        let config = store.config()?;
        Ok(Self { store, config })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Create a task. Repeating a create with the same id and payload is
    /// success without a new event.
    pub fn create(&self, spec: CreateSpec, actor: &str) -> Result<WriteOutcome> {
        id::validate_actor(actor)?;

        let title = spec.title.trim();
        if title.is_empty() {
            return Err(Error::Validation("title cannot be empty".to_string()));
        }

        let status = spec
            .status
            .clone()
            .unwrap_or_else(|| self.config.default_status.clone());
        if !self.config.workflow.statuses.iter().any(|s| s == &status) {
            return Err(Error::Validation(format!(
                "unknown status '{}' (expected one of: {})",
                status,
                self.config.workflow.statuses.join(", ")
            )));
        }

        let priority = spec
            .priority
            .clone()
            .unwrap_or_else(|| self.config.default_priority.clone());
        validate_priority(&priority)?;

        if let Some(task_type) = &spec.task_type {
            if !self.config.task_types.iter().any(|t| t == task_type) {
                return Err(Error::Validation(format!(
                    "unknown task type '{}' (expected one of: {})",
                    task_type,
                    self.config.task_types.join(", ")
                )));
            }
        }

        if let Some(assignee) = &spec.assigned_to {
            id::validate_actor(assignee)?;
        }

        let task_id = match &spec.task_id {
            Some(task_id) => {
                id::validate_id(task_id, TASK_PREFIX)?;
                task_id.clone()
            }
            None => id::new_id(TASK_PREFIX),
        };

        let mut data = Map::new();
        data.insert("title".to_string(), json!(title));
        data.insert("status".to_string(), json!(status));
        data.insert("priority".to_string(), json!(priority));
        insert_opt(&mut data, "description", spec.description.as_deref());
        insert_opt(&mut data, "urgency", spec.urgency.as_deref());
        insert_opt(&mut data, "type", spec.task_type.as_deref());
        insert_opt(&mut data, "complexity", spec.complexity.as_deref());
        insert_opt(&mut data, "assigned_to", spec.assigned_to.as_deref());
        if !spec.tags.is_empty() {
            data.insert("tags".to_string(), json!(spec.tags));
        }

        let created = Event::new_task(EventType::TaskCreated, task_id.clone(), actor, data);

        writer::write_task_mutation(
            &self.store,
            &self.config,
            WriteRequest {
                task_id,
                events: vec![created],
                assign_short_id: self.config.project_code.is_some(),
                actor: actor.to_string(),
            },
        )
    }

    /// Change a task's status through the workflow gates.
    pub fn change_status(
        &self,
        task_ref: &str,
        to: &str,
        actor: &str,
        force: bool,
        reason: Option<&str>,
    ) -> Result<TaskSnapshot> {
        id::validate_actor(actor)?;
        let task_id = self.resolve_active(task_ref)?;
        let snapshot = self.store.read_snapshot(&task_id)?;
        let events = self.store.read_events(&task_id)?;

        workflow::check_transition(
            &self.config,
            &events,
            TransitionRequest {
                from: &snapshot.status,
                to,
                force,
                reason,
            },
        )?;

        self.warn_on_wip_limit(to);

        let mut data = Map::new();
        data.insert("status".to_string(), json!(to));
        data.insert("from".to_string(), json!(snapshot.status));
        if force {
            insert_opt(&mut data, "reason", reason);
        }

        let mut event = Event::new_task(EventType::StatusChanged, task_id.clone(), actor, data);
        if force {
            event = event.with_provenance(event::Provenance {
                reason: reason.map(str::to_string),
                ..Default::default()
            });
        }

        self.commit_one(task_id, event)
    }

    /// Set or clear the assignee.
    pub fn assign(&self, task_ref: &str, assignee: Option<&str>, actor: &str) -> Result<TaskSnapshot> {
        id::validate_actor(actor)?;
        if let Some(assignee) = assignee {
            id::validate_actor(assignee)?;
        }
        let task_id = self.resolve_active(task_ref)?;

        let mut data = Map::new();
        data.insert(
            "assigned_to".to_string(),
            assignee.map(|a| json!(a)).unwrap_or(Value::Null),
        );

        let event = Event::new_task(EventType::AssignmentChanged, task_id.clone(), actor, data);
        self.commit_one(task_id, event)
    }

    /// Update one snapshot field, or a dotted `custom_fields.*` path.
    pub fn update_field(
        &self,
        task_ref: &str,
        field: &str,
        value: Value,
        actor: &str,
    ) -> Result<TaskSnapshot> {
        id::validate_actor(actor)?;
        let task_id = self.resolve_active(task_ref)?;

        let is_custom = field.starts_with("custom_fields.")
            && field.len() > "custom_fields.".len();
        if !is_custom && !UPDATABLE_FIELDS.contains(&field) {
            return Err(Error::Validation(format!(
                "field '{}' is not updatable (use one of {} or a custom_fields.* path)",
                field,
                UPDATABLE_FIELDS.join(", ")
            )));
        }

        match field {
            "title" => {
                if value.as_str().map(str::trim).unwrap_or("").is_empty() {
                    return Err(Error::Validation("title cannot be empty".to_string()));
                }
            }
            "priority" => {
                if let Some(priority) = value.as_str() {
                    validate_priority(priority)?;
                } else if !value.is_null() {
                    return Err(Error::Validation("priority must be a string".to_string()));
                }
            }
            "assigned_to" => {
                if let Some(assignee) = value.as_str() {
                    id::validate_actor(assignee)?;
                }
            }
            "tags" => {
                if !value.is_array() && !value.is_null() {
                    return Err(Error::Validation("tags must be an array".to_string()));
                }
            }
            _ => {}
        }

        let mut data = Map::new();
        data.insert("field".to_string(), json!(field));
        data.insert("value".to_string(), value);

        let event = Event::new_task(EventType::FieldUpdated, task_id.clone(), actor, data);
        self.commit_one(task_id, event)
    }

    /// Record a comment; `role` makes it count as completion-policy evidence.
    pub fn comment(
        &self,
        task_ref: &str,
        text: &str,
        role: Option<&str>,
        actor: &str,
    ) -> Result<TaskSnapshot> {
        id::validate_actor(actor)?;
        if text.trim().is_empty() {
            return Err(Error::Validation("comment cannot be empty".to_string()));
        }
        let task_id = self.resolve_active(task_ref)?;

        let mut data = Map::new();
        data.insert("text".to_string(), json!(text));
        insert_opt(&mut data, "role", role);

        let event = Event::new_task(EventType::CommentAdded, task_id.clone(), actor, data);
        self.commit_one(task_id, event)
    }

    /// Add an outgoing relationship edge.
    pub fn link(
        &self,
        task_ref: &str,
        rel_type: &str,
        target_ref: &str,
        note: Option<&str>,
        actor: &str,
    ) -> Result<TaskSnapshot> {
        id::validate_actor(actor)?;
        if !RELATION_TYPES.contains(&rel_type) {
            return Err(Error::Validation(format!(
                "unknown relationship type '{}' (expected one of: {})",
                rel_type,
                RELATION_TYPES.join(", ")
            )));
        }

        let task_id = self.resolve_active(task_ref)?;
        let target_id = self.store.resolve_task(target_ref)?;

        if task_id == target_id {
            return Err(Error::Validation(
                "a task cannot relate to itself".to_string(),
            ));
        }

        let snapshot = self.store.read_snapshot(&task_id)?;
        if snapshot.relationship(rel_type, &target_id).is_some() {
            return Err(Error::Validation(format!(
                "duplicate edge: {} already {} {}",
                task_id, rel_type, target_id
            )));
        }

        let mut data = Map::new();
        data.insert("type".to_string(), json!(rel_type));
        data.insert("target_task_id".to_string(), json!(target_id));
        insert_opt(&mut data, "note", note);

        let event = Event::new_task(EventType::RelationshipAdded, task_id.clone(), actor, data);
        self.commit_one(task_id, event)
    }

    /// Remove an outgoing relationship edge.
    pub fn unlink(
        &self,
        task_ref: &str,
        rel_type: &str,
        target_ref: &str,
        actor: &str,
    ) -> Result<TaskSnapshot> {
        id::validate_actor(actor)?;
        let task_id = self.resolve_active(task_ref)?;
        let target_id = self.store.resolve_task(target_ref)?;

        let snapshot = self.store.read_snapshot(&task_id)?;
        if snapshot.relationship(rel_type, &target_id).is_none() {
            return Err(Error::NotFound(format!(
                "relationship {} {} {}",
                task_id, rel_type, target_id
            )));
        }

        let mut data = Map::new();
        data.insert("type".to_string(), json!(rel_type));
        data.insert("target_task_id".to_string(), json!(target_id));

        let event = Event::new_task(EventType::RelationshipRemoved, task_id.clone(), actor, data);
        self.commit_one(task_id, event)
    }

    /// Attach an existing artifact; `role` makes it completion evidence.
    pub fn attach_artifact(
        &self,
        task_ref: &str,
        artifact_id: &str,
        role: Option<&str>,
        actor: &str,
    ) -> Result<TaskSnapshot> {
        id::validate_actor(actor)?;
        id::validate_id(artifact_id, ARTIFACT_PREFIX)?;
        let task_id = self.resolve_active(task_ref)?;

        if !self.store.artifact_meta_path(artifact_id).exists() {
            return Err(Error::NotFound(format!("artifact {artifact_id}")));
        }

        let mut data = Map::new();
        data.insert("artifact_id".to_string(), json!(artifact_id));
        insert_opt(&mut data, "role", role);

        let event = Event::new_task(EventType::ArtifactAttached, task_id.clone(), actor, data);
        self.commit_one(task_id, event)
    }

    /// Link a VCS branch to a task.
    pub fn link_branch(
        &self,
        task_ref: &str,
        branch: &str,
        repo: Option<&str>,
        actor: &str,
    ) -> Result<TaskSnapshot> {
        id::validate_actor(actor)?;
        if branch.trim().is_empty() {
            return Err(Error::Validation("branch cannot be empty".to_string()));
        }
        let task_id = self.resolve_active(task_ref)?;

        let mut data = Map::new();
        data.insert("branch".to_string(), json!(branch));
        insert_opt(&mut data, "repo", repo);

        let event = Event::new_task(EventType::BranchLinked, task_id.clone(), actor, data);
        self.commit_one(task_id, event)
    }

    /// Remove a branch link.
    pub fn unlink_branch(
        &self,
        task_ref: &str,
        branch: &str,
        repo: Option<&str>,
        actor: &str,
    ) -> Result<TaskSnapshot> {
        id::validate_actor(actor)?;
        let task_id = self.resolve_active(task_ref)?;

        let snapshot = self.store.read_snapshot(&task_id)?;
        let exists = snapshot.branch_links.iter().any(|link| {
            link.branch == branch && (repo.is_none() || link.repo.as_deref() == repo)
        });
        if !exists {
            return Err(Error::NotFound(format!(
                "branch link '{}' on {}",
                branch, task_id
            )));
        }

        let mut data = Map::new();
        data.insert("branch".to_string(), json!(branch));
        insert_opt(&mut data, "repo", repo);

        let event = Event::new_task(EventType::BranchUnlinked, task_id.clone(), actor, data);
        self.commit_one(task_id, event)
    }

    /// Record a git observation (merge, push). No-op in the reducer.
    pub fn git_event(
        &self,
        task_ref: &str,
        data: Map<String, Value>,
        actor: &str,
    ) -> Result<TaskSnapshot> {
        id::validate_actor(actor)?;
        let task_id = self.resolve_active(task_ref)?;
        let event = Event::new_task(EventType::GitEvent, task_id.clone(), actor, data);
        self.commit_one(task_id, event)
    }

    /// Record a custom `x_*` event. No-op in the reducer.
    pub fn custom_event(
        &self,
        task_ref: &str,
        event_type: &str,
        data: Map<String, Value>,
        actor: &str,
    ) -> Result<TaskSnapshot> {
        id::validate_actor(actor)?;
        event::validate_custom_event_type(event_type)?;
        let task_id = self.resolve_active(task_ref)?;
        let event = Event::new_task(
            EventType::Custom(event_type.to_string()),
            task_id.clone(),
            actor,
            data,
        );
        self.commit_one(task_id, event)
    }

    // =========================================================================
    // Reads (lock-free)
    // =========================================================================

    pub fn get(&self, task_ref: &str) -> Result<TaskSnapshot> {
        let task_id = self.store.resolve_task(task_ref)?;
        self.store.read_snapshot(&task_id)
    }

    pub fn list(&self, filter: &ListFilter) -> Result<Vec<TaskSnapshot>> {
        if let Some(status) = &filter.status {
            if !self.config.workflow.statuses.iter().any(|s| s == status) {
                return Err(Error::Validation(format!("unknown status '{status}'")));
            }
        }

        let mut snapshots = self.store.list_snapshots()?;
        snapshots.retain(|snapshot| {
            filter
                .status
                .as_ref()
                .map(|status| &snapshot.status == status)
                .unwrap_or(true)
                && filter
                    .assigned_to
                    .as_ref()
                    .map(|assignee| snapshot.assigned_to.as_ref() == Some(assignee))
                    .unwrap_or(true)
                && filter
                    .tag
                    .as_ref()
                    .map(|tag| snapshot.tags.contains(tag))
                    .unwrap_or(true)
        });
        Ok(snapshots)
    }

    /// Comments, oldest first, straight from the event log.
    pub fn comments(&self, task_ref: &str) -> Result<Vec<Comment>> {
        let task_id = self.store.resolve_task(task_ref)?;
        let events = self.store.read_events(&task_id)?;
        Ok(events
            .into_iter()
            .filter(|event| event.event_type == EventType::CommentAdded)
            .map(|event| Comment {
                event_id: event.id.clone(),
                ts: event.ts.clone(),
                actor: event.actor.clone(),
                text: event
                    .data
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                role: event
                    .data
                    .get("role")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
            .collect())
    }

    pub fn events(&self, task_ref: &str) -> Result<Vec<Event>> {
        let task_id = self.store.resolve_task(task_ref)?;
        self.store.read_events(&task_id)
    }

    /// Tasks whose outgoing edges point at `task_ref` (reverse view, derived
    /// by linear scan; storage is outgoing-only).
    pub fn incoming_relationships(&self, task_ref: &str) -> Result<Vec<(String, String)>> {
        let task_id = self.store.resolve_task(task_ref)?;
        let mut incoming = Vec::new();
        for snapshot in self.store.list_snapshots()? {
            for rel in &snapshot.relationships_out {
                if rel.target_task_id == task_id {
                    incoming.push((snapshot.id.clone(), rel.rel_type.clone()));
                }
            }
        }
        Ok(incoming)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn resolve_active(&self, task_ref: &str) -> Result<String> {
        let task_id = self.store.resolve_task(task_ref)?;
        match self.store.task_location(&task_id) {
            Some(TaskLocation::Active) => Ok(task_id),
            Some(TaskLocation::Archived) => Err(Error::Validation(format!(
                "task {task_id} is archived; unarchive it first"
            ))),
            None => Err(Error::NotFound(format!("task {task_id}"))),
        }
    }

    fn commit_one(&self, task_id: String, event: Event) -> Result<TaskSnapshot> {
        let outcome = writer::write_task_mutation(
            &self.store,
            &self.config,
            WriteRequest {
                actor: event.actor.clone(),
                task_id,
                events: vec![event],
                assign_short_id: false,
            },
        )?;
        Ok(outcome.into_snapshot())
    }

    fn warn_on_wip_limit(&self, status: &str) {
        let Some(limit) = self.config.workflow.wip_limits.get(status) else {
            return;
        };
        let Ok(snapshots) = self.store.list_snapshots() else {
            return;
        };
        let occupancy = snapshots.iter().filter(|s| s.status == status).count();
        if occupancy as u32 >= *limit {
            warn!(status, occupancy, limit, "WIP limit reached");
        }
    }
}

fn validate_priority(priority: &str) -> Result<()> {
    if PRIORITIES.contains(&priority) {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "unknown priority '{}' (expected one of: {})",
            priority,
            PRIORITIES.join(", ")
        )))
    }
}

fn insert_opt(data: &mut Map<String, Value>, key: &str, value: Option<&str>) {
    if let Some(value) = value {
        data.insert(key.to_string(), json!(value));
    }
}
