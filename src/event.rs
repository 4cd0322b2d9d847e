//! Event records: the authoritative, append-only unit of change.
//!
//! Events are serialized as canonical JSONL (sorted keys, no inner
//! whitespace, one `\n`-terminated line each). The built-in type set is
//! closed; custom types live in the `x_` namespace and reduce as no-ops.

use std::fmt;

use chrono::{SecondsFormat, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::canon;
use crate::error::{Error, Result};
use crate::id::{self, EVENT_PREFIX};

/// Schema version stamped on every event record.
pub const EVENT_SCHEMA_VERSION: u32 = 1;

/// Built-in task event type names, the closed set.
pub const TASK_EVENT_TYPES: [&str; 14] = [
    "task_created",
    "task_archived",
    "task_unarchived",
    "status_changed",
    "assignment_changed",
    "field_updated",
    "comment_added",
    "relationship_added",
    "relationship_removed",
    "artifact_attached",
    "branch_linked",
    "branch_unlinked",
    "task_short_id_assigned",
    "git_event",
];

/// Built-in resource event type names, the closed set.
pub const RESOURCE_EVENT_TYPES: [&str; 6] = [
    "resource_created",
    "resource_acquired",
    "resource_released",
    "resource_heartbeat",
    "resource_expired",
    "resource_updated",
];

/// Event types duplicated into the aggregate lifecycle index.
pub const LIFECYCLE_EVENT_TYPES: [&str; 3] =
    ["task_created", "task_archived", "task_unarchived"];

/// Event type tag: the closed built-in set plus an `x_` custom arm.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    TaskCreated,
    TaskArchived,
    TaskUnarchived,
    StatusChanged,
    AssignmentChanged,
    FieldUpdated,
    CommentAdded,
    RelationshipAdded,
    RelationshipRemoved,
    ArtifactAttached,
    BranchLinked,
    BranchUnlinked,
    TaskShortIdAssigned,
    GitEvent,
    ResourceCreated,
    ResourceAcquired,
    ResourceReleased,
    ResourceHeartbeat,
    ResourceExpired,
    ResourceUpdated,
    /// Custom type in the `x_` namespace; reduces as a no-op.
    Custom(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::TaskCreated => "task_created",
            EventType::TaskArchived => "task_archived",
            EventType::TaskUnarchived => "task_unarchived",
            EventType::StatusChanged => "status_changed",
            EventType::AssignmentChanged => "assignment_changed",
            EventType::FieldUpdated => "field_updated",
            EventType::CommentAdded => "comment_added",
            EventType::RelationshipAdded => "relationship_added",
            EventType::RelationshipRemoved => "relationship_removed",
            EventType::ArtifactAttached => "artifact_attached",
            EventType::BranchLinked => "branch_linked",
            EventType::BranchUnlinked => "branch_unlinked",
            EventType::TaskShortIdAssigned => "task_short_id_assigned",
            EventType::GitEvent => "git_event",
            EventType::ResourceCreated => "resource_created",
            EventType::ResourceAcquired => "resource_acquired",
            EventType::ResourceReleased => "resource_released",
            EventType::ResourceHeartbeat => "resource_heartbeat",
            EventType::ResourceExpired => "resource_expired",
            EventType::ResourceUpdated => "resource_updated",
            EventType::Custom(name) => name,
        }
    }

    /// Parse a type tag. Unknown names become `Custom` so readers tolerate
    /// foreign logs; writers validate custom names separately.
    pub fn parse(name: &str) -> Self {
        match name {
            "task_created" => EventType::TaskCreated,
            "task_archived" => EventType::TaskArchived,
            "task_unarchived" => EventType::TaskUnarchived,
            "status_changed" => EventType::StatusChanged,
            "assignment_changed" => EventType::AssignmentChanged,
            "field_updated" => EventType::FieldUpdated,
            "comment_added" => EventType::CommentAdded,
            "relationship_added" => EventType::RelationshipAdded,
            "relationship_removed" => EventType::RelationshipRemoved,
            "artifact_attached" => EventType::ArtifactAttached,
            "branch_linked" => EventType::BranchLinked,
            "branch_unlinked" => EventType::BranchUnlinked,
            "task_short_id_assigned" => EventType::TaskShortIdAssigned,
            "git_event" => EventType::GitEvent,
            "resource_created" => EventType::ResourceCreated,
            "resource_acquired" => EventType::ResourceAcquired,
            "resource_released" => EventType::ResourceReleased,
            "resource_heartbeat" => EventType::ResourceHeartbeat,
            "resource_expired" => EventType::ResourceExpired,
            "resource_updated" => EventType::ResourceUpdated,
            other => EventType::Custom(other.to_string()),
        }
    }

    /// True for `task_created` / `task_archived` / `task_unarchived`.
    pub fn is_lifecycle(&self) -> bool {
        LIFECYCLE_EVENT_TYPES.contains(&self.as_str())
    }

    pub fn is_resource_type(&self) -> bool {
        RESOURCE_EVENT_TYPES.contains(&self.as_str())
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        if name.is_empty() {
            return Err(D::Error::custom("event type cannot be empty"));
        }
        Ok(EventType::parse(&name))
    }
}

/// Validate a custom event type for writing: `x_` prefix, no collision.
pub fn validate_custom_event_type(name: &str) -> Result<()> {
    if !name.starts_with("x_") || name.len() <= 2 {
        return Err(Error::Validation(format!(
            "custom event type '{}' must start with 'x_'",
            name
        )));
    }
    if TASK_EVENT_TYPES.contains(&name) || RESOURCE_EVENT_TYPES.contains(&name) {
        return Err(Error::Validation(format!(
            "custom event type '{}' collides with a built-in",
            name
        )));
    }
    Ok(())
}

/// Attribution for events produced by an LLM agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

impl AgentMeta {
    pub fn is_empty(&self) -> bool {
        self.model.is_none() && self.session.is_none()
    }
}

/// Why an event happened, for audits and force overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_behalf_of: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Provenance {
    pub fn is_empty(&self) -> bool {
        self.triggered_by.is_none() && self.on_behalf_of.is_none() && self.reason.is_none()
    }
}

/// OpenTelemetry correlation ids.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Otel {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
}

impl Otel {
    pub fn is_empty(&self) -> bool {
        self.trace_id.is_none() && self.span_id.is_none() && self.parent_span_id.is_none()
    }
}

/// One immutable event record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub schema_version: u32,
    pub id: String,
    pub ts: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_meta: Option<AgentMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub otel: Option<Otel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Map<String, Value>>,
    /// Unknown top-level fields from newer writers, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Event {
    /// Build a task-scoped event with a fresh id and the current time.
    pub fn new_task(
        event_type: EventType,
        task_id: impl Into<String>,
        actor: impl Into<String>,
        data: Map<String, Value>,
    ) -> Self {
        Self {
            schema_version: EVENT_SCHEMA_VERSION,
            id: id::new_id(EVENT_PREFIX),
            ts: now_ts(),
            event_type,
            actor: actor.into(),
            task_id: Some(task_id.into()),
            resource_id: None,
            data,
            agent_meta: None,
            provenance: None,
            otel: None,
            run_id: None,
            metrics: None,
            extra: Map::new(),
        }
    }

    /// Build a resource-scoped event with a fresh id and the current time.
    pub fn new_resource(
        event_type: EventType,
        resource_id: impl Into<String>,
        actor: impl Into<String>,
        data: Map<String, Value>,
    ) -> Self {
        Self {
            resource_id: Some(resource_id.into()),
            task_id: None,
            ..Self::new_task(event_type, String::new(), actor, data)
        }
    }

    /// Override the generated event id (caller-supplied idempotency key).
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Override the generated timestamp.
    pub fn with_ts(mut self, ts: impl Into<String>) -> Self {
        self.ts = ts.into();
        self
    }

    /// Attach agent metadata; empty metadata is omitted, not serialized null.
    pub fn with_agent_meta(mut self, meta: AgentMeta) -> Self {
        self.agent_meta = if meta.is_empty() { None } else { Some(meta) };
        self
    }

    /// Attach provenance; empty provenance is omitted.
    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = if provenance.is_empty() {
            None
        } else {
            Some(provenance)
        };
        self
    }

    /// Canonical JSONL line for this event.
    pub fn to_canonical_line(&self) -> Result<String> {
        canon::to_canonical_line(self)
    }
}

/// Current UTC time as RFC 3339 with `Z` and fixed microsecond precision.
///
/// Timestamps are strings from here on; fixed precision keeps string
/// comparison equivalent to time comparison within one time source.
pub fn now_ts() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn type_tag_round_trips() {
        for name in TASK_EVENT_TYPES.iter().chain(RESOURCE_EVENT_TYPES.iter()) {
            let parsed = EventType::parse(name);
            assert_eq!(parsed.as_str(), *name);
            assert!(!matches!(parsed, EventType::Custom(_)));
        }

        let custom = EventType::parse("x_deploy_requested");
        assert_eq!(custom, EventType::Custom("x_deploy_requested".to_string()));
    }

    #[test]
    fn lifecycle_classification() {
        assert!(EventType::TaskCreated.is_lifecycle());
        assert!(EventType::TaskArchived.is_lifecycle());
        assert!(EventType::TaskUnarchived.is_lifecycle());
        assert!(!EventType::StatusChanged.is_lifecycle());
        assert!(!EventType::Custom("x_thing".to_string()).is_lifecycle());
    }

    #[test]
    fn custom_type_validation() {
        validate_custom_event_type("x_deploy").unwrap();
        assert!(validate_custom_event_type("deploy").is_err());
        assert!(validate_custom_event_type("x_").is_err());
        assert!(validate_custom_event_type("status_changed").is_err());
    }

    #[test]
    fn canonical_line_is_sorted_and_stable() {
        let event = Event::new_task(
            EventType::TaskCreated,
            "task_01J8ZC4D2N3F4G5H6J7K8M9N0P",
            "human:ana",
            data(&[("title", json!("First")), ("status", json!("backlog"))]),
        )
        .with_id("ev_01J8ZC4D2N3F4G5H6J7K8M9N0Q")
        .with_ts("2026-08-01T10:00:00.000000Z");

        let line = event.to_canonical_line().unwrap();
        assert!(line.ends_with('\n'));
        assert!(!line[..line.len() - 1].contains('\n'));
        // Keys sorted: actor < data < id < schema_version < task_id < ts < type
        let actor_pos = line.find("\"actor\"").unwrap();
        let data_pos = line.find("\"data\"").unwrap();
        let type_pos = line.find("\"type\"").unwrap();
        assert!(actor_pos < data_pos && data_pos < type_pos);

        // Serialization is deterministic.
        assert_eq!(line, event.to_canonical_line().unwrap());
    }

    #[test]
    fn optional_blocks_are_omitted_when_empty() {
        let event = Event::new_task(
            EventType::CommentAdded,
            "task_01J8ZC4D2N3F4G5H6J7K8M9N0P",
            "agent:claude",
            Map::new(),
        )
        .with_agent_meta(AgentMeta::default())
        .with_provenance(Provenance::default());

        let line = event.to_canonical_line().unwrap();
        assert!(!line.contains("agent_meta"));
        assert!(!line.contains("provenance"));
        assert!(!line.contains("null"));
    }

    #[test]
    fn unknown_fields_survive_round_trip() {
        let raw = r#"{"actor":"human:a","data":{},"future_field":{"x":1},"id":"ev_01J8ZC4D2N3F4G5H6J7K8M9N0Q","schema_version":1,"task_id":"task_01J8ZC4D2N3F4G5H6J7K8M9N0P","ts":"2026-08-01T10:00:00.000000Z","type":"comment_added"}"#;
        let event: Event = serde_json::from_str(raw).unwrap();
        assert_eq!(event.extra["future_field"], json!({"x": 1}));

        let line = event.to_canonical_line().unwrap();
        assert_eq!(line.trim_end(), raw);
    }

    #[test]
    fn timestamps_are_rfc3339_utc_with_fixed_precision() {
        let ts = now_ts();
        assert!(ts.ends_with('Z'));
        let dot = ts.find('.').unwrap();
        assert_eq!(ts.len() - dot, ".000000Z".len());
    }
}
