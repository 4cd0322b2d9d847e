//! Configuration loading and management
//!
//! Handles parsing of `.lattice/config.json`: workflow statuses and
//! transitions, completion policies, hooks, and project codes.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::canon;
use crate::error::{Error, Result};
use crate::fsio;
use crate::id;
use crate::snapshot::PRIORITIES;

/// Schema version stamped on config.json.
pub const CONFIG_SCHEMA_VERSION: u32 = 1;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,

    /// Status applied to newly created tasks
    #[serde(default = "default_status")]
    pub default_status: String,

    /// Priority applied when none is given
    #[serde(default = "default_priority")]
    pub default_priority: String,

    /// Allowed task types
    #[serde(default = "default_task_types")]
    pub task_types: Vec<String>,

    /// Project code for short-ids (1-5 uppercase letters); none disables them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_code: Option<String>,

    /// Optional subproject code for short-ids
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subproject_code: Option<String>,

    /// Workflow graph and gates
    #[serde(default)]
    pub workflow: WorkflowConfig,

    /// Post-write shell hooks
    #[serde(default, skip_serializing_if = "HooksConfig::is_empty")]
    pub hooks: HooksConfig,

    /// Resource subsystem settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesConfig>,

    /// Heartbeat settings for resource holders
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<HeartbeatConfig>,

    /// Unknown fields from newer writers, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            default_status: default_status(),
            default_priority: default_priority(),
            task_types: default_task_types(),
            project_code: None,
            subproject_code: None,
            workflow: WorkflowConfig::default(),
            hooks: HooksConfig::default(),
            resources: None,
            heartbeat: None,
            extra: Map::new(),
        }
    }
}

fn default_schema_version() -> u32 {
    CONFIG_SCHEMA_VERSION
}

fn default_status() -> String {
    "backlog".to_string()
}

fn default_priority() -> String {
    "medium".to_string()
}

fn default_task_types() -> Vec<String> {
    ["feature", "bug", "chore", "spike"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Workflow statuses, transition graph, WIP limits, and completion policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default = "default_statuses")]
    pub statuses: Vec<String>,

    /// Allowed transitions, `from -> [to, ...]`. Absent key means no exits.
    #[serde(default = "default_transitions")]
    pub transitions: BTreeMap<String, Vec<String>>,

    /// Soft per-status WIP ceilings; exceeding one is a warning, not an error
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub wip_limits: BTreeMap<String, u32>,

    /// Gates keyed by status (target status for role evidence; `review` for
    /// the rework cycle limit)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub completion_policies: BTreeMap<String, CompletionPolicy>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            statuses: default_statuses(),
            transitions: default_transitions(),
            wip_limits: BTreeMap::new(),
            completion_policies: BTreeMap::new(),
        }
    }
}

fn default_statuses() -> Vec<String> {
    [
        "backlog",
        "in_planning",
        "planned",
        "in_progress",
        "review",
        "done",
        "abandoned",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_transitions() -> BTreeMap<String, Vec<String>> {
    let edges: [(&str, &[&str]); 6] = [
        ("backlog", &["in_planning", "abandoned"]),
        ("in_planning", &["planned", "backlog", "abandoned"]),
        ("planned", &["in_progress", "backlog", "abandoned"]),
        ("in_progress", &["review", "planned", "abandoned"]),
        ("review", &["done", "in_progress", "in_planning"]),
        ("abandoned", &["backlog"]),
    ];
    edges
        .iter()
        .map(|(from, tos)| {
            (
                from.to_string(),
                tos.iter().map(|to| to.to_string()).collect(),
            )
        })
        .collect()
}

/// Per-status completion policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionPolicy {
    /// Roles that must appear on a comment or attached artifact before a
    /// task may enter this status
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub require_roles: Vec<String>,

    /// Require a linked branch to be recorded as merged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_branch_merged: Option<bool>,

    /// Max rework round-trips out of this status (used on `review`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_cycle_limit: Option<usize>,
}

/// Post-write hook commands, run via `sh -c` after a durable mutation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HooksConfig {
    /// Catch-all hook, runs for every event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_event: Option<String>,

    /// Hooks keyed by event type
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub on: BTreeMap<String, String>,

    /// Hooks keyed by transition, `from->to`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub transitions: BTreeMap<String, String>,
}

impl HooksConfig {
    pub fn is_empty(&self) -> bool {
        self.post_event.is_none() && self.on.is_empty() && self.transitions.is_empty()
    }
}

/// Resource subsystem settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcesConfig {
    /// Default holder TTL as a duration string ("30s", "90m", "2h", "1d")
    #[serde(default = "default_resource_ttl")]
    pub default_ttl: String,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            default_ttl: default_resource_ttl(),
        }
    }
}

fn default_resource_ttl() -> String {
    "2h".to_string()
}

/// Heartbeat settings: how far a heartbeat extends a holder's TTL when the
/// caller gives no explicit duration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub interval: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: default_heartbeat_interval(),
        }
    }
}

fn default_heartbeat_interval() -> String {
    "15m".to_string()
}

impl Config {
    /// Load configuration from a config.json file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration atomically in canonical form
    pub fn save(&self, path: &Path) -> Result<()> {
        let doc = canon::to_pretty_document(self)?;
        fsio::atomic_write(path, doc.as_bytes())
    }

    /// Is `from -> to` an allowed transition? Equal states are a no-op, not
    /// a transition, and always answer false.
    pub fn validate_transition(&self, from: &str, to: &str) -> bool {
        if from == to {
            return false;
        }
        self.workflow
            .transitions
            .get(from)
            .map(|tos| tos.iter().any(|t| t.as_str() == to))
            .unwrap_or(false)
    }

    /// Completion policy for a target status, if configured.
    pub fn completion_policy(&self, status: &str) -> Option<&CompletionPolicy> {
        self.workflow.completion_policies.get(status)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workflow.statuses.is_empty() {
            return Err(Error::Validation(
                "workflow.statuses cannot be empty".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for status in &self.workflow.statuses {
            if status.trim().is_empty() {
                return Err(Error::Validation(
                    "workflow.statuses cannot include empty entries".to_string(),
                ));
            }
            if !seen.insert(status.as_str()) {
                return Err(Error::Validation(format!(
                    "workflow.statuses has duplicate entry '{status}'"
                )));
            }
        }

        if !seen.contains(self.default_status.as_str()) {
            return Err(Error::Validation(format!(
                "default_status '{}' not in workflow.statuses",
                self.default_status
            )));
        }

        if !PRIORITIES.contains(&self.default_priority.as_str()) {
            return Err(Error::Validation(format!(
                "default_priority '{}' must be one of {}",
                self.default_priority,
                PRIORITIES.join(", ")
            )));
        }

        for (from, tos) in &self.workflow.transitions {
            if !seen.contains(from.as_str()) {
                return Err(Error::Validation(format!(
                    "workflow.transitions references unknown status '{from}'"
                )));
            }
            for to in tos {
                if !seen.contains(to.as_str()) {
                    return Err(Error::Validation(format!(
                        "workflow.transitions['{from}'] references unknown status '{to}'"
                    )));
                }
            }
        }

        for status in self.workflow.completion_policies.keys() {
            if !seen.contains(status.as_str()) {
                return Err(Error::Validation(format!(
                    "workflow.completion_policies references unknown status '{status}'"
                )));
            }
        }

        for status in self.workflow.wip_limits.keys() {
            if !seen.contains(status.as_str()) {
                return Err(Error::Validation(format!(
                    "workflow.wip_limits references unknown status '{status}'"
                )));
            }
        }

        if let Some(code) = &self.project_code {
            id::validate_project_code(code)?;
        }
        if let Some(code) = &self.subproject_code {
            id::validate_project_code(code)?;
            if self.project_code.is_none() {
                return Err(Error::Validation(
                    "subproject_code requires project_code".to_string(),
                ));
            }
        }

        Ok(())
    }
}
