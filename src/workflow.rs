//! Workflow gates: transition validation, completion policies, and the
//! review rework limit.
//!
//! Gates run in the write path only; the reducer applies whatever the log
//! says. A force override needs a reason, which the caller records into the
//! event's provenance and data.

use serde_json::Value;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::{Event, EventType};

/// Statuses that count as rework when entered from `review`.
const REWORK_STATUSES: [&str; 2] = ["in_progress", "in_planning"];

/// A requested status change, with optional force override.
#[derive(Debug, Clone, Copy)]
pub struct TransitionRequest<'a> {
    pub from: &'a str,
    pub to: &'a str,
    pub force: bool,
    pub reason: Option<&'a str>,
}

/// Validate a status change against the workflow graph and gates.
///
/// `events` is the task's full event history, used for role evidence and
/// rework counting.
pub fn check_transition(cfg: &Config, events: &[Event], req: TransitionRequest) -> Result<()> {
    if req.force && req.reason.map(str::trim).unwrap_or("").is_empty() {
        return Err(Error::Validation(
            "--force requires --reason".to_string(),
        ));
    }

    if req.from == req.to {
        return Err(Error::Validation(format!(
            "task is already in status '{}'",
            req.to
        )));
    }

    if !cfg.workflow.statuses.iter().any(|s| s.as_str() == req.to) {
        return Err(Error::Validation(format!(
            "unknown status '{}' (expected one of: {})",
            req.to,
            cfg.workflow.statuses.join(", ")
        )));
    }

    if !cfg.validate_transition(req.from, req.to) && !req.force {
        return Err(Error::InvalidTransition {
            from: req.from.to_string(),
            to: req.to.to_string(),
        });
    }

    if !req.force {
        check_completion_policy(cfg, events, req.to)?;
        check_review_cycle(cfg, events, req.from, req.to)?;
    }

    Ok(())
}

/// Enforce role evidence required before entering `target_status`.
///
/// A role is satisfied by any `comment_added` or `artifact_attached` event
/// whose `data.role` matches; comments and artifacts count equally.
pub fn check_completion_policy(cfg: &Config, events: &[Event], target_status: &str) -> Result<()> {
    let Some(policy) = cfg.completion_policy(target_status) else {
        return Ok(());
    };

    for role in &policy.require_roles {
        let satisfied = events.iter().any(|event| {
            matches!(
                event.event_type,
                EventType::CommentAdded | EventType::ArtifactAttached
            ) && event.data.get("role").and_then(Value::as_str) == Some(role.as_str())
        });

        if !satisfied {
            return Err(Error::CompletionBlocked(format!(
                "Missing role: {role}. Satisfy with: attach --role {role} or comment --role {role}. \
                 Override with --force --reason."
            )));
        }
    }

    if policy.require_branch_merged == Some(true) {
        let merged = events.iter().any(|event| {
            event.event_type == EventType::GitEvent
                && event.data.get("kind").and_then(Value::as_str) == Some("branch_merged")
        });
        if !merged {
            return Err(Error::CompletionBlocked(
                "Missing merged branch. Record a git_event with kind=branch_merged. \
                 Override with --force --reason."
                    .to_string(),
            ));
        }
    }

    Ok(())
}

/// Count past rework transitions and block when the configured limit is hit.
fn check_review_cycle(cfg: &Config, events: &[Event], from: &str, to: &str) -> Result<()> {
    if from != "review" || !REWORK_STATUSES.contains(&to) {
        return Ok(());
    }

    let Some(limit) = cfg
        .completion_policy("review")
        .and_then(|policy| policy.review_cycle_limit)
    else {
        return Ok(());
    };

    let count = rework_count(events);
    if count >= limit {
        return Err(Error::ReviewCycleExceeded { count, limit });
    }

    Ok(())
}

/// Number of `review -> in_progress|in_planning` transitions in the history.
pub fn rework_count(events: &[Event]) -> usize {
    events
        .iter()
        .filter(|event| {
            event.event_type == EventType::StatusChanged
                && event.data.get("from").and_then(Value::as_str) == Some("review")
                && event
                    .data
                    .get("status")
                    .and_then(Value::as_str)
                    .map(|status| REWORK_STATUSES.contains(&status))
                    .unwrap_or(false)
        })
        .count()
}
