//! lattice task command implementations.

use serde_json::Value;

use super::{BranchCommands, Context};
use crate::error::Result;
use crate::output::Output;
use crate::snapshot::TaskSnapshot;
use crate::task::{CreateSpec, ListFilter, Tasks};
use crate::writer::WriteOutcome;

pub struct CreateArgs {
    pub title: String,
    pub description: Option<String>,
    pub status: Option<String>,
    pub priority: Option<String>,
    pub urgency: Option<String>,
    pub task_type: Option<String>,
    pub complexity: Option<String>,
    pub tags: Vec<String>,
    pub assign: Option<String>,
    pub id: Option<String>,
}

fn tasks(ctx: &Context) -> Result<Tasks> {
    Tasks::open(ctx.store()?)
}

fn task_header(snapshot: &TaskSnapshot) -> String {
    let alias = snapshot
        .short_id
        .as_deref()
        .unwrap_or(snapshot.id.as_str());
    format!("{} [{}] {}", alias, snapshot.status, snapshot.title)
}

pub fn create(ctx: &Context, args: CreateArgs, json: bool, quiet: bool) -> Result<()> {
    let actor = ctx.actor()?;
    let tasks = tasks(ctx)?;

    let outcome = tasks.create(
        CreateSpec {
            task_id: args.id,
            title: args.title,
            description: args.description,
            status: args.status,
            priority: args.priority,
            urgency: args.urgency,
            task_type: args.task_type,
            complexity: args.complexity,
            tags: args.tags,
            assigned_to: args.assign,
        },
        &actor,
    )?;

    let already = matches!(outcome, WriteOutcome::Idempotent(_));
    let snapshot = outcome.into_snapshot();

    let mut output = Output::new(format!("Created {}", task_header(&snapshot)), &snapshot)?;
    if already {
        output = output.detail("task already existed with the same payload; no new event");
    }
    output.emit(json, quiet)
}

pub fn show(ctx: &Context, task_ref: &str, json: bool, quiet: bool) -> Result<()> {
    let tasks = tasks(ctx)?;
    let snapshot = tasks.get(task_ref)?;
    let comments = tasks.comments(task_ref)?;

    #[derive(serde::Serialize)]
    struct ShowReport<'a> {
        task: &'a TaskSnapshot,
        comments: &'a [crate::task::Comment],
    }

    let mut output = Output::new(
        task_header(&snapshot),
        ShowReport {
            task: &snapshot,
            comments: &comments,
        },
    )?;
    if let Some(assignee) = &snapshot.assigned_to {
        output = output.detail(format!("assigned to {assignee}"));
    }
    for rel in &snapshot.relationships_out {
        output = output.detail(format!("{} {}", rel.rel_type, rel.target_task_id));
    }
    for comment in &comments {
        let role = comment
            .role
            .as_deref()
            .map(|role| format!(" [{role}]"))
            .unwrap_or_default();
        output = output.detail(format!("{}{}: {}", comment.actor, role, comment.text));
    }
    output.emit(json, quiet)
}

pub fn list(
    ctx: &Context,
    status: Option<String>,
    assignee: Option<String>,
    tag: Option<String>,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let tasks = tasks(ctx)?;
    let snapshots = tasks.list(&ListFilter {
        status,
        assigned_to: assignee,
        tag,
    })?;

    #[derive(serde::Serialize)]
    struct ListReport<'a> {
        total: usize,
        tasks: &'a [TaskSnapshot],
    }

    let mut output = Output::new(
        format!("{} task(s)", snapshots.len()),
        ListReport {
            total: snapshots.len(),
            tasks: &snapshots,
        },
    )?;
    for snapshot in &snapshots {
        output = output.detail(task_header(snapshot));
    }
    output.emit(json, quiet)
}

pub fn log(ctx: &Context, task_ref: &str, json: bool, quiet: bool) -> Result<()> {
    let tasks = tasks(ctx)?;
    let events = tasks.events(task_ref)?;

    let mut output = Output::new(format!("{} event(s)", events.len()), &events)?;
    for event in &events {
        output = output.detail(format!(
            "{} {} {} by {}",
            event.ts, event.id, event.event_type, event.actor
        ));
    }
    output.emit(json, quiet)
}

pub fn status(
    ctx: &Context,
    task_ref: &str,
    to: &str,
    force: bool,
    reason: Option<&str>,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let actor = ctx.actor()?;
    let tasks = tasks(ctx)?;
    let snapshot = tasks.change_status(task_ref, to, &actor, force, reason)?;

    let mut output = Output::new(
        format!("Status -> {} for {}", to, task_header(&snapshot)),
        &snapshot,
    )?;
    if force {
        output = output.warning("workflow gates overridden with --force");
    }
    output.emit(json, quiet)
}

pub fn assign(
    ctx: &Context,
    task_ref: &str,
    assignee: Option<String>,
    clear: bool,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let actor = ctx.actor()?;
    let tasks = tasks(ctx)?;

    let assignee = if clear { None } else { assignee };
    let snapshot = tasks.assign(task_ref, assignee.as_deref(), &actor)?;

    let header = match &snapshot.assigned_to {
        Some(assignee) => format!("Assigned {} to {assignee}", task_header(&snapshot)),
        None => format!("Unassigned {}", task_header(&snapshot)),
    };
    Output::new(header, &snapshot)?.emit(json, quiet)
}

pub fn field(
    ctx: &Context,
    task_ref: &str,
    field: &str,
    raw_value: &str,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let actor = ctx.actor()?;
    let tasks = tasks(ctx)?;

    // JSON when it parses, bare string otherwise; "null" clears.
    let value: Value =
        serde_json::from_str(raw_value).unwrap_or_else(|_| Value::String(raw_value.to_string()));
    let snapshot = tasks.update_field(task_ref, field, value, &actor)?;

    Output::new(
        format!("Updated {} on {}", field, task_header(&snapshot)),
        &snapshot,
    )?
    .emit(json, quiet)
}

pub fn comment(
    ctx: &Context,
    task_ref: &str,
    text: &str,
    role: Option<&str>,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let actor = ctx.actor()?;
    let tasks = tasks(ctx)?;
    let snapshot = tasks.comment(task_ref, text, role, &actor)?;

    Output::new(format!("Commented on {}", task_header(&snapshot)), &snapshot)?
        .emit(json, quiet)
}

pub fn link(
    ctx: &Context,
    task_ref: &str,
    rel_type: &str,
    target_ref: &str,
    note: Option<&str>,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let actor = ctx.actor()?;
    let tasks = tasks(ctx)?;
    let snapshot = tasks.link(task_ref, rel_type, target_ref, note, &actor)?;

    Output::new(
        format!("{} {} {}", task_header(&snapshot), rel_type, target_ref),
        &snapshot,
    )?
    .emit(json, quiet)
}

pub fn unlink(
    ctx: &Context,
    task_ref: &str,
    rel_type: &str,
    target_ref: &str,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let actor = ctx.actor()?;
    let tasks = tasks(ctx)?;
    let snapshot = tasks.unlink(task_ref, rel_type, target_ref, &actor)?;

    Output::new(
        format!("Removed {} {} {}", snapshot.id, rel_type, target_ref),
        &snapshot,
    )?
    .emit(json, quiet)
}

pub fn attach(
    ctx: &Context,
    task_ref: &str,
    artifact_id: &str,
    role: Option<&str>,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let actor = ctx.actor()?;
    let tasks = tasks(ctx)?;
    let snapshot = tasks.attach_artifact(task_ref, artifact_id, role, &actor)?;

    Output::new(
        format!("Attached {} to {}", artifact_id, task_header(&snapshot)),
        &snapshot,
    )?
    .emit(json, quiet)
}

pub fn branch(ctx: &Context, command: BranchCommands, json: bool, quiet: bool) -> Result<()> {
    let actor = ctx.actor()?;
    let tasks = tasks(ctx)?;

    match command {
        BranchCommands::Link { task, branch, repo } => {
            let snapshot = tasks.link_branch(&task, &branch, repo.as_deref(), &actor)?;
            Output::new(
                format!("Linked branch {} to {}", branch, task_header(&snapshot)),
                &snapshot,
            )?
            .emit(json, quiet)
        }
        BranchCommands::Unlink { task, branch, repo } => {
            let snapshot = tasks.unlink_branch(&task, &branch, repo.as_deref(), &actor)?;
            Output::new(
                format!("Unlinked branch {} from {}", branch, task_header(&snapshot)),
                &snapshot,
            )?
            .emit(json, quiet)
        }
    }
}
