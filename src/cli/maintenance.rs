//! lattice archive/unarchive/rebuild/doctor command implementations.

use super::Context;
use crate::error::Result;
use crate::output::Output;
use crate::task::Tasks;
use crate::{archive, doctor, rebuild};

pub fn archive(ctx: &Context, task_ref: &str, json: bool, quiet: bool) -> Result<()> {
    let actor = ctx.actor()?;
    let tasks = Tasks::open(ctx.store()?)?;
    let snapshot = archive::archive(tasks.store(), tasks.config(), task_ref, &actor)?;

    Output::new(format!("Archived {}", snapshot.id), &snapshot)?.emit(json, quiet)
}

pub fn unarchive(ctx: &Context, task_ref: &str, json: bool, quiet: bool) -> Result<()> {
    let actor = ctx.actor()?;
    let tasks = Tasks::open(ctx.store()?)?;
    let snapshot = archive::unarchive(tasks.store(), tasks.config(), task_ref, &actor)?;

    Output::new(format!("Unarchived {}", snapshot.id), &snapshot)?.emit(json, quiet)
}

pub fn rebuild(ctx: &Context, task_ref: Option<&str>, json: bool, quiet: bool) -> Result<()> {
    let store = ctx.store()?;

    match task_ref {
        Some(task_ref) => {
            // Accept a bare task id even when its snapshot is missing; that
            // is precisely the damage a rebuild repairs.
            let task_id = if task_ref.starts_with("task_") {
                crate::id::validate_id(task_ref, crate::id::TASK_PREFIX)?;
                task_ref.to_string()
            } else {
                store.resolve_task(task_ref)?
            };
            let changed = rebuild::rebuild_one(&store, &task_id)?;

            #[derive(serde::Serialize)]
            struct OneReport {
                task_id: String,
                changed: bool,
            }

            let header = if changed {
                format!("Rebuilt {task_id} (snapshot updated)")
            } else {
                format!("Rebuilt {task_id} (no changes)")
            };
            Output::new(header, OneReport { task_id, changed })?.emit(json, quiet)
        }
        None => {
            let report = rebuild::rebuild_all(&store)?;
            let header = format!(
                "Rebuilt {} task(s), {} changed",
                report.tasks_rebuilt, report.tasks_changed
            );
            Output::new(header, &report)?.emit(json, quiet)
        }
    }
}

pub fn doctor(ctx: &Context, fix: bool, json: bool, quiet: bool) -> Result<()> {
    let store = ctx.store()?;
    let report = if fix {
        doctor::fix(&store)?
    } else {
        doctor::check(&store)?
    };

    let header = if report.is_clean() {
        "doctor: store is clean".to_string()
    } else {
        format!("doctor: {} finding(s)", report.findings.len())
    };

    let mut output = Output::new(header, &report)?;
    for finding in &report.findings {
        let fixable = if finding.fixable { " (fixable)" } else { "" };
        output = output.detail(format!("{}{}: {}", finding.code, fixable, finding.detail));
    }
    for repaired in &report.fixed {
        output = output.detail(format!("fixed: {repaired}"));
    }
    if !report.is_clean() && !fix {
        output = output.warning("run `lattice doctor --fix` to apply safe repairs");
    }
    output.emit(json, quiet)
}
