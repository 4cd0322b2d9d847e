//! Doctor: integrity checks and known-safe repairs.
//!
//! Each check produces findings (severity, code, detail, fixable). `fix`
//! applies only repairs that cannot lose data: dropping a truncated JSONL
//! tail, rebuilding drifted snapshots, and regenerating derived indexes.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::Serialize;
use tracing::info;

use crate::error::Result;
use crate::event::Event;
use crate::fsio;
use crate::id::{self, ShortId, EVENT_PREFIX, TASK_PREFIX};
use crate::lock;
use crate::rebuild;
use crate::snapshot::TaskSnapshot;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

/// One diagnostic finding.
#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    pub severity: Severity,
    pub code: &'static str,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub fixable: bool,
}

impl Finding {
    fn new(severity: Severity, code: &'static str, detail: String) -> Self {
        Self {
            severity,
            code,
            detail,
            task_id: None,
            fixable: false,
        }
    }

    fn task(mut self, task_id: &str) -> Self {
        self.task_id = Some(task_id.to_string());
        self
    }

    fn fixable(mut self) -> Self {
        self.fixable = true;
        self
    }
}

/// Outcome of a doctor run.
#[derive(Debug, Default, Serialize)]
pub struct DoctorReport {
    pub findings: Vec<Finding>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fixed: Vec<String>,
}

impl DoctorReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

/// Run every check without touching anything.
pub fn check(store: &Store) -> Result<DoctorReport> {
    let mut report = DoctorReport::default();

    check_config(store, &mut report);
    let task_ids = check_logs_and_snapshots(store, &mut report)?;
    check_relationships(store, &task_ids, &mut report)?;
    check_lifecycle(store, &mut report)?;
    check_short_index(store, &mut report)?;
    check_artifacts(store, &mut report)?;
    check_archive_overlap(store, &mut report)?;

    Ok(report)
}

/// Run the checks, then apply known-safe repairs and re-check.
pub fn fix(store: &Store) -> Result<DoctorReport> {
    let initial = check(store)?;
    let mut fixed = Vec::new();

    for finding in &initial.findings {
        if !finding.fixable {
            continue;
        }
        match finding.code {
            "TRUNCATED" => {
                if let Some(task_id) = &finding.task_id {
                    drop_truncated_tail(store, task_id)?;
                    fixed.push(format!("dropped truncated tail of {task_id} log"));
                }
            }
            "DRIFT" => {
                if let Some(task_id) = &finding.task_id {
                    rebuild::rebuild_one(store, task_id)?;
                    fixed.push(format!("rebuilt snapshot for {task_id}"));
                }
            }
            _ => {}
        }
    }

    let needs_lifecycle = initial
        .findings
        .iter()
        .any(|f| matches!(f.code, "LIFECYCLE_MISSING" | "LIFECYCLE_ORPHAN"));
    if needs_lifecycle {
        rebuild::rebuild_lifecycle(store)?;
        fixed.push("regenerated events/_lifecycle.jsonl".to_string());
    }

    let needs_ids = initial
        .findings
        .iter()
        .any(|f| matches!(f.code, "SHORT_ID_UNBACKED" | "SHORT_ID_SEQ"));
    if needs_ids {
        rebuild::rebuild_short_index(store)?;
        fixed.push("regenerated ids.json".to_string());
    }

    if !fixed.is_empty() {
        info!(repairs = fixed.len(), "doctor applied repairs");
    }

    let mut report = check(store)?;
    report.fixed = fixed;
    Ok(report)
}

// =============================================================================
// Checks
// =============================================================================

fn check_config(store: &Store, report: &mut DoctorReport) {
    if let Err(err) = store.config() {
        report.findings.push(Finding::new(
            Severity::Error,
            "CORRUPT",
            format!("config.json unreadable: {err}"),
        ));
    }
}

/// Parse every log and snapshot; returns ids of every known task
/// (active + archived) for the reference checks.
fn check_logs_and_snapshots(store: &Store, report: &mut DoctorReport) -> Result<Vec<String>> {
    let mut task_ids = Vec::new();

    for (archived, dir) in [(false, store.events_dir()), (true, store.archive_events_dir())] {
        if !dir.exists() {
            continue;
        }
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()).map(String::from) else {
                continue;
            };
            if stem.starts_with('_') || !stem.starts_with(&format!("{TASK_PREFIX}_")) {
                continue;
            }

            if id::validate_id(&stem, TASK_PREFIX).is_err() {
                report.findings.push(Finding::new(
                    Severity::Error,
                    "MALFORMED_ID",
                    format!("log file name is not a task id: {}", path.display()),
                ));
                continue;
            }

            task_ids.push(stem.clone());
            check_one_task(store, &stem, &path, archived, report)?;
        }
    }

    task_ids.sort();
    Ok(task_ids)
}

fn check_one_task(
    store: &Store,
    task_id: &str,
    log_path: &Path,
    archived: bool,
    report: &mut DoctorReport,
) -> Result<()> {
    let scan = scan_log(log_path)?;

    for detail in scan.corrupt_lines {
        report.findings.push(
            Finding::new(Severity::Error, "CORRUPT", detail).task(task_id),
        );
    }
    if scan.truncated_tail {
        report.findings.push(
            Finding::new(
                Severity::Warning,
                "TRUNCATED",
                format!("{} ends in a torn line", log_path.display()),
            )
            .task(task_id)
            .fixable(),
        );
    }

    for event in &scan.events {
        if id::validate_id(&event.id, EVENT_PREFIX).is_err() {
            report.findings.push(
                Finding::new(
                    Severity::Error,
                    "MALFORMED_ID",
                    format!("event id '{}' fails the ev_ prefix rule", event.id),
                )
                .task(task_id),
            );
        }
        if event.task_id.as_deref() != Some(task_id) {
            report.findings.push(
                Finding::new(
                    Severity::Error,
                    "CORRUPT",
                    format!("event '{}' targets {:?}", event.id, event.task_id),
                )
                .task(task_id),
            );
        }
    }

    let snapshot_path = if archived {
        store.archived_snapshot_path(task_id)
    } else {
        store.task_snapshot_path(task_id)
    };

    if !snapshot_path.exists() {
        report.findings.push(
            Finding::new(
                Severity::Warning,
                "DRIFT",
                format!("no snapshot for {} log", task_id),
            )
            .task(task_id)
            .fixable(),
        );
        return Ok(());
    }

    let content = fs::read_to_string(&snapshot_path)?;
    let snapshot: TaskSnapshot = match serde_json::from_str(&content) {
        Ok(snapshot) => snapshot,
        Err(err) => {
            report.findings.push(
                Finding::new(
                    Severity::Error,
                    "CORRUPT",
                    format!("{} unparseable: {err}", snapshot_path.display()),
                )
                .task(task_id),
            );
            return Ok(());
        }
    };

    if let Some(last) = scan.events.last() {
        if snapshot.last_event_id != last.id {
            report.findings.push(
                Finding::new(
                    Severity::Warning,
                    "DRIFT",
                    format!(
                        "snapshot at event '{}' but log ends at '{}'",
                        snapshot.last_event_id, last.id
                    ),
                )
                .task(task_id)
                .fixable(),
            );
        }
    }

    Ok(())
}

fn check_relationships(
    store: &Store,
    task_ids: &[String],
    report: &mut DoctorReport,
) -> Result<()> {
    let known: HashSet<&str> = task_ids.iter().map(String::as_str).collect();

    for task_id in task_ids {
        let Ok(snapshot) = store.read_snapshot(task_id) else {
            continue;
        };

        let mut seen_edges = HashSet::new();
        for rel in &snapshot.relationships_out {
            if rel.target_task_id == *task_id {
                report.findings.push(
                    Finding::new(
                        Severity::Error,
                        "SELF_LINK",
                        format!("{} {} itself", task_id, rel.rel_type),
                    )
                    .task(task_id),
                );
            }
            if !seen_edges.insert((rel.rel_type.clone(), rel.target_task_id.clone())) {
                report.findings.push(
                    Finding::new(
                        Severity::Error,
                        "DUPLICATE_EDGE",
                        format!("{} {} {} appears twice", task_id, rel.rel_type, rel.target_task_id),
                    )
                    .task(task_id),
                );
            }
            if !known.contains(rel.target_task_id.as_str()) {
                report.findings.push(
                    Finding::new(
                        Severity::Error,
                        "DANGLING_RELATIONSHIP",
                        format!(
                            "{} {} {} which does not exist",
                            task_id, rel.rel_type, rel.target_task_id
                        ),
                    )
                    .task(task_id),
                );
            }
        }
    }

    Ok(())
}

fn check_lifecycle(store: &Store, report: &mut DoctorReport) -> Result<()> {
    let lifecycle_path = store.lifecycle_path();
    let index_events: Vec<Event> = if lifecycle_path.exists() {
        fsio::read_jsonl(&lifecycle_path)?
    } else {
        Vec::new()
    };
    let indexed: HashSet<&str> = index_events.iter().map(|e| e.id.as_str()).collect();

    let mut expected: HashSet<String> = HashSet::new();
    for (dir_exists, dir) in [
        (store.events_dir().exists(), store.events_dir()),
        (
            store.archive_events_dir().exists(),
            store.archive_events_dir(),
        ),
    ] {
        if !dir_exists {
            continue;
        }
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !stem.starts_with(&format!("{TASK_PREFIX}_"))
                || path.extension().and_then(|e| e.to_str()) != Some("jsonl")
            {
                continue;
            }
            let scan = scan_log(&path)?;
            for event in scan.events {
                if event.event_type.is_lifecycle() {
                    if !indexed.contains(event.id.as_str()) {
                        report.findings.push(
                            Finding::new(
                                Severity::Warning,
                                "LIFECYCLE_MISSING",
                                format!("lifecycle event '{}' not in _lifecycle.jsonl", event.id),
                            )
                            .fixable(),
                        );
                    }
                    expected.insert(event.id);
                }
            }
        }
    }

    for event in &index_events {
        if !expected.contains(&event.id) {
            report.findings.push(
                Finding::new(
                    Severity::Warning,
                    "LIFECYCLE_ORPHAN",
                    format!(
                        "_lifecycle.jsonl entry '{}' has no per-task counterpart",
                        event.id
                    ),
                )
                .fixable(),
            );
        }
    }

    Ok(())
}

fn check_short_index(store: &Store, report: &mut DoctorReport) -> Result<()> {
    let index = match store.short_index() {
        Ok(index) => index,
        Err(err) => {
            report.findings.push(Finding::new(
                Severity::Error,
                "CORRUPT",
                format!("ids.json unreadable: {err}"),
            ));
            return Ok(());
        }
    };

    let mut max_seq = 0u64;
    for (short_id, task_id) in &index.short_ids {
        if let Some(short) = ShortId::parse(short_id) {
            max_seq = max_seq.max(short.seq);
        }

        let backed = store
            .read_events(task_id)
            .map(|events| {
                events.iter().any(|event| {
                    event.data.get("short_id").and_then(|v| v.as_str()) == Some(short_id)
                })
            })
            .unwrap_or(false);
        if !backed {
            report.findings.push(
                Finding::new(
                    Severity::Warning,
                    "SHORT_ID_UNBACKED",
                    format!("ids.json maps {short_id} -> {task_id} without an assignment event"),
                )
                .fixable(),
            );
        }
    }

    if index.next_seq <= max_seq {
        report.findings.push(
            Finding::new(
                Severity::Error,
                "SHORT_ID_SEQ",
                format!(
                    "next_seq {} does not exceed max assigned sequence {}",
                    index.next_seq, max_seq
                ),
            )
            .fixable(),
        );
    }

    Ok(())
}

fn check_artifacts(store: &Store, report: &mut DoctorReport) -> Result<()> {
    let dir = store.artifacts_meta_dir();
    if !dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(&dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let content = fs::read_to_string(&path)?;
        if serde_json::from_str::<serde_json::Value>(&content).is_err() {
            report.findings.push(Finding::new(
                Severity::Error,
                "CORRUPT",
                format!("artifact metadata unparseable: {}", path.display()),
            ));
        }
    }
    Ok(())
}

fn check_archive_overlap(store: &Store, report: &mut DoctorReport) -> Result<()> {
    let active: HashSet<String> = store.list_task_ids()?.into_iter().collect();
    for task_id in store.list_archived_task_ids()? {
        if active.contains(&task_id) {
            report.findings.push(
                Finding::new(
                    Severity::Error,
                    "ARCHIVE_OVERLAP",
                    format!("{task_id} exists in both active and archive trees"),
                )
                .task(&task_id),
            );
        }
    }
    Ok(())
}

// =============================================================================
// Repairs and raw log scanning
// =============================================================================

struct LogScan {
    events: Vec<Event>,
    corrupt_lines: Vec<String>,
    truncated_tail: bool,
}

/// Line-by-line scan that separates parseable events, corrupt interior
/// lines, and a torn tail.
fn scan_log(path: &Path) -> Result<LogScan> {
    let content = fs::read_to_string(path)?;
    let mut scan = LogScan {
        events: Vec::new(),
        corrupt_lines: Vec::new(),
        truncated_tail: false,
    };

    let mut rest = content.as_str();
    let mut line_no = 0usize;
    while !rest.is_empty() {
        line_no += 1;
        let (line, terminated, remainder) = match rest.find('\n') {
            Some(pos) => (&rest[..pos], true, &rest[pos + 1..]),
            None => (rest, false, ""),
        };
        rest = remainder;

        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<Event>(line) {
            Ok(event) => scan.events.push(event),
            Err(_) if !terminated => scan.truncated_tail = true,
            Err(err) => scan
                .corrupt_lines
                .push(format!("{}:{line_no}: {err}", path.display())),
        }
    }

    Ok(scan)
}

/// Remove a torn final line from a task's log, under its events lock.
fn drop_truncated_tail(store: &Store, task_id: &str) -> Result<()> {
    let _lock = store.lock(&lock::events_key(task_id))?;

    let active = store.task_events_path(task_id);
    let path = if active.exists() {
        active
    } else {
        store.archived_events_path(task_id)
    };

    fsio::drop_torn_tail(&path)?;
    Ok(())
}
