//! Storage layer for lattice
//!
//! Manages the project-local `.lattice/` directory.
//!
//! # Directory Structure
//!
//! ```text
//! .lattice/
//!   config.json                  # workflow, policies, hooks
//!   ids.json                     # derived short-id index
//!   tasks/<task_id>.json         # snapshots (derived)
//!   events/<task_id>.jsonl       # per-task authoritative logs
//!   events/_lifecycle.jsonl      # derived lifecycle index
//!   artifacts/meta/<art_id>.json
//!   artifacts/payload/<art_id>.<ext>
//!   plans/<task_id>.md           # non-authoritative
//!   notes/<task_id>.md           # non-authoritative
//!   archive/tasks|events|plans|notes/
//!   resources/<name>/resource.json
//!   locks/<key>.lock
//! ```
//!
//! Readers take no locks; they observe the last atomically-renamed snapshot.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::canon;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::fsio::{self, LATTICE_DIR};
use crate::id::{self, ShortId, TASK_PREFIX};
use crate::lock::{LatticeLock, MultiLock, DEFAULT_LOCK_TIMEOUT_SECS};
use crate::snapshot::TaskSnapshot;

/// Name of the aggregate lifecycle log under `events/`.
pub const LIFECYCLE_FILE: &str = "_lifecycle.jsonl";

/// Where a task currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskLocation {
    Active,
    Archived,
}

/// Handle to one `.lattice/` store.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
    timeout: Duration,
}

impl Store {
    /// Open the store governing `start_dir` (honors `LATTICE_ROOT`).
    pub fn open(start_dir: &Path) -> Result<Self> {
        let root = fsio::find_root(start_dir)?;
        Ok(Self::at_root(root))
    }

    /// Open a store at a known project root without discovery.
    pub fn at_root(root: PathBuf) -> Self {
        Self {
            root,
            timeout: Duration::from_secs(DEFAULT_LOCK_TIMEOUT_SECS),
        }
    }

    /// Initialize `.lattice/` at `root` and return a handle.
    pub fn init(
        root: &Path,
        project_code: Option<&str>,
        subproject_code: Option<&str>,
    ) -> Result<Self> {
        let store = Self::at_root(root.to_path_buf());
        if store.config_path().exists() {
            return Err(Error::Validation(format!(
                "already initialized: {}",
                store.lattice_dir().display()
            )));
        }

        for dir in [
            store.lattice_dir(),
            store.tasks_dir(),
            store.events_dir(),
            store.artifacts_meta_dir(),
            store.artifacts_payload_dir(),
            store.plans_dir(),
            store.notes_dir(),
            store.archive_tasks_dir(),
            store.archive_events_dir(),
            store.archive_plans_dir(),
            store.archive_notes_dir(),
            store.resources_dir(),
            store.locks_dir(),
        ] {
            fs::create_dir_all(dir)?;
        }

        let mut config = Config::default();
        config.project_code = project_code.map(|code| code.to_ascii_uppercase());
        config.subproject_code = subproject_code.map(|code| code.to_ascii_uppercase());
        config.validate()?;
        config.save(&store.config_path())?;

        ShortIdIndex::default().save(&store.ids_path())?;

        Ok(store)
    }

    /// Override the lock timeout (seconds) for every operation on this handle.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // =========================================================================
    // Path accessors
    // =========================================================================

    pub fn lattice_dir(&self) -> PathBuf {
        self.root.join(LATTICE_DIR)
    }

    pub fn config_path(&self) -> PathBuf {
        self.lattice_dir().join("config.json")
    }

    pub fn ids_path(&self) -> PathBuf {
        self.lattice_dir().join("ids.json")
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.lattice_dir().join("tasks")
    }

    pub fn events_dir(&self) -> PathBuf {
        self.lattice_dir().join("events")
    }

    pub fn lifecycle_path(&self) -> PathBuf {
        self.events_dir().join(LIFECYCLE_FILE)
    }

    pub fn artifacts_meta_dir(&self) -> PathBuf {
        self.lattice_dir().join("artifacts").join("meta")
    }

    pub fn artifacts_payload_dir(&self) -> PathBuf {
        self.lattice_dir().join("artifacts").join("payload")
    }

    pub fn plans_dir(&self) -> PathBuf {
        self.lattice_dir().join("plans")
    }

    pub fn notes_dir(&self) -> PathBuf {
        self.lattice_dir().join("notes")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.lattice_dir().join("archive")
    }

    pub fn archive_tasks_dir(&self) -> PathBuf {
        self.archive_dir().join("tasks")
    }

    pub fn archive_events_dir(&self) -> PathBuf {
        self.archive_dir().join("events")
    }

    pub fn archive_plans_dir(&self) -> PathBuf {
        self.archive_dir().join("plans")
    }

    pub fn archive_notes_dir(&self) -> PathBuf {
        self.archive_dir().join("notes")
    }

    pub fn resources_dir(&self) -> PathBuf {
        self.lattice_dir().join("resources")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.lattice_dir().join("locks")
    }

    pub fn task_snapshot_path(&self, task_id: &str) -> PathBuf {
        self.tasks_dir().join(format!("{task_id}.json"))
    }

    pub fn task_events_path(&self, task_id: &str) -> PathBuf {
        self.events_dir().join(format!("{task_id}.jsonl"))
    }

    pub fn archived_snapshot_path(&self, task_id: &str) -> PathBuf {
        self.archive_tasks_dir().join(format!("{task_id}.json"))
    }

    pub fn archived_events_path(&self, task_id: &str) -> PathBuf {
        self.archive_events_dir().join(format!("{task_id}.jsonl"))
    }

    pub fn plan_path(&self, task_id: &str) -> PathBuf {
        self.plans_dir().join(format!("{task_id}.md"))
    }

    pub fn note_path(&self, task_id: &str) -> PathBuf {
        self.notes_dir().join(format!("{task_id}.md"))
    }

    pub fn artifact_meta_path(&self, artifact_id: &str) -> PathBuf {
        self.artifacts_meta_dir().join(format!("{artifact_id}.json"))
    }

    pub fn resource_dir(&self, name: &str) -> PathBuf {
        self.resources_dir().join(name)
    }

    pub fn resource_snapshot_path(&self, name: &str) -> PathBuf {
        self.resource_dir(name).join("resource.json")
    }

    pub fn resource_events_path(&self, resource_id: &str) -> PathBuf {
        self.events_dir().join(format!("{resource_id}.jsonl"))
    }

    // =========================================================================
    // Locks
    // =========================================================================

    pub fn lock(&self, key: &str) -> Result<LatticeLock> {
        LatticeLock::acquire(&self.locks_dir(), key, self.timeout)
    }

    pub fn multi_lock(&self, keys: &[String]) -> Result<MultiLock> {
        MultiLock::acquire(&self.locks_dir(), keys, self.timeout)
    }

    // =========================================================================
    // Config and short-id index
    // =========================================================================

    pub fn config(&self) -> Result<Config> {
        if !self.config_path().exists() {
            return Err(Error::NotInitialized(self.root.clone()));
        }
        Config::load(&self.config_path())
    }

    /// Read the short-id index. Callers mutating it must hold the `ids` lock.
    pub fn short_index(&self) -> Result<ShortIdIndex> {
        ShortIdIndex::load(&self.ids_path())
    }

    // =========================================================================
    // Read side (lock-free)
    // =========================================================================

    /// Where does `task_id` live, if anywhere?
    pub fn task_location(&self, task_id: &str) -> Option<TaskLocation> {
        if self.task_snapshot_path(task_id).exists() {
            Some(TaskLocation::Active)
        } else if self.archived_snapshot_path(task_id).exists() {
            Some(TaskLocation::Archived)
        } else {
            None
        }
    }

    /// Read a task snapshot from the active or archived tree.
    pub fn read_snapshot(&self, task_id: &str) -> Result<TaskSnapshot> {
        let path = match self.task_location(task_id) {
            Some(TaskLocation::Active) => self.task_snapshot_path(task_id),
            Some(TaskLocation::Archived) => self.archived_snapshot_path(task_id),
            None => return Err(Error::NotFound(format!("task {task_id}"))),
        };
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Read a task's full event history from the active or archived log.
    pub fn read_events(&self, task_id: &str) -> Result<Vec<Event>> {
        let active = self.task_events_path(task_id);
        if active.exists() {
            return fsio::read_jsonl(&active);
        }
        let archived = self.archived_events_path(task_id);
        if archived.exists() {
            return fsio::read_jsonl(&archived);
        }
        Err(Error::NotFound(format!("event log for task {task_id}")))
    }

    /// Task ids with an active snapshot, sorted (= creation order for ULIDs).
    pub fn list_task_ids(&self) -> Result<Vec<String>> {
        list_ids_in(&self.tasks_dir(), "json")
    }

    /// Task ids with an archived snapshot, sorted.
    pub fn list_archived_task_ids(&self) -> Result<Vec<String>> {
        list_ids_in(&self.archive_tasks_dir(), "json")
    }

    /// Every active snapshot, in id order. Unreadable files are errors;
    /// doctor is the tool for damaged stores.
    pub fn list_snapshots(&self) -> Result<Vec<TaskSnapshot>> {
        let mut snapshots = Vec::new();
        for task_id in self.list_task_ids()? {
            snapshots.push(self.read_snapshot(&task_id)?);
        }
        Ok(snapshots)
    }

    /// Resolve user input to a task id: a full `task_` id or a short-id
    /// (case-insensitive).
    pub fn resolve_task(&self, input: &str) -> Result<String> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(Error::Validation("task reference cannot be empty".to_string()));
        }

        if trimmed.starts_with(TASK_PREFIX) {
            id::validate_id(trimmed, TASK_PREFIX)?;
            if self.task_location(trimmed).is_none() {
                return Err(Error::NotFound(format!("task {trimmed}")));
            }
            return Ok(trimmed.to_string());
        }

        if let Some(short) = ShortId::parse(trimmed) {
            let index = self.short_index()?;
            if let Some(task_id) = index.lookup(&short.to_string()) {
                return Ok(task_id.to_string());
            }
            return Err(Error::NotFound(format!("short id {short}")));
        }

        Err(Error::InvalidId {
            id: trimmed.to_string(),
            expected: "task_<ULID> or PROJ[-SUB]-N".to_string(),
        })
    }
}

fn list_ids_in(dir: &Path, extension: &str) -> Result<Vec<String>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(extension) {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
            ids.push(stem.to_string());
        }
    }
    ids.sort();
    Ok(ids)
}

/// The derived short-id index (`ids.json`): alias map plus the next sequence
/// number. The only shared monotone counter in the store; always re-read
/// under the `ids` lock, never cached across lock boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShortIdIndex {
    pub schema_version: u32,
    pub next_seq: u64,
    #[serde(default)]
    pub short_ids: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for ShortIdIndex {
    fn default() -> Self {
        Self {
            schema_version: 1,
            next_seq: 1,
            short_ids: BTreeMap::new(),
            extra: Map::new(),
        }
    }
}

impl ShortIdIndex {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let doc = canon::to_pretty_document(self)?;
        fsio::atomic_write(path, doc.as_bytes())
    }

    pub fn lookup(&self, short_id: &str) -> Option<&str> {
        self.short_ids
            .get(&short_id.to_ascii_uppercase())
            .map(String::as_str)
    }

    /// Allocate the next short-id for `task_id` and advance the counter.
    pub fn assign(&mut self, project: &str, subproject: Option<&str>, task_id: &str) -> ShortId {
        let short = ShortId::new(project, subproject, self.next_seq);
        self.short_ids
            .insert(short.to_string(), task_id.to_string());
        self.next_seq += 1;
        short
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn init_creates_layout() {
        let temp = TempDir::new().unwrap();
        let store = Store::init(temp.path(), Some("LAT"), None).unwrap();

        assert!(store.config_path().exists());
        assert!(store.ids_path().exists());
        assert!(store.tasks_dir().exists());
        assert!(store.events_dir().exists());
        assert!(store.archive_tasks_dir().exists());
        assert!(store.locks_dir().exists());

        let config = store.config().unwrap();
        assert_eq!(config.project_code.as_deref(), Some("LAT"));

        // Second init fails loudly.
        assert!(Store::init(temp.path(), None, None).is_err());
    }

    #[test]
    fn short_index_assignment_advances_counter() {
        let mut index = ShortIdIndex::default();
        let first = index.assign("LAT", None, "task_a");
        let second = index.assign("LAT", None, "task_b");
        assert_eq!(first.to_string(), "LAT-1");
        assert_eq!(second.to_string(), "LAT-2");
        assert_eq!(index.next_seq, 3);
        assert_eq!(index.lookup("lat-2"), Some("task_b"));
    }

    #[test]
    fn short_index_save_load_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("ids.json");

        let mut index = ShortIdIndex::default();
        index.assign("LAT", Some("CORE"), "task_x");
        index.save(&path).unwrap();

        let loaded = ShortIdIndex::load(&path).unwrap();
        assert_eq!(loaded.next_seq, 2);
        assert_eq!(loaded.lookup("LAT-CORE-1"), Some("task_x"));
    }

    #[test]
    fn resolve_rejects_garbage() {
        let temp = TempDir::new().unwrap();
        let store = Store::init(temp.path(), Some("LAT"), None).unwrap();

        let err = store.resolve_task("not-an-id!").unwrap_err();
        assert_eq!(err.code(), "INVALID_ID");

        let err = store.resolve_task("LAT-99").unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");

        let err = store
            .resolve_task("task_01J8ZC4D2N3F4G5H6J7K8M9N0P")
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }
}
