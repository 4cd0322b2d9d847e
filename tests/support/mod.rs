use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use lattice::config::Config;
use lattice::event::Event;
use lattice::store::Store;
use lattice::task::Tasks;
use tempfile::TempDir;

/// A temp directory with an initialized `.lattice/` store.
pub struct TestTracker {
    dir: TempDir,
    store: Store,
}

#[allow(dead_code)]
impl TestTracker {
    pub fn init(project_code: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let store = Store::init(dir.path(), project_code, None)?;
        Ok(Self { dir, store })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn tasks(&self) -> Result<Tasks, Box<dyn std::error::Error>> {
        Ok(Tasks::open(self.store.clone())?)
    }

    /// Rewrite config.json through the validated save path.
    pub fn update_config<F>(&self, mutate: F) -> Result<(), Box<dyn std::error::Error>>
    where
        F: FnOnce(&mut Config),
    {
        let mut config = self.store.config()?;
        mutate(&mut config);
        config.validate()?;
        config.save(&self.store.config_path())?;
        Ok(())
    }

    pub fn read_events(&self, task_id: &str) -> Result<Vec<Event>, Box<dyn std::error::Error>> {
        Ok(self.store.read_events(task_id)?)
    }

    pub fn read_lifecycle(&self) -> Result<Vec<Event>, Box<dyn std::error::Error>> {
        let path = self.store.lifecycle_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut events = Vec::new();
        for line in fs::read_to_string(&path)?.lines() {
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str(line)?);
        }
        Ok(events)
    }

    pub fn snapshot_bytes(&self, task_id: &str) -> Result<String, Box<dyn std::error::Error>> {
        let path = self.store.task_snapshot_path(task_id);
        let path = if path.exists() {
            path
        } else {
            self.store.archived_snapshot_path(task_id)
        };
        Ok(fs::read_to_string(path)?)
    }

    pub fn write_file(&self, rel_path: &str, contents: &str) -> std::io::Result<PathBuf> {
        let path = self.dir.path().join(rel_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, contents)?;
        Ok(path)
    }
}

/// The lattice binary, rooted at the tracker's directory.
#[allow(dead_code)]
pub fn lattice_cmd(tracker: &TestTracker) -> Command {
    let mut cmd = Command::cargo_bin("lattice").expect("binary");
    cmd.current_dir(tracker.path());
    cmd.env_remove("LATTICE_ROOT");
    cmd.env_remove("LATTICE_ACTOR");
    cmd
}

/// The lattice binary in a bare directory (no store).
#[allow(dead_code)]
pub fn lattice_cmd_in(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("lattice").expect("binary");
    cmd.current_dir(dir);
    cmd.env_remove("LATTICE_ROOT");
    cmd.env_remove("LATTICE_ACTOR");
    cmd
}
