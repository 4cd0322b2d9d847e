//! Post-write shell hooks.
//!
//! Hooks fire after the locks are released: the mutation is already durable
//! and nothing a hook does can roll it back. Failures are logged and
//! swallowed.

use std::io::Write;
use std::process::{Command, Stdio};

use serde_json::Value;
use tracing::{debug, warn};

use crate::config::Config;
use crate::event::{Event, EventType};
use crate::store::Store;

/// Run every configured hook that matches `events`, in order: the catch-all,
/// then per-type, then per-transition (`from->to`).
pub fn run_post_write(store: &Store, config: &Config, events: &[Event]) {
    if config.hooks.is_empty() {
        return;
    }

    for event in events {
        if let Some(cmd) = &config.hooks.post_event {
            run_hook(store, cmd, event);
        }

        if let Some(cmd) = config.hooks.on.get(event.event_type.as_str()) {
            run_hook(store, cmd, event);
        }

        if event.event_type == EventType::StatusChanged {
            let from = event.data.get("from").and_then(Value::as_str).unwrap_or("");
            let to = event.data.get("status").and_then(Value::as_str).unwrap_or("");
            let key = format!("{from}->{to}");
            if let Some(cmd) = config.hooks.transitions.get(&key) {
                run_hook(store, cmd, event);
            }
        }
    }
}

fn run_hook(store: &Store, cmd: &str, event: &Event) {
    let payload = match event.to_canonical_line() {
        Ok(line) => line,
        Err(err) => {
            warn!(%err, "hook payload serialization failed");
            return;
        }
    };

    let spawned = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .current_dir(store.root())
        .env("LATTICE_ROOT", store.root())
        .env("LATTICE_EVENT_TYPE", event.event_type.as_str())
        .env("LATTICE_TASK_ID", event.task_id.as_deref().unwrap_or(""))
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(err) => {
            warn!(cmd, %err, "hook spawn failed");
            return;
        }
    };

    if let Some(stdin) = child.stdin.take() {
        let mut stdin = stdin;
        if let Err(err) = stdin.write_all(payload.as_bytes()) {
            warn!(cmd, %err, "hook stdin write failed");
        }
    }

    match child.wait() {
        Ok(status) if status.success() => {
            debug!(cmd, event_type = event.event_type.as_str(), "hook ok");
        }
        Ok(status) => {
            warn!(cmd, %status, "hook exited non-zero");
        }
        Err(err) => {
            warn!(cmd, %err, "hook wait failed");
        }
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use crate::config::Config;
    use serde_json::{json, Map};
    use tempfile::TempDir;

    fn event(task_id: &str, event_type: EventType, data: Map<String, Value>) -> Event {
        Event::new_task(event_type, task_id, "agent:claude", data)
    }

    #[test]
    fn hooks_receive_env_and_stdin() {
        let temp = TempDir::new().unwrap();
        let store = Store::init(temp.path(), None, None).unwrap();
        let marker = temp.path().join("hook-out");

        let mut config = Config::default();
        config.hooks.post_event = Some(format!(
            "cat > {} && printf %s \"$LATTICE_EVENT_TYPE\" >> {}",
            marker.display(),
            marker.display()
        ));

        let mut data = Map::new();
        data.insert("text".to_string(), json!("hello"));
        let events = vec![event(
            "task_01J8ZC4D2N3F4G5H6J7K8M9N0P",
            EventType::CommentAdded,
            data,
        )];
        run_post_write(&store, &config, &events);

        let written = std::fs::read_to_string(&marker).unwrap();
        assert!(written.contains("\"comment_added\""));
        assert!(written.ends_with("comment_added"));
    }

    #[test]
    fn transition_hooks_match_from_to() {
        let temp = TempDir::new().unwrap();
        let store = Store::init(temp.path(), None, None).unwrap();
        let marker = temp.path().join("transitioned");

        let mut config = Config::default();
        config.hooks.transitions.insert(
            "review->done".to_string(),
            format!("touch {}", marker.display()),
        );

        let mut data = Map::new();
        data.insert("from".to_string(), json!("review"));
        data.insert("status".to_string(), json!("done"));
        let events = vec![event(
            "task_01J8ZC4D2N3F4G5H6J7K8M9N0P",
            EventType::StatusChanged,
            data,
        )];
        run_post_write(&store, &config, &events);
        assert!(marker.exists());

        // A different transition does not fire it.
        std::fs::remove_file(&marker).unwrap();
        let mut data = Map::new();
        data.insert("from".to_string(), json!("backlog"));
        data.insert("status".to_string(), json!("in_planning"));
        let events = vec![event(
            "task_01J8ZC4D2N3F4G5H6J7K8M9N0P",
            EventType::StatusChanged,
            data,
        )];
        run_post_write(&store, &config, &events);
        assert!(!marker.exists());
    }

    #[test]
    fn failing_hook_is_swallowed() {
        let temp = TempDir::new().unwrap();
        let store = Store::init(temp.path(), None, None).unwrap();

        let mut config = Config::default();
        config.hooks.post_event = Some("exit 7".to_string());

        let events = vec![event(
            "task_01J8ZC4D2N3F4G5H6J7K8M9N0P",
            EventType::CommentAdded,
            Map::new(),
        )];
        // Must not panic or error.
        run_post_write(&store, &config, &events);
    }
}
