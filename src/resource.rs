//! Resources: event-sourced exclusive-access coordination with TTL.
//!
//! A resource follows the same contract as a task: an append-only event log
//! at `events/<res_id>.jsonl` and a derived snapshot at
//! `resources/<name>/resource.json`. Expiry is evaluated at read time: a
//! holder past its `expires_at` is expired with a synthesized
//! `resource_expired` event, under the resource lock, before the requested
//! operation proceeds.

use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::canon;
use crate::error::{Error, Result};
use crate::event::{self, Event, EventType};
use crate::fsio;
use crate::id::{self, RESOURCE_PREFIX};
use crate::lock;
use crate::store::Store;

/// Schema version stamped on resource snapshots.
pub const RESOURCE_SCHEMA_VERSION: u32 = 1;

/// Poll backoff bounds for `acquire --wait`.
const WAIT_BACKOFF_START_MS: u64 = 200;
const WAIT_BACKOFF_CAP_MS: u64 = 2_000;

/// The current holder of a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holder {
    pub actor: String,
    pub acquired_at: String,
    pub expires_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
}

/// Materialized resource state, derived from the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub schema_version: u32,
    pub id: String,
    pub name: String,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
    pub last_event_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder: Option<Holder>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ResourceSnapshot {
    pub fn is_held(&self) -> bool {
        self.holder.is_some()
    }
}

/// Apply one resource event to an optional prior snapshot. Pure.
pub fn apply_resource_event(
    prior: Option<ResourceSnapshot>,
    event: &Event,
) -> Result<ResourceSnapshot> {
    let mut snapshot = match (prior, &event.event_type) {
        (_, EventType::ResourceCreated) => ResourceSnapshot {
            schema_version: RESOURCE_SCHEMA_VERSION,
            id: event.resource_id.clone().unwrap_or_default(),
            name: event
                .data
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            status: "free".to_string(),
            created_at: event.ts.clone(),
            updated_at: event.ts.clone(),
            last_event_id: event.id.clone(),
            holder: None,
            metadata: Map::new(),
            extra: Map::new(),
        },
        (Some(snapshot), _) => snapshot,
        (None, other) => {
            return Err(Error::Validation(format!(
                "event '{}' ({}) has no preceding resource_created",
                event.id, other
            )))
        }
    };

    match &event.event_type {
        EventType::ResourceCreated => {}
        EventType::ResourceAcquired => {
            snapshot.holder = Some(Holder {
                actor: event.actor.clone(),
                acquired_at: event.ts.clone(),
                expires_at: event
                    .data
                    .get("expires_at")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                ttl_seconds: event.data.get("ttl_seconds").and_then(Value::as_u64),
            });
            snapshot.status = "held".to_string();
        }
        EventType::ResourceReleased | EventType::ResourceExpired => {
            snapshot.holder = None;
            snapshot.status = "free".to_string();
        }
        EventType::ResourceHeartbeat => {
            if let Some(holder) = snapshot.holder.as_mut() {
                if let Some(expires_at) = event.data.get("expires_at").and_then(Value::as_str) {
                    holder.expires_at = expires_at.to_string();
                }
            }
        }
        EventType::ResourceUpdated => {
            for (key, value) in &event.data {
                if value.is_null() {
                    snapshot.metadata.remove(key);
                } else {
                    snapshot.metadata.insert(key.clone(), value.clone());
                }
            }
        }
        other => {
            return Err(Error::Validation(format!(
                "task event '{}' in a resource log",
                other
            )))
        }
    }

    snapshot.updated_at = event.ts.clone();
    snapshot.last_event_id = event.id.clone();
    Ok(snapshot)
}

/// Fold a full resource event sequence into a snapshot.
pub fn replay_resource<'a>(
    events: impl IntoIterator<Item = &'a Event>,
) -> Result<ResourceSnapshot> {
    let mut snapshot = None;
    for event in events {
        snapshot = Some(apply_resource_event(snapshot, event)?);
    }
    snapshot.ok_or_else(|| Error::Validation("empty resource event log".to_string()))
}

/// High-level resource operations over one store.
#[derive(Debug, Clone)]
pub struct Resources {
    store: Store,
    default_ttl: String,
    heartbeat_interval: String,
}

impl Resources {
    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn open(store: Store) -> Result<Self> {
        let config = store.config()?;
        let default_ttl = config
            .resources
            .map(|r| r.default_ttl)
            .unwrap_or_else(|| "2h".to_string());
        let heartbeat_interval = config
            .heartbeat
            .map(|h| h.interval)
            .unwrap_or_else(|| default_ttl.clone());
        Ok(Self {
            store,
            default_ttl,
            heartbeat_interval,
        })
    }

    /// Acquire exclusive access. Creates the resource on first use.
    ///
    /// `wait` polls with bounded backoff until the lock-timeout budget runs
    /// out; `force` evicts a live holder by writing `resource_expired` first.
    pub fn acquire(
        &self,
        name: &str,
        actor: &str,
        ttl: Option<&str>,
        wait: bool,
        force: bool,
    ) -> Result<ResourceSnapshot> {
        id::validate_actor(actor)?;
        validate_resource_name(name)?;
        let ttl_secs = parse_duration(ttl.unwrap_or(&self.default_ttl))?;

        let deadline = Instant::now() + self.store.timeout();
        let mut backoff = Duration::from_millis(WAIT_BACKOFF_START_MS);

        loop {
            match self.try_acquire(name, actor, ttl_secs, force)? {
                Some(snapshot) => return Ok(snapshot),
                None if wait && Instant::now() < deadline => {
                    debug!(name, "resource held, backing off");
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(Duration::from_millis(WAIT_BACKOFF_CAP_MS));
                }
                None => {
                    let holder = self
                        .show(name)?
                        .holder
                        .map(|h| format!("{} until {}", h.actor, h.expires_at))
                        .unwrap_or_else(|| "unknown".to_string());
                    return Err(Error::Validation(format!(
                        "resource '{name}' is held by {holder} (use --wait or --force)"
                    )));
                }
            }
        }
    }

    fn try_acquire(
        &self,
        name: &str,
        actor: &str,
        ttl_secs: u64,
        force: bool,
    ) -> Result<Option<ResourceSnapshot>> {
        let _lock = self.store.lock(&lock::resource_key(name))?;

        let mut events = Vec::new();
        let state = self.read_state_locked(name)?;

        let (resource_id, mut snapshot) = match state {
            Some((resource_id, snapshot)) => (resource_id, Some(snapshot)),
            None => {
                let resource_id = id::new_id(RESOURCE_PREFIX);
                let mut data = Map::new();
                data.insert("name".to_string(), json!(name));
                events.push(Event::new_resource(
                    EventType::ResourceCreated,
                    resource_id.clone(),
                    actor,
                    data,
                ));
                (resource_id, None)
            }
        };

        if let Some(expired) = expiry_event(&resource_id, snapshot.as_ref(), actor) {
            snapshot = Some(apply_resource_event(snapshot, &expired)?);
            events.push(expired);
        }

        if let Some(current) = snapshot.as_ref().and_then(|s| s.holder.as_ref()) {
            if current.actor != actor {
                if !force {
                    return Ok(None);
                }
                let mut data = Map::new();
                data.insert("evicted_actor".to_string(), json!(current.actor));
                data.insert("forced".to_string(), json!(true));
                let evict = Event::new_resource(
                    EventType::ResourceExpired,
                    resource_id.clone(),
                    actor,
                    data,
                );
                snapshot = Some(apply_resource_event(snapshot, &evict)?);
                events.push(evict);
            }
            // Re-acquire by the current holder just refreshes the grant.
        }

        let now = Utc::now();
        let expires_at = (now + chrono::Duration::seconds(ttl_secs as i64))
            .to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
        let mut data = Map::new();
        data.insert("expires_at".to_string(), json!(expires_at));
        data.insert("ttl_seconds".to_string(), json!(ttl_secs));
        let acquire = Event::new_resource(
            EventType::ResourceAcquired,
            resource_id.clone(),
            actor,
            data,
        );
        let snapshot = apply_resource_event(snapshot, &acquire)?;
        events.push(acquire);

        self.commit_locked(name, &resource_id, &events, &snapshot)?;
        Ok(Some(snapshot))
    }

    /// Release a held resource. Only the holder may release without `force`.
    pub fn release(&self, name: &str, actor: &str, force: bool) -> Result<ResourceSnapshot> {
        id::validate_actor(actor)?;
        let _lock = self.store.lock(&lock::resource_key(name))?;

        let (resource_id, mut snapshot) = self
            .read_state_locked(name)?
            .ok_or_else(|| Error::NotFound(format!("resource {name}")))?;

        let mut events = Vec::new();
        if let Some(expired) = expiry_event(&resource_id, Some(&snapshot), actor) {
            snapshot = apply_resource_event(Some(snapshot), &expired)?;
            events.push(expired);
        }

        match snapshot.holder.as_ref() {
            None => {
                if events.is_empty() {
                    return Err(Error::Validation(format!(
                        "resource '{name}' is not held"
                    )));
                }
                // Holder just expired; the release collapses into the expiry.
            }
            Some(holder) if holder.actor != actor && !force => {
                return Err(Error::Validation(format!(
                    "resource '{name}' is held by {}; use --force to release",
                    holder.actor
                )));
            }
            Some(_) => {
                let release = Event::new_resource(
                    EventType::ResourceReleased,
                    resource_id.clone(),
                    actor,
                    Map::new(),
                );
                snapshot = apply_resource_event(Some(snapshot), &release)?;
                events.push(release);
            }
        }

        self.commit_locked(name, &resource_id, &events, &snapshot)?;
        Ok(snapshot)
    }

    /// Extend the holder's TTL by `ttl`, or the configured heartbeat
    /// interval when absent.
    pub fn heartbeat(&self, name: &str, actor: &str, ttl: Option<&str>) -> Result<ResourceSnapshot> {
        id::validate_actor(actor)?;
        let ttl_secs = parse_duration(ttl.unwrap_or(&self.heartbeat_interval))?;
        let _lock = self.store.lock(&lock::resource_key(name))?;

        let (resource_id, mut snapshot) = self
            .read_state_locked(name)?
            .ok_or_else(|| Error::NotFound(format!("resource {name}")))?;

        let mut events = Vec::new();
        if let Some(expired) = expiry_event(&resource_id, Some(&snapshot), actor) {
            snapshot = apply_resource_event(Some(snapshot), &expired)?;
            events.push(expired);
        }

        let Some(holder) = snapshot.holder.as_ref() else {
            self.commit_locked(name, &resource_id, &events, &snapshot)?;
            return Err(Error::Validation(format!(
                "resource '{name}' is not held; acquire it first"
            )));
        };
        if holder.actor != actor {
            return Err(Error::Validation(format!(
                "resource '{name}' is held by {}, not {actor}",
                holder.actor
            )));
        }

        let expires_at = (Utc::now() + chrono::Duration::seconds(ttl_secs as i64))
            .to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
        let mut data = Map::new();
        data.insert("expires_at".to_string(), json!(expires_at));
        let beat = Event::new_resource(
            EventType::ResourceHeartbeat,
            resource_id.clone(),
            actor,
            data,
        );
        snapshot = apply_resource_event(Some(snapshot), &beat)?;
        events.push(beat);

        self.commit_locked(name, &resource_id, &events, &snapshot)?;
        Ok(snapshot)
    }

    /// Current state; expires a stale holder under lock first.
    pub fn show(&self, name: &str) -> Result<ResourceSnapshot> {
        let _lock = self.store.lock(&lock::resource_key(name))?;

        let (resource_id, mut snapshot) = self
            .read_state_locked(name)?
            .ok_or_else(|| Error::NotFound(format!("resource {name}")))?;

        if let Some(expired) = expiry_event(&resource_id, Some(&snapshot), "agent:lattice") {
            snapshot = apply_resource_event(Some(snapshot), &expired)?;
            self.commit_locked(name, &resource_id, &[expired], &snapshot)?;
        }

        Ok(snapshot)
    }

    /// All resources, by directory listing.
    pub fn list(&self) -> Result<Vec<ResourceSnapshot>> {
        let dir = self.store.resources_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();

        let mut snapshots = Vec::new();
        for name in names {
            snapshots.push(self.show(&name)?);
        }
        Ok(snapshots)
    }

    fn read_state_locked(&self, name: &str) -> Result<Option<(String, ResourceSnapshot)>> {
        let path = self.store.resource_snapshot_path(name);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        let snapshot: ResourceSnapshot = serde_json::from_str(&content)?;
        let resource_id = snapshot.id.clone();

        // Events are the source of truth; a stale snapshot (crash between
        // append and rename) is replaced by replaying the log.
        let log_path = self.store.resource_events_path(&resource_id);
        fsio::drop_torn_tail(&log_path)?;
        let events: Vec<Event> = fsio::read_jsonl(&log_path)?;
        if events.is_empty() {
            return Ok(Some((resource_id, snapshot)));
        }
        let replayed = replay_resource(&events)?;
        Ok(Some((resource_id, replayed)))
    }

    fn commit_locked(
        &self,
        name: &str,
        resource_id: &str,
        events: &[Event],
        snapshot: &ResourceSnapshot,
    ) -> Result<()> {
        let log_path = self.store.resource_events_path(resource_id);
        for event in events {
            fsio::jsonl_append(&log_path, &event.to_canonical_line()?)?;
        }
        let doc = canon::to_pretty_document(snapshot)?;
        fsio::atomic_write(&self.store.resource_snapshot_path(name), doc.as_bytes())?;
        Ok(())
    }
}

/// Synthesize an expiry event when the holder's TTL has lapsed.
fn expiry_event(resource_id: &str, snapshot: Option<&ResourceSnapshot>, actor: &str) -> Option<Event> {
    let holder = snapshot?.holder.as_ref()?;
    if holder.expires_at.as_str() >= event::now_ts().as_str() {
        return None;
    }
    let mut data = Map::new();
    data.insert("expired_actor".to_string(), json!(holder.actor));
    data.insert("expired_at".to_string(), json!(holder.expires_at));
    Some(Event::new_resource(
        EventType::ResourceExpired,
        resource_id,
        actor,
        data,
    ))
}

fn validate_resource_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
    if ok {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "resource name '{name}' must be alphanumeric with - or _"
        )))
    }
}

/// Parse a duration string: `30s`, `15m`, `2h`, `1d`. Returns seconds.
pub fn parse_duration(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    let (digits, unit) = trimmed.split_at(trimmed.len().saturating_sub(1));
    let value: u64 = digits
        .parse()
        .map_err(|_| Error::Validation(format!("invalid duration '{input}'")))?;
    let seconds = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3_600,
        "d" => value * 86_400,
        _ => {
            return Err(Error::Validation(format!(
                "invalid duration '{input}' (expected <n>s|m|h|d)"
            )))
        }
    };
    if seconds == 0 {
        return Err(Error::Validation(format!(
            "duration '{input}' must be positive"
        )));
    }
    Ok(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Resources) {
        let temp = TempDir::new().unwrap();
        let store = Store::init(temp.path(), None, None).unwrap();
        let resources = Resources::open(store).unwrap();
        (temp, resources)
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("30s").unwrap(), 30);
        assert_eq!(parse_duration("15m").unwrap(), 900);
        assert_eq!(parse_duration("2h").unwrap(), 7_200);
        assert_eq!(parse_duration("1d").unwrap(), 86_400);
        assert!(parse_duration("2x").is_err());
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("0s").is_err());
    }

    #[test]
    fn first_acquire_creates_the_resource() {
        let (_temp, resources) = setup();
        let snapshot = resources
            .acquire("gpu-0", "agent:claude", Some("1h"), false, false)
            .unwrap();
        assert_eq!(snapshot.name, "gpu-0");
        assert_eq!(snapshot.status, "held");
        let holder = snapshot.holder.unwrap();
        assert_eq!(holder.actor, "agent:claude");
        assert_eq!(holder.ttl_seconds, Some(3_600));

        // Log starts with resource_created then resource_acquired.
        let events: Vec<Event> = fsio::read_jsonl(
            &resources.store.resource_events_path(&snapshot.id),
        )
        .unwrap();
        assert_eq!(events[0].event_type, EventType::ResourceCreated);
        assert_eq!(events[1].event_type, EventType::ResourceAcquired);
    }

    #[test]
    fn second_actor_is_blocked_until_release() {
        let (_temp, resources) = setup();
        resources
            .acquire("db", "agent:alpha", Some("1h"), false, false)
            .unwrap();

        let err = resources
            .acquire("db", "agent:beta", Some("1h"), false, false)
            .unwrap_err();
        assert!(err.to_string().contains("held by agent:alpha"));

        resources.release("db", "agent:alpha", false).unwrap();
        let snapshot = resources
            .acquire("db", "agent:beta", Some("1h"), false, false)
            .unwrap();
        assert_eq!(snapshot.holder.unwrap().actor, "agent:beta");
    }

    #[test]
    fn force_evicts_with_expiry_event() {
        let (_temp, resources) = setup();
        resources
            .acquire("db", "agent:alpha", Some("1h"), false, false)
            .unwrap();
        let snapshot = resources
            .acquire("db", "agent:beta", Some("1h"), false, true)
            .unwrap();
        assert_eq!(snapshot.holder.as_ref().unwrap().actor, "agent:beta");

        let events: Vec<Event> = fsio::read_jsonl(
            &resources.store.resource_events_path(&snapshot.id),
        )
        .unwrap();
        let expired: Vec<_> = events
            .iter()
            .filter(|e| e.event_type == EventType::ResourceExpired)
            .collect();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].data["forced"], json!(true));
    }

    #[test]
    fn stale_holder_expires_at_read() {
        let (_temp, resources) = setup();
        resources
            .acquire("db", "agent:alpha", Some("1s"), false, false)
            .unwrap();
        std::thread::sleep(Duration::from_millis(1_100));

        let snapshot = resources.show("db").unwrap();
        assert_eq!(snapshot.status, "free");
        assert!(snapshot.holder.is_none());

        // Another actor can now acquire without force.
        let snapshot = resources
            .acquire("db", "agent:beta", Some("1h"), false, false)
            .unwrap();
        assert_eq!(snapshot.holder.unwrap().actor, "agent:beta");
    }

    #[test]
    fn heartbeat_extends_only_for_the_holder() {
        let (_temp, resources) = setup();
        let before = resources
            .acquire("db", "agent:alpha", Some("30s"), false, false)
            .unwrap();
        let before_expiry = before.holder.unwrap().expires_at;

        let after = resources
            .heartbeat("db", "agent:alpha", Some("1h"))
            .unwrap();
        assert!(after.holder.unwrap().expires_at > before_expiry);

        let err = resources
            .heartbeat("db", "agent:beta", Some("1h"))
            .unwrap_err();
        assert!(err.to_string().contains("held by agent:alpha"));
    }

    #[test]
    fn release_requires_holder_or_force() {
        let (_temp, resources) = setup();
        resources
            .acquire("db", "agent:alpha", Some("1h"), false, false)
            .unwrap();

        let err = resources.release("db", "agent:beta", false).unwrap_err();
        assert!(err.to_string().contains("--force"));

        let snapshot = resources.release("db", "agent:beta", true).unwrap();
        assert_eq!(snapshot.status, "free");
    }

    #[test]
    fn rebuilt_snapshot_matches_replay() {
        let (_temp, resources) = setup();
        let written = resources
            .acquire("db", "agent:alpha", Some("1h"), false, false)
            .unwrap();

        let events: Vec<Event> =
            fsio::read_jsonl(&resources.store.resource_events_path(&written.id)).unwrap();
        let replayed = replay_resource(&events).unwrap();
        assert_eq!(
            canon::to_pretty_document(&written).unwrap(),
            canon::to_pretty_document(&replayed).unwrap()
        );
    }
}
