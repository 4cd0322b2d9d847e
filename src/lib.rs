//! lattice - event-sourced work tracking library
//!
//! This library provides the core of the lattice work tracker: an
//! event-sourced storage engine where many independent writers (humans and
//! agents, possibly syncing through version control) mutate shared task
//! state under a project-local `.lattice/` directory.
//!
//! # Core Concepts
//!
//! - **Events**: append-only JSONL per task; the authoritative record
//! - **Snapshots**: derived JSON materializations, rebuildable at any time
//! - **Locks**: named advisory file locks with deterministic ordering
//! - **Event-first writes**: events are durable before the snapshot renames
//! - **Short-ids**: human-readable `PROJ-N` aliases for ULID task ids
//! - **Resources**: optional TTL-based exclusive-access coordination
//!
//! # Module Organization
//!
//! - `cli`: Command-line interface using clap
//! - `id`: Prefixed ULIDs, actors, short-id parsing
//! - `canon`: The one canonical JSON serializer
//! - `fsio`: Atomic replace, durable JSONL append, root discovery
//! - `lock`: Advisory file locks and ordered multi-lock
//! - `event`: Event records and the built-in type registry
//! - `snapshot`: Task snapshot model and the pure reducer
//! - `config`: `config.json` loading and the workflow graph
//! - `workflow`: Transition gates, completion policies, review cycles
//! - `store`: `.lattice/` layout, reads, short-id index
//! - `writer`: The lock-ordered, event-first write path
//! - `hooks`: Post-write shell hooks
//! - `task`: High-level task operations
//! - `rebuild`: Snapshot and index regeneration from logs
//! - `doctor`: Integrity checks and safe repairs
//! - `archive`: Active/archive tree moves
//! - `artifact`: Artifact metadata and payloads
//! - `resource`: TTL resources

pub mod archive;
pub mod artifact;
pub mod canon;
pub mod cli;
pub mod config;
pub mod doctor;
pub mod error;
pub mod event;
pub mod fsio;
pub mod hooks;
pub mod id;
pub mod lock;
pub mod output;
pub mod rebuild;
pub mod resource;
pub mod snapshot;
pub mod store;
pub mod task;
pub mod workflow;
pub mod writer;

pub use error::{Error, Result};
