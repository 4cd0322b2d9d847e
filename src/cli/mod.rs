//! Command-line interface for lattice
//!
//! This module defines the CLI structure using clap derive macros. It is a
//! thin shell over the library: argument parsing and output formatting only;
//! all semantics live in the core modules.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::error::{Error, Result};
use crate::id;
use crate::store::Store;

mod artifact;
mod init;
mod maintenance;
mod resource;
mod task;

const ROBOT_HELP: &str = r#"lattice --robot-help

Purpose
  lattice is a file-based, event-sourced work tracker for humans and agents
  sharing one repository. All state lives under .lattice/: append-only JSONL
  event logs per task, derived JSON snapshots, advisory file locks.

Quickstart (typical agent flow)
  lattice init --project-code LAT
  lattice create "Ship the parser" --type feature --actor agent:claude
  lattice status LAT-1 in_planning --actor agent:claude
  lattice comment LAT-1 "looks good" --role review --actor human:ana
  lattice status LAT-1 done --actor agent:claude

Environment
  LATTICE_ROOT   -> directory containing .lattice/ (overrides discovery)
  LATTICE_ACTOR  -> default actor (agent:<id> | human:<id> | team:<id>)
  LATTICE_DEBUG  -> verbose diagnostics on stderr

Storage layout
  .lattice/config.json             Workflow, policies, hooks
  .lattice/ids.json                Short-id index (derived)
  .lattice/tasks/<id>.json         Snapshots (derived)
  .lattice/events/<id>.jsonl       Authoritative per-task logs
  .lattice/events/_lifecycle.jsonl Lifecycle index (derived)
  .lattice/archive/                Archived tasks
  .lattice/resources/<name>/       TTL coordination resources

Output contracts
  --json   {"ok": true, "data": ...} on success
           {"ok": false, "error": {"code", "message"}} on failure

Exit codes
  0 success
  1 user/domain error (validation, not-found, conflict, policy-blocked)
  2 system error (lock timeout, I/O)

Commands (high level)
  lattice init                      Initialize .lattice/
  lattice create|show|list|log      Tasks
  lattice status|assign|field       Task mutations (workflow-gated)
  lattice comment|link|unlink       Evidence and relationships
  lattice attach|branch             Artifacts and branch links
  lattice archive|unarchive         Move tasks to/from the archive tree
  lattice rebuild                   Replay logs into snapshots + indexes
  lattice doctor [--fix]            Integrity checks and safe repairs
  lattice artifact new|show|list    Standalone artifacts
  lattice resource acquire|release|heartbeat|show|list  TTL resources

Tips for agent automation
  - Use --json for parsing; codes in error.code are stable.
  - Events are the source of truth; snapshots are derived and rebuildable.
  - Pass --force --reason "<why>" to override workflow gates; the reason is
    recorded in the event's provenance.
"#;

/// lattice - event-sourced work tracking
///
/// A file-based work tracker whose core is an append-only event log per
/// task, built for many parallel human and agent writers.
#[derive(Parser, Debug)]
#[command(name = "lattice")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(subcommand_required = false)]
#[command(after_help = r#"Examples:
  lattice init --project-code LAT
  lattice create "Ship the parser" --type feature
  lattice status LAT-1 in_planning
  lattice doctor --fix
"#)]
pub struct Cli {
    /// Actor identity for mutations (agent:<id> | human:<id> | team:<id>)
    #[arg(long, global = true, env = "LATTICE_ACTOR")]
    pub actor: Option<String>,

    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Lock timeout in seconds
    #[arg(long, global = true, value_name = "secs")]
    pub timeout: Option<u64>,

    /// Print detailed robot-oriented help and exit
    #[arg(long, global = true)]
    pub robot_help: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a .lattice/ store in the current directory
    Init {
        /// Project code for short-ids (1-5 uppercase letters)
        #[arg(long)]
        project_code: Option<String>,

        /// Subproject code for short-ids
        #[arg(long)]
        subproject_code: Option<String>,

        /// Directory to initialize (defaults to current directory)
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// Create a task
    Create {
        title: String,

        #[arg(long)]
        description: Option<String>,

        #[arg(long)]
        status: Option<String>,

        /// critical | high | medium | low
        #[arg(long)]
        priority: Option<String>,

        #[arg(long)]
        urgency: Option<String>,

        #[arg(long = "type")]
        task_type: Option<String>,

        #[arg(long)]
        complexity: Option<String>,

        #[arg(long = "tag")]
        tags: Vec<String>,

        #[arg(long)]
        assign: Option<String>,

        /// Caller-supplied task id for idempotent creates
        #[arg(long)]
        id: Option<String>,
    },

    /// Show one task (full id or short-id)
    Show { task: String },

    /// List active tasks
    List {
        #[arg(long)]
        status: Option<String>,

        #[arg(long)]
        assignee: Option<String>,

        #[arg(long)]
        tag: Option<String>,
    },

    /// Print a task's event log
    Log { task: String },

    /// Change a task's status through the workflow
    Status {
        task: String,
        to: String,

        /// Override workflow gates (requires --reason)
        #[arg(long)]
        force: bool,

        #[arg(long)]
        reason: Option<String>,
    },

    /// Set or clear the assignee
    Assign {
        task: String,

        /// New assignee; omit with --clear to unassign
        assignee: Option<String>,

        #[arg(long)]
        clear: bool,
    },

    /// Update a snapshot field or a custom_fields.* path
    Field {
        task: String,
        field: String,

        /// JSON value; bare words are treated as strings, "null" clears
        value: String,
    },

    /// Add a comment; --role makes it completion-policy evidence
    Comment {
        task: String,
        text: String,

        #[arg(long)]
        role: Option<String>,
    },

    /// Add an outgoing relationship
    Link {
        task: String,

        /// blocks | depends_on | subtask_of | related_to | spawned_by | duplicate_of | supersedes
        rel_type: String,
        target: String,

        #[arg(long)]
        note: Option<String>,
    },

    /// Remove an outgoing relationship
    Unlink {
        task: String,
        rel_type: String,
        target: String,
    },

    /// Attach an artifact to a task
    Attach {
        task: String,
        artifact: String,

        #[arg(long)]
        role: Option<String>,
    },

    /// Link or unlink a VCS branch
    Branch {
        #[command(subcommand)]
        command: BranchCommands,
    },

    /// Move a task to the archive tree
    Archive { task: String },

    /// Move an archived task back to the active tree
    Unarchive { task: String },

    /// Replay event logs into snapshots and regenerate indexes
    Rebuild {
        /// Rebuild one task only
        task: Option<String>,
    },

    /// Run integrity checks
    Doctor {
        /// Apply known-safe repairs
        #[arg(long)]
        fix: bool,
    },

    /// Manage standalone artifacts
    Artifact {
        #[command(subcommand)]
        command: ArtifactCommands,
    },

    /// Manage TTL coordination resources
    Resource {
        #[command(subcommand)]
        command: ResourceCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum BranchCommands {
    /// Link a branch to a task
    Link {
        task: String,
        branch: String,

        #[arg(long)]
        repo: Option<String>,
    },

    /// Remove a branch link
    Unlink {
        task: String,
        branch: String,

        #[arg(long)]
        repo: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ArtifactCommands {
    /// Create an artifact
    New {
        /// conversation | prompt | file | log | reference
        #[arg(long = "type")]
        artifact_type: String,

        title: String,

        #[arg(long)]
        summary: Option<String>,

        #[arg(long)]
        model: Option<String>,

        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Read the payload from this file
        #[arg(long)]
        file: Option<PathBuf>,

        #[arg(long)]
        content_type: Option<String>,

        #[arg(long)]
        sensitive: bool,
    },

    /// Show artifact metadata
    Show { artifact: String },

    /// List artifacts
    List,
}

#[derive(Subcommand, Debug)]
pub enum ResourceCommands {
    /// Acquire exclusive access (creates the resource on first use)
    Acquire {
        name: String,

        /// TTL, e.g. 30s, 15m, 2h
        #[arg(long)]
        ttl: Option<String>,

        /// Poll with backoff until the holder releases or the timeout lapses
        #[arg(long)]
        wait: bool,

        /// Evict the current holder
        #[arg(long)]
        force: bool,
    },

    /// Release a held resource
    Release {
        name: String,

        #[arg(long)]
        force: bool,
    },

    /// Extend the holder's TTL
    Heartbeat {
        name: String,

        #[arg(long)]
        ttl: Option<String>,
    },

    /// Show one resource
    Show { name: String },

    /// List resources
    List,
}

impl Cli {
    pub fn run(self) -> Result<()> {
        if self.robot_help {
            println!("{ROBOT_HELP}");
            return Ok(());
        }

        let Some(command) = self.command else {
            return Err(Error::Validation(
                "no command given (try --help or --robot-help)".to_string(),
            ));
        };

        let json = self.json;
        let quiet = self.quiet;
        let ctx = Context {
            actor: self.actor,
            timeout: self.timeout.map(Duration::from_secs),
        };

        match command {
            Commands::Init {
                project_code,
                subproject_code,
                dir,
            } => init::run(project_code, subproject_code, dir, json, quiet),
            Commands::Create {
                title,
                description,
                status,
                priority,
                urgency,
                task_type,
                complexity,
                tags,
                assign,
                id,
            } => task::create(
                &ctx,
                task::CreateArgs {
                    title,
                    description,
                    status,
                    priority,
                    urgency,
                    task_type,
                    complexity,
                    tags,
                    assign,
                    id,
                },
                json,
                quiet,
            ),
            Commands::Show { task } => task::show(&ctx, &task, json, quiet),
            Commands::List {
                status,
                assignee,
                tag,
            } => task::list(&ctx, status, assignee, tag, json, quiet),
            Commands::Log { task } => task::log(&ctx, &task, json, quiet),
            Commands::Status {
                task,
                to,
                force,
                reason,
            } => task::status(&ctx, &task, &to, force, reason.as_deref(), json, quiet),
            Commands::Assign {
                task,
                assignee,
                clear,
            } => task::assign(&ctx, &task, assignee, clear, json, quiet),
            Commands::Field { task, field, value } => {
                task::field(&ctx, &task, &field, &value, json, quiet)
            }
            Commands::Comment { task, text, role } => {
                task::comment(&ctx, &task, &text, role.as_deref(), json, quiet)
            }
            Commands::Link {
                task,
                rel_type,
                target,
                note,
            } => task::link(&ctx, &task, &rel_type, &target, note.as_deref(), json, quiet),
            Commands::Unlink {
                task,
                rel_type,
                target,
            } => task::unlink(&ctx, &task, &rel_type, &target, json, quiet),
            Commands::Attach {
                task,
                artifact,
                role,
            } => task::attach(&ctx, &task, &artifact, role.as_deref(), json, quiet),
            Commands::Branch { command } => task::branch(&ctx, command, json, quiet),
            Commands::Archive { task } => maintenance::archive(&ctx, &task, json, quiet),
            Commands::Unarchive { task } => maintenance::unarchive(&ctx, &task, json, quiet),
            Commands::Rebuild { task } => maintenance::rebuild(&ctx, task.as_deref(), json, quiet),
            Commands::Doctor { fix } => maintenance::doctor(&ctx, fix, json, quiet),
            Commands::Artifact { command } => artifact::run(&ctx, command, json, quiet),
            Commands::Resource { command } => resource::run(&ctx, command, json, quiet),
        }
    }
}

/// Shared command context: actor resolution and store opening.
pub(crate) struct Context {
    actor: Option<String>,
    timeout: Option<Duration>,
}

impl Context {
    /// Open the store governing the current directory.
    pub(crate) fn store(&self) -> Result<Store> {
        let cwd = std::env::current_dir()?;
        let mut store = Store::open(&cwd)?;
        if let Some(timeout) = self.timeout {
            store = store.with_timeout(timeout);
        }
        Ok(store)
    }

    /// The actor for a mutation; required and format-checked.
    pub(crate) fn actor(&self) -> Result<String> {
        let Some(actor) = self.actor.as_deref().map(str::trim).filter(|a| !a.is_empty())
        else {
            return Err(Error::Validation(
                "actor required: pass --actor or set LATTICE_ACTOR".to_string(),
            ));
        };
        id::validate_actor(actor)?;
        Ok(actor.to_string())
    }
}
