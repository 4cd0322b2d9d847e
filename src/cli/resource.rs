//! lattice resource command implementations.

use super::{Context, ResourceCommands};
use crate::error::Result;
use crate::output::Output;
use crate::resource::{ResourceSnapshot, Resources};

fn holder_line(snapshot: &ResourceSnapshot) -> String {
    match &snapshot.holder {
        Some(holder) => format!(
            "{}: held by {} until {}",
            snapshot.name, holder.actor, holder.expires_at
        ),
        None => format!("{}: free", snapshot.name),
    }
}

pub fn run(ctx: &Context, command: ResourceCommands, json: bool, quiet: bool) -> Result<()> {
    let resources = Resources::open(ctx.store()?)?;

    match command {
        ResourceCommands::Acquire {
            name,
            ttl,
            wait,
            force,
        } => {
            let actor = ctx.actor()?;
            let snapshot = resources.acquire(&name, &actor, ttl.as_deref(), wait, force)?;
            Output::new(format!("Acquired {}", holder_line(&snapshot)), &snapshot)?
                .emit(json, quiet)
        }
        ResourceCommands::Release { name, force } => {
            let actor = ctx.actor()?;
            let snapshot = resources.release(&name, &actor, force)?;
            Output::new(format!("Released {}", snapshot.name), &snapshot)?.emit(json, quiet)
        }
        ResourceCommands::Heartbeat { name, ttl } => {
            let actor = ctx.actor()?;
            let snapshot = resources.heartbeat(&name, &actor, ttl.as_deref())?;
            Output::new(format!("Heartbeat {}", holder_line(&snapshot)), &snapshot)?
                .emit(json, quiet)
        }
        ResourceCommands::Show { name } => {
            let snapshot = resources.show(&name)?;
            Output::new(holder_line(&snapshot), &snapshot)?.emit(json, quiet)
        }
        ResourceCommands::List => {
            let snapshots = resources.list()?;
            let mut output = Output::new(format!("{} resource(s)", snapshots.len()), &snapshots)?;
            for snapshot in &snapshots {
                output = output.detail(holder_line(snapshot));
            }
            output.emit(json, quiet)
        }
    }
}
