//! lattice artifact command implementations.

use super::{ArtifactCommands, Context};
use crate::artifact::{ArtifactPayload, ArtifactSpec, Artifacts};
use crate::error::{Error, Result};
use crate::output::Output;

pub fn run(ctx: &Context, command: ArtifactCommands, json: bool, quiet: bool) -> Result<()> {
    let artifacts = Artifacts::new(ctx.store()?);

    match command {
        ArtifactCommands::New {
            artifact_type,
            title,
            summary,
            model,
            tags,
            file,
            content_type,
            sensitive,
        } => {
            let actor = ctx.actor()?;

            let payload = match file {
                Some(path) => {
                    let extension = path
                        .extension()
                        .and_then(|ext| ext.to_str())
                        .map(str::to_string)
                        .ok_or_else(|| {
                            Error::Validation(format!(
                                "payload file '{}' needs an extension",
                                path.display()
                            ))
                        })?;
                    Some(ArtifactPayload {
                        bytes: std::fs::read(&path)?,
                        extension,
                        content_type,
                    })
                }
                None => None,
            };

            let meta = artifacts.create(
                ArtifactSpec {
                    artifact_type,
                    title,
                    summary,
                    model,
                    tags,
                    sensitive,
                },
                payload,
                &actor,
            )?;

            Output::new(format!("Created {} ({})", meta.id, meta.artifact_type), &meta)?
                .emit(json, quiet)
        }
        ArtifactCommands::Show { artifact } => {
            let meta = artifacts.get(&artifact)?;
            Output::new(format!("{} {}", meta.id, meta.title), &meta)?.emit(json, quiet)
        }
        ArtifactCommands::List => {
            let metas = artifacts.list()?;
            let mut output = Output::new(format!("{} artifact(s)", metas.len()), &metas)?;
            for meta in &metas {
                output = output.detail(format!("{} [{}] {}", meta.id, meta.artifact_type, meta.title));
            }
            output.emit(json, quiet)
        }
    }
}
