//! lattice init command implementation
//!
//! Creates the .lattice/ directory tree, a default config.json, and an
//! empty short-id index.

use std::path::PathBuf;

use crate::error::Result;
use crate::output::Output;
use crate::store::Store;

#[derive(serde::Serialize)]
struct InitReport {
    root: PathBuf,
    project_code: Option<String>,
    subproject_code: Option<String>,
}

pub fn run(
    project_code: Option<String>,
    subproject_code: Option<String>,
    dir: Option<PathBuf>,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let root = match dir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };

    let store = Store::init(
        &root,
        project_code.as_deref(),
        subproject_code.as_deref(),
    )?;
    let config = store.config()?;

    let report = InitReport {
        root: store.lattice_dir(),
        project_code: config.project_code.clone(),
        subproject_code: config.subproject_code.clone(),
    };

    let mut output = Output::new(
        format!("Initialized {}", report.root.display()),
        &report,
    )?;
    if let Some(code) = &report.project_code {
        output = output.detail(format!("short-ids enabled with project code {code}"));
    }
    output.emit(json, quiet)
}
