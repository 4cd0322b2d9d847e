//! lattice - event-sourced work tracking CLI
//!
//! A standalone CLI over the lattice core: append-only event logs, derived
//! snapshots, advisory locks, and workflow gates under `.lattice/`.

use clap::Parser;
use lattice::cli::Cli;
use lattice::error::JsonError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() {
    // LATTICE_DEBUG=1 turns on debug diagnostics unless RUST_LOG overrides.
    let default_filter = if std::env::var("LATTICE_DEBUG").is_ok_and(|v| !v.is_empty() && v != "0")
    {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .init();

    let cli = Cli::parse();
    let json = cli.json;
    if let Err(err) = cli.run() {
        if json {
            let payload = JsonError::from(&err);
            let text = serde_json::to_string(&payload).unwrap_or_else(|_| {
                format!(
                    r#"{{"ok":false,"error":{{"code":"{}","message":"serialization failed"}}}}"#,
                    err.code()
                )
            });
            println!("{text}");
        } else {
            eprintln!("error: {err}");
        }
        std::process::exit(err.exit_code());
    }
}
