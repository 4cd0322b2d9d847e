//! Shared output formatting for lattice CLI commands.
//!
//! JSON mode prints the structured envelope: `{"ok": true, "data": ...}` on
//! success; errors use the `{"ok": false, "error": {...}}` shape from
//! `error::JsonError`.

use serde::Serialize;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct Output {
    header: String,
    data: serde_json::Value,
    details: Vec<String>,
    warnings: Vec<String>,
}

impl Output {
    pub fn new<T: Serialize>(header: impl Into<String>, data: T) -> Result<Self> {
        Ok(Self {
            header: header.into(),
            data: serde_json::to_value(data)?,
            details: Vec::new(),
            warnings: Vec::new(),
        })
    }

    pub fn detail(mut self, value: impl Into<String>) -> Self {
        self.details.push(value.into());
        self
    }

    pub fn warning(mut self, value: impl Into<String>) -> Self {
        self.warnings.push(value.into());
        self
    }

    pub fn emit(&self, json: bool, quiet: bool) -> Result<()> {
        if json {
            self.emit_json()?;
            return Ok(());
        }

        if quiet {
            return Ok(());
        }

        self.emit_human();
        Ok(())
    }

    fn emit_json(&self) -> Result<()> {
        #[derive(Serialize)]
        struct Envelope<'a> {
            ok: bool,
            data: &'a serde_json::Value,
            #[serde(skip_serializing_if = "Vec::is_empty")]
            warnings: &'a Vec<String>,
        }

        let payload = Envelope {
            ok: true,
            data: &self.data,
            warnings: &self.warnings,
        };

        println!("{}", serde_json::to_string_pretty(&payload)?);
        Ok(())
    }

    fn emit_human(&self) {
        println!("{}", self.header);
        print_section("Details", &self.details);
        print_section("Warnings", &self.warnings);
    }
}

fn print_section(title: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }

    println!();
    println!("{title}:");
    for item in items {
        println!("- {item}");
    }
}
