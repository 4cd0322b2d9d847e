//! Identifier generation and validation.
//!
//! All entity ids are prefixed ULIDs: `<prefix>_<26-char Crockford Base32>`.
//! The ULID embeds UTC milliseconds in its top 48 bits, so lexicographic
//! order equals time order. Short-ids (`PROJ-N` / `PROJ-SUB-N`) are
//! human-readable aliases assigned once per task.

use std::fmt;

use ulid::Ulid;

use crate::error::{Error, Result};

/// Prefix for task ids (`task_...`)
pub const TASK_PREFIX: &str = "task";
/// Prefix for event ids (`ev_...`)
pub const EVENT_PREFIX: &str = "ev";
/// Prefix for artifact ids (`art_...`)
pub const ARTIFACT_PREFIX: &str = "art";
/// Prefix for resource ids (`res_...`)
pub const RESOURCE_PREFIX: &str = "res";

const ULID_LEN: usize = 26;
const ACTOR_PREFIXES: [&str; 3] = ["agent", "human", "team"];

/// Generate a new prefixed ULID, e.g. `task_01J8ZC4D2N3F4G5H6J7K8M9N0P`.
pub fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new())
}

/// Validate that `id` is `<expected_prefix>_<ulid26>` and decodes to 128 bits.
pub fn validate_id(id: &str, expected_prefix: &str) -> Result<()> {
    let invalid = || Error::InvalidId {
        id: id.to_string(),
        expected: format!("{}_<26-char ULID>", expected_prefix),
    };

    let rest = id
        .strip_prefix(expected_prefix)
        .and_then(|rest| rest.strip_prefix('_'))
        .ok_or_else(invalid)?;

    if rest.len() != ULID_LEN || !rest.chars().all(|ch| ch.is_ascii_digit() || ch.is_ascii_uppercase()) {
        return Err(invalid());
    }

    Ulid::from_string(rest).map_err(|_| invalid())?;
    Ok(())
}

/// Validate an actor identity of the form `agent:<id>`, `human:<id>`, or `team:<id>`.
pub fn validate_actor(actor: &str) -> Result<()> {
    let Some((prefix, rest)) = actor.split_once(':') else {
        return Err(Error::InvalidActor(actor.to_string()));
    };
    if !ACTOR_PREFIXES.contains(&prefix) || rest.is_empty() {
        return Err(Error::InvalidActor(actor.to_string()));
    }
    Ok(())
}

/// A parsed short-id alias: `PROJ-N` or `PROJ-SUB-N`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortId {
    pub project: String,
    pub subproject: Option<String>,
    pub seq: u64,
}

impl ShortId {
    pub fn new(project: &str, subproject: Option<&str>, seq: u64) -> Self {
        Self {
            project: project.to_ascii_uppercase(),
            subproject: subproject.map(|s| s.to_ascii_uppercase()),
            seq,
        }
    }

    /// Parse `PROJ-N` or `PROJ-SUB-N` (case-insensitive). Returns `None` on
    /// any format violation; callers decide whether that is an error.
    pub fn parse(input: &str) -> Option<Self> {
        let upper = input.trim().to_ascii_uppercase();
        let parts: Vec<&str> = upper.split('-').collect();
        let (project, subproject, seq_part) = match parts.as_slice() {
            [project, seq] => (*project, None, *seq),
            [project, sub, seq] => (*project, Some(*sub), *seq),
            _ => return None,
        };

        if !is_code(project) {
            return None;
        }
        if let Some(sub) = subproject {
            if !is_code(sub) {
                return None;
            }
        }

        let seq: u64 = seq_part.parse().ok()?;
        if seq == 0 || seq_part.starts_with('0') {
            return None;
        }

        Some(Self {
            project: project.to_string(),
            subproject: subproject.map(|s| s.to_string()),
            seq,
        })
    }
}

impl fmt::Display for ShortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.subproject {
            Some(sub) => write!(f, "{}-{}-{}", self.project, sub, self.seq),
            None => write!(f, "{}-{}", self.project, self.seq),
        }
    }
}

/// Validate a project or subproject code: 1-5 uppercase ASCII letters.
pub fn validate_project_code(code: &str) -> Result<()> {
    if is_code(code) {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "project code '{}' must be 1-5 uppercase ASCII letters",
            code
        )))
    }
}

fn is_code(code: &str) -> bool {
    !code.is_empty() && code.len() <= 5 && code.chars().all(|ch| ch.is_ascii_uppercase())
}

/// Extract short-id references for `project_code` from free text.
///
/// Matching is case-insensitive and boundary-delimited: `LAT-4` does not
/// match inside `LAT-42` or `FLAT-4`. Results are uppercased and deduplicated
/// in order of first appearance.
pub fn extract_short_ids_from_text(text: &str, project_code: &str) -> Vec<String> {
    let mut found = Vec::new();
    let bytes = text.as_bytes();
    let upper = text.to_ascii_uppercase();
    let needle = format!("{}-", project_code.to_ascii_uppercase());

    let mut search_from = 0;
    while let Some(offset) = upper[search_from..].find(&needle) {
        let start = search_from + offset;
        search_from = start + 1;

        // Preceding character must be a non-alphanumeric boundary.
        if start > 0 && bytes[start - 1].is_ascii_alphanumeric() {
            continue;
        }

        // Greedily take [-SUB]-N after the project code.
        let mut end = start + needle.len();
        while end < bytes.len() && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'-') {
            end += 1;
        }
        // Trim trailing hyphens so "LAT-3-" parses as LAT-3.
        while end > start && bytes[end - 1] == b'-' {
            end -= 1;
        }

        let candidate = &upper[start..end];
        if let Some(short) = ShortId::parse(candidate) {
            let rendered = short.to_string();
            if !found.contains(&rendered) {
                found.push(rendered);
            }
        }
    }

    found
}
