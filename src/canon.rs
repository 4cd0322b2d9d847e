//! Canonical JSON serialization.
//!
//! Every durable write goes through this module. Rebuild determinism depends
//! on it: snapshots and event lines must re-serialize byte-identically, so
//! there is exactly one way to turn a value into bytes.
//!
//! serde_json's default `Map` is backed by a `BTreeMap`, so converting
//! through `serde_json::Value` sorts keys at every nesting level.

use serde::Serialize;
use serde_json::Value;

use crate::error::Result;

/// Serialize to a compact, sorted-key, `\n`-terminated JSONL line.
pub fn to_canonical_line<T: Serialize>(value: &T) -> Result<String> {
    let value: Value = serde_json::to_value(value)?;
    let mut line = serde_json::to_string(&value)?;
    line.push('\n');
    Ok(line)
}

/// Serialize to a sorted-key, 2-space-indented document with a trailing
/// newline. Used for snapshots, metadata, and indexes so version-control
/// diffs stay stable.
pub fn to_pretty_document<T: Serialize>(value: &T) -> Result<String> {
    let value: Value = serde_json::to_value(value)?;
    let mut doc = serde_json::to_string_pretty(&value)?;
    doc.push('\n');
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn line_sorts_keys_and_terminates() {
        let value = json!({"zeta": 1, "alpha": {"nested_z": true, "nested_a": false}});
        let line = to_canonical_line(&value).unwrap();
        assert_eq!(
            line,
            "{\"alpha\":{\"nested_a\":false,\"nested_z\":true},\"zeta\":1}\n"
        );
    }

    #[test]
    fn struct_fields_are_sorted_regardless_of_declaration_order() {
        #[derive(serde::Serialize)]
        struct Sample {
            zulu: u32,
            alpha: u32,
        }

        let line = to_canonical_line(&Sample { zulu: 1, alpha: 2 }).unwrap();
        assert_eq!(line, "{\"alpha\":2,\"zulu\":1}\n");
    }

    #[test]
    fn pretty_document_is_a_fixed_point() {
        let value = json!({"b": [1, 2], "a": "x"});
        let doc = to_pretty_document(&value).unwrap();
        assert!(doc.ends_with('\n'));

        let reparsed: serde_json::Value = serde_json::from_str(&doc).unwrap();
        let doc2 = to_pretty_document(&reparsed).unwrap();
        assert_eq!(doc, doc2);
    }
}
