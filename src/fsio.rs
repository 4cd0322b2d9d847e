//! Filesystem primitives: atomic replace, durable JSONL append, root discovery.
//!
//! Atomic replace follows the temp + fsync + rename pattern: readers see
//! either the prior content or the new content, never a partial file. JSONL
//! appends fsync before returning, so an event line that this module reports
//! as written survives a crash.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use tracing::warn;

use crate::error::{Error, Result};

/// Name of the state directory at the project root.
pub const LATTICE_DIR: &str = ".lattice";

/// Environment variable overriding root discovery. Must point to the
/// directory *containing* `.lattice/`.
pub const ROOT_ENV: &str = "LATTICE_ROOT";

/// Atomically replace `path` with `data`.
///
/// Writes a temp file in the same directory, fsyncs it, renames it over the
/// destination, then fsyncs the parent directory so the rename itself is
/// durable.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;

    let temp_path = path.with_extension(format!(
        "{}.tmp.{}",
        path.extension().and_then(|e| e.to_str()).unwrap_or(""),
        std::process::id()
    ));

    let mut temp_file = File::create(&temp_path)?;
    temp_file.write_all(data)?;
    temp_file.sync_all()?;
    drop(temp_file);

    fs::rename(&temp_path, path)?;
    sync_dir(&parent)?;

    Ok(())
}

/// Append one `\n`-terminated line to a JSONL file and fsync it.
///
/// The caller must already hold the write lock for this file. If the file's
/// last byte is not `\n` (a torn append from a crashed writer), a newline is
/// written first so the previous fragment cannot corrupt this record.
pub fn jsonl_append(path: &Path, line: &str) -> Result<()> {
    debug_assert!(line.ends_with('\n'), "jsonl lines must be newline-terminated");

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;

    let existed = path.exists();
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?;

    if needs_leading_newline(&mut file)? {
        warn!(path = %path.display(), "repairing torn tail before append");
        file.write_all(b"\n")?;
    }

    file.write_all(line.as_bytes())?;
    file.sync_all()?;

    if !existed {
        sync_dir(&parent)?;
    }

    Ok(())
}

fn needs_leading_newline(file: &mut File) -> Result<bool> {
    let len = file.seek(SeekFrom::End(0))?;
    if len == 0 {
        return Ok(false);
    }

    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    file.seek(SeekFrom::End(0))?;
    Ok(last[0] != b'\n')
}

fn sync_dir(dir: &Path) -> Result<()> {
    // Directory fsync is a unix concept; rename durability is best-effort
    // elsewhere.
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

/// Drop a torn final line (no trailing `\n`, not complete JSON) from a
/// JSONL file. Loss-free: the fragment's mutation never completed. The
/// caller must hold the file's write lock. Returns whether a fragment was
/// removed.
pub fn drop_torn_tail(path: &Path) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    let content = fs::read_to_string(path)?;
    if content.is_empty() || content.ends_with('\n') {
        return Ok(false);
    }

    let fragment_start = content.rfind('\n').map(|pos| pos + 1).unwrap_or(0);
    if serde_json::from_str::<serde_json::Value>(&content[fragment_start..]).is_ok() {
        // Complete record, just missing its newline; leave it for the next
        // append's defensive handling.
        return Ok(false);
    }

    warn!(path = %path.display(), "dropping torn trailing line");
    atomic_write(path, content[..fragment_start].as_bytes())?;
    Ok(true)
}

/// Read all complete records from a JSONL file.
///
/// A trailing line without `\n` is parsed if it is complete JSON and skipped
/// with a warning otherwise (a truncated tail from a crashed append). A bad
/// line anywhere else is an error; doctor reports those as corruption.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(path)?;
    let mut records = Vec::new();
    let mut rest = content.as_str();

    while !rest.is_empty() {
        let (line, terminated, remainder) = match rest.find('\n') {
            Some(pos) => (&rest[..pos], true, &rest[pos + 1..]),
            None => (rest, false, ""),
        };
        rest = remainder;

        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<T>(line) {
            Ok(record) => records.push(record),
            Err(err) if !terminated => {
                warn!(path = %path.display(), %err, "ignoring truncated trailing line");
            }
            Err(err) => return Err(Error::Json(err)),
        }
    }

    Ok(records)
}

/// Locate the project root (the directory containing `.lattice/`).
///
/// `LATTICE_ROOT` wins when set and must be valid; there is no fallback to
/// the ancestor walk when it is wrong. Otherwise ancestors of `start_dir`
/// are searched, nearest first.
pub fn find_root(start_dir: &Path) -> Result<PathBuf> {
    if let Ok(raw) = std::env::var(ROOT_ENV) {
        let root = PathBuf::from(raw);
        if root.join(LATTICE_DIR).is_dir() {
            return Ok(root);
        }
        return Err(Error::NotInitialized(root));
    }

    for dir in start_dir.ancestors() {
        if dir.join(LATTICE_DIR).is_dir() {
            return Ok(dir.to_path_buf());
        }
    }

    Err(Error::NotInitialized(start_dir.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, serde::Serialize, Deserialize)]
    struct Rec {
        n: u32,
    }

    #[test]
    fn atomic_write_replaces_content() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("doc.json");

        atomic_write(&path, b"{\"v\":1}\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"v\":1}\n");

        atomic_write(&path, b"{\"v\":2}\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"v\":2}\n");
    }

    #[test]
    fn append_and_read_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("log.jsonl");

        jsonl_append(&path, "{\"n\":1}\n").unwrap();
        jsonl_append(&path, "{\"n\":2}\n").unwrap();

        let records: Vec<Rec> = read_jsonl(&path).unwrap();
        assert_eq!(records, vec![Rec { n: 1 }, Rec { n: 2 }]);
    }

    #[test]
    fn append_repairs_torn_tail() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("log.jsonl");

        fs::write(&path, "{\"n\":1}\n{\"n\":2").unwrap();
        jsonl_append(&path, "{\"n\":3}\n").unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.ends_with("{\"n\":3}\n"));
        // The torn fragment sits on its own line and cannot merge with ours.
        assert!(content.contains("{\"n\":2\n"));
    }

    #[test]
    fn read_skips_truncated_tail_only() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("log.jsonl");

        fs::write(&path, "{\"n\":1}\n{\"n\":2}\n{\"n\":").unwrap();
        let records: Vec<Rec> = read_jsonl(&path).unwrap();
        assert_eq!(records, vec![Rec { n: 1 }, Rec { n: 2 }]);

        // A complete unterminated final record still counts.
        fs::write(&path, "{\"n\":1}\n{\"n\":2}").unwrap();
        let records: Vec<Rec> = read_jsonl(&path).unwrap();
        assert_eq!(records.len(), 2);

        // Corruption before the tail is an error, not a skip.
        fs::write(&path, "{\"n\":1}\nnot json\n{\"n\":2}\n").unwrap();
        assert!(read_jsonl::<Rec>(&path).is_err());
    }

    #[test]
    fn find_root_walks_ancestors() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("a/b/c");
        fs::create_dir_all(&nested).unwrap();
        fs::create_dir_all(temp.path().join(LATTICE_DIR)).unwrap();

        let root = find_root(&nested).unwrap();
        assert_eq!(root, temp.path());
    }

    #[test]
    fn find_root_fails_without_marker() {
        let temp = TempDir::new().unwrap();
        let err = find_root(temp.path()).unwrap_err();
        assert_eq!(err.code(), "NOT_INITIALIZED");
    }
}
