//! Artifacts: standalone metadata records with optional payloads.
//!
//! Artifacts are created independently and attached to tasks via
//! `artifact_attached` events; they stay in place when a task is archived.

use std::fs;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::canon;
use crate::error::{Error, Result};
use crate::event;
use crate::fsio;
use crate::id::{self, ARTIFACT_PREFIX};
use crate::lock;
use crate::store::Store;

/// Schema version stamped on artifact metadata.
pub const ARTIFACT_SCHEMA_VERSION: u32 = 1;

/// Accepted artifact types.
pub const ARTIFACT_TYPES: [&str; 5] = ["conversation", "prompt", "file", "log", "reference"];

/// Pointer to the stored payload, if any.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PayloadInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

impl PayloadInfo {
    pub fn is_empty(&self) -> bool {
        self.file.is_none() && self.content_type.is_none() && self.size_bytes.is_none()
    }
}

/// Artifact metadata, stored at `artifacts/meta/<art_id>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub schema_version: u32,
    pub id: String,
    #[serde(rename = "type")]
    pub artifact_type: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub created_at: String,
    pub created_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "PayloadInfo::is_empty")]
    pub payload: PayloadInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<Map<String, Value>>,
    #[serde(default)]
    pub sensitive: bool,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub custom_fields: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Inputs for creating an artifact.
#[derive(Debug, Clone, Default)]
pub struct ArtifactSpec {
    pub artifact_type: String,
    pub title: String,
    pub summary: Option<String>,
    pub model: Option<String>,
    pub tags: Vec<String>,
    pub sensitive: bool,
}

/// A payload to store alongside the metadata.
#[derive(Debug, Clone)]
pub struct ArtifactPayload {
    pub bytes: Vec<u8>,
    pub extension: String,
    pub content_type: Option<String>,
}

/// Artifact operations over one store.
#[derive(Debug, Clone)]
pub struct Artifacts {
    store: Store,
}

impl Artifacts {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Create an artifact; metadata and payload are written atomically under
    /// the artifact's lock.
    pub fn create(
        &self,
        spec: ArtifactSpec,
        payload: Option<ArtifactPayload>,
        actor: &str,
    ) -> Result<ArtifactMeta> {
        id::validate_actor(actor)?;
        if spec.title.trim().is_empty() {
            return Err(Error::Validation("title cannot be empty".to_string()));
        }
        if !ARTIFACT_TYPES.contains(&spec.artifact_type.as_str()) {
            return Err(Error::Validation(format!(
                "unknown artifact type '{}' (expected one of: {})",
                spec.artifact_type,
                ARTIFACT_TYPES.join(", ")
            )));
        }

        let artifact_id = id::new_id(ARTIFACT_PREFIX);
        let _lock = self.store.lock(&lock::artifacts_key(&artifact_id))?;

        let payload_info = match &payload {
            Some(payload) => {
                let extension = sanitize_extension(&payload.extension)?;
                let file_name = format!("{artifact_id}.{extension}");
                let path = self.store.artifacts_payload_dir().join(&file_name);
                fsio::atomic_write(&path, &payload.bytes)?;
                PayloadInfo {
                    file: Some(file_name),
                    content_type: payload.content_type.clone(),
                    size_bytes: Some(payload.bytes.len() as u64),
                }
            }
            None => PayloadInfo::default(),
        };

        let mut tags = Vec::new();
        for tag in spec.tags {
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }

        let meta = ArtifactMeta {
            schema_version: ARTIFACT_SCHEMA_VERSION,
            id: artifact_id.clone(),
            artifact_type: spec.artifact_type,
            title: spec.title.trim().to_string(),
            summary: spec.summary,
            created_at: event::now_ts(),
            created_by: actor.to_string(),
            model: spec.model,
            tags,
            payload: payload_info,
            token_usage: None,
            sensitive: spec.sensitive,
            custom_fields: Map::new(),
            extra: Map::new(),
        };

        let doc = canon::to_pretty_document(&meta)?;
        fsio::atomic_write(&self.store.artifact_meta_path(&artifact_id), doc.as_bytes())?;
        Ok(meta)
    }

    pub fn get(&self, artifact_id: &str) -> Result<ArtifactMeta> {
        id::validate_id(artifact_id, ARTIFACT_PREFIX)?;
        let path = self.store.artifact_meta_path(artifact_id);
        if !path.exists() {
            return Err(Error::NotFound(format!("artifact {artifact_id}")));
        }
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn list(&self) -> Result<Vec<ArtifactMeta>> {
        let dir = self.store.artifacts_meta_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();

        let mut metas = Vec::new();
        for artifact_id in ids {
            metas.push(self.get(&artifact_id)?);
        }
        Ok(metas)
    }

    /// Read the payload bytes for an artifact.
    pub fn payload(&self, artifact_id: &str) -> Result<Vec<u8>> {
        let meta = self.get(artifact_id)?;
        let Some(file) = meta.payload.file else {
            return Err(Error::NotFound(format!(
                "artifact {artifact_id} has no payload"
            )));
        };
        Ok(fs::read(self.store.artifacts_payload_dir().join(file))?)
    }
}

fn sanitize_extension(extension: &str) -> Result<String> {
    let trimmed = extension.trim_start_matches('.');
    let ok = !trimmed.is_empty()
        && trimmed.len() <= 16
        && trimmed.chars().all(|ch| ch.is_ascii_alphanumeric());
    if ok {
        Ok(trimmed.to_string())
    } else {
        Err(Error::Validation(format!(
            "invalid payload extension '{extension}'"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Artifacts) {
        let temp = TempDir::new().unwrap();
        let store = Store::init(temp.path(), None, None).unwrap();
        let artifacts = Artifacts::new(store);
        (temp, artifacts)
    }

    #[test]
    fn create_and_read_back() {
        let (_temp, artifacts) = setup();
        let meta = artifacts
            .create(
                ArtifactSpec {
                    artifact_type: "log".to_string(),
                    title: "CI run".to_string(),
                    tags: vec!["ci".to_string(), "ci".to_string()],
                    ..Default::default()
                },
                Some(ArtifactPayload {
                    bytes: b"line one\n".to_vec(),
                    extension: "txt".to_string(),
                    content_type: Some("text/plain".to_string()),
                }),
                "agent:claude",
            )
            .unwrap();

        assert!(meta.id.starts_with("art_"));
        assert_eq!(meta.tags, vec!["ci"]);
        assert_eq!(meta.payload.size_bytes, Some(9));

        let loaded = artifacts.get(&meta.id).unwrap();
        assert_eq!(loaded, meta);
        assert_eq!(artifacts.payload(&meta.id).unwrap(), b"line one\n");
    }

    #[test]
    fn create_validates_type_and_title() {
        let (_temp, artifacts) = setup();
        let err = artifacts
            .create(
                ArtifactSpec {
                    artifact_type: "binary".to_string(),
                    title: "x".to_string(),
                    ..Default::default()
                },
                None,
                "agent:claude",
            )
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        let err = artifacts
            .create(
                ArtifactSpec {
                    artifact_type: "log".to_string(),
                    title: " ".to_string(),
                    ..Default::default()
                },
                None,
                "agent:claude",
            )
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn metadata_document_is_canonical() {
        let (_temp, artifacts) = setup();
        let meta = artifacts
            .create(
                ArtifactSpec {
                    artifact_type: "reference".to_string(),
                    title: "Design doc".to_string(),
                    ..Default::default()
                },
                None,
                "human:ana",
            )
            .unwrap();

        let path = artifacts.store.artifact_meta_path(&meta.id);
        let written = fs::read_to_string(path).unwrap();
        assert!(written.ends_with('\n'));
        // No payload block when there is no payload; no nulls anywhere.
        assert!(!written.contains("\"payload\""));
        assert!(!written.contains("null"));
    }
}
