// Artifact store - durable named outputs with producer metadata and fingerprints

//! # Artifact Store
//!
//! Modules communicate through named artifacts: a module writes an artifact
//! under a stable id together with [`ArtifactMetadata`] naming the producing
//! module, its version, and free-form notes. The resolver reads that metadata
//! back to judge whether a completed node's outputs are still valid.
//!
//! ## Fingerprints
//!
//! Per-artifact fingerprints ride inside the metadata `notes` map under a
//! well-known key derived from the artifact id (`<id>.fingerprint`). A module
//! that advertises fingerprints lets the resolver detect stale outputs even
//! when the file contents still exist.
//!
//! ## Status derivation
//!
//! For a node output, [`evaluate_artifact`] derives:
//! - `Fresh`: stored, produced by the node's module, fingerprint matches
//! - `Outdated`: producer matches but fingerprints disagree
//! - `Invalid`: another module overwrote the slot, or metadata is missing
//! - `Absent`: nothing stored under the artifact id
//!
//! ## Atomic publish
//!
//! [`FsArtifactStore`] stages body and metadata into a temporary directory
//! and renames it into place, so metadata is never observable without its
//! body.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::{ArtifactRef, ArtifactReport, ArtifactStatus};
use crate::Result;

/// Metadata stored alongside every artifact body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub artifact_id: String,
    /// Module id that produced the artifact
    pub module_id: String,
    #[serde(default)]
    pub version: String,
    /// Free-form notes; fingerprints live under `<artifact-id>.fingerprint`
    #[serde(default)]
    pub notes: BTreeMap<String, String>,
    pub written_at: DateTime<Utc>,
}

impl ArtifactMetadata {
    pub fn new<S: Into<String>>(artifact_id: S, module_id: S, version: S) -> Self {
        Self {
            artifact_id: artifact_id.into(),
            module_id: module_id.into(),
            version: version.into(),
            notes: BTreeMap::new(),
            written_at: Utc::now(),
        }
    }

    /// Attach a fingerprint note for this metadata's artifact id
    pub fn with_fingerprint<S: Into<String>>(mut self, fingerprint: S) -> Self {
        let key = fingerprint_note_key(&self.artifact_id);
        self.notes.insert(key, fingerprint.into());
        self
    }

    /// Fingerprint recorded for the given artifact id, if any
    pub fn fingerprint(&self, artifact_id: &str) -> Option<&str> {
        self.notes
            .get(&fingerprint_note_key(artifact_id))
            .map(String::as_str)
    }
}

/// Well-known notes key carrying the fingerprint for an artifact id
pub fn fingerprint_note_key(artifact_id: &str) -> String {
    format!("{}.fingerprint", artifact_id)
}

/// Content-addressed write/read of named artifacts
///
/// Reads are idempotent and side-effect-free. `write` must publish body and
/// metadata atomically.
#[async_trait::async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store an artifact body together with its metadata
    async fn write(
        &self,
        artifact: &ArtifactRef,
        body: &[u8],
        metadata: ArtifactMetadata,
    ) -> Result<()>;

    /// Stored metadata for an artifact id, `None` when absent
    async fn metadata(&self, artifact_id: &str) -> Result<Option<ArtifactMetadata>>;

    /// Stored body for an artifact id, `None` when absent
    async fn read(&self, artifact_id: &str) -> Result<Option<Vec<u8>>>;

    /// True when anything (body or metadata) is stored under the id
    async fn exists(&self, artifact_id: &str) -> Result<bool>;
}

/// Derive the validity of one node output from stored metadata
///
/// `module_id` is the node's module; `expected_fingerprint` is what the
/// module currently advertises (when it fingerprints at all).
pub fn evaluate_artifact(
    module_id: &str,
    expected_fingerprint: Option<&str>,
    metadata: Option<&ArtifactMetadata>,
    stored: bool,
) -> ArtifactReport {
    let metadata = match metadata {
        Some(metadata) => metadata,
        None => {
            if stored {
                // Body without metadata: the slot is unaccounted for
                return ArtifactReport::new(ArtifactStatus::Invalid);
            }
            return ArtifactReport::new(ArtifactStatus::Absent);
        }
    };

    if metadata.module_id != module_id {
        return ArtifactReport::new(ArtifactStatus::Invalid);
    }

    if let Some(expected) = expected_fingerprint {
        let recorded = metadata.fingerprint(&metadata.artifact_id);
        if recorded != Some(expected) {
            let mut report = ArtifactReport::new(ArtifactStatus::Outdated);
            report.expected_fingerprint = Some(expected.to_string());
            report.stored_fingerprint = recorded.map(str::to_string);
            return report;
        }
    }

    ArtifactReport::new(ArtifactStatus::Fresh)
}

/// Filesystem artifact store
///
/// Layout: one directory per artifact id under the root, holding `body` and
/// `meta.json`. Writes stage into a temporary sibling directory and rename it
/// into place.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn artifact_dir(&self, artifact_id: &str) -> PathBuf {
        self.root.join(artifact_id)
    }
}

#[async_trait::async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn write(
        &self,
        artifact: &ArtifactRef,
        body: &[u8],
        metadata: ArtifactMetadata,
    ) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;

        let staging = self
            .root
            .join(format!(".{}.tmp-{}", artifact.id, uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&staging).await?;
        tokio::fs::write(staging.join("body"), body).await?;
        let meta_json = serde_json::to_vec_pretty(&metadata)?;
        tokio::fs::write(staging.join("meta.json"), meta_json).await?;

        // Publish: replace any previous version, then rename the staged
        // directory into place
        let target = self.artifact_dir(&artifact.id);
        if tokio::fs::metadata(&target).await.is_ok() {
            tokio::fs::remove_dir_all(&target).await?;
        }
        tokio::fs::rename(&staging, &target).await?;
        debug!(artifact = %artifact.id, module = %metadata.module_id, "artifact written");
        Ok(())
    }

    async fn metadata(&self, artifact_id: &str) -> Result<Option<ArtifactMetadata>> {
        let path = self.artifact_dir(artifact_id).join("meta.json");
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn read(&self, artifact_id: &str) -> Result<Option<Vec<u8>>> {
        let path = self.artifact_dir(artifact_id).join("body");
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn exists(&self, artifact_id: &str) -> Result<bool> {
        Ok(tokio::fs::metadata(self.artifact_dir(artifact_id))
            .await
            .is_ok())
    }
}

/// In-memory artifact store for tests and single-process runs
#[derive(Default)]
pub struct InMemoryArtifactStore {
    entries: Mutex<HashMap<String, (Vec<u8>, ArtifactMetadata)>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored metadata for an artifact, leaving the body alone.
    /// Used by tests to simulate another process overwriting the slot.
    pub fn overwrite_metadata(&self, artifact_id: &str, metadata: ArtifactMetadata) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(artifact_id) {
            entry.1 = metadata;
        }
    }
}

#[async_trait::async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn write(
        &self,
        artifact: &ArtifactRef,
        body: &[u8],
        metadata: ArtifactMetadata,
    ) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(artifact.id.clone(), (body.to_vec(), metadata));
        Ok(())
    }

    async fn metadata(&self, artifact_id: &str) -> Result<Option<ArtifactMetadata>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries.get(artifact_id).map(|(_, meta)| meta.clone()))
    }

    async fn read(&self, artifact_id: &str) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries.get(artifact_id).map(|(body, _)| body.clone()))
    }

    async fn exists(&self, artifact_id: &str) -> Result<bool> {
        let entries = self.entries.lock().unwrap();
        Ok(entries.contains_key(artifact_id))
    }
}
