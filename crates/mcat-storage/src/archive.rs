use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use async_trait::async_trait;
use mcat_core::{EntityKind, SnapshotId};
use serde_json::Value as JsonValue;
use tokio::fs;
use tracing::debug;

use crate::{sha256_hex, validate_snapshot_id, write_atomic, RawSnapshotSource, StorageError};

#[derive(Debug, Clone)]
pub struct StoredBundle {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub record_count: usize,
    pub deduplicated: bool,
}

/// Raw per-kind snapshot bundles laid out as `<root>/<snapshot_id>/<kind>.json`.
#[derive(Debug, Clone)]
pub struct SnapshotArchive {
    root: PathBuf,
}

impl SnapshotArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bundle_relative_path(&self, kind: EntityKind, snapshot_id: &SnapshotId) -> PathBuf {
        PathBuf::from(snapshot_id.as_str()).join(format!("{}.json", kind.as_str()))
    }

    pub async fn store_records(
        &self,
        kind: EntityKind,
        snapshot_id: &SnapshotId,
        records: &[JsonValue],
    ) -> anyhow::Result<StoredBundle> {
        validate_snapshot_id(snapshot_id)?;
        let bytes = serde_json::to_vec_pretty(records)
            .with_context(|| format!("serializing {kind} bundle for {snapshot_id}"))?;
        let content_hash = sha256_hex(&bytes);
        let relative_path = self.bundle_relative_path(kind, snapshot_id);
        let absolute_path = self.root.join(&relative_path);

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking bundle path {}", absolute_path.display()))?
        {
            let existing = fs::read(&absolute_path)
                .await
                .with_context(|| format!("reading bundle {}", absolute_path.display()))?;
            if sha256_hex(&existing) != content_hash {
                bail!(
                    "snapshot {snapshot_id} already holds a different {kind} bundle at {}",
                    absolute_path.display()
                );
            }
            return Ok(StoredBundle {
                content_hash,
                relative_path,
                absolute_path,
                record_count: records.len(),
                deduplicated: true,
            });
        }

        write_atomic(&absolute_path, &bytes)
            .await
            .with_context(|| format!("writing bundle {}", absolute_path.display()))?;
        debug!(%snapshot_id, %kind, records = records.len(), "stored snapshot bundle");

        Ok(StoredBundle {
            content_hash,
            relative_path,
            absolute_path,
            record_count: records.len(),
            deduplicated: false,
        })
    }
}

#[async_trait]
impl RawSnapshotSource for SnapshotArchive {
    async fn get(
        &self,
        kind: EntityKind,
        snapshot_id: &SnapshotId,
    ) -> Result<Vec<JsonValue>, StorageError> {
        validate_snapshot_id(snapshot_id)?;
        let path = self.root.join(self.bundle_relative_path(kind, snapshot_id));
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::MissingSnapshot {
                    kind,
                    snapshot_id: snapshot_id.clone(),
                })
            }
            Err(err) => return Err(StorageError::io(path, err)),
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| StorageError::serde(format!("parsing {}", path.display()), e))
    }

    async fn list_snapshots(&self) -> Result<Vec<SnapshotId>, StorageError> {
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StorageError::io(&self.root, err)),
        };
        let mut ids = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| StorageError::io(&self.root, e))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map(|ft| ft.is_dir())
                .unwrap_or(false);
            let name = entry.file_name().to_string_lossy().to_string();
            if is_dir && !name.starts_with('.') {
                ids.push(SnapshotId::new(name));
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn identical_bundles_deduplicate() {
        let dir = tempdir().expect("tempdir");
        let archive = SnapshotArchive::new(dir.path());
        let records = vec![json!({"slug": "acme"})];

        let first = archive
            .store_records(EntityKind::Provider, &"s1".into(), &records)
            .await
            .expect("first store");
        let second = archive
            .store_records(EntityKind::Provider, &"s1".into(), &records)
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.content_hash, second.content_hash);
        assert!(first.absolute_path.exists());
    }

    #[tokio::test]
    async fn bundles_are_immutable() {
        let dir = tempdir().expect("tempdir");
        let archive = SnapshotArchive::new(dir.path());
        archive
            .store_records(EntityKind::Model, &"s1".into(), &[json!({"slug": "a"})])
            .await
            .expect("store");
        let err = archive
            .store_records(EntityKind::Model, &"s1".into(), &[json!({"slug": "b"})])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("different model bundle"));
    }

    #[tokio::test]
    async fn missing_bundle_is_a_missing_snapshot_error() {
        let dir = tempdir().expect("tempdir");
        let archive = SnapshotArchive::new(dir.path());
        archive
            .store_records(EntityKind::Model, &"s1".into(), &[])
            .await
            .expect("store");

        let err = archive
            .get(EntityKind::Endpoint, &"s1".into())
            .await
            .unwrap_err();
        assert!(err.is_missing_snapshot());
        assert!(archive.get(EntityKind::Model, &"s1".into()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn previous_snapshot_is_greatest_smaller_id() {
        let dir = tempdir().expect("tempdir");
        let archive = SnapshotArchive::new(dir.path());
        for id in ["2026-03-01T06", "2026-03-01T12", "2026-03-01T18"] {
            archive
                .store_records(EntityKind::Model, &id.into(), &[])
                .await
                .expect("store");
        }

        assert_eq!(archive.list_snapshots().await.unwrap().len(), 3);
        let prev = archive
            .previous_snapshot(&"2026-03-01T18".into())
            .await
            .unwrap();
        assert_eq!(prev, Some(SnapshotId::new("2026-03-01T12")));
        assert_eq!(
            archive.previous_snapshot(&"2026-03-01T06".into()).await.unwrap(),
            None
        );
    }
}
