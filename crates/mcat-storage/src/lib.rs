use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mcat_core::{
    CanonicalRecord, ChangeKey, ChangeRecord, EntityKind, Lifecycle, MaterializedEntry, SnapshotId,
};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

mod archive;
mod file_state;
mod memory;

pub use archive::{SnapshotArchive, StoredBundle};
pub use file_state::FileStateStore;
pub use memory::{MemorySnapshotSource, MemoryStateStore};

pub const CRATE_NAME: &str = "mcat-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("snapshot {snapshot_id} has no {kind} bundle")]
    MissingSnapshot {
        kind: EntityKind,
        snapshot_id: SnapshotId,
    },
    #[error("invalid snapshot id {0:?}")]
    InvalidSnapshotId(String),
    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{context}: {source}")]
    Serde {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn serde(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Serde {
            context: context.into(),
            source,
        }
    }

    pub fn is_missing_snapshot(&self) -> bool {
        matches!(self, StorageError::MissingSnapshot { .. })
    }
}

/// Yields raw upstream records per entity kind for a logical snapshot.
/// Must return the same records for the same snapshot id on every call.
#[async_trait]
pub trait RawSnapshotSource: Send + Sync {
    async fn get(
        &self,
        kind: EntityKind,
        snapshot_id: &SnapshotId,
    ) -> Result<Vec<JsonValue>, StorageError>;

    async fn list_snapshots(&self) -> Result<Vec<SnapshotId>, StorageError>;

    async fn previous_snapshot(
        &self,
        snapshot_id: &SnapshotId,
    ) -> Result<Option<SnapshotId>, StorageError> {
        let ids = self.list_snapshots().await?;
        Ok(ids.into_iter().filter(|id| id < snapshot_id).max())
    }
}

#[async_trait]
pub trait MaterializedStateReader: Send + Sync {
    async fn list(&self, kind: EntityKind) -> Result<Vec<MaterializedEntry>, StorageError>;
}

#[derive(Debug, Clone)]
pub struct StateBatch {
    pub snapshot_id: SnapshotId,
    pub applied_at: DateTime<Utc>,
    pub insert: Vec<CanonicalRecord>,
    pub update: Vec<CanonicalRecord>,
    pub retire: Vec<String>,
}

impl StateBatch {
    pub fn new(snapshot_id: SnapshotId, applied_at: DateTime<Utc>) -> Self {
        Self {
            snapshot_id,
            applied_at,
            insert: Vec::new(),
            update: Vec::new(),
            retire: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.insert.len() + self.update.len() + self.retire.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
pub trait MaterializedStateWriter: Send + Sync {
    async fn apply(&self, kind: EntityKind, batch: StateBatch) -> Result<(), StorageError>;
}

pub trait MaterializedStateStore: MaterializedStateReader + MaterializedStateWriter {}

impl<T: MaterializedStateReader + MaterializedStateWriter> MaterializedStateStore for T {}

#[async_trait]
pub trait ChangeLogStore: Send + Sync {
    async fn upsert(
        &self,
        previous: &SnapshotId,
        current: &SnapshotId,
        records: Vec<ChangeRecord>,
    ) -> Result<usize, StorageError>;

    async fn list_pair(
        &self,
        previous: &SnapshotId,
        current: &SnapshotId,
    ) -> Result<Vec<ChangeRecord>, StorageError>;

    async fn set_display(
        &self,
        previous: &SnapshotId,
        current: &SnapshotId,
        flags: Vec<(ChangeKey, bool)>,
    ) -> Result<usize, StorageError>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub(crate) fn validate_snapshot_id(id: &SnapshotId) -> Result<(), StorageError> {
    let raw = id.as_str();
    if raw.is_empty()
        || raw.starts_with('.')
        || raw.contains(['/', '\\'])
        || raw.contains("..")
    {
        return Err(StorageError::InvalidSnapshotId(raw.to_string()));
    }
    Ok(())
}

pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let parent = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&parent)
        .await
        .map_err(|e| StorageError::io(&parent, e))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(|e| StorageError::io(&temp_path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| StorageError::io(&temp_path, e))?;
    file.flush()
        .await
        .map_err(|e| StorageError::io(&temp_path, e))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StorageError::io(path, err));
    }
    Ok(())
}

/// Applies one batch to a kind's id-keyed entries.
pub(crate) fn apply_batch(
    entries: &mut BTreeMap<String, MaterializedEntry>,
    kind: EntityKind,
    batch: StateBatch,
) {
    let StateBatch {
        snapshot_id,
        applied_at,
        insert,
        update,
        retire,
    } = batch;

    for record in insert.into_iter().chain(update) {
        entries.insert(
            record.id.clone(),
            MaterializedEntry {
                kind,
                id: record.id,
                entity: record.body,
                lifecycle: Lifecycle::Active,
                snapshot_id: snapshot_id.clone(),
                updated_at: applied_at,
            },
        );
    }

    for id in retire {
        if let Some(entry) = entries.get_mut(&id) {
            if entry.is_active() {
                entry.lifecycle = Lifecycle::Retired {
                    unavailable_at: applied_at,
                };
                entry.updated_at = applied_at;
            }
        }
    }
}

pub(crate) fn upsert_changes(
    log: &mut BTreeMap<ChangeKey, ChangeRecord>,
    records: Vec<ChangeRecord>,
) -> usize {
    let written = records.len();
    for record in records {
        log.insert(record.key(), record);
    }
    written
}

pub(crate) fn set_display_flags(
    log: &mut BTreeMap<ChangeKey, ChangeRecord>,
    flags: Vec<(ChangeKey, bool)>,
) -> usize {
    let mut changed = 0;
    for (key, is_display) in flags {
        if let Some(record) = log.get_mut(&key) {
            if record.is_display != is_display {
                record.is_display = is_display;
                changed += 1;
            }
        }
    }
    changed
}
