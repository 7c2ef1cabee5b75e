use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use mcat_core::{ChangeKey, ChangeRecord, EntityKind, MaterializedEntry, SnapshotId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::sync::Mutex;

use crate::{
    apply_batch, set_display_flags, upsert_changes, validate_snapshot_id, write_atomic,
    ChangeLogStore, MaterializedStateReader, MaterializedStateWriter, StateBatch, StorageError,
};

/// Layout: `<root>/state/<kind>.json` holds every entry of a kind and
/// `<root>/changes/<previous>__<current>.json` the records of one snapshot pair.
#[derive(Debug)]
pub struct FileStateStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn state_path(&self, kind: EntityKind) -> PathBuf {
        self.root.join("state").join(format!("{}.json", kind.as_str()))
    }

    fn changes_path(
        &self,
        previous: &SnapshotId,
        current: &SnapshotId,
    ) -> Result<PathBuf, StorageError> {
        validate_snapshot_id(previous)?;
        validate_snapshot_id(current)?;
        Ok(self
            .root
            .join("changes")
            .join(format!("{previous}__{current}.json")))
    }

    async fn read_entries(
        &self,
        kind: EntityKind,
    ) -> Result<BTreeMap<String, MaterializedEntry>, StorageError> {
        let entries: Vec<MaterializedEntry> = read_json_or_default(&self.state_path(kind)).await?;
        Ok(entries.into_iter().map(|e| (e.id.clone(), e)).collect())
    }

    async fn read_changes(
        &self,
        path: &Path,
    ) -> Result<BTreeMap<ChangeKey, ChangeRecord>, StorageError> {
        let records: Vec<ChangeRecord> = read_json_or_default(path).await?;
        Ok(records.into_iter().map(|r| (r.key(), r)).collect())
    }
}

async fn read_json_or_default<T: DeserializeOwned + Default>(
    path: &Path,
) -> Result<T, StorageError> {
    match fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| StorageError::serde(format!("parsing {}", path.display()), e)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(err) => Err(StorageError::io(path, err)),
    }
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| StorageError::serde(format!("serializing {}", path.display()), e))?;
    write_atomic(path, &bytes).await
}

#[async_trait]
impl MaterializedStateReader for FileStateStore {
    async fn list(&self, kind: EntityKind) -> Result<Vec<MaterializedEntry>, StorageError> {
        Ok(self.read_entries(kind).await?.into_values().collect())
    }
}

#[async_trait]
impl MaterializedStateWriter for FileStateStore {
    async fn apply(&self, kind: EntityKind, batch: StateBatch) -> Result<(), StorageError> {
        if batch.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;
        let mut entries = self.read_entries(kind).await?;
        apply_batch(&mut entries, kind, batch);
        let rows: Vec<&MaterializedEntry> = entries.values().collect();
        write_json(&self.state_path(kind), &rows).await
    }
}

#[async_trait]
impl ChangeLogStore for FileStateStore {
    async fn upsert(
        &self,
        previous: &SnapshotId,
        current: &SnapshotId,
        records: Vec<ChangeRecord>,
    ) -> Result<usize, StorageError> {
        let path = self.changes_path(previous, current)?;
        let _guard = self.write_lock.lock().await;
        let mut log = self.read_changes(&path).await?;
        let written = upsert_changes(&mut log, records);
        let rows: Vec<&ChangeRecord> = log.values().collect();
        write_json(&path, &rows).await?;
        Ok(written)
    }

    async fn list_pair(
        &self,
        previous: &SnapshotId,
        current: &SnapshotId,
    ) -> Result<Vec<ChangeRecord>, StorageError> {
        let path = self.changes_path(previous, current)?;
        Ok(self.read_changes(&path).await?.into_values().collect())
    }

    async fn set_display(
        &self,
        previous: &SnapshotId,
        current: &SnapshotId,
        flags: Vec<(ChangeKey, bool)>,
    ) -> Result<usize, StorageError> {
        let path = self.changes_path(previous, current)?;
        let _guard = self.write_lock.lock().await;
        let mut log = self.read_changes(&path).await?;
        let changed = set_display_flags(&mut log, flags);
        if changed > 0 {
            let rows: Vec<&ChangeRecord> = log.values().collect();
            write_json(&path, &rows).await?;
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use mcat_core::{CanonicalRecord, ChangeKind, ChangeOp};
    use serde_json::json;
    use tempfile::tempdir;

    fn applied_at() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc)
    }

    fn change(path: &str, after: i64) -> ChangeRecord {
        let key = ChangeKey {
            entity_type: EntityKind::Model,
            change_kind: ChangeKind::Update,
            entity_id: "acme/foo".into(),
            path: path.into(),
        };
        ChangeRecord {
            id: ChangeRecord::deterministic_id(&"s1".into(), &"s2".into(), &key),
            crawl_id: "s2".into(),
            previous_crawl_id: "s1".into(),
            entity_type: key.entity_type,
            change_kind: key.change_kind,
            entity_id: key.entity_id,
            path: key.path,
            path_level_1: Some("context_length".into()),
            path_level_2: None,
            operation: Some(ChangeOp::Replace),
            before: Some(json!(1)),
            after: Some(json!(after)),
            is_display: true,
        }
    }

    #[tokio::test]
    async fn state_round_trips_through_files() {
        let dir = tempdir().expect("tempdir");
        let store = FileStateStore::new(dir.path());
        assert!(store.list(EntityKind::Model).await.unwrap().is_empty());

        let mut batch = StateBatch::new("s1".into(), applied_at());
        batch.insert.push(CanonicalRecord {
            id: "acme/foo".into(),
            body: json!({"slug": "acme/foo"}),
        });
        store.apply(EntityKind::Model, batch).await.expect("apply");

        let reopened = FileStateStore::new(dir.path());
        let entries = reopened.list(EntityKind::Model).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_active());
    }

    #[tokio::test]
    async fn change_upserts_replace_on_key() {
        let dir = tempdir().expect("tempdir");
        let store = FileStateStore::new(dir.path());
        let (prev, cur) = (SnapshotId::new("s1"), SnapshotId::new("s2"));

        store
            .upsert(&prev, &cur, vec![change("context_length", 2)])
            .await
            .unwrap();
        store
            .upsert(&prev, &cur, vec![change("context_length", 3)])
            .await
            .unwrap();

        let records = store.list_pair(&prev, &cur).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].after, Some(json!(3)));

        let key = records[0].key();
        let changed = store
            .set_display(&prev, &cur, vec![(key.clone(), false), (key, false)])
            .await
            .unwrap();
        assert_eq!(changed, 1);
        assert!(!store.list_pair(&prev, &cur).await.unwrap()[0].is_display);
    }
}
