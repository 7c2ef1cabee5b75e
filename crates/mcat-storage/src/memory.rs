use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use mcat_core::{ChangeKey, ChangeRecord, EntityKind, MaterializedEntry, SnapshotId};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;

use crate::{
    apply_batch, set_display_flags, upsert_changes, ChangeLogStore, MaterializedStateReader,
    MaterializedStateWriter, RawSnapshotSource, StateBatch, StorageError,
};

#[derive(Debug, Default)]
pub struct MemorySnapshotSource {
    bundles: Mutex<BTreeMap<(SnapshotId, EntityKind), Vec<JsonValue>>>,
}

impl MemorySnapshotSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bundle(
        mut self,
        snapshot_id: impl Into<SnapshotId>,
        kind: EntityKind,
        records: Vec<JsonValue>,
    ) -> Self {
        self.bundles
            .get_mut()
            .insert((snapshot_id.into(), kind), records);
        self
    }
}

#[async_trait]
impl RawSnapshotSource for MemorySnapshotSource {
    async fn get(
        &self,
        kind: EntityKind,
        snapshot_id: &SnapshotId,
    ) -> Result<Vec<JsonValue>, StorageError> {
        self.bundles
            .lock()
            .await
            .get(&(snapshot_id.clone(), kind))
            .cloned()
            .ok_or_else(|| StorageError::MissingSnapshot {
                kind,
                snapshot_id: snapshot_id.clone(),
            })
    }

    async fn list_snapshots(&self) -> Result<Vec<SnapshotId>, StorageError> {
        let mut ids: Vec<SnapshotId> = self
            .bundles
            .lock()
            .await
            .keys()
            .map(|(id, _)| id.clone())
            .collect();
        ids.dedup();
        Ok(ids)
    }
}

type PairKey = (SnapshotId, SnapshotId);

#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: Mutex<HashMap<EntityKind, BTreeMap<String, MaterializedEntry>>>,
    changes: Mutex<BTreeMap<PairKey, BTreeMap<ChangeKey, ChangeRecord>>>,
    batches_applied: AtomicUsize,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches_applied(&self) -> usize {
        self.batches_applied.load(Ordering::Relaxed)
    }

    pub async fn entry(&self, kind: EntityKind, id: &str) -> Option<MaterializedEntry> {
        self.state
            .lock()
            .await
            .get(&kind)
            .and_then(|entries| entries.get(id))
            .cloned()
    }
}

#[async_trait]
impl MaterializedStateReader for MemoryStateStore {
    async fn list(&self, kind: EntityKind) -> Result<Vec<MaterializedEntry>, StorageError> {
        Ok(self
            .state
            .lock()
            .await
            .get(&kind)
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl MaterializedStateWriter for MemoryStateStore {
    async fn apply(&self, kind: EntityKind, batch: StateBatch) -> Result<(), StorageError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        apply_batch(state.entry(kind).or_default(), kind, batch);
        self.batches_applied.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl ChangeLogStore for MemoryStateStore {
    async fn upsert(
        &self,
        previous: &SnapshotId,
        current: &SnapshotId,
        records: Vec<ChangeRecord>,
    ) -> Result<usize, StorageError> {
        let mut changes = self.changes.lock().await;
        let log = changes
            .entry((previous.clone(), current.clone()))
            .or_default();
        Ok(upsert_changes(log, records))
    }

    async fn list_pair(
        &self,
        previous: &SnapshotId,
        current: &SnapshotId,
    ) -> Result<Vec<ChangeRecord>, StorageError> {
        Ok(self
            .changes
            .lock()
            .await
            .get(&(previous.clone(), current.clone()))
            .map(|log| log.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_display(
        &self,
        previous: &SnapshotId,
        current: &SnapshotId,
        flags: Vec<(ChangeKey, bool)>,
    ) -> Result<usize, StorageError> {
        let mut changes = self.changes.lock().await;
        Ok(changes
            .get_mut(&(previous.clone(), current.clone()))
            .map(|log| set_display_flags(log, flags))
            .unwrap_or(0))
    }
}
