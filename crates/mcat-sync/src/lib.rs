use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use mcat_adapters::{
    load_raw_listing, validate_endpoints, validate_models, validate_providers, ValidationIssue,
    METRIC_LATENCY_MS, METRIC_THROUGHPUT_TPS, METRIC_UPTIME,
};
use mcat_core::{
    CanonicalRecord, ChangeRecord, EntityKind, MaterializedEntry, RollingWindow, SnapshotId,
};
use mcat_storage::{
    ChangeLogStore, FileStateStore, MaterializedStateStore, RawSnapshotSource, SnapshotArchive,
    StateBatch, StoredBundle,
};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod canonical;
pub mod consolidate;
pub mod diff;
pub mod display;
pub mod export;
pub mod kinds;
pub mod path;
pub mod reconcile;
pub mod window;

pub use canonical::CanonicalSnapshot;
pub use display::DisplayFilter;
pub use kinds::EntitySpec;
pub use reconcile::KindCounts;

pub const CRATE_NAME: &str = "mcat-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub archive_dir: PathBuf,
    pub state_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub write_chunk_size: usize,
    pub window_required_fields: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            archive_dir: PathBuf::from("./archive"),
            state_dir: PathBuf::from("./state"),
            workspace_root: PathBuf::from("."),
            write_chunk_size: 2000,
            window_required_fields: default_required_fields(),
        }
    }
}

fn default_required_fields() -> Vec<String> {
    [METRIC_UPTIME, METRIC_LATENCY_MS, METRIC_THROUGHPUT_TPS]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            archive_dir: std::env::var("MCAT_ARCHIVE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.archive_dir),
            state_dir: std::env::var("MCAT_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.state_dir),
            workspace_root: std::env::var("MCAT_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            write_chunk_size: std::env::var("MCAT_WRITE_CHUNK_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.write_chunk_size),
            window_required_fields: std::env::var("MCAT_WINDOW_REQUIRED_FIELDS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or(defaults.window_required_fields),
        }
    }

    pub fn export_dir(&self) -> PathBuf {
        self.state_dir.join("exports")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MaterializeSummary {
    pub run_id: Uuid,
    pub snapshot_id: SnapshotId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub kinds: BTreeMap<EntityKind, KindCounts>,
    pub issues: Vec<ValidationIssue>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiffSummary {
    pub previous: SnapshotId,
    pub current: SnapshotId,
    pub records: usize,
    pub displayed: usize,
    pub by_kind: BTreeMap<EntityKind, usize>,
}

impl DiffSummary {
    pub fn from_records(
        previous: &SnapshotId,
        current: &SnapshotId,
        records: &[ChangeRecord],
    ) -> Self {
        let mut by_kind = BTreeMap::new();
        for record in records {
            *by_kind.entry(record.entity_type).or_insert(0) += 1;
        }
        Self {
            previous: previous.clone(),
            current: current.clone(),
            records: records.len(),
            displayed: records.iter().filter(|r| r.is_display).count(),
            by_kind,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DiffOutcome {
    Skipped,
    Completed(DiffSummary),
    Failed { previous: SnapshotId, error: String },
}

impl DiffOutcome {
    pub fn summary(&self) -> Option<&DiffSummary> {
        match self {
            DiffOutcome::Completed(summary) => Some(summary),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PassSummary {
    pub materialize: MaterializeSummary,
    pub diff: DiffOutcome,
}

pub struct MaterializePipeline {
    config: SyncConfig,
    source: Arc<dyn RawSnapshotSource>,
    state: Arc<dyn MaterializedStateStore>,
    changes: Arc<dyn ChangeLogStore>,
    filter: DisplayFilter,
}

impl MaterializePipeline {
    pub fn new(
        config: SyncConfig,
        source: Arc<dyn RawSnapshotSource>,
        state: Arc<dyn MaterializedStateStore>,
        changes: Arc<dyn ChangeLogStore>,
    ) -> Self {
        Self {
            config,
            source,
            state,
            changes,
            filter: DisplayFilter::default(),
        }
    }

    pub fn with_display_filter(mut self, filter: DisplayFilter) -> Self {
        self.filter = filter;
        self
    }

    pub async fn previous_snapshot(&self, snapshot_id: &SnapshotId) -> Result<Option<SnapshotId>> {
        self.source
            .previous_snapshot(snapshot_id)
            .await
            .with_context(|| format!("looking up snapshot before {snapshot_id}"))
    }

    async fn fetch(&self, kind: EntityKind, snapshot_id: &SnapshotId) -> Result<Vec<JsonValue>> {
        self.source
            .get(kind, snapshot_id)
            .await
            .with_context(|| format!("loading {kind} bundle for snapshot {snapshot_id}"))
    }

    async fn prior_state(&self, kind: EntityKind) -> Result<Vec<MaterializedEntry>> {
        self.state
            .list(kind)
            .await
            .with_context(|| format!("reading materialized {kind} state"))
    }

    /// Endpoint stats are folded into `prior_windows`; an empty map gives a
    /// read-only rebuild of a historical snapshot.
    pub async fn build_canonical(
        &self,
        snapshot_id: &SnapshotId,
        prior_windows: &HashMap<String, RollingWindow>,
    ) -> Result<CanonicalSnapshot> {
        let (raw_models, raw_endpoints, raw_providers) = tokio::try_join!(
            self.fetch(EntityKind::Model, snapshot_id),
            self.fetch(EntityKind::Endpoint, snapshot_id),
            self.fetch(EntityKind::Provider, snapshot_id),
        )?;

        let models = validate_models(snapshot_id, &raw_models);
        let providers = validate_providers(snapshot_id, &raw_providers);
        let endpoints = validate_endpoints(snapshot_id, &raw_endpoints);
        let mut issues = models.issues;
        issues.extend(providers.issues);
        issues.extend(endpoints.issues);

        let consolidated = consolidate::consolidate_models(models.items);
        let provider_slugs: HashSet<&str> =
            providers.items.iter().map(|p| p.slug.as_str()).collect();

        let mut canonical_endpoints = Vec::with_capacity(endpoints.items.len());
        for draft in endpoints.items {
            let uuid = draft.uuid.clone();
            match canonical::build_endpoint(
                draft,
                &consolidated,
                &provider_slugs,
                prior_windows.get(&uuid),
                &self.config.window_required_fields,
            ) {
                Ok(endpoint) => canonical_endpoints.push(endpoint),
                Err(err) => {
                    debug!(%snapshot_id, endpoint = %uuid, error = %err, "excluded endpoint");
                    issues.push(ValidationIssue::new(
                        EntityKind::Endpoint,
                        snapshot_id,
                        None,
                        Some(uuid),
                        &err,
                    ));
                }
            }
        }

        Ok(CanonicalSnapshot {
            snapshot_id: snapshot_id.clone(),
            models: consolidated.models,
            endpoints: canonical_endpoints,
            providers: providers.items,
            issues,
        })
    }

    pub async fn materialize(&self, snapshot_id: &SnapshotId) -> Result<MaterializeSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("materialize", %run_id, %snapshot_id);
        async move {
            let started_at = Utc::now();
            let (prior_models, prior_endpoints, prior_providers) = tokio::try_join!(
                self.prior_state(EntityKind::Model),
                self.prior_state(EntityKind::Endpoint),
                self.prior_state(EntityKind::Provider),
            )?;

            let windows = canonical::prior_windows(
                prior_endpoints
                    .iter()
                    .map(|entry| (entry.id.as_str(), &entry.entity)),
            );
            let canonical = self.build_canonical(snapshot_id, &windows).await?;
            for issue in &canonical.issues {
                warn!(
                    kind = %issue.kind,
                    identifier = ?issue.identifier,
                    index = ?issue.record_index,
                    message = %issue.message,
                    "record excluded from pass"
                );
            }

            let applied_at = Utc::now();
            let (models, endpoints, providers) = tokio::try_join!(
                self.reconcile_kind(EntityKind::Model, &canonical, &prior_models, applied_at),
                self.reconcile_kind(EntityKind::Endpoint, &canonical, &prior_endpoints, applied_at),
                self.reconcile_kind(EntityKind::Provider, &canonical, &prior_providers, applied_at),
            )?;

            let kinds = BTreeMap::from([
                (EntityKind::Model, models),
                (EntityKind::Endpoint, endpoints),
                (EntityKind::Provider, providers),
            ]);
            info!(issues = canonical.issues.len(), "materialization pass complete");
            Ok::<_, anyhow::Error>(MaterializeSummary {
                run_id,
                snapshot_id: snapshot_id.clone(),
                started_at,
                finished_at: Utc::now(),
                kinds,
                issues: canonical.issues,
            })
        }
        .instrument(span)
        .await
    }

    async fn reconcile_kind(
        &self,
        kind: EntityKind,
        canonical: &CanonicalSnapshot,
        previous: &[MaterializedEntry],
        applied_at: DateTime<Utc>,
    ) -> Result<KindCounts> {
        let descriptor = EntitySpec::for_kind(kind);
        let next = canonical
            .records(kind)
            .with_context(|| format!("encoding canonical {kind} entities"))?;
        let outcome =
            reconcile::reconcile(kind, next, previous, |a, b| descriptor.state_equal(a, b));
        let counts = outcome.counts();

        let mut batch = StateBatch::new(canonical.snapshot_id.clone(), applied_at);
        let mut chunks = 0usize;
        let inserts = outcome.to_insert.into_iter().map(Pending::Insert);
        let updates = outcome.to_update.into_iter().map(Pending::Update);
        let retires = outcome.to_retire.into_iter().map(Pending::Retire);
        for pending in inserts.chain(updates).chain(retires) {
            match pending {
                Pending::Insert(record) => batch.insert.push(record),
                Pending::Update(record) => batch.update.push(record),
                Pending::Retire(id) => batch.retire.push(id),
            }
            if batch.len() >= self.config.write_chunk_size {
                self.write_chunk(kind, &mut batch).await?;
                chunks += 1;
            }
        }
        if !batch.is_empty() {
            self.write_chunk(kind, &mut batch).await?;
            chunks += 1;
        }

        info!(
            %kind,
            inserted = counts.inserted,
            updated = counts.updated,
            stable = counts.stable,
            retired = counts.retired,
            chunks,
            "reconciled kind"
        );
        Ok(counts)
    }

    async fn write_chunk(&self, kind: EntityKind, batch: &mut StateBatch) -> Result<()> {
        let next = StateBatch::new(batch.snapshot_id.clone(), batch.applied_at);
        let chunk = std::mem::replace(batch, next);
        let size = chunk.len();
        self.state
            .apply(kind, chunk)
            .await
            .with_context(|| format!("writing {size} {kind} state changes"))
    }

    pub async fn diff_pair(
        &self,
        previous: &SnapshotId,
        current: &SnapshotId,
    ) -> Result<Vec<ChangeRecord>> {
        let span = info_span!("diff_pair", %previous, %current);
        async move {
            let no_windows = HashMap::new();
            let (before, after) = tokio::try_join!(
                self.build_canonical(previous, &no_windows),
                self.build_canonical(current, &no_windows),
            )?;
            debug!(
                previous_issues = before.issues.len(),
                current_issues = after.issues.len(),
                "rebuilt canonical snapshots"
            );

            let mut records = Vec::new();
            for kind in EntityKind::all() {
                let descriptor = EntitySpec::for_kind(kind);
                let prev_records = encode(&before, kind)?;
                let cur_records = encode(&after, kind)?;
                records.extend(descriptor.diff(&prev_records, &cur_records, previous, current));
            }
            self.filter.apply(&mut records);

            let written = self
                .changes
                .upsert(previous, current, records.clone())
                .await
                .with_context(|| format!("persisting change records for {previous}..{current}"))?;
            let displayed = records.iter().filter(|r| r.is_display).count();
            info!(records = records.len(), displayed, written, "diffed snapshot pair");
            Ok::<_, anyhow::Error>(records)
        }
        .instrument(span)
        .await
    }

    /// Materialization and the diff against the previous snapshot run side by
    /// side. Only a materialization failure fails the pass.
    pub async fn run_pass(&self, snapshot_id: &SnapshotId) -> Result<PassSummary> {
        let Some(previous) = self.previous_snapshot(snapshot_id).await? else {
            info!(%snapshot_id, "no earlier snapshot; skipping diff");
            return Ok(PassSummary {
                materialize: self.materialize(snapshot_id).await?,
                diff: DiffOutcome::Skipped,
            });
        };

        let (materialize, records) = tokio::join!(
            self.materialize(snapshot_id),
            self.diff_pair(&previous, snapshot_id),
        );
        let diff = match records {
            Ok(records) => {
                DiffOutcome::Completed(DiffSummary::from_records(&previous, snapshot_id, &records))
            }
            Err(err) => {
                let error = format!("{err:#}");
                warn!(%previous, %snapshot_id, %error, "diff failed; materialization unaffected");
                DiffOutcome::Failed { previous, error }
            }
        };
        Ok(PassSummary {
            materialize: materialize?,
            diff,
        })
    }

    pub async fn recompute_display(
        &self,
        previous: &SnapshotId,
        current: &SnapshotId,
    ) -> Result<usize> {
        let records = self
            .changes
            .list_pair(previous, current)
            .await
            .with_context(|| format!("reading change records for {previous}..{current}"))?;
        let flags = self.filter.recompute(&records);
        if flags.is_empty() {
            return Ok(0);
        }
        let changed = self
            .changes
            .set_display(previous, current, flags)
            .await
            .with_context(|| format!("updating display flags for {previous}..{current}"))?;
        info!(%previous, %current, changed, "recomputed display flags");
        Ok(changed)
    }

    pub async fn export(
        &self,
        snapshot_id: &SnapshotId,
        out_dir: Option<PathBuf>,
    ) -> Result<PathBuf> {
        let previous = self.previous_snapshot(snapshot_id).await?;
        let changes = match &previous {
            Some(previous) => self
                .changes
                .list_pair(previous, snapshot_id)
                .await
                .with_context(|| format!("reading change records for {previous}..{snapshot_id}"))?,
            None => Vec::new(),
        };
        let mut state = Vec::new();
        for kind in EntityKind::all() {
            state.extend(self.prior_state(kind).await?);
        }

        let dir = out_dir.unwrap_or_else(|| self.config.export_dir().join(snapshot_id.as_str()));
        let manifest =
            export::export_snapshot(&dir, snapshot_id, previous.as_ref(), &changes, &state)?;
        info!(
            %snapshot_id,
            changes = changes.len(),
            entries = state.len(),
            manifest = %manifest.display(),
            "exported parquet snapshot"
        );
        Ok(manifest)
    }
}

enum Pending {
    Insert(CanonicalRecord),
    Update(CanonicalRecord),
    Retire(String),
}

fn encode(snapshot: &CanonicalSnapshot, kind: EntityKind) -> Result<Vec<CanonicalRecord>> {
    snapshot
        .records(kind)
        .with_context(|| format!("encoding {kind} entities of snapshot {}", snapshot.snapshot_id))
}

pub async fn ingest_listing(
    archive: &SnapshotArchive,
    kind: EntityKind,
    snapshot_id: &SnapshotId,
    path: &Path,
) -> Result<StoredBundle> {
    let records = load_raw_listing(path)?;
    let bundle = archive
        .store_records(kind, snapshot_id, &records)
        .await
        .with_context(|| {
            format!("archiving {} as {kind} bundle of {snapshot_id}", path.display())
        })?;
    info!(
        %snapshot_id,
        %kind,
        records = bundle.record_count,
        deduplicated = bundle.deduplicated,
        hash = %bundle.content_hash,
        "ingested raw listing"
    );
    Ok(bundle)
}

pub fn pipeline_from_env() -> Result<MaterializePipeline> {
    let config = SyncConfig::from_env();
    let filter = DisplayFilter::from_workspace_root(&config.workspace_root)?;
    let source = Arc::new(SnapshotArchive::new(config.archive_dir.clone()));
    let store = Arc::new(FileStateStore::new(config.state_dir.clone()));
    Ok(MaterializePipeline::new(config, source, store.clone(), store).with_display_filter(filter))
}

pub async fn run_pass_from_env(snapshot_id: &SnapshotId) -> Result<PassSummary> {
    pipeline_from_env()?.run_pass(snapshot_id).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_requires_all_stats_fields() {
        let config = SyncConfig::default();
        assert_eq!(config.write_chunk_size, 2000);
        assert_eq!(
            config.window_required_fields,
            vec!["uptime", "latency_ms", "throughput_tps"]
        );
        assert_eq!(config.export_dir(), PathBuf::from("./state").join("exports"));
    }

    #[test]
    fn diff_summary_counts_by_kind() {
        let (prev, cur) = (SnapshotId::new("s1"), SnapshotId::new("s2"));
        let summary = DiffSummary::from_records(&prev, &cur, &[]);
        assert_eq!(summary.records, 0);
        assert!(summary.by_kind.is_empty());
    }
}
