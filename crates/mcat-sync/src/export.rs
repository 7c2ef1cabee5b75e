use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use mcat_core::{ChangeRecord, MaterializedEntry, SnapshotId};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CHANGE_RECORDS_FILE: &str = "change_records.parquet";
pub const MATERIALIZED_STATE_FILE: &str = "materialized_state.parquet";
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportManifest {
    pub schema_version: u32,
    pub snapshot_id: SnapshotId,
    pub previous_snapshot_id: Option<SnapshotId>,
    pub files: Vec<ExportManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn json_text(value: Option<&serde_json::Value>) -> Result<Option<String>> {
    value
        .map(serde_json::to_string)
        .transpose()
        .context("serializing change value")
}

pub fn write_change_records_parquet(path: &Path, records: &[ChangeRecord]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Utf8, false),
        ArrowField::new("crawl_id", DataType::Utf8, false),
        ArrowField::new("previous_crawl_id", DataType::Utf8, false),
        ArrowField::new("entity_type", DataType::Utf8, false),
        ArrowField::new("change_kind", DataType::Utf8, false),
        ArrowField::new("entity_id", DataType::Utf8, false),
        ArrowField::new("path", DataType::Utf8, false),
        ArrowField::new("path_level_1", DataType::Utf8, true),
        ArrowField::new("path_level_2", DataType::Utf8, true),
        ArrowField::new("operation", DataType::Utf8, true),
        ArrowField::new("before", DataType::Utf8, true),
        ArrowField::new("after", DataType::Utf8, true),
        ArrowField::new("is_display", DataType::Boolean, false),
    ]));

    let ids: Vec<String> = records.iter().map(|r| r.id.to_string()).collect();
    let befores = records
        .iter()
        .map(|r| json_text(r.before.as_ref()))
        .collect::<Result<Vec<_>>>()?;
    let afters = records
        .iter()
        .map(|r| json_text(r.after.as_ref()))
        .collect::<Result<Vec<_>>>()?;

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from_iter_values(ids.iter())),
            Arc::new(StringArray::from_iter_values(records.iter().map(|r| r.crawl_id.as_str()))),
            Arc::new(StringArray::from_iter_values(
                records.iter().map(|r| r.previous_crawl_id.as_str()),
            )),
            Arc::new(StringArray::from_iter_values(records.iter().map(|r| r.entity_type.as_str()))),
            Arc::new(StringArray::from_iter_values(records.iter().map(|r| r.change_kind.as_str()))),
            Arc::new(StringArray::from_iter_values(records.iter().map(|r| r.entity_id.as_str()))),
            Arc::new(StringArray::from_iter_values(records.iter().map(|r| r.path.as_str()))),
            Arc::new(StringArray::from(
                records.iter().map(|r| r.path_level_1.as_deref()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                records.iter().map(|r| r.path_level_2.as_deref()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                records
                    .iter()
                    .map(|r| r.operation.map(|op| op.as_str()))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(befores)),
            Arc::new(StringArray::from(afters)),
            Arc::new(BooleanArray::from(
                records.iter().map(|r| r.is_display).collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building change records batch")?;
    write_parquet(path, batch)
}

pub fn write_materialized_state_parquet(path: &Path, entries: &[MaterializedEntry]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("kind", DataType::Utf8, false),
        ArrowField::new("id", DataType::Utf8, false),
        ArrowField::new("active", DataType::Boolean, false),
        ArrowField::new("unavailable_at", DataType::Utf8, true),
        ArrowField::new("snapshot_id", DataType::Utf8, false),
        ArrowField::new("updated_at", DataType::Utf8, false),
        ArrowField::new("entity", DataType::Utf8, false),
    ]));

    let unavailable: Vec<Option<String>> = entries
        .iter()
        .map(|e| e.unavailable_at().map(|ts| ts.to_rfc3339()))
        .collect();
    let updated: Vec<String> = entries.iter().map(|e| e.updated_at.to_rfc3339()).collect();
    let bodies = entries
        .iter()
        .map(|e| serde_json::to_string(&e.entity))
        .collect::<Result<Vec<_>, _>>()
        .context("serializing materialized entities")?;

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from_iter_values(entries.iter().map(|e| e.kind.as_str()))),
            Arc::new(StringArray::from_iter_values(entries.iter().map(|e| e.id.as_str()))),
            Arc::new(BooleanArray::from(
                entries.iter().map(|e| e.is_active()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(unavailable)),
            Arc::new(StringArray::from_iter_values(entries.iter().map(|e| e.snapshot_id.as_str()))),
            Arc::new(StringArray::from_iter_values(updated.iter())),
            Arc::new(StringArray::from_iter_values(bodies.iter())),
        ],
    )
    .context("building materialized state batch")?;
    write_parquet(path, batch)
}

pub fn manifest_entry(
    name: &str,
    base_dir: &Path,
    path: &Path,
    rows: usize,
) -> Result<ExportManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(base_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ExportManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
        rows,
    })
}

pub fn export_snapshot(
    dir: &Path,
    snapshot_id: &SnapshotId,
    previous_snapshot_id: Option<&SnapshotId>,
    changes: &[ChangeRecord],
    state: &[MaterializedEntry],
) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let changes_path = dir.join(CHANGE_RECORDS_FILE);
    let state_path = dir.join(MATERIALIZED_STATE_FILE);

    write_change_records_parquet(&changes_path, changes)?;
    write_materialized_state_parquet(&state_path, state)?;

    let manifest = ExportManifest {
        schema_version: 1,
        snapshot_id: snapshot_id.clone(),
        previous_snapshot_id: previous_snapshot_id.cloned(),
        files: vec![
            manifest_entry("change_records", dir, &changes_path, changes.len())?,
            manifest_entry("materialized_state", dir, &state_path, state.len())?,
        ],
    };
    let manifest_path = dir.join(MANIFEST_FILE);
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing export manifest")?;
    std::fs::write(&manifest_path, bytes)
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}
