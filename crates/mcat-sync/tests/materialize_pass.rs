use std::sync::Arc;

use mcat_core::{ChangeKind, ChangeOp, EntityKind, SnapshotId};
use mcat_storage::{ChangeLogStore, MemorySnapshotSource, MemoryStateStore, StorageError};
use mcat_sync::{DiffOutcome, DisplayFilter, KindCounts, MaterializePipeline, SyncConfig};
use serde_json::{json, Value};

fn models() -> Vec<Value> {
    vec![
        json!({
            "slug": "acme/foo",
            "name": "Foo",
            "variant": "standard",
            "created_at": "2026-01-01T00:00:00Z",
            "input_modalities": ["text", "image"],
            "output_modalities": ["text"]
        }),
        json!({
            "slug": "acme/foo:free",
            "name": "Foo (free)",
            "variant": "free",
            "created_at": "2026-01-02T00:00:00Z",
            "input_modalities": ["text", "image"],
            "output_modalities": ["text"]
        }),
    ]
}

fn providers() -> Vec<Value> {
    vec![json!({"slug": "acme", "name": "Acme AI", "regions": ["us"]})]
}

fn endpoint(uuid: &str, model: &str, prompt: &str, status: i64, observed_at: &str) -> Value {
    json!({
        "uuid": uuid,
        "model_slug": model,
        "provider_slug": "acme",
        "pricing": {"prompt": prompt, "completion": "0.2"},
        "supported_parameters": ["tools", "temperature"],
        "status": status,
        "stats": {
            "observed_at": observed_at,
            "uptime": 99.0,
            "p50_latency": 300.0,
            "p50_throughput": 50.0
        }
    })
}

fn snapshot(source: MemorySnapshotSource, id: &str, endpoints: Vec<Value>) -> MemorySnapshotSource {
    source
        .with_bundle(id, EntityKind::Model, models())
        .with_bundle(id, EntityKind::Provider, providers())
        .with_bundle(id, EntityKind::Endpoint, endpoints)
}

/// s1: two endpoints. s2: ep-1 repriced and degraded, ep-2 gone. s3: ep-2 back unchanged.
fn catalog() -> Arc<MemorySnapshotSource> {
    let ep1 = endpoint("ep-1", "acme/foo", "0.1", 0, "2026-03-01T10:15:00Z");
    let ep2 = endpoint("ep-2", "acme/foo:free", "0", 0, "2026-03-01T10:20:00Z");
    let ep1_s2 = endpoint("ep-1", "acme/foo", "0.3", -1, "2026-03-01T11:05:00Z");

    let source = MemorySnapshotSource::new();
    let source = snapshot(source, "s1", vec![ep1, ep2.clone()]);
    let source = snapshot(source, "s2", vec![ep1_s2.clone()]);
    let source = snapshot(source, "s3", vec![ep1_s2, ep2]);
    Arc::new(source)
}

fn pipeline(
    source: Arc<MemorySnapshotSource>,
    store: Arc<MemoryStateStore>,
    chunk: usize,
) -> MaterializePipeline {
    let config = SyncConfig {
        write_chunk_size: chunk,
        ..SyncConfig::default()
    };
    MaterializePipeline::new(config, source, store.clone(), store)
}

fn counts(inserted: usize, updated: usize, stable: usize, retired: usize) -> KindCounts {
    KindCounts {
        inserted,
        updated,
        stable,
        retired,
    }
}

#[tokio::test]
async fn first_run_inserts_everything() {
    let store = Arc::new(MemoryStateStore::new());
    let summary = pipeline(catalog(), store.clone(), 2000)
        .materialize(&"s1".into())
        .await
        .expect("materialize");

    assert!(summary.issues.is_empty(), "{:?}", summary.issues);
    assert_eq!(summary.kinds[&EntityKind::Model], counts(1, 0, 0, 0));
    assert_eq!(summary.kinds[&EntityKind::Endpoint], counts(2, 0, 0, 0));
    assert_eq!(summary.kinds[&EntityKind::Provider], counts(1, 0, 0, 0));

    let free = store.entry(EntityKind::Endpoint, "ep-2").await.expect("ep-2");
    assert_eq!(free.entity["model_slug"], "acme/foo");
    assert_eq!(free.entity["variant"], "free");
    assert_eq!(free.entity["capabilities"]["supports_image_input"], true);
    assert_eq!(free.entity["stats"]["hourly"][0]["timestamp"], "2026-03-01T10:00:00Z");

    let model = store.entry(EntityKind::Model, "acme/foo").await.expect("model");
    assert_eq!(model.entity["variants"], json!(["standard", "free"]));
}

#[tokio::test]
async fn later_runs_update_retire_and_stay_idempotent() {
    let store = Arc::new(MemoryStateStore::new());
    let pipeline = pipeline(catalog(), store.clone(), 2000);
    pipeline.materialize(&"s1".into()).await.expect("s1");

    let second = pipeline.materialize(&"s2".into()).await.expect("s2");
    assert_eq!(second.kinds[&EntityKind::Model], counts(0, 0, 1, 0));
    assert_eq!(second.kinds[&EntityKind::Endpoint], counts(0, 1, 0, 1));
    assert_eq!(second.kinds[&EntityKind::Provider], counts(0, 0, 1, 0));

    let retired = store.entry(EntityKind::Endpoint, "ep-2").await.expect("ep-2");
    assert!(!retired.is_active());
    assert!(retired.unavailable_at().is_some());

    let updated = store.entry(EntityKind::Endpoint, "ep-1").await.expect("ep-1");
    assert_eq!(updated.entity["pricing"]["prompt"], "0.3");
    assert_eq!(updated.entity["stats"]["hourly"].as_array().map(Vec::len), Some(2));

    let again = pipeline.materialize(&"s2".into()).await.expect("s2 again");
    assert_eq!(again.kinds[&EntityKind::Endpoint], counts(0, 0, 1, 0));
    let unchanged = store.entry(EntityKind::Endpoint, "ep-1").await.expect("ep-1");
    assert_eq!(unchanged.entity, updated.entity);
}

#[tokio::test]
async fn reappearing_endpoint_is_a_fresh_insert() {
    let store = Arc::new(MemoryStateStore::new());
    let pipeline = pipeline(catalog(), store.clone(), 2000);
    for id in ["s1", "s2"] {
        pipeline.materialize(&id.into()).await.expect("materialize");
    }

    let third = pipeline.materialize(&"s3".into()).await.expect("s3");
    assert_eq!(third.kinds[&EntityKind::Endpoint], counts(1, 0, 1, 0));
    let back = store.entry(EntityKind::Endpoint, "ep-2").await.expect("ep-2");
    assert!(back.is_active());
    assert_eq!(back.snapshot_id, SnapshotId::new("s3"));
}

#[tokio::test]
async fn diff_pair_records_leaf_changes_and_deletes() {
    let store = Arc::new(MemoryStateStore::new());
    let pipeline = pipeline(catalog(), store.clone(), 2000);
    let (s1, s2) = (SnapshotId::new("s1"), SnapshotId::new("s2"));

    let records = pipeline.diff_pair(&s1, &s2).await.expect("diff");
    assert_eq!(records.len(), 3, "{records:#?}");

    let price = records
        .iter()
        .find(|r| r.path == "pricing.prompt")
        .expect("price change");
    assert_eq!(price.entity_id, "ep-1");
    assert_eq!(price.operation, Some(ChangeOp::Replace));
    assert_eq!(price.before, Some(json!("0.1")));
    assert_eq!(price.after, Some(json!("0.3")));
    assert!(price.is_display);

    let status = records.iter().find(|r| r.path == "status").expect("status change");
    assert!(!status.is_display);

    let deleted = records
        .iter()
        .find(|r| r.change_kind == ChangeKind::Delete)
        .expect("delete");
    assert_eq!(deleted.entity_id, "ep-2");
    assert!(deleted.is_display);
    assert!(records.iter().all(|r| !r.path.starts_with("stats")));

    let rerun = pipeline.diff_pair(&s1, &s2).await.expect("rediff");
    assert_eq!(rerun, records);
    assert_eq!(store.list_pair(&s1, &s2).await.unwrap().len(), 3);
}

#[tokio::test]
async fn recompute_display_only_flips_flags() {
    let store = Arc::new(MemoryStateStore::new());
    let source = catalog();
    let (s1, s2) = (SnapshotId::new("s1"), SnapshotId::new("s2"));
    pipeline(source.clone(), store.clone(), 2000)
        .diff_pair(&s1, &s2)
        .await
        .expect("diff");

    let show_all =
        pipeline(source, store.clone(), 2000).with_display_filter(DisplayFilter::new(vec![]));
    assert_eq!(show_all.recompute_display(&s1, &s2).await.expect("recompute"), 1);
    assert_eq!(show_all.recompute_display(&s1, &s2).await.expect("recompute"), 0);

    let stored = store.list_pair(&s1, &s2).await.unwrap();
    assert_eq!(stored.len(), 3);
    assert!(stored.iter().all(|r| r.is_display));
}

#[tokio::test]
async fn run_pass_diffs_against_the_previous_snapshot() {
    let store = Arc::new(MemoryStateStore::new());
    let pipeline = pipeline(catalog(), store.clone(), 2000);

    let first = pipeline.run_pass(&"s1".into()).await.expect("s1");
    assert!(matches!(first.diff, DiffOutcome::Skipped));

    let second = pipeline.run_pass(&"s2".into()).await.expect("s2");
    let diff = second.diff.summary().expect("diff summary");
    assert_eq!(diff.previous, SnapshotId::new("s1"));
    assert_eq!(diff.records, 3);
    assert_eq!(diff.displayed, 2);
    assert_eq!(second.materialize.kinds[&EntityKind::Endpoint].retired, 1);
}

#[tokio::test]
async fn broken_previous_snapshot_does_not_block_materialization() {
    let source = MemorySnapshotSource::new()
        .with_bundle("s1", EntityKind::Model, models())
        .with_bundle(
            "s1",
            EntityKind::Endpoint,
            vec![endpoint("ep-1", "acme/foo", "0.1", 0, "2026-03-01T10:15:00Z")],
        );
    let source = snapshot(
        source,
        "s2",
        vec![endpoint("ep-1", "acme/foo", "0.3", 0, "2026-03-01T11:05:00Z")],
    );
    let store = Arc::new(MemoryStateStore::new());
    let (s1, s2) = (SnapshotId::new("s1"), SnapshotId::new("s2"));

    let pass = pipeline(Arc::new(source), store.clone(), 2000)
        .run_pass(&s2)
        .await
        .expect("materialization still succeeds");

    assert_eq!(pass.materialize.kinds[&EntityKind::Model], counts(1, 0, 0, 0));
    assert_eq!(pass.materialize.kinds[&EntityKind::Endpoint], counts(1, 0, 0, 0));
    assert_eq!(pass.materialize.kinds[&EntityKind::Provider], counts(1, 0, 0, 0));
    match &pass.diff {
        DiffOutcome::Failed { previous, error } => {
            assert_eq!(previous, &s1);
            assert!(error.contains("provider"), "{error}");
        }
        other => panic!("expected a failed diff, got {other:?}"),
    }
    assert!(pass.diff.summary().is_none());

    let written = store.entry(EntityKind::Endpoint, "ep-1").await.expect("ep-1");
    assert_eq!(written.entity["pricing"]["prompt"], "0.3");
    assert!(store.list_pair(&s1, &s2).await.unwrap().is_empty());
}

#[tokio::test]
async fn missing_bundle_fails_the_pass() {
    let store = Arc::new(MemoryStateStore::new());
    let err = pipeline(catalog(), store.clone(), 2000)
        .materialize(&"s9".into())
        .await
        .expect_err("no such snapshot");

    let missing = err
        .chain()
        .filter_map(|cause| cause.downcast_ref::<StorageError>())
        .any(StorageError::is_missing_snapshot);
    assert!(missing, "{err:#}");
    assert_eq!(store.batches_applied(), 0);
}

#[tokio::test]
async fn bad_records_are_reported_without_aborting() {
    let source = MemorySnapshotSource::new();
    let source = snapshot(
        source,
        "s1",
        vec![
            endpoint("ep-1", "acme/foo", "0.1", 0, "2026-03-01T10:15:00Z"),
            endpoint("ep-x", "ghost/model", "0.1", 0, "2026-03-01T10:15:00Z"),
            json!({"uuid": "ep-y"}),
        ],
    );
    let store = Arc::new(MemoryStateStore::new());
    let summary = pipeline(Arc::new(source), store, 2000)
        .materialize(&"s1".into())
        .await
        .expect("materialize");

    assert_eq!(summary.kinds[&EntityKind::Endpoint].inserted, 1);
    assert_eq!(summary.issues.len(), 2);
    let ghost = summary
        .issues
        .iter()
        .find(|i| i.identifier.as_deref() == Some("ep-x"))
        .expect("unresolved model issue");
    assert_eq!(ghost.kind, EntityKind::Endpoint);
    assert_eq!(ghost.snapshot_id, SnapshotId::new("s1"));
    assert!(ghost.message.contains("ghost/model"));
}

#[tokio::test]
async fn state_writes_are_chunked() {
    let store = Arc::new(MemoryStateStore::new());
    pipeline(catalog(), store.clone(), 1)
        .materialize(&"s1".into())
        .await
        .expect("materialize");
    // one model, two endpoints, one provider
    assert_eq!(store.batches_applied(), 4);
}
