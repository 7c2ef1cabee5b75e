use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mcat_core::{EntityKind, SnapshotId};
use mcat_storage::SnapshotArchive;
use mcat_sync::{DiffOutcome, MaterializePipeline, MaterializeSummary, SyncConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mcat")]
#[command(about = "Model catalog change tracker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Archive raw listing files as the bundles of a snapshot.
    Ingest {
        snapshot: String,
        #[arg(long)]
        models: Option<PathBuf>,
        #[arg(long)]
        endpoints: Option<PathBuf>,
        #[arg(long)]
        providers: Option<PathBuf>,
    },
    /// Reconcile materialized state against a snapshot.
    Materialize { snapshot: String },
    /// Diff a snapshot against its predecessor (or `--previous`).
    Diff {
        snapshot: String,
        #[arg(long)]
        previous: Option<String>,
    },
    /// Materialize and diff in one pass.
    Run { snapshot: String },
    /// Re-evaluate display flags of stored change records.
    Redisplay {
        snapshot: String,
        #[arg(long)]
        previous: Option<String>,
    },
    /// Write parquet files of the change log and materialized state.
    Export {
        snapshot: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn print_materialize(summary: &MaterializeSummary) {
    println!(
        "materialize complete: run_id={} snapshot={} issues={}",
        summary.run_id,
        summary.snapshot_id,
        summary.issues.len()
    );
    for (kind, counts) in &summary.kinds {
        println!(
            "  {kind}: inserted={} updated={} stable={} retired={}",
            counts.inserted, counts.updated, counts.stable, counts.retired
        );
    }
}

async fn resolve_previous(
    pipeline: &MaterializePipeline,
    snapshot: &SnapshotId,
    previous: Option<String>,
) -> Result<SnapshotId> {
    match previous {
        Some(previous) => Ok(SnapshotId::new(previous)),
        None => pipeline
            .previous_snapshot(snapshot)
            .await?
            .with_context(|| format!("no archived snapshot precedes {snapshot}")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Ingest {
            snapshot,
            models,
            endpoints,
            providers,
        } => {
            let config = SyncConfig::from_env();
            let archive = SnapshotArchive::new(config.archive_dir.clone());
            let snapshot = SnapshotId::new(snapshot);
            let files = [
                (EntityKind::Model, models),
                (EntityKind::Endpoint, endpoints),
                (EntityKind::Provider, providers),
            ];
            let mut stored = 0usize;
            for (kind, path) in files {
                let Some(path) = path else {
                    continue;
                };
                let bundle = mcat_sync::ingest_listing(&archive, kind, &snapshot, &path).await?;
                println!(
                    "ingested {kind}: records={} sha256={} path={}",
                    bundle.record_count,
                    bundle.content_hash,
                    bundle.relative_path.display()
                );
                stored += 1;
            }
            if stored == 0 {
                anyhow::bail!("nothing to ingest; pass --models, --endpoints or --providers");
            }
        }
        Commands::Materialize { snapshot } => {
            let pipeline = mcat_sync::pipeline_from_env()?;
            let summary = pipeline.materialize(&SnapshotId::new(snapshot)).await?;
            print_materialize(&summary);
        }
        Commands::Diff { snapshot, previous } => {
            let pipeline = mcat_sync::pipeline_from_env()?;
            let snapshot = SnapshotId::new(snapshot);
            let previous = resolve_previous(&pipeline, &snapshot, previous).await?;
            let records = pipeline.diff_pair(&previous, &snapshot).await?;
            let displayed = records.iter().filter(|r| r.is_display).count();
            println!(
                "diff complete: {previous}..{snapshot} records={} displayed={displayed}",
                records.len()
            );
        }
        Commands::Run { snapshot } => {
            let summary = mcat_sync::run_pass_from_env(&SnapshotId::new(snapshot)).await?;
            print_materialize(&summary.materialize);
            match summary.diff {
                DiffOutcome::Completed(diff) => println!(
                    "diff complete: {}..{} records={} displayed={}",
                    diff.previous, diff.current, diff.records, diff.displayed
                ),
                DiffOutcome::Skipped => info!("first snapshot; no diff"),
                DiffOutcome::Failed { previous, error } => {
                    anyhow::bail!("diff against {previous} failed: {error}")
                }
            }
        }
        Commands::Redisplay { snapshot, previous } => {
            let pipeline = mcat_sync::pipeline_from_env()?;
            let snapshot = SnapshotId::new(snapshot);
            let previous = resolve_previous(&pipeline, &snapshot, previous).await?;
            let changed = pipeline.recompute_display(&previous, &snapshot).await?;
            println!("redisplay complete: {previous}..{snapshot} changed={changed}");
        }
        Commands::Export { snapshot, out } => {
            let pipeline = mcat_sync::pipeline_from_env()?;
            let manifest = pipeline.export(&SnapshotId::new(snapshot), out).await?;
            println!("export complete: manifest={}", manifest.display());
        }
    }

    Ok(())
}
