//! Parquet snapshots of clusters and issues for offline review.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, SecondsFormat, Utc};
use parquet::arrow::ArrowWriter;
use pim_core::{ExtractedIssue, IssueCluster};
use pim_storage::Store;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub exported_at: DateTime<Utc>,
    pub files: Vec<SnapshotFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub name: String,
    pub path: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

/// Writes `clusters.parquet`, `issues.parquet` and `manifest.json` into `dir/<run_id>/`.
pub async fn export_snapshot(store: &dyn Store, dir: &Path, run_id: Uuid) -> Result<SnapshotManifest> {
    let clusters = store.clusters().await.context("loading clusters")?;
    let issues = store.all_issues().await.context("loading issues")?;

    let snapshot_dir = dir.join(run_id.to_string());
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        run_id,
        exported_at: Utc::now(),
        files: vec![
            store_table(dir, &snapshot_dir, "clusters", clusters_batch(&clusters)?).await?,
            store_table(dir, &snapshot_dir, "issues", issues_batch(&issues)?).await?,
        ],
    };

    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    info!(
        %run_id,
        clusters = clusters.len(),
        issues = issues.len(),
        dir = %snapshot_dir.display(),
        "snapshot exported"
    );
    Ok(manifest)
}

fn timestamp(at: Option<DateTime<Utc>>) -> Option<String> {
    at.map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
}

fn clusters_batch(clusters: &[IssueCluster]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Int64, false),
        ArrowField::new("category", DataType::Utf8, false),
        ArrowField::new("subcategory", DataType::Utf8, false),
        ArrowField::new("name", DataType::Utf8, false),
        ArrowField::new("summary", DataType::Utf8, true),
        ArrowField::new("issue_count", DataType::Int64, false),
        ArrowField::new("unique_customers", DataType::Int64, false),
        ArrowField::new("count_7d", DataType::Int64, false),
        ArrowField::new("count_prior_7d", DataType::Int64, false),
        ArrowField::new("trend_pct", DataType::Float64, true),
        ArrowField::new("first_seen", DataType::Utf8, true),
        ArrowField::new("last_seen", DataType::Utf8, true),
        ArrowField::new("is_active", DataType::Boolean, false),
        ArrowField::new("pm_status", DataType::Utf8, false),
    ]));

    let first_seen: Vec<Option<String>> = clusters.iter().map(|c| timestamp(c.first_seen)).collect();
    let last_seen: Vec<Option<String>> = clusters.iter().map(|c| timestamp(c.last_seen)).collect();

    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int64Array::from(clusters.iter().map(|c| c.id).collect::<Vec<_>>())),
        Arc::new(StringArray::from(
            clusters.iter().map(|c| c.category.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            clusters.iter().map(|c| c.subcategory.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(clusters.iter().map(|c| c.name.as_str()).collect::<Vec<_>>())),
        Arc::new(StringArray::from(
            clusters.iter().map(|c| c.summary.as_deref()).collect::<Vec<_>>(),
        )),
        Arc::new(Int64Array::from(clusters.iter().map(|c| c.issue_count).collect::<Vec<_>>())),
        Arc::new(Int64Array::from(
            clusters.iter().map(|c| c.unique_customers).collect::<Vec<_>>(),
        )),
        Arc::new(Int64Array::from(clusters.iter().map(|c| c.count_7d).collect::<Vec<_>>())),
        Arc::new(Int64Array::from(
            clusters.iter().map(|c| c.count_prior_7d).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(clusters.iter().map(|c| c.trend_pct).collect::<Vec<_>>())),
        Arc::new(StringArray::from(
            first_seen.iter().map(|s| s.as_deref()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            last_seen.iter().map(|s| s.as_deref()).collect::<Vec<_>>(),
        )),
        Arc::new(BooleanArray::from(clusters.iter().map(|c| c.is_active).collect::<Vec<_>>())),
        Arc::new(StringArray::from(
            clusters.iter().map(|c| c.pm_status.as_str()).collect::<Vec<_>>(),
        )),
    ];

    RecordBatch::try_new(schema, columns).context("building clusters record batch")
}

fn issues_batch(issues: &[ExtractedIssue]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Int64, false),
        ArrowField::new("ticket_id", DataType::Int64, false),
        ArrowField::new("cluster_id", DataType::Int64, true),
        ArrowField::new("category", DataType::Utf8, false),
        ArrowField::new("subcategory", DataType::Utf8, false),
        ArrowField::new("issue_type", DataType::Utf8, false),
        ArrowField::new("severity", DataType::Utf8, false),
        ArrowField::new("summary", DataType::Utf8, false),
        ArrowField::new("confidence", DataType::Float64, true),
        ArrowField::new("extracted_at", DataType::Utf8, false),
    ]));

    let extracted_at: Vec<String> = issues
        .iter()
        .map(|i| i.extracted_at.to_rfc3339_opts(SecondsFormat::Secs, true))
        .collect();

    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int64Array::from(issues.iter().map(|i| i.id).collect::<Vec<_>>())),
        Arc::new(Int64Array::from(issues.iter().map(|i| i.ticket_id).collect::<Vec<_>>())),
        Arc::new(Int64Array::from(issues.iter().map(|i| i.cluster_id).collect::<Vec<_>>())),
        Arc::new(StringArray::from(
            issues.iter().map(|i| i.category.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            issues.iter().map(|i| i.subcategory.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            issues.iter().map(|i| i.issue_type.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            issues.iter().map(|i| i.severity.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(issues.iter().map(|i| i.summary.as_str()).collect::<Vec<_>>())),
        Arc::new(Float64Array::from(issues.iter().map(|i| i.confidence).collect::<Vec<_>>())),
        Arc::new(StringArray::from(
            extracted_at.iter().map(String::as_str).collect::<Vec<_>>(),
        )),
    ];

    RecordBatch::try_new(schema, columns).context("building issues record batch")
}

/// Encodes one table to `<snapshot_dir>/<table>.parquet` and describes it for the
/// manifest. The checksum covers exactly the bytes written.
async fn store_table(
    root: &Path,
    snapshot_dir: &Path,
    table: &str,
    batch: RecordBatch,
) -> Result<SnapshotFile> {
    let mut encoded = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut encoded, batch.schema(), None)
        .with_context(|| format!("starting {table} parquet encoder"))?;
    writer
        .write(&batch)
        .with_context(|| format!("encoding {table} rows"))?;
    writer
        .close()
        .with_context(|| format!("finishing {table} parquet encoder"))?;

    let path = snapshot_dir.join(format!("{table}.parquet"));
    fs::write(&path, &encoded)
        .await
        .with_context(|| format!("writing {}", path.display()))?;

    Ok(SnapshotFile {
        name: table.to_string(),
        path: path.strip_prefix(root).unwrap_or(&path).display().to_string(),
        rows: batch.num_rows(),
        sha256: hex::encode(Sha256::digest(&encoded)),
        bytes: encoded.len() as u64,
    })
}
