//! Consolidation of a year's checkpoints into one artifact, gated on an
//! integrity check against the manifest.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use efile_core::{GroupPlan, Manifest, SchemaTable};
use efile_storage::{commit_temp, remove_if_exists, sha256_file, temp_sibling, write_atomic, YearLayout};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::table::{artifact_schema, read_batches, row_count, typed_batch, ParquetSink};
use crate::PipelineConfig;

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("year {year} is already bundled; remove {year}.parquet to rebuild it")]
    AlreadyBundled { year: i32 },
    #[error("year {year} is missing checkpoints for groups {ordinals:?}")]
    MissingCheckpoints { year: i32, ordinals: Vec<u32> },
    #[error("year {year} bundled {actual} rows but the manifest lists {expected}")]
    RowCountMismatch {
        year: i32,
        expected: usize,
        actual: usize,
    },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Sidecar written next to each year artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityRecord {
    pub year: i32,
    pub rows: usize,
    pub groups: u32,
    pub schema_version: u32,
    pub sha256: String,
    pub bytes: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleReport {
    pub year: i32,
    pub rows: usize,
    pub groups: u32,
    pub artifact: PathBuf,
    pub sha256: String,
}

pub struct Bundler {
    config: PipelineConfig,
    schema: Arc<SchemaTable>,
}

impl Bundler {
    pub fn new(config: PipelineConfig, schema: Arc<SchemaTable>) -> Self {
        Self { config, schema }
    }

    pub async fn bundle_and_verify(&self, year: i32) -> Result<BundleReport, IntegrityError> {
        let manifest = self.config.load_manifest(year)?;
        let plan = GroupPlan::new(manifest.len(), self.config.group_size);
        self.bundle(&self.config.layout(year), &manifest, &plan).await
    }

    pub(crate) async fn bundle(
        &self,
        layout: &YearLayout,
        manifest: &Manifest,
        plan: &GroupPlan,
    ) -> Result<BundleReport, IntegrityError> {
        let year = layout.year();
        if layout.artifact_exists().await? {
            return Err(IntegrityError::AlreadyBundled { year });
        }
        let checkpoints = layout.list_checkpoints().await?;
        let absent: Vec<u32> = plan
            .ordinals()
            .filter(|ordinal| !checkpoints.contains_key(ordinal))
            .collect();
        if !absent.is_empty() {
            return Err(IntegrityError::MissingCheckpoints {
                year,
                ordinals: absent,
            });
        }

        layout.ensure_year_dir().await?;
        let target = layout.artifact_path();
        let temp = temp_sibling(&target);
        let written = plan
            .ordinals()
            .filter_map(|ordinal| checkpoints.get(&ordinal).map(|path| (ordinal, path.as_path())));
        if let Err(err) = self.write_artifact(&temp, written) {
            remove_if_exists(&temp).await?;
            return Err(err.into());
        }

        let actual = match row_count(&temp) {
            Ok(rows) => rows,
            Err(err) => {
                remove_if_exists(&temp).await?;
                return Err(err.into());
            }
        };
        let expected = manifest.len();
        if actual != expected {
            remove_if_exists(&temp).await?;
            warn!(year, expected, actual, "integrity check failed, checkpoints kept");
            return Err(IntegrityError::RowCountMismatch {
                year,
                expected,
                actual,
            });
        }

        let (sha256, bytes) = sha256_file(&temp).await?;
        let record = IntegrityRecord {
            year,
            rows: actual,
            groups: plan.group_count(),
            schema_version: self.schema.version,
            sha256: sha256.clone(),
            bytes,
            created_at: Utc::now(),
        };
        let sidecar = serde_json::to_vec_pretty(&record).context("serializing integrity record")?;
        write_atomic(&layout.integrity_path(), &sidecar).await?;
        commit_temp(&temp, &target).await?;

        for path in checkpoints.values() {
            remove_if_exists(path).await?;
        }

        info!(year, rows = actual, groups = plan.group_count(), sha256 = %sha256, "year bundled");
        Ok(BundleReport {
            year,
            rows: actual,
            groups: plan.group_count(),
            artifact: target,
            sha256,
        })
    }

    fn write_artifact<'a>(
        &self,
        path: &Path,
        checkpoints: impl Iterator<Item = (u32, &'a Path)>,
    ) -> anyhow::Result<()> {
        let schema = artifact_schema(&self.schema);
        let mut sink = ParquetSink::create(path, Arc::clone(&schema))?;
        for (ordinal, checkpoint) in checkpoints {
            for batch in read_batches(checkpoint)? {
                let typed = typed_batch(&self.schema, Arc::clone(&schema), &batch, ordinal)
                    .with_context(|| format!("converting {}", checkpoint.display()))?;
                sink.write(&typed)?;
            }
        }
        sink.close()
    }
}

pub async fn read_integrity_record(path: &Path) -> anyhow::Result<IntegrityRecord> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
}
