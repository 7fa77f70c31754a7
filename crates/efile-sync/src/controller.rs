//! Per-year orchestration: resume planning, group execution and the final
//! bundle pass.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use efile_core::{GroupPlan, SchemaTable};
use efile_storage::{manifest_years, remove_if_exists, DocumentSource, HttpFetcher};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::bundler::Bundler;
use crate::fetcher::{BatchFetcher, GroupError};
use crate::table::row_count;
use crate::PipelineConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed { groups_fetched: usize, rows: usize },
    AlreadyComplete,
    /// A group exhausted its retries; these ordinals still lack checkpoints.
    PartiallyFetched { remaining: Vec<u32> },
}

/// Read-only snapshot of a year's progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct YearStatus {
    pub year: i32,
    pub entries: usize,
    pub planned_groups: u32,
    pub checkpointed: Vec<u32>,
    pub missing: Vec<u32>,
    pub artifact_present: bool,
}

pub struct RunController {
    config: PipelineConfig,
    fetcher: BatchFetcher,
    bundler: Bundler,
}

impl RunController {
    pub fn new(
        config: PipelineConfig,
        schema: Arc<SchemaTable>,
        source: Arc<dyn DocumentSource>,
    ) -> Self {
        let fetcher = BatchFetcher::new(&config, Arc::clone(&schema), source);
        let bundler = Bundler::new(config.clone(), schema);
        Self {
            config,
            fetcher,
            bundler,
        }
    }

    /// Builds the HTTP source and schema table the configuration names.
    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        let schema = Arc::new(config.load_schema()?);
        let http = HttpFetcher::new(config.http_client_config())?;
        Ok(Self::new(config, schema, Arc::new(http)))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn bundler(&self) -> &Bundler {
        &self.bundler
    }

    /// Years with a manifest in the data directory.
    pub async fn years(&self) -> Result<Vec<i32>> {
        manifest_years(&self.config.data_dir).await
    }

    pub async fn status(&self, year: i32) -> Result<YearStatus> {
        let layout = self.config.layout(year);
        let manifest = self.config.load_manifest(year)?;
        let plan = GroupPlan::new(manifest.len(), self.config.group_size);
        let checkpoints = layout.list_checkpoints().await?;
        let trusted = trusted_ordinals(&plan, &checkpoints).0;
        Ok(YearStatus {
            year,
            entries: manifest.len(),
            planned_groups: plan.group_count(),
            missing: plan.ordinals().filter(|o| !trusted.contains(o)).collect(),
            checkpointed: trusted.into_iter().collect(),
            artifact_present: layout.artifact_exists().await?,
        })
    }

    /// Bring one year to completion, resuming from whatever checkpoints a
    /// previous run left behind.
    pub async fn run_year(&self, year: i32) -> Result<RunOutcome> {
        let span = info_span!("year", year, run_id = %Uuid::new_v4());
        self.run_year_inner(year).instrument(span).await
    }

    async fn run_year_inner(&self, year: i32) -> Result<RunOutcome> {
        let layout = self.config.layout(year);
        if layout.artifact_exists().await? {
            let leftovers = layout.list_checkpoints().await?;
            for path in leftovers.values() {
                remove_if_exists(path).await?;
            }
            layout.remove_stale_temps().await?;
            info!(removed_checkpoints = leftovers.len(), "year already bundled");
            return Ok(RunOutcome::AlreadyComplete);
        }

        let manifest = self.config.load_manifest(year)?;
        let plan = GroupPlan::new(manifest.len(), self.config.group_size);
        layout.ensure_year_dir().await?;
        let swept = layout.remove_stale_temps().await?;

        let checkpoints = layout.list_checkpoints().await?;
        let (trusted, untrusted) = trusted_ordinals(&plan, &checkpoints);
        for path in &untrusted {
            warn!(path = %path.display(), "discarding untrusted checkpoint");
            remove_if_exists(path).await?;
        }

        let missing: Vec<u32> = plan.ordinals().filter(|o| !trusted.contains(o)).collect();
        info!(
            entries = manifest.len(),
            groups = plan.group_count(),
            checkpointed = trusted.len(),
            missing = missing.len(),
            swept_temps = swept,
            "planning year"
        );

        let mut groups_fetched = 0;
        for (position, &ordinal) in missing.iter().enumerate() {
            let entries = manifest
                .group(&plan, ordinal)
                .with_context(|| format!("group {ordinal} is outside the plan"))?;
            let run = self
                .fetcher
                .run_group(&layout, ordinal, entries)
                .instrument(info_span!("group", group = ordinal))
                .await;
            match run {
                Ok(_) => groups_fetched += 1,
                Err(GroupError::Exhausted(exhausted)) => {
                    let remaining = missing[position..].to_vec();
                    warn!(error = %exhausted, remaining = remaining.len(), "stopping year");
                    return Ok(RunOutcome::PartiallyFetched { remaining });
                }
                Err(GroupError::Storage(err)) => {
                    return Err(err.context(format!("checkpointing group {ordinal}")));
                }
            }
        }

        let report = self
            .bundler
            .bundle(&layout, &manifest, &plan)
            .await
            .with_context(|| format!("bundling year {year}"))?;
        Ok(RunOutcome::Completed {
            groups_fetched,
            rows: report.rows,
        })
    }
}

/// Split on-disk checkpoints into trusted ordinals and files to discard. A
/// checkpoint is trusted when its ordinal is planned and its row count
/// matches the group size.
fn trusted_ordinals(
    plan: &GroupPlan,
    checkpoints: &BTreeMap<u32, PathBuf>,
) -> (BTreeSet<u32>, Vec<PathBuf>) {
    let mut trusted = BTreeSet::new();
    let mut untrusted = Vec::new();
    for (&ordinal, path) in checkpoints {
        let Some(expected) = plan.expected_rows(ordinal) else {
            untrusted.push(path.clone());
            continue;
        };
        match row_count(path) {
            Ok(rows) if rows == expected => {
                trusted.insert(ordinal);
            }
            Ok(rows) => {
                warn!(group = ordinal, rows, expected, "checkpoint has the wrong row count");
                untrusted.push(path.clone());
            }
            Err(err) => {
                warn!(group = ordinal, error = %err, "checkpoint unreadable");
                untrusted.push(path.clone());
            }
        }
    }
    (trusted, untrusted)
}
