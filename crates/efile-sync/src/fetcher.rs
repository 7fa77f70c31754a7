//! Group fetching: bounded concurrent downloads, parse and verify, retry.

use std::sync::Arc;
use std::time::Duration;

use efile_core::{ManifestEntry, ParsedRecord, SchemaTable};
use efile_parse::{DocumentParser, VerificationOutcome, Verifier};
use efile_storage::{
    commit_temp, remove_if_exists, temp_sibling, DocumentResponse, DocumentSource, FetchError,
    YearLayout,
};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::table::write_checkpoint;
use crate::PipelineConfig;

/// Reasons one attempt at a group is discarded and retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GroupFault {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("recovered {recovered} of {expected} records")]
    Incomplete { expected: usize, recovered: usize },
    #[error("fetch task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("group {ordinal} gave up after {attempts} attempts: {last}")]
pub struct GroupExhausted {
    pub ordinal: u32,
    pub attempts: u32,
    pub last: GroupFault,
}

#[derive(Debug, Error)]
pub enum GroupError {
    #[error(transparent)]
    Exhausted(#[from] GroupExhausted),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Records of one successful attempt, in entry order.
#[derive(Debug, Clone, Default)]
pub struct GroupFetch {
    pub records: Vec<ParsedRecord>,
    pub bytes: u64,
    pub missing: usize,
    pub period_warnings: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupReport {
    pub ordinal: u32,
    pub records: usize,
    pub missing: usize,
    pub period_warnings: usize,
    pub bytes: u64,
    pub attempts: u32,
}

enum DocumentOutcome {
    Kept {
        index: usize,
        record: ParsedRecord,
        bytes: u64,
        missing: bool,
        period_warning: bool,
    },
    Rejected,
}

pub struct BatchFetcher {
    source: Arc<dyn DocumentSource>,
    parser: DocumentParser,
    verifier: Verifier,
    session_size: usize,
    concurrency: usize,
    retry_backoff: Duration,
    max_group_attempts: u32,
}

impl BatchFetcher {
    pub fn new(
        config: &PipelineConfig,
        schema: Arc<SchemaTable>,
        source: Arc<dyn DocumentSource>,
    ) -> Self {
        Self {
            source,
            parser: DocumentParser::new(Arc::clone(&schema)),
            verifier: Verifier::new(schema),
            session_size: config.session_size.max(1),
            concurrency: config.concurrency.max(1),
            retry_backoff: config.retry_backoff,
            max_group_attempts: config.max_group_attempts,
        }
    }

    /// One attempt at a group. Sessions run back to back; documents inside a
    /// session run concurrently under the shared permit pool.
    pub async fn fetch_group(&self, entries: &[ManifestEntry]) -> Result<GroupFetch, GroupFault> {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut kept: Vec<(usize, ParsedRecord)> = Vec::with_capacity(entries.len());
        let mut fetch = GroupFetch::default();

        for (session, chunk) in entries.chunks(self.session_size).enumerate() {
            let offset = session * self.session_size;
            let mut tasks = JoinSet::new();
            for (i, entry) in chunk.iter().enumerate() {
                let entry = entry.clone();
                let source = Arc::clone(&self.source);
                let parser = self.parser.clone();
                let verifier = self.verifier.clone();
                let permits = Arc::clone(&permits);
                tasks.spawn(async move {
                    let _permit = permits
                        .acquire_owned()
                        .await
                        .map_err(|err| GroupFault::Task(err.to_string()))?;
                    fetch_document(offset + i, &entry, source.as_ref(), &parser, &verifier).await
                });
            }

            while let Some(joined) = tasks.join_next().await {
                let outcome = match joined {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(fault)) => {
                        tasks.abort_all();
                        return Err(fault);
                    }
                    Err(err) => {
                        tasks.abort_all();
                        return Err(GroupFault::Task(err.to_string()));
                    }
                };
                if let DocumentOutcome::Kept {
                    index,
                    record,
                    bytes,
                    missing,
                    period_warning,
                } = outcome
                {
                    fetch.bytes += bytes;
                    fetch.missing += usize::from(missing);
                    fetch.period_warnings += usize::from(period_warning);
                    kept.push((index, record));
                }
            }
        }

        if kept.len() != entries.len() {
            return Err(GroupFault::Incomplete {
                expected: entries.len(),
                recovered: kept.len(),
            });
        }

        kept.sort_by_key(|(index, _)| *index);
        fetch.records = kept.into_iter().map(|(_, record)| record).collect();
        Ok(fetch)
    }

    /// Fetch a group until it succeeds or the attempt bound is reached, then
    /// persist its checkpoint atomically.
    pub async fn run_group(
        &self,
        layout: &YearLayout,
        ordinal: u32,
        entries: &[ManifestEntry],
    ) -> Result<GroupReport, GroupError> {
        let mut attempts = 0u32;
        let fetch = loop {
            attempts += 1;
            match self.fetch_group(entries).await {
                Ok(fetch) => break fetch,
                Err(fault) => {
                    warn!(group = ordinal, attempt = attempts, error = %fault, "group attempt failed");
                    if self.max_group_attempts != 0 && attempts >= self.max_group_attempts {
                        return Err(GroupExhausted {
                            ordinal,
                            attempts,
                            last: fault,
                        }
                        .into());
                    }
                    tokio::time::sleep(self.retry_backoff).await;
                }
            }
        };

        let target = layout.checkpoint_path(ordinal);
        let temp = temp_sibling(&target);
        if let Err(err) = write_checkpoint(&temp, self.parser.schema(), &fetch.records) {
            remove_if_exists(&temp).await?;
            return Err(err.into());
        }
        commit_temp(&temp, &target).await?;

        let report = GroupReport {
            ordinal,
            records: fetch.records.len(),
            missing: fetch.missing,
            period_warnings: fetch.period_warnings,
            bytes: fetch.bytes,
            attempts,
        };
        info!(
            group = ordinal,
            records = report.records,
            missing = report.missing,
            period_warnings = report.period_warnings,
            bytes = report.bytes,
            attempts = report.attempts,
            "group checkpointed"
        );
        Ok(report)
    }
}

async fn fetch_document(
    index: usize,
    entry: &ManifestEntry,
    source: &dyn DocumentSource,
    parser: &DocumentParser,
    verifier: &Verifier,
) -> Result<DocumentOutcome, GroupFault> {
    let url = entry.resource_locator.as_str();
    let body = match source.fetch_document(url).await? {
        DocumentResponse::Found(body) => body,
        DocumentResponse::Missing => {
            debug!(url, identity = %entry.identity_key, "document missing upstream, using defaults");
            return Ok(DocumentOutcome::Kept {
                index,
                record: ParsedRecord::missing(parser.schema()),
                bytes: 0,
                missing: true,
                period_warning: false,
            });
        }
    };

    let record = match parser.parse(&body) {
        Ok(record) => record,
        Err(err) => {
            warn!(url, identity = %entry.identity_key, error = %err, "dropping unparseable document");
            return Ok(DocumentOutcome::Rejected);
        }
    };

    let period_warning = match verifier.verify(&record, entry) {
        VerificationOutcome::Ok => false,
        VerificationOutcome::IdentityMismatch { expected, found } => {
            warn!(url, expected = %expected, found = ?found, "dropping document for another organization");
            return Ok(DocumentOutcome::Rejected);
        }
        VerificationOutcome::PeriodMismatch {
            reporting_period,
            tax_year,
        } => {
            warn!(url, reporting_period = %reporting_period, tax_year = ?tax_year, "tax year outside reporting window");
            true
        }
    };

    Ok(DocumentOutcome::Kept {
        index,
        record,
        bytes: body.len() as u64,
        missing: false,
        period_warning,
    })
}
