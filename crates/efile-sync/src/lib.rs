//! Year ingestion: grouped fetching, checkpointing, resume and bundling.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use efile_core::{Manifest, SchemaTable};
use efile_storage::{HttpClientConfig, TokenBucketConfig, YearLayout};

pub mod bundler;
pub mod controller;
pub mod fetcher;
pub mod table;

pub use bundler::{read_integrity_record, BundleReport, Bundler, IntegrityError, IntegrityRecord};
pub use controller::{RunController, RunOutcome, YearStatus};
pub use fetcher::{BatchFetcher, GroupError, GroupExhausted, GroupFault, GroupFetch, GroupReport};

pub const CRATE_NAME: &str = "efile-sync";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub schema_path: Option<PathBuf>,
    /// Keep only manifest entries declaring this form type.
    pub form_type: Option<String>,
    pub group_size: usize,
    pub session_size: usize,
    pub concurrency: usize,
    pub http_timeout: Duration,
    pub retry_backoff: Duration,
    /// `0` retries a failing group forever.
    pub max_group_attempts: u32,
    pub user_agent: String,
    pub requests_per_second: Option<u32>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            schema_path: None,
            form_type: Some("990".to_string()),
            group_size: 1000,
            session_size: 50,
            concurrency: 50,
            http_timeout: Duration::from_secs(10),
            retry_backoff: Duration::from_secs(10),
            max_group_attempts: 25,
            user_agent: "efile-ingest/0.1".to_string(),
            requests_per_second: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: std::env::var("EFILE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            schema_path: std::env::var("EFILE_SCHEMA_PATH").ok().map(PathBuf::from),
            form_type: match std::env::var("EFILE_FORM_TYPE") {
                Ok(v) if v.trim().is_empty() || v == "*" => None,
                Ok(v) => Some(v),
                Err(_) => defaults.form_type,
            },
            group_size: env_parse("EFILE_GROUP_SIZE").unwrap_or(defaults.group_size),
            session_size: env_parse("EFILE_SESSION_SIZE").unwrap_or(defaults.session_size),
            concurrency: env_parse("EFILE_CONCURRENCY").unwrap_or(defaults.concurrency),
            http_timeout: env_parse("EFILE_HTTP_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.http_timeout),
            retry_backoff: env_parse("EFILE_RETRY_BACKOFF_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.retry_backoff),
            max_group_attempts: env_parse("EFILE_MAX_GROUP_ATTEMPTS")
                .unwrap_or(defaults.max_group_attempts),
            user_agent: std::env::var("EFILE_USER_AGENT").unwrap_or(defaults.user_agent),
            requests_per_second: env_parse("EFILE_REQUESTS_PER_SECOND"),
        }
    }

    pub fn layout(&self, year: i32) -> YearLayout {
        YearLayout::new(self.data_dir.clone(), year)
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.http_timeout,
            user_agent: Some(self.user_agent.clone()),
            max_idle_per_host: self.concurrency.max(1),
            token_bucket: self.requests_per_second.map(TokenBucketConfig::per_second),
        }
    }

    pub fn load_schema(&self) -> Result<SchemaTable> {
        match &self.schema_path {
            Some(path) => SchemaTable::load(path)
                .with_context(|| format!("loading schema table {}", path.display())),
            None => SchemaTable::builtin().context("loading built-in schema table"),
        }
    }

    pub fn load_manifest(&self, year: i32) -> Result<Manifest> {
        let path = self.layout(year).manifest_path();
        Manifest::load(&path, year, self.form_type.as_deref())
            .with_context(|| format!("loading manifest for {year}"))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
