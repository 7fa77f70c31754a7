use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use efile_sync::{PipelineConfig, RunController, RunOutcome};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "efile-cli")]
#[command(about = "Fetch, checkpoint and bundle yearly nonprofit e-file returns")]
struct Cli {
    #[command(flatten)]
    overrides: ConfigOverrides,
    #[command(subcommand)]
    command: Option<Commands>,
}

/// Flags that take precedence over the `EFILE_*` environment.
#[derive(Debug, Args)]
struct ConfigOverrides {
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    schema: Option<PathBuf>,
    /// Form type to keep from the manifest; `*` keeps every entry.
    #[arg(long, global = true)]
    form_type: Option<String>,
    #[arg(long, global = true)]
    group_size: Option<usize>,
    #[arg(long, global = true)]
    session_size: Option<usize>,
    #[arg(long, global = true)]
    concurrency: Option<usize>,
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,
    #[arg(long, global = true)]
    backoff_secs: Option<u64>,
    /// `0` retries a failing group without limit.
    #[arg(long, global = true)]
    max_group_attempts: Option<u32>,
    #[arg(long, global = true)]
    requests_per_second: Option<u32>,
}

impl ConfigOverrides {
    fn apply(self, mut config: PipelineConfig) -> PipelineConfig {
        if let Some(dir) = self.data_dir {
            config.data_dir = dir;
        }
        if let Some(schema) = self.schema {
            config.schema_path = Some(schema);
        }
        if let Some(form_type) = self.form_type {
            config.form_type = (form_type != "*").then_some(form_type);
        }
        if let Some(size) = self.group_size {
            config.group_size = size;
        }
        if let Some(size) = self.session_size {
            config.session_size = size;
        }
        if let Some(limit) = self.concurrency {
            config.concurrency = limit;
        }
        if let Some(secs) = self.timeout_secs {
            config.http_timeout = std::time::Duration::from_secs(secs);
        }
        if let Some(secs) = self.backoff_secs {
            config.retry_backoff = std::time::Duration::from_secs(secs);
        }
        if let Some(attempts) = self.max_group_attempts {
            config.max_group_attempts = attempts;
        }
        if let Some(rate) = self.requests_per_second {
            config.requests_per_second = Some(rate);
        }
        config
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest one year, or every year with a manifest.
    Run { year: Option<i32> },
    /// Show checkpoint progress for a year.
    Status { year: i32 },
    /// Re-run the bundle pass for a fully checkpointed year.
    Bundle { year: i32 },
    /// Print the active schema table.
    Schema,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = cli.overrides.apply(PipelineConfig::from_env());

    match cli.command.unwrap_or(Commands::Run { year: None }) {
        Commands::Run { year } => {
            let controller = RunController::from_config(config)?;
            let years = match year {
                Some(year) => vec![year],
                None => controller.years().await?,
            };
            run_years(&controller, &years).await?;
        }
        Commands::Status { year } => {
            let controller = RunController::from_config(config)?;
            let status = controller.status(year).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Bundle { year } => {
            let controller = RunController::from_config(config)?;
            let report = controller.bundler().bundle_and_verify(year).await?;
            println!(
                "bundle complete: year={} rows={} groups={} sha256={} artifact={}",
                report.year,
                report.rows,
                report.groups,
                report.sha256,
                report.artifact.display()
            );
        }
        Commands::Schema => {
            let schema = config.load_schema()?;
            println!(
                "schema v{} identity={} tax_year={}",
                schema.version, schema.identity_field, schema.tax_year_field
            );
            let mut categories: Vec<&str> = Vec::new();
            for field in schema.fields() {
                if !categories.contains(&field.category.as_str()) {
                    categories.push(&field.category);
                }
            }
            for category in categories {
                println!("[{category}]");
                for field in schema.fields_in_category(category) {
                    println!(
                        "  {:<26} {:<5} legacy={} current={}",
                        field.name, field.field_type, field.legacy_path, field.current_path
                    );
                }
            }
        }
    }

    Ok(())
}

/// Years are independent; a failure is reported and the next year still runs.
async fn run_years(controller: &RunController, years: &[i32]) -> Result<()> {
    let mut failed = Vec::new();
    let mut unfinished = Vec::new();
    for &year in years {
        match controller.run_year(year).await {
            Ok(outcome) => {
                println!("{year}: {}", serde_json::to_string(&outcome)?);
                if let RunOutcome::PartiallyFetched { remaining } = outcome {
                    unfinished.push((year, remaining.len()));
                }
            }
            Err(err) => {
                error!(year, error = ?err, "year failed");
                failed.push(year);
            }
        }
    }

    info!(years = years.len(), failed = failed.len(), unfinished = unfinished.len(), "run finished");
    if !failed.is_empty() {
        bail!("years failed: {failed:?}");
    }
    if !unfinished.is_empty() {
        bail!("years left unfinished (year, groups remaining): {unfinished:?}");
    }
    Ok(())
}
