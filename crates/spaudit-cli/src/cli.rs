use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use spaudit_core::model::{Row, Table};
use spaudit_core::remote::RemoteApi;
use spaudit_core::store::fetch_latest;
use spaudit_core::{
    audit_pipeline, AuditConfig, FixtureApi, FixtureTenant, InventoryStore, JournalStore,
    MemoryStore, RunSummary,
};
use tracing::{info, warn};

/// Seed of the synthetic dry-run tenant.
const DRY_RUN_SEED: u64 = 42;

#[derive(Parser)]
#[command(name = "spaudit")]
#[command(about = "Tenant inventory and permission audit", long_about = None)]
pub struct Cli {
    /// Configuration file (.toml or .json); defaults apply when it does not exist.
    #[arg(short, long, global = true, env = "SPAUDIT_CONFIG", default_value = "spaudit.toml")]
    pub config: PathBuf,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start a run, or resume one by id.
    Run {
        /// Run id; a new UUID when omitted.
        #[arg(long)]
        run_id: Option<String>,

        /// Only list active sites.
        #[arg(long)]
        active_only: bool,

        /// Restrict the run to these site URLs (repeatable).
        #[arg(long = "site")]
        sites: Vec<String>,

        /// Audit a synthetic tenant instead of a live one.
        #[arg(long, conflicts_with = "snapshot")]
        dry_run: bool,

        /// Number of sites in the synthetic tenant.
        #[arg(long, default_value = "10")]
        synthetic_sites: usize,

        /// Audit a captured tenant snapshot (JSON).
        #[arg(long)]
        snapshot: Option<PathBuf>,

        /// Print stage metrics in text exposition format after the run.
        #[arg(long)]
        metrics: bool,
    },
    /// Show the latest run row and checkpoints of a run.
    Status {
        #[arg(long)]
        run_id: String,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let config = load_config(&self.config)?;
        match self.command {
            Command::Run {
                run_id,
                active_only,
                sites,
                dry_run,
                synthetic_sites,
                snapshot,
                metrics,
            } => {
                let mut config = config;
                config.crawl.active_only |= active_only;
                config.crawl.site_allowlist.extend(sites);
                config.validate()?;

                let api: Arc<dyn RemoteApi> = match (snapshot, dry_run) {
                    (Some(path), _) => {
                        let tenant = FixtureTenant::from_file(&path)
                            .with_context(|| format!("loading snapshot {}", path.display()))?;
                        info!(path = %path.display(), sites = tenant.sites.len(), "replaying tenant snapshot");
                        Arc::new(FixtureApi::new(tenant))
                    }
                    (None, true) => {
                        info!(sites = synthetic_sites, "dry run over a synthetic tenant");
                        Arc::new(FixtureApi::new(FixtureTenant::synthetic(
                            synthetic_sites,
                            DRY_RUN_SEED,
                        )))
                    }
                    (None, false) => bail!(
                        "no tenant connection is configured; use --snapshot FILE or --dry-run"
                    ),
                };

                let run_id = run_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                let summary = run_audit(&run_id, api, &config).await?;
                print_summary(&summary);
                if metrics {
                    print!("{}", summary.metrics.render(&run_id));
                }
                Ok(())
            }
            Command::Status { run_id } => status(&run_id, &config).await,
        }
    }
}

fn load_config(path: &Path) -> Result<AuditConfig> {
    if path.exists() {
        AuditConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
    } else {
        warn!(path = %path.display(), "config file not found, using defaults");
        Ok(AuditConfig::default())
    }
}

async fn open_store(config: &AuditConfig) -> Result<Arc<dyn InventoryStore>> {
    match &config.store.journal_path {
        Some(path) => {
            let store = JournalStore::open(path, config.store.sync_writes)
                .await
                .with_context(|| format!("opening journal {}", path.display()))?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("no store.journal_path configured; results are kept in memory only");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn run_audit(
    run_id: &str,
    api: Arc<dyn RemoteApi>,
    config: &AuditConfig,
) -> Result<RunSummary> {
    let store = open_store(config).await?;
    let pipeline = audit_pipeline(run_id, api, store, config);
    info!(run_id, stages = ?pipeline.stage_names(), "starting audit");
    pipeline
        .run()
        .await
        .with_context(|| format!("run {} failed", run_id))
}

fn print_summary(summary: &RunSummary) {
    let r = &summary.record;
    println!("Run:         {}", r.run_id);
    println!("Status:      {}", r.status);
    println!("Sites:       {}", r.sites);
    println!("Libraries:   {}", r.libraries);
    println!("Folders:     {}", r.folders);
    println!("Files:       {}", r.files);
    println!("Permissions: {}", r.permissions);
    println!("Errors:      {}", r.error_count);
    if !summary.skipped_stages.is_empty() {
        println!("Resumed after: {}", summary.skipped_stages.join(", "));
    }
    for error in &r.errors {
        println!("  [{}] {}: {}", error.stage, error.scope, error.message);
    }
}

async fn status(run_id: &str, config: &AuditConfig) -> Result<()> {
    if config.store.journal_path.is_none() {
        bail!("status needs store.journal_path; in-memory runs are not retained");
    }
    let store = open_store(config).await?;
    let run = fetch_latest(store.as_ref(), Table::Runs, run_id).await?;
    let checkpoints = store.latest_checkpoints(run_id).await?;
    if run.is_none() && checkpoints.is_empty() {
        bail!("run {} not found", run_id);
    }

    if let Some(Row::Run(record)) = run {
        println!("{}", serde_json::to_string_pretty(&record)?);
    }
    println!("{:<40} {:<30} STATE", "CHECKPOINT", "WRITTEN");
    println!("{}", "-".repeat(80));
    for checkpoint in checkpoints {
        println!(
            "{:<40} {:<30} {}",
            checkpoint.checkpoint_type,
            checkpoint.created_at.to_rfc3339(),
            checkpoint.state
        );
    }
    Ok(())
}
