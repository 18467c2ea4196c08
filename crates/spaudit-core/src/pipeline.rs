//! Staged audit pipeline.
//!
//! A [`Pipeline`] runs an ordered list of [`Stage`]s over one [`RunContext`]. Completed
//! stages are checkpointed, so a later invocation with the same run id skips them and
//! resumes from the first incomplete stage, after hydrating the context from the store.
//! The first failing stage ends the invocation: the error is recorded, checkpointed and
//! the run row is marked failed.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;
use tracing::{error, info};

use crate::checkpoint::{CheckpointKind, CheckpointStore};
use crate::config::RunConfig;
use crate::error::{PipelineError, StageError, StoreError};
use crate::metrics::MetricsCollector;
use crate::model::{
    ErrorLog, File, Folder, Library, PermissionSet, Row, RunError, RunRecord, RunStatus, Site,
    Table, Timestamp,
};
use crate::resolver::InventoryIndex;
use crate::store::{fetch_latest, query_all, InventoryStore, RowFilter};

/// One step of the pipeline.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Stable name, used for checkpoints and metrics.
    fn name(&self) -> &str;

    /// Runs the stage. Branch-local problems go to `ctx.errors`; an `Err` fails the run.
    async fn execute(&self, ctx: &mut RunContext) -> Result<(), StageError>;
}

/// State shared by the stages of one run.
pub struct RunContext {
    /// Run id.
    pub run_id: String,
    /// Sites in scope.
    pub sites: Vec<Site>,
    /// Libraries of those sites.
    pub libraries: Vec<Library>,
    /// Folders of those libraries.
    pub folders: Vec<Folder>,
    /// Files of those libraries.
    pub files: Vec<File>,
    /// Permission sets resolved in this invocation.
    pub permissions: Vec<PermissionSet>,
    /// Permission rows persisted for the run's sites.
    pub permission_rows: u64,
    /// Errors recorded so far.
    pub errors: ErrorLog,
    /// Stage and custom metrics.
    pub metrics: MetricsCollector,
    /// Storage backend.
    pub store: Arc<dyn InventoryStore>,
    /// Checkpoints of this run.
    pub checkpoints: Arc<CheckpointStore>,
}

impl RunContext {
    /// Empty context bound to `checkpoints`' run.
    pub fn new(
        store: Arc<dyn InventoryStore>,
        checkpoints: Arc<CheckpointStore>,
        error_cap: usize,
    ) -> Self {
        RunContext {
            run_id: checkpoints.run_id().to_string(),
            sites: Vec::new(),
            libraries: Vec::new(),
            folders: Vec::new(),
            files: Vec::new(),
            permissions: Vec::new(),
            permission_rows: 0,
            errors: ErrorLog::with_cap(error_cap),
            metrics: MetricsCollector::new(),
            store,
            checkpoints,
        }
    }

    /// Sites, libraries, folders and files held.
    pub fn item_count(&self) -> u64 {
        (self.sites.len() + self.libraries.len() + self.folders.len() + self.files.len()) as u64
    }

    /// Replaces the inventory with the stored rows of `site_ids`.
    pub async fn load_inventory(&mut self, site_ids: &[String]) -> Result<(), StoreError> {
        let ids: BTreeSet<String> = site_ids.iter().cloned().collect();
        let store = self.store.as_ref();
        let filter = || RowFilter::SiteIds(ids.clone());

        self.sites.clear();
        self.libraries.clear();
        self.folders.clear();
        self.files.clear();
        for table in [Table::Sites, Table::Libraries, Table::Folders, Table::Files] {
            for row in query_all(store, table, filter()).await? {
                match row {
                    Row::Site(s) => self.sites.push(s),
                    Row::Library(l) => self.libraries.push(l),
                    Row::Folder(f) => self.folders.push(f),
                    Row::File(f) => self.files.push(f),
                    Row::Permission(_) | Row::Run(_) => {}
                }
            }
        }
        self.permission_rows = query_all(store, Table::Permissions, filter()).await?.len() as u64;
        Ok(())
    }

    /// Restores the inventory of a resumed run. Returns false if discovery never recorded
    /// its sites.
    pub async fn hydrate(&mut self) -> Result<bool, StoreError> {
        let site_ids: Option<Vec<String>> = self
            .checkpoints
            .load(&CheckpointKind::DiscoveredSites)
            .await?;
        match site_ids {
            Some(ids) => {
                self.load_inventory(&ids).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Carries over the errors `previous` recorded in stages that completed. Errors of the
    /// failed or unfinished stage are dropped; that stage runs again and records its own.
    pub async fn restore_errors(&mut self, previous: &RunRecord) -> Result<(), StoreError> {
        let mut kept = Vec::new();
        let mut dropped = 0usize;
        for error in &previous.errors {
            if self.checkpoints.is_stage_completed(&error.stage).await? {
                kept.push(error.clone());
            } else {
                dropped += 1;
            }
        }
        let total = (previous.error_count as usize).saturating_sub(dropped);
        self.errors.restore(kept, total);
        Ok(())
    }

    /// Parent-chain index over the inventory.
    pub fn index(&self) -> InventoryIndex {
        self.sites
            .iter()
            .map(Site::object_ref)
            .chain(self.libraries.iter().map(Library::object_ref))
            .chain(self.folders.iter().map(Folder::object_ref))
            .chain(self.files.iter().map(File::object_ref))
            .collect()
    }

    /// Run row reflecting the current counts.
    pub fn run_record(&self, started_at: Timestamp, status: RunStatus) -> RunRecord {
        RunRecord {
            run_id: self.run_id.clone(),
            started_at,
            finished_at: status.is_terminal().then(Utc::now),
            status,
            sites: self.sites.len() as u64,
            libraries: self.libraries.len() as u64,
            folders: self.folders.len() as u64,
            files: self.files.len() as u64,
            permissions: self.permission_rows,
            error_count: self.errors.total() as u64,
            failed_stage: None,
            failure: None,
            errors: self.errors.entries().to_vec(),
        }
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("sites", &self.sites.len())
            .field("libraries", &self.libraries.len())
            .field("folders", &self.folders.len())
            .field("files", &self.files.len())
            .field("errors", &self.errors.total())
            .finish_non_exhaustive()
    }
}

/// Result of a successful invocation.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Final run row.
    pub record: RunRecord,
    /// Metrics of the stages executed in this invocation.
    pub metrics: MetricsCollector,
    /// Stages skipped because an earlier invocation completed them.
    pub skipped_stages: Vec<String>,
}

/// Ordered stages over a shared context.
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
    store: Arc<dyn InventoryStore>,
    checkpoints: Arc<CheckpointStore>,
    config: RunConfig,
}

impl Pipeline {
    /// Pipeline without stages.
    pub fn new(
        store: Arc<dyn InventoryStore>,
        checkpoints: Arc<CheckpointStore>,
        config: RunConfig,
    ) -> Self {
        Pipeline {
            stages: Vec::new(),
            store,
            checkpoints,
            config,
        }
    }

    /// Appends a stage.
    pub fn with_stage(mut self, stage: Box<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Stage names in execution order.
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run id.
    pub fn run_id(&self) -> &str {
        self.checkpoints.run_id()
    }

    /// Executes every stage not yet completed for this run.
    pub async fn run(&self) -> Result<RunSummary, PipelineError> {
        let run_id = self.run_id().to_string();
        let status: Option<RunStatus> = self
            .checkpoints
            .load(&CheckpointKind::PipelineStatus)
            .await?;
        if let Some(status @ (RunStatus::Completed | RunStatus::CompletedWithErrors)) = status {
            return Err(PipelineError::AlreadyFinished {
                run_id,
                status: status.to_string(),
            });
        }

        let previous = match fetch_latest(self.store.as_ref(), Table::Runs, &run_id).await? {
            Some(Row::Run(previous)) => Some(previous),
            _ => None,
        };
        let started_at = previous
            .as_ref()
            .map(|p| p.started_at)
            .unwrap_or_else(Utc::now);
        let mut ctx = RunContext::new(
            Arc::clone(&self.store),
            Arc::clone(&self.checkpoints),
            self.config.error_cap,
        );
        if let Some(previous) = &previous {
            ctx.restore_errors(previous).await?;
        }
        self.set_status(&ctx, started_at, RunStatus::Running, None).await?;
        info!(run_id = %run_id, stages = self.stages.len(), resumed = status.is_some(), "run started");

        let mut skipped = Vec::new();
        let body = self.run_stages(&mut ctx, started_at, &mut skipped);
        let outcome = match self.config.global_timeout() {
            Some(limit) => match tokio::time::timeout(limit, body).await {
                Ok(result) => result,
                Err(_) => Err(PipelineError::TimedOut(limit)),
            },
            None => body.await,
        };

        match outcome {
            Ok(()) => {
                let status = if ctx.errors.is_empty() {
                    RunStatus::Completed
                } else {
                    RunStatus::CompletedWithErrors
                };
                let record = self.set_status(&ctx, started_at, status, None).await?;
                info!(
                    run_id = %run_id,
                    status = %status,
                    sites = record.sites,
                    files = record.files,
                    permissions = record.permissions,
                    errors = record.error_count,
                    "run finished"
                );
                Ok(RunSummary {
                    record,
                    metrics: ctx.metrics,
                    skipped_stages: skipped,
                })
            }
            Err(e) => {
                let stage = match &e {
                    PipelineError::StageFailed { stage, .. } => stage.clone(),
                    _ => "pipeline".to_string(),
                };
                let message = match &e {
                    PipelineError::StageFailed { source, .. } => source.to_string(),
                    other => other.to_string(),
                };
                ctx.errors.push(RunError::new(&stage, "run", &message));
                self.checkpoints.record_failure(&stage, &message).await?;
                self.set_status(&ctx, started_at, RunStatus::Failed, Some((stage, message)))
                    .await?;
                error!(run_id = %run_id, error = %e, "run failed");
                Err(e)
            }
        }
    }

    async fn run_stages(
        &self,
        ctx: &mut RunContext,
        started_at: Timestamp,
        skipped: &mut Vec<String>,
    ) -> Result<(), PipelineError> {
        let mut hydrated = false;
        for stage in &self.stages {
            let name = stage.name().to_string();
            if self.checkpoints.is_stage_completed(&name).await? {
                info!(run_id = %ctx.run_id, stage = %name, "stage already completed, skipping");
                skipped.push(name);
                continue;
            }
            if !skipped.is_empty() && !hydrated {
                hydrated = ctx.hydrate().await?;
                info!(run_id = %ctx.run_id, items = ctx.item_count(), "context hydrated from store");
            }

            info!(run_id = %ctx.run_id, stage = %name, "stage started");
            let started = Instant::now();
            let errors_before = ctx.errors.total();
            let result = stage.execute(ctx).await;
            let elapsed = started.elapsed();
            let errors = (ctx.errors.total() - errors_before) as u64;
            let items = ctx.item_count();
            ctx.metrics
                .record_stage(&name, elapsed, items, errors, result.is_ok());

            match result {
                Ok(()) => {
                    // The run row carries the stage's errors before the stage counts as done.
                    self.set_status(ctx, started_at, RunStatus::Running, None)
                        .await?;
                    self.checkpoints.mark_stage_completed(&name).await?;
                    info!(
                        run_id = %ctx.run_id,
                        stage = %name,
                        elapsed_ms = elapsed.as_millis() as u64,
                        items,
                        errors,
                        "stage completed"
                    );
                }
                Err(source) => {
                    error!(run_id = %ctx.run_id, stage = %name, error = %source, "stage failed");
                    return Err(PipelineError::StageFailed {
                        stage: name,
                        source,
                    });
                }
            }
        }
        Ok(())
    }

    async fn set_status(
        &self,
        ctx: &RunContext,
        started_at: Timestamp,
        status: RunStatus,
        failure: Option<(String, String)>,
    ) -> Result<RunRecord, StoreError> {
        let mut record = ctx.run_record(started_at, status);
        if let Some((stage, message)) = failure {
            record.failed_stage = Some(stage);
            record.failure = Some(message);
        }
        self.checkpoints
            .save(&CheckpointKind::PipelineStatus, &status)
            .await?;
        self.store
            .upsert(Table::Runs, vec![Row::Run(record.clone())])
            .await?;
        Ok(record)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("run_id", &self.run_id())
            .field("stages", &self.stage_names())
            .finish_non_exhaustive()
    }
}
