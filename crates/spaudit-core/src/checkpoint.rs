//! Run-scoped checkpoints for resumable pipelines and crawls.
//!
//! Checkpoints are appended to the storage backend's log; the most recent entry per type
//! wins. [`CheckpointStore`] writes through and keeps a read cache of what it has seen.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::StoreResult;
use crate::model::Timestamp;
use crate::store::InventoryStore;

/// Checkpoint type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CheckpointKind {
    /// Completion marker of one stage.
    StageStatus(String),
    /// Name of the last completed stage.
    LastCompletedStage,
    /// Failure of the last attempt.
    PipelineError,
    /// Overall run status.
    PipelineStatus,
    /// Completion marker of one site's crawl.
    SiteStatus(String),
    /// Cursor of the incremental site listing.
    SitesDeltaCursor,
    /// Ids of the sites discovered for this run.
    DiscoveredSites,
}

impl CheckpointKind {
    /// Stable string form stored in the backend.
    pub fn key(&self) -> String {
        match self {
            CheckpointKind::StageStatus(stage) => format!("stage_status:{}", stage),
            CheckpointKind::LastCompletedStage => "last_completed_stage".to_string(),
            CheckpointKind::PipelineError => "pipeline_error".to_string(),
            CheckpointKind::PipelineStatus => "pipeline_status".to_string(),
            CheckpointKind::SiteStatus(site) => format!("site_status:{}", site),
            CheckpointKind::SitesDeltaCursor => "sites_delta_cursor".to_string(),
            CheckpointKind::DiscoveredSites => "discovered_sites".to_string(),
        }
    }
}

impl fmt::Display for CheckpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Completion marker written for stages and sites.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionMarker {
    /// Always `completed`.
    pub status: String,
    /// When the unit of work completed.
    pub completed_at: Timestamp,
}

impl CompletionMarker {
    fn now() -> Self {
        CompletionMarker {
            status: "completed".to_string(),
            completed_at: Utc::now(),
        }
    }

    fn is_completed(&self) -> bool {
        self.status == "completed"
    }
}

/// Failure recorded when a stage raises.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineFailure {
    /// Failing stage.
    pub stage: String,
    /// Error message.
    pub error: String,
    /// When it failed.
    pub failed_at: Timestamp,
}

/// Checkpoints of one run.
pub struct CheckpointStore {
    run_id: String,
    backend: Arc<dyn InventoryStore>,
    seen: DashMap<String, serde_json::Value>,
}

impl CheckpointStore {
    /// Binds the checkpoints of `run_id` in `backend`.
    pub fn new(run_id: impl Into<String>, backend: Arc<dyn InventoryStore>) -> Self {
        CheckpointStore {
            run_id: run_id.into(),
            backend,
            seen: DashMap::new(),
        }
    }

    /// Run id.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Appends a checkpoint.
    pub async fn save<T: Serialize>(&self, kind: &CheckpointKind, state: &T) -> StoreResult<()> {
        let value = serde_json::to_value(state)?;
        let key = kind.key();
        self.backend
            .save_checkpoint(&self.run_id, &key, value.clone())
            .await?;
        tracing::debug!(run_id = %self.run_id, checkpoint = %key, "checkpoint saved");
        self.seen.insert(key, value);
        Ok(())
    }

    /// Most recent checkpoint of `kind`, decoded.
    pub async fn load<T: DeserializeOwned>(&self, kind: &CheckpointKind) -> StoreResult<Option<T>> {
        let key = kind.key();
        let cached = self.seen.get(&key).map(|v| v.value().clone());
        let value = match cached {
            Some(value) => value,
            None => match self.backend.latest_checkpoint(&self.run_id, &key).await? {
                Some(record) => {
                    self.seen.insert(key, record.state.clone());
                    record.state
                }
                None => return Ok(None),
            },
        };
        Ok(Some(serde_json::from_value(value)?))
    }

    /// True if a checkpoint exists for this run at all.
    pub async fn has_any(&self) -> StoreResult<bool> {
        Ok(!self.backend.latest_checkpoints(&self.run_id).await?.is_empty())
    }

    /// Whether `stage` has a completion marker.
    pub async fn is_stage_completed(&self, stage: &str) -> StoreResult<bool> {
        self.is_completed(&CheckpointKind::StageStatus(stage.to_string()))
            .await
    }

    /// Writes the completion marker of `stage` and records it as the last completed stage.
    pub async fn mark_stage_completed(&self, stage: &str) -> StoreResult<()> {
        self.save(
            &CheckpointKind::StageStatus(stage.to_string()),
            &CompletionMarker::now(),
        )
        .await?;
        self.save(&CheckpointKind::LastCompletedStage, &stage).await
    }

    /// Name of the last completed stage.
    pub async fn last_completed_stage(&self) -> StoreResult<Option<String>> {
        self.load(&CheckpointKind::LastCompletedStage).await
    }

    /// Whether the crawl of `site_id` completed.
    pub async fn is_site_completed(&self, site_id: &str) -> StoreResult<bool> {
        self.is_completed(&CheckpointKind::SiteStatus(site_id.to_string()))
            .await
    }

    /// Marks the crawl of `site_id` completed.
    pub async fn mark_site_completed(&self, site_id: &str) -> StoreResult<()> {
        self.save(
            &CheckpointKind::SiteStatus(site_id.to_string()),
            &CompletionMarker::now(),
        )
        .await
    }

    /// Records a stage failure.
    pub async fn record_failure(&self, stage: &str, error: &str) -> StoreResult<()> {
        let failure = PipelineFailure {
            stage: stage.to_string(),
            error: error.to_string(),
            failed_at: Utc::now(),
        };
        self.save(&CheckpointKind::PipelineError, &failure).await
    }

    async fn is_completed(&self, kind: &CheckpointKind) -> StoreResult<bool> {
        Ok(self
            .load::<CompletionMarker>(kind)
            .await?
            .map_or(false, |marker| marker.is_completed()))
    }
}

impl fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointStore")
            .field("run_id", &self.run_id)
            .field("cached", &self.seen.len())
            .finish()
    }
}
