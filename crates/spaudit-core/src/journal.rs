//! Durable store backed by an append-only JSON-lines journal.
//!
//! Every mutation is written to the journal before it is applied in memory; opening a
//! store replays the journal, so a later invocation with the same run id sees all rows and
//! checkpoints of the interrupted one. A torn final line (crash mid-write) is dropped from
//! the file before new writes are appended.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{StoreError, StoreResult};
use crate::model::{Row, Table};
use crate::store::{CheckpointRecord, InventoryStore, MemoryStore, RowPage, RowQuery};

/// Operation recorded in the journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalOp {
    Upsert { table: Table, rows: Vec<Row> },
    Append { table: Table, rows: Vec<Row> },
    Checkpoint { record: CheckpointRecord },
}

/// Journal-backed [`InventoryStore`].
#[derive(Debug)]
pub struct JournalStore {
    path: PathBuf,
    inner: MemoryStore,
    writer: Mutex<tokio::fs::File>,
    sync_writes: bool,
    replayed: usize,
}

impl JournalStore {
    /// Opens (creating if needed) the journal at `path` and replays it.
    pub async fn open(path: impl AsRef<Path>, sync_writes: bool) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let inner = MemoryStore::new();
        let mut replayed = 0;
        let mut torn_at = None;
        let mut unterminated = false;
        if tokio::fs::try_exists(&path).await? {
            let contents = tokio::fs::read_to_string(&path).await?;
            let lines: Vec<&str> = contents.lines().collect();
            for (idx, line) in lines.iter().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let op: JournalOp = match serde_json::from_str(line) {
                    Ok(op) => op,
                    Err(e) if idx + 1 == lines.len() && !contents.ends_with('\n') => {
                        tracing::warn!(path = %path.display(), line = idx + 1, error = %e, "dropping torn journal tail");
                        torn_at = Some(contents.rfind('\n').map_or(0, |i| i + 1) as u64);
                        break;
                    }
                    Err(e) => {
                        return Err(StoreError::Corrupt {
                            line: idx + 1,
                            reason: e.to_string(),
                        })
                    }
                };
                Self::apply(&inner, op)?;
                replayed += 1;
            }
            unterminated = torn_at.is_none() && !contents.is_empty() && !contents.ends_with('\n');
        }

        // Later appends must start on a fresh line.
        if let Some(len) = torn_at {
            let file = tokio::fs::OpenOptions::new().write(true).open(&path).await?;
            file.set_len(len).await?;
            file.sync_all().await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        if unterminated {
            file.write_all(b"\n").await?;
            file.flush().await?;
        }
        tracing::info!(path = %path.display(), replayed, "journal store opened");

        Ok(Self {
            path,
            inner,
            writer: Mutex::new(file),
            sync_writes,
            replayed,
        })
    }

    /// Journal file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of operations replayed when the store was opened.
    pub fn replayed(&self) -> usize {
        self.replayed
    }

    /// Number of rows in `table`.
    pub fn len(&self, table: Table) -> usize {
        self.inner.len(table)
    }

    fn apply(inner: &MemoryStore, op: JournalOp) -> StoreResult<usize> {
        match op {
            JournalOp::Upsert { table, rows } => inner.apply_upsert(table, rows),
            JournalOp::Append { table, rows } => inner.apply_append(table, rows),
            JournalOp::Checkpoint { record } => {
                inner.apply_checkpoint(record);
                Ok(1)
            }
        }
    }

    async fn write(&self, op: JournalOp) -> StoreResult<usize> {
        if let JournalOp::Upsert { table, rows } | JournalOp::Append { table, rows } = &op {
            if let Some(row) = rows.iter().find(|row| row.table() != *table) {
                return Err(StoreError::TableMismatch {
                    expected: *table,
                    found: row.table(),
                });
            }
        }

        let mut line = serde_json::to_string(&op)?;
        line.push('\n');

        let mut file = self.writer.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        if self.sync_writes {
            file.sync_data().await?;
        }
        Self::apply(&self.inner, op)
    }
}

#[async_trait]
impl InventoryStore for JournalStore {
    async fn upsert(&self, table: Table, rows: Vec<Row>) -> StoreResult<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        self.write(JournalOp::Upsert { table, rows }).await
    }

    async fn append(&self, table: Table, rows: Vec<Row>) -> StoreResult<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        self.write(JournalOp::Append { table, rows }).await
    }

    async fn paged_query(&self, query: &RowQuery) -> StoreResult<RowPage> {
        self.inner.paged_query(query).await
    }

    async fn save_checkpoint(
        &self,
        run_id: &str,
        checkpoint_type: &str,
        state: serde_json::Value,
    ) -> StoreResult<()> {
        let record = MemoryStore::checkpoint_record(run_id, checkpoint_type, state);
        self.write(JournalOp::Checkpoint { record }).await?;
        Ok(())
    }

    async fn latest_checkpoint(
        &self,
        run_id: &str,
        checkpoint_type: &str,
    ) -> StoreResult<Option<CheckpointRecord>> {
        self.inner.latest_checkpoint(run_id, checkpoint_type).await
    }

    async fn latest_checkpoints(&self, run_id: &str) -> StoreResult<Vec<CheckpointRecord>> {
        self.inner.latest_checkpoints(run_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Library;
    use crate::store::{query_all, RowFilter};
    use tempfile::TempDir;

    fn library(id: &str) -> Row {
        Row::Library(Library {
            library_id: id.to_string(),
            site_id: "s1".to_string(),
            name: "Documents".to_string(),
            web_url: None,
            created_at: None,
            modified_at: None,
            item_count: Some(3),
            has_unique_permissions: None,
        })
    }

    #[tokio::test]
    async fn test_replay_restores_rows_and_checkpoints() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("inventory.jsonl");
        {
            let store = JournalStore::open(&path, false).await.unwrap();
            store.upsert(Table::Libraries, vec![library("l1"), library("l2")]).await.unwrap();
            store.upsert(Table::Libraries, vec![library("l1")]).await.unwrap();
            store
                .save_checkpoint("run-1", "last_completed_stage", serde_json::json!("discovery"))
                .await
                .unwrap();
        }

        let reopened = JournalStore::open(&path, false).await.unwrap();
        assert_eq!(reopened.replayed(), 3);
        assert_eq!(reopened.len(Table::Libraries), 2);
        let cp = reopened
            .latest_checkpoint("run-1", "last_completed_stage")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cp.state, serde_json::json!("discovery"));
    }

    #[tokio::test]
    async fn test_torn_tail_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("inventory.jsonl");
        {
            let store = JournalStore::open(&path, true).await.unwrap();
            store.upsert(Table::Libraries, vec![library("l1")]).await.unwrap();
        }
        let mut contents = std::fs::read_to_string(&path).unwrap();
        contents.push_str("{\"op\":\"upsert\",\"table\":");
        std::fs::write(&path, contents).unwrap();

        let reopened = JournalStore::open(&path, false).await.unwrap();
        let rows = query_all(&reopened, Table::Libraries, RowFilter::All).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_writes_after_torn_tail_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("inventory.jsonl");
        {
            let store = JournalStore::open(&path, false).await.unwrap();
            store
                .save_checkpoint("run-1", "stage_status:discovery", serde_json::json!("completed"))
                .await
                .unwrap();
        }
        let mut contents = std::fs::read_to_string(&path).unwrap();
        contents.push_str("{\"op\":\"checkpoint\",\"rec");
        std::fs::write(&path, contents).unwrap();

        {
            let store = JournalStore::open(&path, false).await.unwrap();
            assert_eq!(store.replayed(), 1);
            store
                .save_checkpoint("run-1", "stage_status:validation", serde_json::json!("completed"))
                .await
                .unwrap();
        }

        let reopened = JournalStore::open(&path, false).await.unwrap();
        assert_eq!(reopened.replayed(), 2);
        let validation = reopened
            .latest_checkpoint("run-1", "stage_status:validation")
            .await
            .unwrap();
        assert!(validation.is_some());
        assert!(std::fs::read_to_string(&path).unwrap().ends_with('\n'));
    }

    #[tokio::test]
    async fn test_unterminated_last_line_kept_and_terminated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("inventory.jsonl");
        {
            let store = JournalStore::open(&path, false).await.unwrap();
            store.upsert(Table::Libraries, vec![library("l1")]).await.unwrap();
        }
        let contents = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, contents.trim_end()).unwrap();

        {
            let store = JournalStore::open(&path, false).await.unwrap();
            store.upsert(Table::Libraries, vec![library("l2")]).await.unwrap();
        }
        let reopened = JournalStore::open(&path, false).await.unwrap();
        assert_eq!(reopened.replayed(), 2);
        assert_eq!(reopened.len(Table::Libraries), 2);
    }

    #[tokio::test]
    async fn test_corrupt_middle_line_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("inventory.jsonl");
        std::fs::write(&path, "not json\n{\"op\":\"checkpoint\"}\n").unwrap();
        let err = JournalStore::open(&path, false).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { line: 1, .. }));
    }

    #[tokio::test]
    async fn test_mismatched_row_not_journaled() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("inventory.jsonl");
        let store = JournalStore::open(&path, false).await.unwrap();
        assert!(store.upsert(Table::Sites, vec![library("l1")]).await.is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }
}
