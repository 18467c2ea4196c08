//! Inventory and checkpoint storage backend.
//!
//! The core needs only upsert/append of rows, paginated reads and a run-scoped,
//! append-only checkpoint log. [`MemoryStore`] keeps everything in ordered in-process
//! maps; the journal-backed store in [`crate::journal`] layers durability on top of it.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::model::{Row, Table, Timestamp};

/// Row predicate for [`RowQuery`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowFilter {
    /// Every row.
    All,
    /// Rows owned by one of these sites.
    SiteIds(BTreeSet<String>),
    /// Rows describing one of these objects.
    ObjectIds(BTreeSet<String>),
}

impl RowFilter {
    fn matches(&self, row: &Row) -> bool {
        match self {
            RowFilter::All => true,
            RowFilter::SiteIds(ids) => row.site_id().map_or(false, |id| ids.contains(id)),
            RowFilter::ObjectIds(ids) => ids.contains(row.object_id()),
        }
    }
}

/// A paginated read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowQuery {
    /// Table to read.
    pub table: Table,
    /// Row predicate.
    pub filter: RowFilter,
    /// Matching rows to skip.
    pub offset: usize,
    /// Maximum rows to return.
    pub limit: usize,
}

impl RowQuery {
    /// First page of every row in `table`.
    pub fn all(table: Table, limit: usize) -> Self {
        RowQuery {
            table,
            filter: RowFilter::All,
            offset: 0,
            limit,
        }
    }
}

/// One page of rows.
#[derive(Debug, Clone, PartialEq)]
pub struct RowPage {
    /// Rows in table order.
    pub rows: Vec<Row>,
    /// Offset of the next page, if more rows match.
    pub next_offset: Option<usize>,
}

/// One entry of the checkpoint log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Run id.
    pub run_id: String,
    /// Checkpoint type key.
    pub checkpoint_type: String,
    /// Opaque state.
    pub state: serde_json::Value,
    /// When it was written.
    pub created_at: Timestamp,
}

/// Storage operations required by the core.
#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Inserts or replaces rows by their unique key. Returns the number of rows written.
    async fn upsert(&self, table: Table, rows: Vec<Row>) -> StoreResult<usize>;

    /// Appends rows without de-duplication.
    async fn append(&self, table: Table, rows: Vec<Row>) -> StoreResult<usize>;

    /// Reads one page of matching rows.
    async fn paged_query(&self, query: &RowQuery) -> StoreResult<RowPage>;

    /// Appends a checkpoint to the run's log.
    async fn save_checkpoint(
        &self,
        run_id: &str,
        checkpoint_type: &str,
        state: serde_json::Value,
    ) -> StoreResult<()>;

    /// Most recent checkpoint of one type.
    async fn latest_checkpoint(
        &self,
        run_id: &str,
        checkpoint_type: &str,
    ) -> StoreResult<Option<CheckpointRecord>>;

    /// Most recent checkpoint of every type for a run, ordered by type.
    async fn latest_checkpoints(&self, run_id: &str) -> StoreResult<Vec<CheckpointRecord>>;
}

/// Page size used by [`query_all`].
pub const QUERY_PAGE_SIZE: usize = 500;

/// Reads every matching row by following pages.
pub async fn query_all(
    store: &dyn InventoryStore,
    table: Table,
    filter: RowFilter,
) -> StoreResult<Vec<Row>> {
    let mut query = RowQuery {
        table,
        filter,
        offset: 0,
        limit: QUERY_PAGE_SIZE,
    };
    let mut rows = Vec::new();
    loop {
        let page = store.paged_query(&query).await?;
        rows.extend(page.rows);
        match page.next_offset {
            Some(next) => query.offset = next,
            None => return Ok(rows),
        }
    }
}

/// Reads the most recent row appended to `table` for `object_id`.
pub async fn fetch_latest(
    store: &dyn InventoryStore,
    table: Table,
    object_id: &str,
) -> StoreResult<Option<Row>> {
    let filter = RowFilter::ObjectIds(BTreeSet::from([object_id.to_string()]));
    Ok(query_all(store, table, filter).await?.pop())
}

#[derive(Debug, Default)]
struct TableData {
    rows: BTreeMap<String, Row>,
    appended: u64,
}

#[derive(Debug, Default)]
struct StoreState {
    tables: BTreeMap<Table, TableData>,
    checkpoints: Vec<CheckpointRecord>,
}

/// In-process store with ordered tables.
///
/// Upserted rows are ordered by key; appended rows by insertion.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

fn check_tables(table: Table, rows: &[Row]) -> StoreResult<()> {
    match rows.iter().find(|row| row.table() != table) {
        Some(row) => Err(StoreError::TableMismatch {
            expected: table,
            found: row.table(),
        }),
        None => Ok(()),
    }
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows in `table`.
    pub fn len(&self, table: Table) -> usize {
        self.state
            .read()
            .tables
            .get(&table)
            .map_or(0, |data| data.rows.len())
    }

    /// True if no table holds rows.
    pub fn is_empty(&self) -> bool {
        self.state.read().tables.values().all(|data| data.rows.is_empty())
    }

    pub(crate) fn apply_upsert(&self, table: Table, rows: Vec<Row>) -> StoreResult<usize> {
        check_tables(table, &rows)?;
        let count = rows.len();
        let mut state = self.state.write();
        let data = state.tables.entry(table).or_default();
        for row in rows {
            data.rows.insert(row.key(), row);
        }
        Ok(count)
    }

    pub(crate) fn apply_append(&self, table: Table, rows: Vec<Row>) -> StoreResult<usize> {
        check_tables(table, &rows)?;
        let count = rows.len();
        let mut state = self.state.write();
        let data = state.tables.entry(table).or_default();
        for row in rows {
            let key = format!("{:016}:{}", data.appended, row.key());
            data.appended += 1;
            data.rows.insert(key, row);
        }
        Ok(count)
    }

    pub(crate) fn apply_checkpoint(&self, record: CheckpointRecord) {
        self.state.write().checkpoints.push(record);
    }

    pub(crate) fn checkpoint_record(
        run_id: &str,
        checkpoint_type: &str,
        state: serde_json::Value,
    ) -> CheckpointRecord {
        CheckpointRecord {
            run_id: run_id.to_string(),
            checkpoint_type: checkpoint_type.to_string(),
            state,
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
impl InventoryStore for MemoryStore {
    async fn upsert(&self, table: Table, rows: Vec<Row>) -> StoreResult<usize> {
        self.apply_upsert(table, rows)
    }

    async fn append(&self, table: Table, rows: Vec<Row>) -> StoreResult<usize> {
        self.apply_append(table, rows)
    }

    async fn paged_query(&self, query: &RowQuery) -> StoreResult<RowPage> {
        let state = self.state.read();
        let Some(data) = state.tables.get(&query.table) else {
            return Ok(RowPage {
                rows: Vec::new(),
                next_offset: None,
            });
        };
        let limit = query.limit.max(1);
        let mut matching = data
            .rows
            .values()
            .filter(|row| query.filter.matches(row))
            .skip(query.offset);
        let rows: Vec<Row> = matching.by_ref().take(limit).cloned().collect();
        let next_offset = matching
            .next()
            .map(|_| query.offset + rows.len());
        Ok(RowPage { rows, next_offset })
    }

    async fn save_checkpoint(
        &self,
        run_id: &str,
        checkpoint_type: &str,
        state: serde_json::Value,
    ) -> StoreResult<()> {
        self.apply_checkpoint(Self::checkpoint_record(run_id, checkpoint_type, state));
        Ok(())
    }

    async fn latest_checkpoint(
        &self,
        run_id: &str,
        checkpoint_type: &str,
    ) -> StoreResult<Option<CheckpointRecord>> {
        let state = self.state.read();
        Ok(state
            .checkpoints
            .iter()
            .rev()
            .find(|c| c.run_id == run_id && c.checkpoint_type == checkpoint_type)
            .cloned())
    }

    async fn latest_checkpoints(&self, run_id: &str) -> StoreResult<Vec<CheckpointRecord>> {
        let state = self.state.read();
        let mut latest: BTreeMap<&str, &CheckpointRecord> = BTreeMap::new();
        for record in state.checkpoints.iter().filter(|c| c.run_id == run_id) {
            latest.insert(record.checkpoint_type.as_str(), record);
        }
        Ok(latest.into_values().cloned().collect())
    }
}
