//! Checkpoint and pending-write table access

use super::{limit_clause, string_param, where_clause};
use crate::checkpoint::WriteKind;
use crate::config::TableNames;
use crate::error::{Result, WarehouseError};
use crate::serializer::EncodedValue;
use crate::warehouse::{ColumnValue, ResultSet, Row, Statement, WarehouseClient};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

const CHECKPOINT_KEY: &[&str] = &["thread_id", "checkpoint_ns", "checkpoint_id"];
const WRITE_KEY: &[&str] = &["thread_id", "checkpoint_ns", "checkpoint_id", "task_id", "idx"];
const WRITE_UPDATE: &[&str] = &["channel", "encoding", "value", "write_type"];

const CHECKPOINT_COLUMNS: &str =
    "thread_id, checkpoint_ns, checkpoint_id, parent_checkpoint_id, encoding, checkpoint, metadata";
const WRITE_COLUMNS: &str =
    "thread_id, checkpoint_ns, checkpoint_id, task_id, idx, channel, encoding, value, write_type";

/// One stored checkpoint row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRow {
    pub thread_id: String,
    pub checkpoint_ns: String,
    pub checkpoint_id: String,
    pub parent_checkpoint_id: Option<String>,
    pub checkpoint: EncodedValue,
    /// Metadata as JSON text
    pub metadata: String,
}

impl CheckpointRow {
    fn identity(&self) -> (&str, &str, &str) {
        (&self.thread_id, &self.checkpoint_ns, &self.checkpoint_id)
    }

    fn from_row(row: Row<'_>) -> Result<Self> {
        Ok(Self {
            thread_id: row.string("thread_id")?.to_string(),
            checkpoint_ns: row.opt_string("checkpoint_ns")?.unwrap_or_default().to_string(),
            checkpoint_id: row.string("checkpoint_id")?.to_string(),
            parent_checkpoint_id: row.opt_string("parent_checkpoint_id")?.map(str::to_string),
            checkpoint: EncodedValue::from_parts(row.string("encoding")?, row.string("checkpoint")?),
            metadata: row.opt_string("metadata")?.unwrap_or("{}").to_string(),
        })
    }

    fn to_columns(&self) -> Vec<ColumnValue> {
        vec![
            ColumnValue::string("thread_id", &self.thread_id),
            ColumnValue::string("checkpoint_ns", &self.checkpoint_ns),
            ColumnValue::string("checkpoint_id", &self.checkpoint_id),
            ColumnValue::opt_string("parent_checkpoint_id", self.parent_checkpoint_id.as_deref()),
            ColumnValue::string("encoding", &self.checkpoint.tag),
            ColumnValue::string("checkpoint", &self.checkpoint.data),
            ColumnValue::string("metadata", &self.metadata),
        ]
    }
}

/// One stored pending write row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRow {
    pub thread_id: String,
    pub checkpoint_ns: String,
    pub checkpoint_id: String,
    pub task_id: String,
    pub idx: i64,
    pub channel: String,
    pub value: EncodedValue,
    pub write_type: WriteKind,
}

impl WriteRow {
    fn identity(&self) -> (&str, &str, &str, &str, i64) {
        (
            &self.thread_id,
            &self.checkpoint_ns,
            &self.checkpoint_id,
            &self.task_id,
            self.idx,
        )
    }

    fn from_row(row: Row<'_>) -> Result<Self> {
        Ok(Self {
            thread_id: row.string("thread_id")?.to_string(),
            checkpoint_ns: row.opt_string("checkpoint_ns")?.unwrap_or_default().to_string(),
            checkpoint_id: row.string("checkpoint_id")?.to_string(),
            task_id: row.string("task_id")?.to_string(),
            idx: row.i64("idx")?,
            channel: row.string("channel")?.to_string(),
            value: EncodedValue::from_parts(
                row.string("encoding")?,
                row.opt_string("value")?.unwrap_or("null"),
            ),
            write_type: row.string("write_type")?.parse()?,
        })
    }

    fn to_columns(&self) -> Vec<ColumnValue> {
        vec![
            ColumnValue::string("thread_id", &self.thread_id),
            ColumnValue::string("checkpoint_ns", &self.checkpoint_ns),
            ColumnValue::string("checkpoint_id", &self.checkpoint_id),
            ColumnValue::string("task_id", &self.task_id),
            ColumnValue::bigint("idx", self.idx),
            ColumnValue::string("channel", &self.channel),
            ColumnValue::string("encoding", &self.value.tag),
            ColumnValue::string("value", &self.value.data),
            ColumnValue::string("write_type", self.write_type.as_str()),
        ]
    }
}

/// Selection for one page of a checkpoint listing
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    /// Restrict to one thread; `None` lists every thread
    pub thread_id: Option<String>,
    /// Restrict to one namespace; `None` lists every namespace
    pub checkpoint_ns: Option<String>,
    /// Only ids lexically below this one
    pub before: Option<String>,
    /// Resume after this row, as returned last on the previous page
    pub after_row: Option<(String, String, String)>,
    pub page_size: usize,
}

/// Repository for the checkpoints and checkpoint_writes tables
#[derive(Clone)]
pub struct CheckpointRepository {
    client: Arc<dyn WarehouseClient>,
    tables: Arc<TableNames>,
}

impl std::fmt::Debug for CheckpointRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointRepository")
            .field("checkpoints", &self.tables.checkpoints)
            .field("writes", &self.tables.writes)
            .finish()
    }
}

impl CheckpointRepository {
    pub fn new(client: Arc<dyn WarehouseClient>, tables: Arc<TableNames>) -> Self {
        Self { client, tables }
    }

    pub fn tables(&self) -> &TableNames {
        &self.tables
    }

    async fn run(&self, statement: Statement, table: &str) -> Result<ResultSet> {
        debug!(label = statement.label, table, "Executing statement");
        self.client.execute(&statement).await
    }

    /// Append a checkpoint row, failing with `Conflict` if its identity is taken
    pub async fn insert_checkpoint(&self, row: &CheckpointRow) -> Result<()> {
        let dialect = self.client.dialect();
        let statement = dialect.insert_if_absent(
            "insert_checkpoint",
            &self.tables.checkpoints,
            row.to_columns(),
            CHECKPOINT_KEY,
        )?;
        let result = self.run(statement, &self.tables.checkpoints).await?;

        if dialect.inserted_rows(&result)? == 0 {
            debug!(
                thread_id = %row.thread_id,
                checkpoint_id = %row.checkpoint_id,
                "Checkpoint identity already taken"
            );
            return Err(WarehouseError::Conflict {
                thread_id: row.thread_id.clone(),
                checkpoint_ns: row.checkpoint_ns.clone(),
                checkpoint_id: row.checkpoint_id.clone(),
            });
        }
        Ok(())
    }

    /// Checkpoint row by id, or the latest of the thread/namespace when `checkpoint_id` is `None`
    pub async fn get_checkpoint(
        &self,
        thread_id: &str,
        checkpoint_ns: &str,
        checkpoint_id: Option<&str>,
    ) -> Result<Option<CheckpointRow>> {
        let table = &self.tables.checkpoints;
        let statement = match checkpoint_id {
            Some(checkpoint_id) => Statement::new(
                "get_checkpoint",
                format!(
                    "SELECT {CHECKPOINT_COLUMNS} FROM {table} \
                     WHERE thread_id = :thread_id AND checkpoint_ns = :checkpoint_ns \
                     AND checkpoint_id = :checkpoint_id"
                ),
            )
            .bind("checkpoint_id", checkpoint_id),
            None => Statement::new(
                "get_latest_checkpoint",
                format!(
                    "SELECT {CHECKPOINT_COLUMNS} FROM {table} \
                     WHERE thread_id = :thread_id AND checkpoint_ns = :checkpoint_ns \
                     ORDER BY checkpoint_id DESC LIMIT 1"
                ),
            ),
        }
        .bind("thread_id", thread_id)
        .bind("checkpoint_ns", checkpoint_ns);

        let result = self.run(statement, table).await?;
        result.first().map(CheckpointRow::from_row).transpose()
    }

    /// Pending writes of one checkpoint, ordered by task id then write index
    pub async fn get_writes(
        &self,
        thread_id: &str,
        checkpoint_ns: &str,
        checkpoint_id: &str,
    ) -> Result<Vec<WriteRow>> {
        let table = &self.tables.writes;
        let statement = Statement::new(
            "get_writes",
            format!(
                "SELECT {WRITE_COLUMNS} FROM {table} \
                 WHERE thread_id = :thread_id AND checkpoint_ns = :checkpoint_ns \
                 AND checkpoint_id = :checkpoint_id ORDER BY task_id, idx"
            ),
        )
        .bind("thread_id", thread_id)
        .bind("checkpoint_ns", checkpoint_ns)
        .bind("checkpoint_id", checkpoint_id);

        let result = self.run(statement, table).await?;
        result.iter().map(WriteRow::from_row).collect()
    }

    /// One page of checkpoint rows, most recent id first
    ///
    /// Rows sharing an id across threads or namespaces are ordered by thread id
    /// and namespace (descending) so `after_row` resumes without gaps.
    pub async fn list_checkpoints(&self, query: &ListQuery) -> Result<Vec<CheckpointRow>> {
        let table = &self.tables.checkpoints;
        let mut conditions = Vec::new();
        let mut statement = Statement::new("list_checkpoints", String::new());

        if let Some(thread_id) = &query.thread_id {
            conditions.push("thread_id = :thread_id".to_string());
            statement = statement.bind("thread_id", thread_id);
        }
        if let Some(checkpoint_ns) = &query.checkpoint_ns {
            conditions.push("checkpoint_ns = :checkpoint_ns".to_string());
            statement = statement.bind("checkpoint_ns", checkpoint_ns);
        }
        if let Some(before) = &query.before {
            conditions.push("checkpoint_id < :before".to_string());
            statement = statement.bind("before", before);
        }
        if let Some((thread_id, checkpoint_ns, checkpoint_id)) = &query.after_row {
            conditions.push(
                "(checkpoint_id < :after_id OR (checkpoint_id = :after_id AND \
                 (thread_id < :after_thread OR (thread_id = :after_thread AND checkpoint_ns < :after_ns))))"
                    .to_string(),
            );
            statement = statement
                .bind("after_id", checkpoint_id)
                .bind("after_thread", thread_id)
                .bind("after_ns", checkpoint_ns);
        }

        statement.sql = format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM {table}{} \
             ORDER BY checkpoint_id DESC, thread_id DESC, checkpoint_ns DESC{}",
            where_clause(&conditions),
            limit_clause(Some(query.page_size.max(1)), 0),
        );

        let result = self.run(statement, table).await?;
        result.iter().map(CheckpointRow::from_row).collect()
    }

    /// Pending writes for several checkpoints in one statement, grouped by checkpoint identity
    pub async fn get_writes_for(
        &self,
        checkpoints: &[CheckpointRow],
    ) -> Result<HashMap<(String, String, String), Vec<WriteRow>>> {
        let mut grouped: HashMap<(String, String, String), Vec<WriteRow>> = HashMap::new();
        if checkpoints.is_empty() {
            return Ok(grouped);
        }

        let table = &self.tables.writes;
        let mut parameters = Vec::with_capacity(checkpoints.len() * 3);
        let mut disjuncts = Vec::with_capacity(checkpoints.len());
        for (i, row) in checkpoints.iter().enumerate() {
            let (thread_id, checkpoint_ns, checkpoint_id) = row.identity();
            disjuncts.push(format!(
                "(thread_id = :thread_id_{i} AND checkpoint_ns = :checkpoint_ns_{i} \
                 AND checkpoint_id = :checkpoint_id_{i})"
            ));
            parameters.push(string_param(format!("thread_id_{i}"), thread_id));
            parameters.push(string_param(format!("checkpoint_ns_{i}"), checkpoint_ns));
            parameters.push(string_param(format!("checkpoint_id_{i}"), checkpoint_id));
        }

        let statement = Statement::new(
            "get_writes_for_page",
            format!(
                "SELECT {WRITE_COLUMNS} FROM {table} WHERE {} \
                 ORDER BY thread_id, checkpoint_ns, checkpoint_id, task_id, idx",
                disjuncts.join(" OR ")
            ),
        )
        .with_parameters(parameters);

        let result = self.run(statement, table).await?;
        for row in result.iter() {
            let write = WriteRow::from_row(row)?;
            grouped
                .entry((
                    write.thread_id.clone(),
                    write.checkpoint_ns.clone(),
                    write.checkpoint_id.clone(),
                ))
                .or_default()
                .push(write);
        }
        Ok(grouped)
    }

    /// Upsert pending writes in one statement
    ///
    /// Rows are keyed by `(thread_id, checkpoint_ns, checkpoint_id, task_id, idx)`;
    /// a key repeated within `writes` keeps its last row.
    pub async fn insert_pending_writes(&self, writes: &[WriteRow]) -> Result<()> {
        let mut unique: BTreeMap<(&str, &str, &str, &str, i64), &WriteRow> = BTreeMap::new();
        for write in writes {
            unique.insert(write.identity(), write);
        }
        if unique.is_empty() {
            return Ok(());
        }

        let rows: Vec<Vec<ColumnValue>> = unique.values().map(|w| w.to_columns()).collect();
        let statement = self.client.dialect().upsert(
            "upsert_writes",
            &self.tables.writes,
            &rows,
            WRITE_KEY,
            WRITE_UPDATE,
        )?;
        self.run(statement, &self.tables.writes).await?;
        Ok(())
    }

    /// Remove every checkpoint and pending write of a thread, across all namespaces
    ///
    /// Writes go first so an interrupted delete never leaves writes without
    /// a checkpoint still visible to readers.
    pub async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        for (label, table) in [
            ("delete_thread_writes", &self.tables.writes),
            ("delete_thread_checkpoints", &self.tables.checkpoints),
        ] {
            let statement = Statement::new(label, format!("DELETE FROM {table} WHERE thread_id = :thread_id"))
                .bind("thread_id", thread_id);
            self.run(statement, table).await?;
        }
        Ok(())
    }
}
