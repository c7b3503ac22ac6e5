//! Shard aggregation
//!
//! Copies every reachable shard's theme tables into the coordination
//! database. Each shard/theme pair is its own unit of work: it reads through a
//! cursor in fixed-size batches, inserts inside one transaction, and commits
//! once at the end. Any failure inside a pair rolls that pair back and the
//! loop moves on.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{info, instrument, warn};

use crate::catalog::{Ident, ShardName, TableRef, Theme, ThemeTables, Year};
use crate::error::{CompilerError, Result};
use crate::reconcile::{reconcile, ColumnDef, CopyPlan, TypeConflict};

/// Source side: one session per shard
#[async_trait]
pub trait ShardSource: Send + Sync {
    async fn open(&self, shard: &ShardName) -> Result<Box<dyn ShardSession>>;
}

#[async_trait]
pub trait ShardSession: Send {
    async fn table_exists(&mut self, schema: &Ident, table: &Ident) -> Result<bool>;

    /// Columns of `schema.table` in ordinal order
    async fn columns(&mut self, schema: &Ident, table: &Ident) -> Result<Vec<ColumnDef>>;

    /// Start streaming the rows selected by `plan`
    async fn open_cursor(&mut self, plan: &CopyPlan) -> Result<()>;

    /// Next batch of rows as JSON objects; empty when exhausted
    async fn next_batch(&mut self, size: usize) -> Result<Vec<Value>>;

    async fn close(self: Box<Self>) -> Result<()>;
}

/// Target side: the coordination database's per-theme/year tables
#[async_trait]
pub trait AggregationTarget: Send + Sync {
    async fn target_columns(&self, theme: Theme, year: Year) -> Result<Vec<ColumnDef>>;

    /// Open a transaction for one shard/theme insert
    async fn begin(&self, theme: Theme, year: Year, shard: &ShardName)
        -> Result<Box<dyn TargetWriter>>;
}

#[async_trait]
pub trait TargetWriter: Send {
    async fn insert(&mut self, columns: &[String], rows: Vec<Value>) -> Result<u64>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PairOutcome {
    Copied { rows: u64 },
    MissingTable,
    NoTransferableColumns,
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct PairReport {
    pub shard: ShardName,
    pub theme: Theme,
    pub outcome: PairOutcome,
    pub conflicts: Vec<TypeConflict>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregateReport {
    pub pairs: Vec<PairReport>,
    pub unreachable: Vec<ShardName>,
}

impl AggregateReport {
    pub fn total_rows(&self, theme: Theme) -> u64 {
        self.pairs
            .iter()
            .filter(|p| p.theme == theme)
            .map(|p| match p.outcome {
                PairOutcome::Copied { rows } => rows,
                _ => 0,
            })
            .sum()
    }

    pub fn rows_by_shard(&self, theme: Theme) -> BTreeMap<String, u64> {
        self.pairs
            .iter()
            .filter(|p| p.theme == theme)
            .filter_map(|p| match p.outcome {
                PairOutcome::Copied { rows } => Some((p.shard.to_string(), rows)),
                _ => None,
            })
            .collect()
    }

    pub fn failures(&self) -> usize {
        self.pairs
            .iter()
            .filter(|p| matches!(p.outcome, PairOutcome::Failed { .. }))
            .count()
            + self.unreachable.len()
    }
}

#[derive(Debug, Clone)]
pub struct AggregateOptions {
    pub batch_size: usize,
    pub shard_schema: Ident,
    pub geometry_column: String,
}

pub struct Aggregator<'a> {
    source: &'a dyn ShardSource,
    target: &'a dyn AggregationTarget,
    tables: &'a ThemeTables,
    options: AggregateOptions,
}

impl<'a> Aggregator<'a> {
    pub fn new(
        source: &'a dyn ShardSource,
        target: &'a dyn AggregationTarget,
        tables: &'a ThemeTables,
        options: AggregateOptions,
    ) -> Self {
        Self {
            source,
            target,
            tables,
            options,
        }
    }

    /// Aggregate `shards` for `year`. Only coordination-side failures escape.
    #[instrument(skip(self, shards), fields(shards = shards.len()))]
    pub async fn run(&self, shards: &[ShardName], year: Year) -> Result<AggregateReport> {
        let mut target_columns = BTreeMap::new();
        for theme in Theme::ALL {
            let columns = self.target.target_columns(theme, year).await?;
            if columns.is_empty() {
                return Err(CompilerError::critical(format!(
                    "aggregation table for {} {} has no columns",
                    theme, year
                )));
            }
            target_columns.insert(theme, columns);
        }

        let mut report = AggregateReport::default();

        for shard in shards {
            let mut session = match self.source.open(shard).await {
                Ok(session) => session,
                Err(e) => {
                    warn!(shard = %shard, error = %e, "Shard unreachable, skipping");
                    report.unreachable.push(shard.clone());
                    continue;
                }
            };

            for theme in Theme::ALL {
                let columns = target_columns.get(&theme).map(Vec::as_slice).unwrap_or(&[]);
                let (outcome, conflicts) =
                    match self.copy_pair(session.as_mut(), shard, theme, year, columns).await {
                        Ok(result) => result,
                        Err(e) => {
                            warn!(shard = %shard, theme = %theme, error = %e, "Shard/theme copy failed");
                            (PairOutcome::Failed { error: e.to_string() }, Vec::new())
                        }
                    };

                report.pairs.push(PairReport {
                    shard: shard.clone(),
                    theme,
                    outcome,
                    conflicts,
                });
            }

            if let Err(e) = session.close().await {
                warn!(shard = %shard, error = %e, "Failed to close shard session");
            }
        }

        for theme in Theme::ALL {
            info!(
                theme = %theme,
                year = %year,
                rows = report.total_rows(theme),
                "Aggregation totals"
            );
        }

        Ok(report)
    }

    async fn copy_pair(
        &self,
        session: &mut dyn ShardSession,
        shard: &ShardName,
        theme: Theme,
        year: Year,
        target_columns: &[ColumnDef],
    ) -> Result<(PairOutcome, Vec<TypeConflict>)> {
        let table = self.tables.data_table(theme, year)?;
        let schema = &self.options.shard_schema;

        if !session.table_exists(schema, &table).await? {
            warn!(shard = %shard, table = %table, "Source table missing");
            return Ok((PairOutcome::MissingTable, Vec::new()));
        }

        let source_columns = session.columns(schema, &table).await?;
        let reconciliation = reconcile(&source_columns, target_columns);

        for conflict in &reconciliation.conflicts {
            warn!(
                shard = %shard,
                theme = %theme,
                column = %conflict.column,
                source_type = %conflict.source_type,
                target_type = %conflict.target_type,
                "Column type conflict, column not copied"
            );
        }

        if reconciliation.is_empty() {
            warn!(shard = %shard, theme = %theme, "No transferable columns, skipping");
            return Ok((PairOutcome::NoTransferableColumns, reconciliation.conflicts));
        }

        let plan = CopyPlan::new(
            shard.clone(),
            TableRef::new(schema.clone(), table),
            &reconciliation,
            &source_columns,
            &self.options.geometry_column,
        )?;
        let columns = plan.column_names();

        session.open_cursor(&plan).await?;
        let mut writer = self.target.begin(theme, year, shard).await?;

        let mut rows = 0u64;
        let copied = loop {
            let batch = match session.next_batch(self.options.batch_size).await {
                Ok(batch) => batch,
                Err(e) => break Err(e),
            };
            if batch.is_empty() {
                break Ok(());
            }
            match writer.insert(&columns, batch).await {
                Ok(n) => rows += n,
                Err(e) => break Err(e),
            }
        };

        match copied {
            Ok(()) => {
                writer.commit().await?;
                info!(shard = %shard, theme = %theme, rows, "Shard/theme copied");
                Ok((PairOutcome::Copied { rows }, reconciliation.conflicts))
            }
            Err(e) => {
                if let Err(rollback) = writer.rollback().await {
                    warn!(shard = %shard, error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }
}
