use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;

use crate::aggregate::{ShardSession, ShardSource};
use crate::catalog::{Ident, ShardName};
use crate::db::{self, Databases};
use crate::error::{CompilerError, Result};
use crate::reconcile::{ColumnDef, CopyPlan};

const CURSOR: &str = "survey_copy";

/// Opens one single-connection session per shard
#[derive(Debug, Clone)]
pub struct PgShardSource {
    databases: Databases,
}

impl PgShardSource {
    pub fn new(databases: Databases) -> Self {
        Self { databases }
    }
}

#[async_trait]
impl ShardSource for PgShardSource {
    async fn open(&self, shard: &ShardName) -> Result<Box<dyn ShardSession>> {
        let pool = self.databases.shard(shard).await?;
        db::health_check(&pool)
            .await
            .map_err(|e| CompilerError::shard(shard.as_str(), e))?;
        debug!(shard = %shard, "Shard session opened");

        Ok(Box::new(PgShardSession {
            shard: shard.clone(),
            pool,
            cursor: None,
        }))
    }
}

pub struct PgShardSession {
    shard: ShardName,
    pool: PgPool,
    /// Transaction holding the open cursor, if any
    cursor: Option<Transaction<'static, Postgres>>,
}

impl PgShardSession {
    async fn release_cursor(&mut self) -> Result<()> {
        if let Some(tx) = self.cursor.take() {
            tx.rollback().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ShardSession for PgShardSession {
    async fn table_exists(&mut self, schema: &Ident, table: &Ident) -> Result<bool> {
        self.release_cursor().await?;
        Ok(db::table_exists(&self.pool, schema, table).await?)
    }

    async fn columns(&mut self, schema: &Ident, table: &Ident) -> Result<Vec<ColumnDef>> {
        self.release_cursor().await?;
        super::fetch_columns(&self.pool, schema, table).await
    }

    async fn open_cursor(&mut self, plan: &CopyPlan) -> Result<()> {
        self.release_cursor().await?;

        let mut tx = self.pool.begin().await?;
        let sql = format!("DECLARE {} NO SCROLL CURSOR FOR {}", CURSOR, plan.select_sql());
        sqlx::query(&sql).execute(&mut *tx).await?;
        debug!(shard = %self.shard, source = %plan.source, "Cursor opened");

        self.cursor = Some(tx);
        Ok(())
    }

    async fn next_batch(&mut self, size: usize) -> Result<Vec<Value>> {
        let Some(tx) = self.cursor.as_mut() else {
            return Err(CompilerError::shard(self.shard.as_str(), "no open cursor"));
        };
        let sql = format!("FETCH FORWARD {} FROM {}", size.max(1), CURSOR);
        let rows: Vec<Value> = sqlx::query_scalar(&sql).fetch_all(&mut **tx).await?;
        Ok(rows)
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        self.release_cursor().await?;
        self.pool.close().await;
        Ok(())
    }
}
