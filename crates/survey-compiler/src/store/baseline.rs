use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use tracing::{debug, info};

use crate::baseline::{BaselineStore, QcRecord, ShardBaseline};
use crate::catalog::{Ident, ShardName, TableRef, Theme, ThemeTables, Year};
use crate::db::{self, Databases};
use crate::error::{CompilerError, Result};
use crate::geometry::Wkb;

/// Column names shared by every baseline and QC table
#[derive(Debug, Clone)]
pub struct BaselineColumns {
    pub geometry: Ident,
    pub region: Ident,
    pub status: Ident,
}

async fn create_baseline_table(pool: &PgPool, table: &TableRef, columns: &BaselineColumns) -> Result<()> {
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {} (
            ogc_fid serial PRIMARY KEY,
            {} geometry(MultiPolygon, 4326),
            {} varchar(255)
        )",
        table,
        columns.geometry.quoted(),
        columns.region.quoted()
    ))
    .execute(pool)
    .await?;

    let index = Ident::new(format!("idx_{}_geom", table.table))?;
    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} USING GIST ({})",
        index.quoted(),
        table,
        columns.geometry.quoted()
    ))
    .execute(pool)
    .await?;

    Ok(())
}

/// Insert each geometry unless an equal geometry for the same region is
/// already present. One statement per geometry so that later rows see
/// earlier ones.
async fn insert_deduplicated(
    pool: &PgPool,
    table: &TableRef,
    columns: &BaselineColumns,
    region: &ShardName,
    geometries: &[Wkb],
) -> Result<u64> {
    let geom = columns.geometry.quoted();
    let region_col = columns.region.quoted();
    let sql = format!(
        "INSERT INTO {table} ({geom}, {region_col})
         SELECT g, $2 FROM (SELECT ST_Multi(ST_Force2D(ST_GeomFromWKB($1, 4326))) AS g) c
         WHERE NOT EXISTS (
            SELECT 1 FROM {table} b
            WHERE ST_Equals(b.{geom}, c.g) AND b.{region_col} = $2
         )"
    );

    let mut tx = pool.begin().await?;
    let mut inserted = 0;
    for geometry in geometries {
        let result = sqlx::query(&sql)
            .bind(geometry.as_bytes())
            .bind(region.as_str())
            .execute(&mut *tx)
            .await?;
        inserted += result.rows_affected();
    }
    tx.commit().await?;

    debug!(table = %table, region = %region, candidates = geometries.len(), inserted, "Baseline rows inserted");
    Ok(inserted)
}

/// Baseline tables in the coordination database and in every shard
pub struct PgBaselineStore {
    databases: Databases,
    central: PgPool,
    central_schema: Ident,
    shard_schema: Ident,
    tables: ThemeTables,
    columns: BaselineColumns,
}

impl PgBaselineStore {
    pub fn new(
        databases: Databases,
        central: PgPool,
        central_schema: Ident,
        shard_schema: Ident,
        tables: ThemeTables,
        columns: BaselineColumns,
    ) -> Self {
        Self {
            databases,
            central,
            central_schema,
            shard_schema,
            tables,
            columns,
        }
    }

    fn central_table(&self, theme: Theme, year: Year) -> Result<TableRef> {
        Ok(TableRef::new(
            self.central_schema.clone(),
            self.tables.baseline_table(theme, year)?,
        ))
    }
}

#[async_trait]
impl BaselineStore for PgBaselineStore {
    async fn prepare_central(&self, year: Year) -> Result<()> {
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", self.central_schema.quoted()))
            .execute(&self.central)
            .await?;
        for theme in Theme::ALL {
            let table = self.central_table(theme, year)?;
            create_baseline_table(&self.central, &table, &self.columns).await?;
            info!(table = %table, "Central baseline table ready");
        }
        Ok(())
    }

    async fn open_shard(&self, shard: &ShardName) -> Result<Box<dyn ShardBaseline>> {
        let pool = self.databases.shard(shard).await?;
        db::health_check(&pool)
            .await
            .map_err(|e| CompilerError::shard(shard.as_str(), e))?;

        Ok(Box::new(PgShardBaseline {
            pool,
            schema: self.shard_schema.clone(),
            tables: self.tables.clone(),
            columns: self.columns.clone(),
        }))
    }

    async fn insert_central(&self, theme: Theme, year: Year, region: &ShardName, geometries: &[Wkb]) -> Result<u64> {
        let table = self.central_table(theme, year)?;
        insert_deduplicated(&self.central, &table, &self.columns, region, geometries).await
    }
}

pub struct PgShardBaseline {
    pool: PgPool,
    schema: Ident,
    tables: ThemeTables,
    columns: BaselineColumns,
}

impl PgShardBaseline {
    fn table(&self, name: Ident) -> TableRef {
        TableRef::new(self.schema.clone(), name)
    }
}

#[async_trait]
impl ShardBaseline for PgShardBaseline {
    async fn qc_table_exists(&mut self, theme: Theme, year: Year) -> Result<bool> {
        let table = self.tables.qc_table(theme, year)?;
        Ok(db::table_exists(&self.pool, &self.schema, &table).await?)
    }

    async fn qc_records(&mut self, theme: Theme, year: Year) -> Result<Vec<QcRecord>> {
        let table = self.table(self.tables.qc_table(theme, year)?);
        let geom = self.columns.geometry.quoted();
        let status = self.columns.status.quoted();

        let rows: Vec<(Vec<u8>, Value)> = sqlx::query_as(&format!(
            "SELECT DISTINCT ON (ST_AsText({geom}))
                ST_AsBinary({geom}), {status}::jsonb
             FROM {table}
             WHERE {status} IS NOT NULL AND {geom} IS NOT NULL
             ORDER BY ST_AsText({geom}), ogc_fid DESC"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(bytes, status)| QcRecord {
                geometry: Wkb::from_bytes(bytes),
                status,
            })
            .collect())
    }

    async fn prepare_baseline(&mut self, theme: Theme, year: Year) -> Result<()> {
        let table = self.table(self.tables.baseline_table(theme, year)?);
        create_baseline_table(&self.pool, &table, &self.columns).await
    }

    async fn insert_baseline(&mut self, theme: Theme, year: Year, region: &ShardName, geometries: &[Wkb]) -> Result<u64> {
        let table = self.table(self.tables.baseline_table(theme, year)?);
        insert_deduplicated(&self.pool, &table, &self.columns, region, geometries).await
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
