use async_trait::async_trait;
use futures::TryStreamExt;
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use std::path::Path;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, instrument};

use super::{fetch_columns, CoordinationStore, DatasetRecord};
use crate::aggregate::{AggregationTarget, TargetWriter};
use crate::catalog::{Ident, ShardName, TableRef, Theme, ThemeTables, Year};
use crate::controller::{ProgressStore, RunState};
use crate::db;
use crate::error::{CompilerError, Result};
use crate::geometry::{RepairItem, Wkb};
use crate::reconcile::{ColumnDef, SOURCE_SHARD_COLUMN};

/// Double-quote a column name read back from the catalog
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Text projection for a column in GeoJSON output
fn export_projection(column: &ColumnDef) -> String {
    let col = quote_ident(&column.name);
    if !column.family().is_temporal() {
        return col;
    }
    if column.data_type.starts_with("time ") {
        format!("{col}::text AS {col}")
    } else {
        format!("to_char({col}, 'YYYY-MM-DD HH24:MI:SS') AS {col}")
    }
}

/// The coordination database: aggregation tables, run state, dataset metadata
#[derive(Debug, Clone)]
pub struct PgCoordination {
    pool: PgPool,
    schema: Ident,
    tables: ThemeTables,
    geometry: Ident,
}

impl PgCoordination {
    pub fn new(pool: PgPool, schema: Ident, tables: ThemeTables, geometry: Ident) -> Self {
        Self {
            pool,
            schema,
            tables,
            geometry,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn table(&self, theme: Theme, year: Year) -> Result<TableRef> {
        Ok(TableRef::new(self.schema.clone(), self.tables.data_table(theme, year)?))
    }

    fn meta_table(&self, name: &str) -> String {
        format!("{}.{}", self.schema.quoted(), name)
    }

    async fn key_column(&self, table: &TableRef) -> Result<String> {
        fetch_columns(&self.pool, &table.schema, &table.table)
            .await?
            .into_iter()
            .find(|c| c.generated)
            .map(|c| quote_ident(&c.name))
            .ok_or_else(|| CompilerError::critical(format!("{} has no generated key column", table)))
    }

    async fn prepare_table(&self, theme: Theme, year: Year) -> Result<()> {
        let table = self.table(theme, year)?;
        let template = self.tables.template_table(theme)?;
        let geom = self.geometry.quoted();

        if db::table_exists(&self.pool, &self.schema, &template).await? {
            let template = TableRef::new(self.schema.clone(), template);
            sqlx::query(&format!(
                "CREATE TABLE IF NOT EXISTS {} (LIKE {} INCLUDING ALL)",
                table, template
            ))
            .execute(&self.pool)
            .await?;
            // rows land before repair, so any geometry type is accepted
            sqlx::query(&format!(
                "ALTER TABLE {table} ALTER COLUMN {geom} TYPE geometry USING {geom}::geometry"
            ))
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    ogc_fid serial PRIMARY KEY,
                    {geom} geometry,
                    created_at timestamptz DEFAULT now()
                )"
            ))
            .execute(&self.pool)
            .await?;
        }

        sqlx::query(&format!(
            "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} text",
            table, SOURCE_SHARD_COLUMN
        ))
        .execute(&self.pool)
        .await?;

        let index = Ident::new(format!("{}_geom_idx", table.table))?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} USING GIST ({})",
            index.quoted(),
            table,
            geom
        ))
        .execute(&self.pool)
        .await?;

        debug!(table = %table, "Aggregation table ready");
        Ok(())
    }

    /// Schema plus the run-state and dataset metadata tables
    pub async fn bootstrap(&self) -> Result<()> {
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema.quoted()))
            .execute(&self.pool)
            .await?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id text PRIMARY KEY,
                year integer NOT NULL,
                percentage smallint NOT NULL,
                status text NOT NULL,
                step text,
                last_update timestamptz NOT NULL DEFAULT now()
            )",
            self.meta_table("compiler_status")
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id serial PRIMARY KEY,
                title text NOT NULL UNIQUE,
                year integer NOT NULL,
                theme text NOT NULL,
                \"rows\" bigint NOT NULL DEFAULT 0,
                md5 text,
                size bigint,
                gdb_url text,
                shp_url text,
                map_url text,
                date_created timestamptz NOT NULL DEFAULT now()
            )",
            self.meta_table("compiler_datasets")
        ))
        .execute(&self.pool)
        .await?;

        info!(schema = %self.schema, "Coordination schema ready");
        Ok(())
    }
}

#[async_trait]
impl CoordinationStore for PgCoordination {
    async fn prepare_tables(&self, year: Year) -> Result<()> {
        for theme in Theme::ALL {
            self.prepare_table(theme, year).await?;
        }
        Ok(())
    }

    async fn clear(&self, year: Year) -> Result<u64> {
        let mut removed = 0;
        for theme in Theme::ALL {
            let table = self.table(theme, year)?;
            let result = sqlx::query(&format!("DELETE FROM {}", table))
                .execute(&self.pool)
                .await?;
            removed += result.rows_affected();
        }
        info!(year = %year, removed, "Aggregation tables cleared");
        Ok(removed)
    }

    async fn load_geometries(&self, theme: Theme, year: Year) -> Result<Vec<RepairItem<i64>>> {
        let table = self.table(theme, year)?;
        let key = self.key_column(&table).await?;
        let rows: Vec<(i64, Option<Vec<u8>>)> = sqlx::query_as(&format!(
            "SELECT {key}::bigint, ST_AsEWKB({geom}) FROM {table} ORDER BY {key}",
            geom = self.geometry.quoted()
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(key, bytes)| RepairItem {
                key,
                geometry: bytes.map(Wkb::from_bytes),
            })
            .collect())
    }

    #[instrument(skip(self, updates, drops), fields(updates = updates.len(), drops = drops.len()))]
    async fn apply_repairs(&self, theme: Theme, year: Year, updates: &[(i64, Wkb)], drops: &[i64]) -> Result<()> {
        let table = self.table(theme, year)?;
        let key = self.key_column(&table).await?;
        let geom = self.geometry.quoted();

        let keys: Vec<i64> = updates.iter().map(|(k, _)| *k).collect();
        let geometries: Vec<Vec<u8>> = updates.iter().map(|(_, g)| g.as_bytes().to_vec()).collect();

        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "UPDATE {table} AS t SET {geom} = ST_Multi(ST_Force2D(ST_GeomFromEWKB(u.g)))
             FROM unnest($1::bigint[], $2::bytea[]) AS u(k, g)
             WHERE t.{key} = u.k"
        ))
        .bind(&keys)
        .bind(&geometries)
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!("DELETE FROM {table} WHERE {key} = ANY($1::bigint[])"))
            .bind(drops)
            .execute(&mut *tx)
            .await?;

        sqlx::query(&format!(
            "UPDATE {table} SET {geom} = ST_Multi(ST_Force2D({geom}))
             WHERE {geom} IS NOT NULL
               AND (ST_GeometryType({geom}) <> 'ST_MultiPolygon' OR ST_NDims({geom}) > 2)"
        ))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn count_rows(&self, theme: Theme, year: Year) -> Result<u64> {
        let table = self.table(theme, year)?;
        let count: i64 = sqlx::query_scalar(&format!("SELECT count(*) FROM {}", table))
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn regions(&self, theme: Theme, year: Year) -> Result<Vec<ShardName>> {
        let table = self.table(theme, year)?;
        let names: Vec<String> = sqlx::query_scalar(&format!(
            "SELECT DISTINCT {col} FROM {table} WHERE {col} IS NOT NULL ORDER BY 1",
            col = SOURCE_SHARD_COLUMN
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(names.into_iter().filter_map(|n| ShardName::new(n).ok()).collect())
    }

    #[instrument(skip(self, out))]
    async fn export_geojson(&self, theme: Theme, year: Year, region: Option<&ShardName>, out: &Path) -> Result<u64> {
        let table = self.table(theme, year)?;
        let columns = fetch_columns(&self.pool, &table.schema, &table.table).await?;
        let projection = columns
            .iter()
            .map(export_projection)
            .collect::<Vec<_>>()
            .join(", ");
        let filter = match region {
            Some(_) => format!(" WHERE {} = $1", SOURCE_SHARD_COLUMN),
            None => String::new(),
        };
        let sql = format!(
            "SELECT ST_AsGeoJSON(r.*, '{}')::text FROM (SELECT {} FROM {}{}) r",
            self.geometry, projection, table, filter
        );

        let mut query = sqlx::query_scalar::<_, String>(&sql);
        if let Some(region) = region {
            query = query.bind(region.as_str());
        }
        let mut rows = query.fetch(&self.pool);

        let file = tokio::fs::File::create(out).await?;
        let mut writer = BufWriter::new(file);
        writer
            .write_all(b"{\"type\":\"FeatureCollection\",\"features\":[\n")
            .await?;

        let mut count = 0u64;
        while let Some(feature) = rows.try_next().await? {
            if count > 0 {
                writer.write_all(b",\n").await?;
            }
            writer.write_all(feature.as_bytes()).await?;
            count += 1;
        }

        writer.write_all(b"\n]}\n").await?;
        writer.flush().await?;

        info!(table = %table, region = ?region.map(|r| r.as_str()), features = count, "GeoJSON exported");
        Ok(count)
    }

    async fn upsert_dataset(&self, record: &DatasetRecord) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {table} AS d (title, year, theme, \"rows\", md5, size, gdb_url, shp_url, map_url, date_created)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, now())
             ON CONFLICT (title) DO UPDATE SET
                year = EXCLUDED.year,
                theme = EXCLUDED.theme,
                \"rows\" = EXCLUDED.\"rows\",
                md5 = COALESCE(EXCLUDED.md5, d.md5),
                size = COALESCE(EXCLUDED.size, d.size),
                gdb_url = COALESCE(EXCLUDED.gdb_url, d.gdb_url),
                shp_url = COALESCE(EXCLUDED.shp_url, d.shp_url),
                map_url = COALESCE(EXCLUDED.map_url, d.map_url),
                date_created = now()",
            table = self.meta_table("compiler_datasets")
        ))
        .bind(&record.title)
        .bind(record.year.value())
        .bind(record.theme.label())
        .bind(record.rows)
        .bind(&record.md5)
        .bind(record.size)
        .bind(&record.gdb_url)
        .bind(&record.shp_url)
        .bind(&record.map_url)
        .execute(&self.pool)
        .await?;

        info!(title = %record.title, rows = record.rows, "Dataset metadata written");
        Ok(())
    }
}

#[async_trait]
impl ProgressStore for PgCoordination {
    async fn prepare(&self) -> Result<()> {
        self.bootstrap().await
    }

    async fn save(&self, state: &RunState) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (id, year, percentage, status, step, last_update)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (id) DO UPDATE SET
                year = EXCLUDED.year,
                percentage = EXCLUDED.percentage,
                status = EXCLUDED.status,
                step = EXCLUDED.step,
                last_update = EXCLUDED.last_update",
            self.meta_table("compiler_status")
        ))
        .bind(&state.run_id)
        .bind(state.year.value())
        .bind(i16::from(state.percentage))
        .bind(state.status.as_str())
        .bind(state.step.map(|s| s.name()))
        .bind(state.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl AggregationTarget for PgCoordination {
    async fn target_columns(&self, theme: Theme, year: Year) -> Result<Vec<ColumnDef>> {
        let table = self.table(theme, year)?;
        fetch_columns(&self.pool, &table.schema, &table.table).await
    }

    async fn begin(&self, theme: Theme, year: Year, shard: &ShardName) -> Result<Box<dyn TargetWriter>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTargetWriter {
            tx,
            table: self.table(theme, year)?,
            shard: shard.clone(),
        }))
    }
}

/// One shard/theme insert transaction
pub struct PgTargetWriter {
    tx: Transaction<'static, Postgres>,
    table: TableRef,
    shard: ShardName,
}

#[async_trait]
impl TargetWriter for PgTargetWriter {
    async fn insert(&mut self, columns: &[String], rows: Vec<Value>) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let cols = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {table} ({cols}, {provenance})
             SELECT {cols}, $2 FROM jsonb_populate_recordset(NULL::{table}, $1)",
            table = self.table,
            provenance = SOURCE_SHARD_COLUMN,
        );

        let result = sqlx::query(&sql)
            .bind(Json(Value::Array(rows)))
            .bind(self.shard.as_str())
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
