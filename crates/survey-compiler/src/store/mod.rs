//! PostgreSQL-backed implementations of the pipeline seams
//!
//! - [`PgShardSource`]: reads shard tables through a server-side cursor
//! - [`PgCoordination`]: aggregation tables, run state and dataset metadata
//! - [`PgBaselineStore`]: QC tables and baseline ratchet tables

use async_trait::async_trait;
use serde::Serialize;
use std::path::Path;

use crate::catalog::{Ident, ShardName, Theme, Year};
use crate::error::Result;
use crate::geometry::{RepairItem, Wkb};
use crate::reconcile::ColumnDef;

pub mod baseline;
pub mod coordination;
pub mod shard;

pub use baseline::{BaselineColumns, PgBaselineStore};
pub use coordination::PgCoordination;
pub use shard::PgShardSource;

/// One row of the artifact metadata table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetRecord {
    pub title: String,
    pub year: Year,
    pub theme: Theme,
    pub rows: i64,
    pub md5: Option<String>,
    pub size: Option<i64>,
    pub gdb_url: Option<String>,
    pub shp_url: Option<String>,
    pub map_url: Option<String>,
}

/// Coordination-database operations used by the pipeline steps
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Create both theme tables for `year` when missing
    async fn prepare_tables(&self, year: Year) -> Result<()>;

    /// Remove every row of both theme tables for `year`
    async fn clear(&self, year: Year) -> Result<u64>;

    async fn load_geometries(&self, theme: Theme, year: Year) -> Result<Vec<RepairItem<i64>>>;

    /// Write repaired geometries, delete dropped rows, and normalize the rest
    /// to 2-D multi-polygons
    async fn apply_repairs(&self, theme: Theme, year: Year, updates: &[(i64, Wkb)], drops: &[i64]) -> Result<()>;

    async fn count_rows(&self, theme: Theme, year: Year) -> Result<u64>;

    /// Shards that contributed rows, for per-region tiles
    async fn regions(&self, theme: Theme, year: Year) -> Result<Vec<ShardName>>;

    /// Write the table as a GeoJSON feature collection, optionally restricted
    /// to one region. Returns the feature count.
    async fn export_geojson(&self, theme: Theme, year: Year, region: Option<&ShardName>, out: &Path) -> Result<u64>;

    async fn upsert_dataset(&self, record: &DatasetRecord) -> Result<()>;
}

/// Columns of `schema.table` in ordinal order
pub(crate) async fn fetch_columns(
    executor: impl sqlx::PgExecutor<'_>,
    schema: &Ident,
    table: &Ident,
) -> Result<Vec<ColumnDef>> {
    let rows: Vec<(String, String, String, bool)> = sqlx::query_as(
        r#"
        SELECT column_name::text,
               data_type::text,
               udt_name::text,
               (coalesce(column_default, '') LIKE 'nextval(%' OR is_identity = 'YES') AS generated
        FROM information_schema.columns
        WHERE table_schema = $1 AND table_name = $2
        ORDER BY ordinal_position
        "#,
    )
    .bind(schema.as_str())
    .bind(table.as_str())
    .fetch_all(executor)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(name, data_type, udt_name, generated)| ColumnDef {
            name,
            data_type,
            udt_name,
            generated,
        })
        .collect())
}
