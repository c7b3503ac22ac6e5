//! Schema reconciliation between a shard table and the aggregation table
//!
//! Columns are matched by exact name. A name match whose declared types fall
//! into different families is dropped from the copy and reported as a type
//! conflict instead of failing later at insert time.

use serde::Serialize;

use crate::catalog::{Ident, ShardName, TableRef};
use crate::error::Result;

/// Provenance column appended to every aggregation table
pub const SOURCE_SHARD_COLUMN: &str = "source_shard";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    /// `information_schema.columns.data_type`
    pub data_type: String,
    /// `information_schema.columns.udt_name`
    pub udt_name: String,
    /// Serial/identity primary key generated by the table itself
    pub generated: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>, udt_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            udt_name: udt_name.into(),
            generated: false,
        }
    }

    pub fn generated(mut self) -> Self {
        self.generated = true;
        self
    }

    pub fn family(&self) -> TypeFamily {
        TypeFamily::of(&self.data_type, &self.udt_name)
    }
}

/// Coarse type classes; values move freely within a family
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TypeFamily {
    Text,
    Numeric,
    Temporal,
    Boolean,
    Json,
    Geometry,
    Other(String),
}

impl TypeFamily {
    pub fn of(data_type: &str, udt_name: &str) -> Self {
        let udt = udt_name.to_ascii_lowercase();
        if udt == "geometry" || udt == "geography" {
            return Self::Geometry;
        }

        match data_type.to_ascii_lowercase().as_str() {
            "text" | "character varying" | "character" | "name" | "citext" => Self::Text,
            "smallint" | "integer" | "bigint" | "numeric" | "real" | "double precision" => {
                Self::Numeric
            }
            "date"
            | "timestamp without time zone"
            | "timestamp with time zone"
            | "time without time zone"
            | "time with time zone" => Self::Temporal,
            "boolean" => Self::Boolean,
            "json" | "jsonb" => Self::Json,
            "user-defined" if udt == "citext" => Self::Text,
            "array" => Self::Other(udt),
            other => Self::Other(other.to_string()),
        }
    }

    pub fn is_temporal(&self) -> bool {
        matches!(self, Self::Temporal)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeConflict {
    pub column: String,
    pub source_type: String,
    pub target_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedColumn {
    pub name: Ident,
    pub geometry: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    /// Transferable columns in target-table order
    pub columns: Vec<PlannedColumn>,
    pub conflicts: Vec<TypeConflict>,
}

impl Reconciliation {
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Ordered intersection of `source` and `target`, in target order.
///
/// Generated keys and the provenance column of the target are never copied.
/// Columns whose names are not plain lowercase identifiers cannot be quoted
/// safely and are left out.
pub fn reconcile(source: &[ColumnDef], target: &[ColumnDef]) -> Reconciliation {
    let mut result = Reconciliation::default();

    for target_col in target {
        if target_col.generated || target_col.name == SOURCE_SHARD_COLUMN {
            continue;
        }

        let Some(source_col) = source.iter().find(|c| c.name == target_col.name) else {
            continue;
        };

        let (source_family, target_family) = (source_col.family(), target_col.family());
        if source_family != target_family {
            result.conflicts.push(TypeConflict {
                column: target_col.name.clone(),
                source_type: source_col.udt_name.clone(),
                target_type: target_col.udt_name.clone(),
            });
            continue;
        }

        match Ident::new(target_col.name.clone()) {
            Ok(name) => result.columns.push(PlannedColumn {
                name,
                geometry: target_family == TypeFamily::Geometry,
            }),
            Err(e) => tracing::warn!(column = %target_col.name, error = %e, "Column skipped"),
        }
    }

    result
}

/// Shard-side read plan for one shard/theme pair
#[derive(Debug, Clone)]
pub struct CopyPlan {
    pub shard: ShardName,
    pub source: TableRef,
    pub columns: Vec<PlannedColumn>,
    /// Source geometry column used to skip rows without a geometry
    pub geometry_filter: Option<Ident>,
}

impl CopyPlan {
    pub fn new(
        shard: ShardName,
        source: TableRef,
        reconciliation: &Reconciliation,
        source_columns: &[ColumnDef],
        geometry_column: &str,
    ) -> Result<Self> {
        let geometry_filter = source_columns
            .iter()
            .find(|c| c.name == geometry_column)
            .map(|c| Ident::new(c.name.clone()))
            .transpose()?;

        Ok(Self {
            shard,
            source,
            columns: reconciliation.columns.clone(),
            geometry_filter,
        })
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.to_string()).collect()
    }

    /// Query yielding one JSON object per row. Geometry columns are forced to
    /// two dimensions, wrapped as multi-geometries and shipped as hex EWKB.
    pub fn select_sql(&self) -> String {
        let projection = self
            .columns
            .iter()
            .map(|c| {
                let col = c.name.quoted();
                if c.geometry {
                    format!("encode(ST_AsEWKB(ST_Multi(ST_Force2D({col}))), 'hex') AS {col}")
                } else {
                    col
                }
            })
            .collect::<Vec<_>>()
            .join(", ");

        let filter = match &self.geometry_filter {
            Some(geom) => format!(" WHERE {} IS NOT NULL", geom.quoted()),
            None => String::new(),
        };

        format!(
            "SELECT to_jsonb(r) FROM (SELECT {} FROM {}{}) r",
            projection, self.source, filter
        )
    }
}
