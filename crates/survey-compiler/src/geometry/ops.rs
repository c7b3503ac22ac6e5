use async_trait::async_trait;
use sqlx::PgPool;

use super::Wkb;
use crate::error::Result;

/// Topological operations the repair cascade needs. Implemented on PostGIS
/// in production; tests substitute an in-memory version.
#[async_trait]
pub trait GeometryOps: Send + Sync {
    async fn buffer(&self, geometry: &Wkb, distance: f64) -> Result<Wkb>;

    /// Union the geometry with itself, then rebuild polygons from the
    /// resulting linework. Returns the polygonal part only.
    async fn polygonize(&self, geometry: &Wkb) -> Result<Wkb>;

    async fn is_valid(&self, geometry: &Wkb) -> Result<bool>;

    /// Validity of many geometries in one round trip, in input order
    async fn is_valid_batch(&self, geometries: &[Wkb]) -> Result<Vec<bool>> {
        let mut out = Vec::with_capacity(geometries.len());
        for geometry in geometries {
            out.push(self.is_valid(geometry).await?);
        }
        Ok(out)
    }

    async fn from_geojson(&self, geometry: &serde_json::Value) -> Result<Wkb>;

    async fn to_geojson(&self, geometry: &Wkb) -> Result<serde_json::Value>;
}

/// Geometry operations evaluated by the coordination database
#[derive(Clone)]
pub struct PostgisOps {
    pool: PgPool,
    srid: i32,
}

impl PostgisOps {
    pub fn new(pool: PgPool) -> Self {
        Self { pool, srid: 4326 }
    }
}

#[async_trait]
impl GeometryOps for PostgisOps {
    async fn buffer(&self, geometry: &Wkb, distance: f64) -> Result<Wkb> {
        let bytes: Vec<u8> =
            sqlx::query_scalar("SELECT ST_AsEWKB(ST_Buffer(ST_GeomFromEWKB($1), $2))")
                .bind(geometry.as_bytes())
                .bind(distance)
                .fetch_one(&self.pool)
                .await?;
        Ok(Wkb::from_bytes(bytes))
    }

    async fn polygonize(&self, geometry: &Wkb) -> Result<Wkb> {
        let bytes: Vec<u8> = sqlx::query_scalar(
            r#"
            SELECT ST_AsEWKB(ST_SetSRID(
                ST_CollectionExtract(ST_Polygonize(u.geom), 3),
                ST_SRID(ST_GeomFromEWKB($1))
            ))
            FROM (SELECT ST_UnaryUnion(ST_GeomFromEWKB($1)) AS geom) u
            "#,
        )
        .bind(geometry.as_bytes())
        .fetch_one(&self.pool)
        .await?;
        Ok(Wkb::from_bytes(bytes))
    }

    async fn is_valid(&self, geometry: &Wkb) -> Result<bool> {
        let valid: bool = sqlx::query_scalar("SELECT ST_IsValid(ST_GeomFromEWKB($1))")
            .bind(geometry.as_bytes())
            .fetch_one(&self.pool)
            .await?;
        Ok(valid)
    }

    async fn is_valid_batch(&self, geometries: &[Wkb]) -> Result<Vec<bool>> {
        let bytes: Vec<Vec<u8>> = geometries.iter().map(|g| g.as_bytes().to_vec()).collect();
        let valid: Vec<bool> = sqlx::query_scalar(
            r#"
            SELECT ST_IsValid(ST_GeomFromEWKB(t.g))
            FROM unnest($1::bytea[]) WITH ORDINALITY AS t(g, i)
            ORDER BY t.i
            "#,
        )
        .bind(bytes)
        .fetch_all(&self.pool)
        .await?;
        Ok(valid)
    }

    async fn from_geojson(&self, geometry: &serde_json::Value) -> Result<Wkb> {
        let bytes: Vec<u8> =
            sqlx::query_scalar("SELECT ST_AsEWKB(ST_SetSRID(ST_GeomFromGeoJSON($1), $2))")
                .bind(geometry.to_string())
                .bind(self.srid)
                .fetch_one(&self.pool)
                .await?;
        Ok(Wkb::from_bytes(bytes))
    }

    async fn to_geojson(&self, geometry: &Wkb) -> Result<serde_json::Value> {
        let json: serde_json::Value =
            sqlx::query_scalar("SELECT ST_AsGeoJSON(ST_GeomFromEWKB($1))::jsonb")
                .bind(geometry.as_bytes())
                .fetch_one(&self.pool)
                .await?;
        Ok(json)
    }
}
