//! Database connections
//!
//! Every database (coordination and shards) shares one set of connection
//! parameters; only the database name changes.

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use thiserror::Error;

use crate::catalog::Ident;
use crate::config::DatabaseConfig;

/// Database operation errors with contextual information
#[derive(Error, Debug)]
pub enum DbError {
    /// SQL query or connection error
    #[error("Database query failed: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Could not connect to the named database
    #[error("Cannot connect to database '{database}': {source}")]
    Connect {
        database: String,
        #[source]
        source: sqlx::Error,
    },
}

pub type DbResult<T> = Result<T, DbError>;

impl From<DbError> for crate::error::CompilerError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::Sqlx(e) => Self::Database(e),
            DbError::Connect { database, source } => Self::shard(database, source),
        }
    }
}

/// Builds pools for the coordination database and for individual shards
#[derive(Debug, Clone)]
pub struct Databases {
    config: DatabaseConfig,
}

impl Databases {
    pub fn new(config: DatabaseConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn connect_options(&self, database: &str) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.config.host)
            .port(self.config.port)
            .username(&self.config.user)
            .password(&self.config.password)
            .database(database)
            .application_name("survey-compiler")
    }

    /// Pool for the coordination database
    pub async fn coordination(&self) -> DbResult<PgPool> {
        let database = &self.config.coordination_database;
        let pool = PgPoolOptions::new()
            .max_connections(self.config.max_connections)
            .acquire_timeout(self.config.connect_timeout())
            .connect_with(self.connect_options(database))
            .await
            .map_err(|source| DbError::Connect {
                database: database.clone(),
                source,
            })?;

        tracing::info!(
            database = %database,
            max_connections = self.config.max_connections,
            "Coordination database pool created"
        );

        Ok(pool)
    }

    /// Single-connection pool for one shard. Shards are visited one at a time,
    /// so a second connection would only sit idle.
    pub async fn shard(&self, shard: &Ident) -> DbResult<PgPool> {
        PgPoolOptions::new()
            .max_connections(1)
            .min_connections(0)
            .acquire_timeout(self.config.connect_timeout())
            .connect_with(self.connect_options(shard.as_str()))
            .await
            .map_err(|source| DbError::Connect {
                database: shard.to_string(),
                source,
            })
    }
}

pub async fn health_check(pool: &PgPool) -> DbResult<()> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .map(|_| ())
        .map_err(DbError::from)
}

/// Whether `schema.table` exists
pub async fn table_exists(
    executor: impl sqlx::PgExecutor<'_>,
    schema: &Ident,
    table: &Ident,
) -> DbResult<bool> {
    let exists: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT FROM information_schema.tables
            WHERE table_schema = $1 AND table_name = $2
        )
        "#,
    )
    .bind(schema.as_str())
    .bind(table.as_str())
    .fetch_one(executor)
    .await?;

    Ok(exists)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_options_vary_only_by_database() {
        let dbs = Databases::new(DatabaseConfig {
            host: "db.internal".to_string(),
            port: 6543,
            ..DatabaseConfig::default()
        });

        let musi = dbs.connect_options("musi");
        let solo = dbs.connect_options("solo");

        assert_eq!(musi.get_host(), "db.internal");
        assert_eq!(musi.get_port(), 6543);
        assert_eq!(musi.get_database(), Some("musi"));
        assert_eq!(solo.get_database(), Some("solo"));
        assert_eq!(musi.get_username(), solo.get_username());
    }
}
