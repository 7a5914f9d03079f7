//! PostgreSQL backend for identities, configuration sets and templates

use outpost_common::config::DatabaseConfig;
use outpost_common::{Error, Result};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, warn};

/// Schema for the reference-data tables
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Shared connection pool; cheap to clone
#[derive(Clone)]
pub struct DatabasePool {
    pool: PgPool,
}

impl DatabasePool {
    /// Connect with the configured pool bounds and bring the schema up to date
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| Error::Config("database.url is required for the postgres backend".into()))?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections.min(config.max_connections))
            .acquire_timeout(Duration::from_millis(config.acquire_timeout_ms))
            .connect(url)
            .await
            .map_err(|e| Error::Database(format!("cannot connect to {}: {}", redact(url), e)))?;

        info!(
            max_connections = config.max_connections,
            "Connected to {}",
            redact(url)
        );

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Wrap an existing pool; the schema is assumed to be in place
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn migrate(&self) -> Result<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("migration failed: {}", e)))?;
        info!("Schema is up to date");
        Ok(())
    }

    /// Round-trip a trivial query; used by readiness checks
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(db_err)
    }
}

/// Map a sqlx error into the storage error
pub(crate) fn db_err(e: sqlx::Error) -> Error {
    match e {
        sqlx::Error::PoolTimedOut => {
            warn!("Timed out waiting for a database connection");
            Error::Database("no database connection available".into())
        }
        other => Error::Database(other.to_string()),
    }
}

/// Connection string with the password masked
fn redact(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let Some((credentials, host)) = rest.rsplit_once('@') else {
        return url.to_string();
    };
    match credentials.split_once(':') {
        Some((user, _)) => format!("{}://{}:***@{}", scheme, user, host),
        None => url.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Pool for the Postgres-backed repository tests, from
    /// `OUTPOST_TEST_DATABASE_URL`; those tests pass vacuously without it
    pub(crate) async fn test_pool() -> Option<DatabasePool> {
        let url = std::env::var("OUTPOST_TEST_DATABASE_URL").ok()?;
        let config = DatabaseConfig {
            backend: "postgres".into(),
            url: Some(url),
            max_connections: 4,
            min_connections: 0,
            ..Default::default()
        };
        Some(DatabasePool::connect(&config).await.unwrap())
    }

    #[test]
    fn test_redact() {
        assert_eq!(
            redact("postgres://outpost:secret@db:5432/outpost"),
            "postgres://outpost:***@db:5432/outpost"
        );
        assert_eq!(redact("postgres://db/outpost"), "postgres://db/outpost");
        assert_eq!(redact("not a url"), "not a url");
    }

    #[tokio::test]
    async fn test_connect_requires_url() {
        let err = DatabasePool::connect(&DatabaseConfig::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), "InternalFailure");
        assert!(err.to_string().contains("database.url"));
    }

    #[tokio::test]
    async fn test_ping() {
        let Some(db) = test_pool().await else {
            return;
        };
        db.ping().await.unwrap();
        // Migrations are idempotent
        db.migrate().await.unwrap();
    }
}
