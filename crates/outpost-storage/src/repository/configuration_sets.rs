//! Configuration set repository

use crate::db::{db_err, DatabasePool};
use crate::models::{ConfigurationSet, EventDestination};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outpost_common::{EntityKind, Error, Result};
use sqlx::types::Json;
use sqlx::FromRow;

/// Configuration set repository trait
#[async_trait]
pub trait ConfigurationSetRepository: Send + Sync {
    async fn create(&self, set: ConfigurationSet) -> Result<ConfigurationSet>;
    async fn get(&self, name: &str) -> Result<Option<ConfigurationSet>>;
    async fn list(&self) -> Result<Vec<ConfigurationSet>>;
    async fn delete(&self, name: &str) -> Result<()>;
    async fn set_sending_enabled(&self, name: &str, enabled: bool) -> Result<ConfigurationSet>;
    async fn set_tracking_domain(
        &self,
        name: &str,
        domain: Option<String>,
    ) -> Result<ConfigurationSet>;
    /// Fails with `AlreadyExists` when the set already has a destination of that name
    async fn add_event_destination(
        &self,
        name: &str,
        destination: EventDestination,
    ) -> Result<ConfigurationSet>;
    async fn remove_event_destination(
        &self,
        name: &str,
        destination: &str,
    ) -> Result<ConfigurationSet>;
}

#[derive(Debug, FromRow)]
struct ConfigurationSetRow {
    name: String,
    sending_enabled: bool,
    event_destinations: Json<Vec<EventDestination>>,
    tracking_domain: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ConfigurationSetRow> for ConfigurationSet {
    fn from(row: ConfigurationSetRow) -> Self {
        ConfigurationSet {
            name: row.name,
            sending_enabled: row.sending_enabled,
            event_destinations: row.event_destinations.0,
            tracking_domain: row.tracking_domain,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Database configuration set repository
pub struct DbConfigurationSetRepository {
    pool: DatabasePool,
}

impl DbConfigurationSetRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    fn missing(name: &str) -> Error {
        Error::does_not_exist(EntityKind::ConfigurationSet, name)
    }

    /// Read-modify-write of the destination list under a row lock
    async fn modify_destinations<F>(&self, name: &str, f: F) -> Result<ConfigurationSet>
    where
        F: FnOnce(&mut Vec<EventDestination>) -> Result<()> + Send,
    {
        let mut tx = self.pool.pool().begin().await.map_err(db_err)?;

        let row = sqlx::query_as::<_, ConfigurationSetRow>(
            "SELECT * FROM configuration_sets WHERE name = $1 FOR UPDATE",
        )
        .bind(name)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| Self::missing(name))?;

        let mut destinations = row.event_destinations.0;
        f(&mut destinations)?;

        let updated = sqlx::query_as::<_, ConfigurationSetRow>(
            r#"
            UPDATE configuration_sets SET event_destinations = $2, updated_at = NOW()
            WHERE name = $1
            RETURNING *
            "#,
        )
        .bind(name)
        .bind(Json(&destinations))
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(updated.into())
    }
}

#[async_trait]
impl ConfigurationSetRepository for DbConfigurationSetRepository {
    async fn create(&self, set: ConfigurationSet) -> Result<ConfigurationSet> {
        let result = sqlx::query(
            r#"
            INSERT INTO configuration_sets (
                name, sending_enabled, event_destinations, tracking_domain, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(&set.name)
        .bind(set.sending_enabled)
        .bind(Json(&set.event_destinations))
        .bind(&set.tracking_domain)
        .bind(set.created_at)
        .bind(set.updated_at)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(Error::already_exists(EntityKind::ConfigurationSet, &set.name));
        }
        Ok(set)
    }

    async fn get(&self, name: &str) -> Result<Option<ConfigurationSet>> {
        Ok(sqlx::query_as::<_, ConfigurationSetRow>(
            "SELECT * FROM configuration_sets WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)?
        .map(Into::into))
    }

    async fn list(&self) -> Result<Vec<ConfigurationSet>> {
        let rows = sqlx::query_as::<_, ConfigurationSetRow>(
            "SELECT * FROM configuration_sets ORDER BY name ASC",
        )
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM configuration_sets WHERE name = $1")
            .bind(name)
            .execute(self.pool.pool())
            .await
            .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(Self::missing(name));
        }
        Ok(())
    }

    async fn set_sending_enabled(&self, name: &str, enabled: bool) -> Result<ConfigurationSet> {
        sqlx::query_as::<_, ConfigurationSetRow>(
            r#"
            UPDATE configuration_sets SET sending_enabled = $2, updated_at = NOW()
            WHERE name = $1
            RETURNING *
            "#,
        )
        .bind(name)
        .bind(enabled)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)?
        .map(Into::into)
        .ok_or_else(|| Self::missing(name))
    }

    async fn set_tracking_domain(
        &self,
        name: &str,
        domain: Option<String>,
    ) -> Result<ConfigurationSet> {
        sqlx::query_as::<_, ConfigurationSetRow>(
            r#"
            UPDATE configuration_sets SET tracking_domain = $2, updated_at = NOW()
            WHERE name = $1
            RETURNING *
            "#,
        )
        .bind(name)
        .bind(domain)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)?
        .map(Into::into)
        .ok_or_else(|| Self::missing(name))
    }

    async fn add_event_destination(
        &self,
        name: &str,
        destination: EventDestination,
    ) -> Result<ConfigurationSet> {
        self.modify_destinations(name, move |destinations| {
            if destinations.iter().any(|d| d.name == destination.name) {
                return Err(Error::already_exists(
                    EntityKind::EventDestination,
                    &destination.name,
                ));
            }
            destinations.push(destination);
            Ok(())
        })
        .await
    }

    async fn remove_event_destination(
        &self,
        name: &str,
        destination: &str,
    ) -> Result<ConfigurationSet> {
        self.modify_destinations(name, |destinations| {
            let before = destinations.len();
            destinations.retain(|d| d.name != destination);
            if destinations.len() == before {
                return Err(Error::does_not_exist(
                    EntityKind::EventDestination,
                    destination,
                ));
            }
            Ok(())
        })
        .await
    }
}
