//! Identity repository

use crate::db::{db_err, DatabasePool};
use crate::models::Identity;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outpost_common::types::{IdentityKind, VerificationStatus};
use outpost_common::{EntityKind, Error, Result};
use sqlx::types::Json;
use sqlx::FromRow;

/// Identity repository trait
#[async_trait]
pub trait IdentityRepository: Send + Sync {
    /// Insert a new identity; fails with `AlreadyExists` on a duplicate value
    async fn create(&self, identity: Identity) -> Result<Identity>;
    async fn get(&self, value: &str) -> Result<Option<Identity>>;
    async fn list(&self, kind: Option<IdentityKind>) -> Result<Vec<Identity>>;
    async fn list_by_status(&self, status: VerificationStatus) -> Result<Vec<Identity>>;
    async fn set_status(&self, value: &str, status: VerificationStatus) -> Result<Identity>;
    async fn set_dkim_tokens(&self, value: &str, tokens: Vec<String>) -> Result<Identity>;
    async fn set_dkim_enabled(&self, value: &str, enabled: bool) -> Result<Identity>;
    /// Remove an identity, returning what was removed
    async fn delete(&self, value: &str) -> Result<Identity>;
}

#[derive(Debug, FromRow)]
struct IdentityRow {
    value: String,
    kind: String,
    status: String,
    dkim_enabled: bool,
    dkim_tokens: Json<Vec<String>>,
    verification_token: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<IdentityRow> for Identity {
    type Error = Error;

    fn try_from(row: IdentityRow) -> Result<Self> {
        Ok(Identity {
            value: row.value,
            kind: row.kind.parse()?,
            status: row.status.parse()?,
            dkim_enabled: row.dkim_enabled,
            dkim_tokens: row.dkim_tokens.0,
            verification_token: row.verification_token,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Database identity repository
pub struct DbIdentityRepository {
    pool: DatabasePool,
}

impl DbIdentityRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    fn missing(value: &str) -> Error {
        Error::does_not_exist(EntityKind::Identity, value)
    }
}

#[async_trait]
impl IdentityRepository for DbIdentityRepository {
    async fn create(&self, identity: Identity) -> Result<Identity> {
        let result = sqlx::query(
            r#"
            INSERT INTO identities (
                value, kind, status, dkim_enabled, dkim_tokens, verification_token,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (value) DO NOTHING
            "#,
        )
        .bind(&identity.value)
        .bind(identity.kind.to_string())
        .bind(identity.status.to_string())
        .bind(identity.dkim_enabled)
        .bind(Json(&identity.dkim_tokens))
        .bind(&identity.verification_token)
        .bind(identity.created_at)
        .bind(identity.updated_at)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(Error::already_exists(EntityKind::Identity, &identity.value));
        }
        Ok(identity)
    }

    async fn get(&self, value: &str) -> Result<Option<Identity>> {
        sqlx::query_as::<_, IdentityRow>("SELECT * FROM identities WHERE value = $1")
            .bind(value.to_lowercase())
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)?
            .map(Identity::try_from)
            .transpose()
    }

    async fn list(&self, kind: Option<IdentityKind>) -> Result<Vec<Identity>> {
        let rows = match kind {
            Some(kind) => {
                sqlx::query_as::<_, IdentityRow>(
                    "SELECT * FROM identities WHERE kind = $1 ORDER BY value ASC",
                )
                .bind(kind.to_string())
                .fetch_all(self.pool.pool())
                .await
            }
            None => {
                sqlx::query_as::<_, IdentityRow>("SELECT * FROM identities ORDER BY value ASC")
                    .fetch_all(self.pool.pool())
                    .await
            }
        }
        .map_err(db_err)?;

        rows.into_iter().map(Identity::try_from).collect()
    }

    async fn list_by_status(&self, status: VerificationStatus) -> Result<Vec<Identity>> {
        let rows = sqlx::query_as::<_, IdentityRow>(
            "SELECT * FROM identities WHERE status = $1 ORDER BY created_at ASC",
        )
        .bind(status.to_string())
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)?;

        rows.into_iter().map(Identity::try_from).collect()
    }

    async fn set_status(&self, value: &str, status: VerificationStatus) -> Result<Identity> {
        sqlx::query_as::<_, IdentityRow>(
            r#"
            UPDATE identities SET status = $2, updated_at = NOW()
            WHERE value = $1
            RETURNING *
            "#,
        )
        .bind(value.to_lowercase())
        .bind(status.to_string())
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)?
        .ok_or_else(|| Self::missing(value))
        .and_then(Identity::try_from)
    }

    async fn set_dkim_tokens(&self, value: &str, tokens: Vec<String>) -> Result<Identity> {
        sqlx::query_as::<_, IdentityRow>(
            r#"
            UPDATE identities SET dkim_tokens = $2, updated_at = NOW()
            WHERE value = $1
            RETURNING *
            "#,
        )
        .bind(value.to_lowercase())
        .bind(Json(&tokens))
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)?
        .ok_or_else(|| Self::missing(value))
        .and_then(Identity::try_from)
    }

    async fn set_dkim_enabled(&self, value: &str, enabled: bool) -> Result<Identity> {
        sqlx::query_as::<_, IdentityRow>(
            r#"
            UPDATE identities SET dkim_enabled = $2, updated_at = NOW()
            WHERE value = $1
            RETURNING *
            "#,
        )
        .bind(value.to_lowercase())
        .bind(enabled)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)?
        .ok_or_else(|| Self::missing(value))
        .and_then(Identity::try_from)
    }

    async fn delete(&self, value: &str) -> Result<Identity> {
        sqlx::query_as::<_, IdentityRow>("DELETE FROM identities WHERE value = $1 RETURNING *")
            .bind(value.to_lowercase())
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)?
            .ok_or_else(|| Self::missing(value))
            .and_then(Identity::try_from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::test_pool;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn unique_domain() -> String {
        format!("{}.example.com", Uuid::new_v4().simple())
    }

    #[tokio::test]
    async fn test_identity_lifecycle() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let repo = DbIdentityRepository::new(pool);
        let domain = unique_domain();

        let created = repo
            .create(Identity::pending(&domain, IdentityKind::Domain, Some("tok".into())))
            .await
            .unwrap();
        let err = repo.create(created.clone()).await.unwrap_err();
        assert_eq!(err.code(), "IdentityAlreadyExists");

        let found = repo.get(&domain.to_uppercase()).await.unwrap().unwrap();
        assert_eq!(found.value, domain);
        assert_eq!(found.kind, IdentityKind::Domain);
        assert_eq!(found.verification_token.as_deref(), Some("tok"));

        let tokens = vec!["a1".to_string(), "b2".to_string()];
        let updated = repo.set_dkim_tokens(&domain, tokens.clone()).await.unwrap();
        assert_eq!(updated.dkim_tokens, tokens);
        assert!(repo.set_dkim_enabled(&domain, true).await.unwrap().dkim_enabled);

        let verified = repo
            .set_status(&domain, VerificationStatus::Success)
            .await
            .unwrap();
        assert!(verified.is_verified());
        let listed = repo
            .list_by_status(VerificationStatus::Success)
            .await
            .unwrap();
        assert!(listed.iter().any(|i| i.value == domain));

        let removed = repo.delete(&domain).await.unwrap();
        assert_eq!(removed.dkim_tokens, tokens);
        assert!(repo.get(&domain).await.unwrap().is_none());
        let err = repo.delete(&domain).await.unwrap_err();
        assert_eq!(err.code(), "IdentityDoesNotExist");
    }

    #[tokio::test]
    async fn test_identity_list_by_kind() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let repo = DbIdentityRepository::new(pool);
        let domain = unique_domain();
        let address = format!("sender@{}", domain);
        repo.create(Identity::pending(&domain, IdentityKind::Domain, None))
            .await
            .unwrap();
        repo.create(Identity::pending(&address, IdentityKind::EmailAddress, None))
            .await
            .unwrap();

        let domains = repo.list(Some(IdentityKind::Domain)).await.unwrap();
        assert!(domains.iter().any(|i| i.value == domain));
        assert!(!domains.iter().any(|i| i.value == address));
        let all = repo.list(None).await.unwrap();
        assert!(all.iter().any(|i| i.value == address));

        let err = repo
            .set_status("missing.invalid", VerificationStatus::Failed)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "IdentityDoesNotExist");
    }
}
