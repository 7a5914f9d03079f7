//! Template repository

use crate::db::{db_err, DatabasePool};
use crate::models::{Template, TemplateContent};
use async_trait::async_trait;
use outpost_common::{EntityKind, Error, Result};

/// Template repository trait
#[async_trait]
pub trait TemplateRepository: Send + Sync {
    async fn create(&self, content: TemplateContent) -> Result<Template>;
    async fn get(&self, name: &str) -> Result<Option<Template>>;
    /// Replace every part of an existing template in one step
    async fn update(&self, content: TemplateContent) -> Result<Template>;
    async fn delete(&self, name: &str) -> Result<()>;
    async fn list(&self) -> Result<Vec<Template>>;
}

/// Database template repository
pub struct DbTemplateRepository {
    pool: DatabasePool,
}

impl DbTemplateRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TemplateRepository for DbTemplateRepository {
    async fn create(&self, content: TemplateContent) -> Result<Template> {
        let template = content.into_template();

        let result = sqlx::query(
            r#"
            INSERT INTO templates (name, subject_part, html_part, text_part, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(&template.name)
        .bind(&template.subject_part)
        .bind(&template.html_part)
        .bind(&template.text_part)
        .bind(template.created_at)
        .bind(template.updated_at)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(Error::already_exists(EntityKind::Template, &template.name));
        }
        Ok(template)
    }

    async fn get(&self, name: &str) -> Result<Option<Template>> {
        sqlx::query_as::<_, Template>("SELECT * FROM templates WHERE name = $1")
            .bind(name)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn update(&self, content: TemplateContent) -> Result<Template> {
        sqlx::query_as::<_, Template>(
            r#"
            UPDATE templates
            SET subject_part = $2, html_part = $3, text_part = $4, updated_at = NOW()
            WHERE name = $1
            RETURNING *
            "#,
        )
        .bind(&content.name)
        .bind(&content.subject_part)
        .bind(&content.html_part)
        .bind(&content.text_part)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)?
        .ok_or_else(|| Error::does_not_exist(EntityKind::Template, &content.name))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM templates WHERE name = $1")
            .bind(name)
            .execute(self.pool.pool())
            .await
            .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(Error::does_not_exist(EntityKind::Template, name));
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Template>> {
        sqlx::query_as::<_, Template>("SELECT * FROM templates ORDER BY name ASC")
            .fetch_all(self.pool.pool())
            .await
            .map_err(db_err)
    }
}
