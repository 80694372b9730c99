//! Postgres-backed content-version ledger.

mod util;

pub use util::map_sqlx_error;

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{
    Row,
    postgres::{PgPool, PgPoolOptions},
    query,
};

use crate::cache::{CacheError, ContentVersionLedger, UpdateCommand, VersionRow};

const INCREMENT_SQL: &str = "INSERT INTO content_versions (tablename, username, version) \
    VALUES ($1, $2, 1) \
    ON CONFLICT (tablename, username) \
    DO UPDATE SET version = content_versions.version + 1, updated_at = now() \
    RETURNING version";

#[derive(Clone)]
pub struct PostgresLedger {
    pool: Arc<PgPool>,
}

impl PostgresLedger {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
    }

    pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        query("SELECT 1").execute(self.pool()).await.map(|_| ())
    }
}

#[async_trait]
impl ContentVersionLedger for PostgresLedger {
    async fn increment(&self, command: &UpdateCommand) -> Result<i64, CacheError> {
        let row = query(INCREMENT_SQL)
            .bind(&command.table)
            .bind(&command.user)
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        row.try_get::<i64, _>("version").map_err(map_sqlx_error)
    }

    async fn versions_for(&self, user: &str) -> Result<Vec<VersionRow>, CacheError> {
        let rows = query(
            "SELECT tablename, username, version FROM content_versions \
             WHERE username = $1 ORDER BY tablename",
        )
        .bind(user)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter()
            .map(|row| -> Result<VersionRow, sqlx::Error> {
                Ok(VersionRow {
                    table: row.try_get("tablename")?,
                    user: row.try_get("username")?,
                    version: row.try_get("version")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(map_sqlx_error)
    }

    async fn base_version(&self) -> Result<i64, CacheError> {
        let row = query("SELECT COALESCE(MAX(version), 0) AS version FROM content_base_version")
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        row.try_get::<i64, _>("version").map_err(map_sqlx_error)
    }
}
