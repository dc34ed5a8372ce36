//! Postgres-backed [Coordinator] over a single `coordinator_keys` table.
//!
//! This module is feature-gated behind `kernel-postgres`. Each primitive is
//! one statement, so atomicity comes from the row lock taken by
//! `INSERT .. ON CONFLICT` / `DELETE`.

#![cfg(feature = "kernel-postgres")]

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tokio::sync::OnceCell;

use crate::coordinator::{Coordinator, CoordinatorError, WindowCount};

fn is_valid_schema_ident(schema: &str) -> bool {
    !schema.is_empty()
        && schema
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn unavailable(prefix: &str, e: impl std::fmt::Display) -> CoordinatorError {
    CoordinatorError::Unavailable(format!("{prefix}: {e}"))
}

fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
}

#[derive(Clone)]
pub struct PostgresCoordinator {
    pool: PgPool,
    schema: String,
    schema_ready: Arc<OnceCell<()>>,
}

impl PostgresCoordinator {
    pub fn connect_lazy(database_url: &str) -> Result<Self, CoordinatorError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(std::time::Duration::from_secs(2))
            .connect_lazy(database_url)
            .map_err(|e| unavailable("postgres init error", e))?;
        Ok(Self::with_pool(pool))
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self {
            pool,
            schema: "public".to_string(),
            schema_ready: Arc::new(OnceCell::new()),
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    fn table(&self) -> String {
        format!("\"{}\".coordinator_keys", self.schema)
    }

    async fn ensure_schema(&self) -> Result<(), CoordinatorError> {
        if !is_valid_schema_ident(&self.schema) {
            return Err(unavailable("invalid schema", &self.schema));
        }
        self.schema_ready
            .get_or_try_init(|| async {
                let statements = [
                    format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", self.schema),
                    format!(
                        "CREATE TABLE IF NOT EXISTS {} (
                            key TEXT PRIMARY KEY,
                            value TEXT NOT NULL,
                            count BIGINT NOT NULL,
                            expires_at_ms BIGINT NOT NULL
                        )",
                        self.table()
                    ),
                    format!(
                        "CREATE INDEX IF NOT EXISTS idx_coordinator_keys_expiry
                         ON {}(expires_at_ms)",
                        self.table()
                    ),
                ];
                for sql in &statements {
                    sqlx::query(sql)
                        .execute(&self.pool)
                        .await
                        .map_err(|e| unavailable("schema bootstrap", e))?;
                }
                Ok::<(), CoordinatorError>(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Coordinator for PostgresCoordinator {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, CoordinatorError> {
        self.ensure_schema().await?;
        let table = self.table();
        let sql = format!(
            "INSERT INTO {table} AS t (key, value, count, expires_at_ms)
             VALUES ($1, $2, 0, $3)
             ON CONFLICT (key) DO UPDATE
             SET value = EXCLUDED.value, count = 0, expires_at_ms = EXCLUDED.expires_at_ms
             WHERE t.expires_at_ms <= $4"
        );
        let affected = sqlx::query(&sql)
            .bind(key)
            .bind(value)
            .bind(dt_to_ms(now + ttl))
            .bind(dt_to_ms(now))
            .execute(&self.pool)
            .await
            .map_err(|e| unavailable("set if absent", e))?
            .rows_affected();
        Ok(affected == 1)
    }

    async fn compare_and_delete(
        &self,
        key: &str,
        expected: &str,
        _now: DateTime<Utc>,
    ) -> Result<bool, CoordinatorError> {
        self.ensure_schema().await?;
        let sql = format!("DELETE FROM {} WHERE key = $1 AND value = $2", self.table());
        let affected = sqlx::query(&sql)
            .bind(key)
            .bind(expected)
            .execute(&self.pool)
            .await
            .map_err(|e| unavailable("compare and delete", e))?
            .rows_affected();
        Ok(affected == 1)
    }

    async fn incr_window(
        &self,
        key: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<WindowCount, CoordinatorError> {
        self.ensure_schema().await?;
        let table = self.table();
        let sql = format!(
            "INSERT INTO {table} AS t (key, value, count, expires_at_ms)
             VALUES ($1, '', 1, $2)
             ON CONFLICT (key) DO UPDATE
             SET count = CASE WHEN t.expires_at_ms <= $3 THEN 1 ELSE t.count + 1 END,
                 expires_at_ms = CASE WHEN t.expires_at_ms <= $3
                                      THEN EXCLUDED.expires_at_ms
                                      ELSE t.expires_at_ms END
             RETURNING count, expires_at_ms"
        );
        let row = sqlx::query(&sql)
            .bind(key)
            .bind(dt_to_ms(now + ttl))
            .bind(dt_to_ms(now))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| unavailable("increment window", e))?;
        let count: i64 = row
            .try_get("count")
            .map_err(|e| unavailable("decode count", e))?;
        let expires_at_ms: i64 = row
            .try_get("expires_at_ms")
            .map_err(|e| unavailable("decode expiry", e))?;
        Ok(WindowCount {
            count: count.max(0) as u64,
            expires_at: ms_to_dt(expires_at_ms),
        })
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, CoordinatorError> {
        self.ensure_schema().await?;
        let sql = format!("DELETE FROM {} WHERE expires_at_ms <= $1", self.table());
        let removed = sqlx::query(&sql)
            .bind(dt_to_ms(now))
            .execute(&self.pool)
            .await
            .map_err(|e| unavailable("purge expired keys", e))?
            .rows_affected();
        Ok(removed)
    }
}
