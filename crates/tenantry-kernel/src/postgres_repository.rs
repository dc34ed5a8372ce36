//! Postgres-backed [OpsRepository].
//!
//! This module is feature-gated behind `kernel-postgres`. Timestamps are
//! stored as epoch milliseconds, opaque JSON as TEXT.

#![cfg(feature = "kernel-postgres")]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row};
use tokio::sync::OnceCell;

use crate::error::KernelError;
use crate::identity::{new_id, WorkflowType};
use crate::models::{
    ActionQuery, ActionRecord, ActionStatus, ExceptionQuery, ExceptionRecord, ExceptionStatus,
    GovernorState, NewPolicy, OperatorSettings, PolicyRecord, PolicyScope, Run, RunOrder,
    RunQuery, RunStats, RunStatus, ScopeType, Severity, TriggerType, CANCELLED_ERROR,
};
use crate::repository::OpsRepository;

fn is_valid_schema_ident(schema: &str) -> bool {
    !schema.is_empty()
        && schema
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn map_driver_err(prefix: &str, e: impl std::fmt::Display) -> KernelError {
    KernelError::Store(format!("{prefix}: {e}"))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}

fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
}

fn severity_rank(severity: Severity) -> i32 {
    match severity {
        Severity::Low => 0,
        Severity::Medium => 1,
        Severity::High => 2,
        Severity::Critical => 3,
    }
}

fn col<'r, T>(row: &'r PgRow, name: &str) -> Result<T, KernelError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get::<T, _>(name)
        .map_err(|e| map_driver_err("decode column", e))
}

fn json_col(row: &PgRow, name: &str) -> Result<Value, KernelError> {
    let text: String = col(row, name)?;
    serde_json::from_str(&text).map_err(|e| map_driver_err("decode json column", e))
}

fn opt_json_col(row: &PgRow, name: &str) -> Result<Option<Value>, KernelError> {
    let text: Option<String> = col(row, name)?;
    text.map(|t| serde_json::from_str(&t).map_err(|e| map_driver_err("decode json column", e)))
        .transpose()
}

fn opt_ms_col(row: &PgRow, name: &str) -> Result<Option<DateTime<Utc>>, KernelError> {
    Ok(col::<Option<i64>>(row, name)?.map(ms_to_dt))
}

fn to_json_text(value: &Value) -> String {
    value.to_string()
}

fn scope_key(scope: &PolicyScope) -> String {
    scope.scope_id.clone().unwrap_or_default()
}

fn limit_param(limit: usize) -> i64 {
    if limit == 0 {
        i64::MAX
    } else {
        limit as i64
    }
}

const RUN_COLUMNS: &str = "id, workflow_type, status, attempts, max_attempts, trigger_type, \
     trigger_ref, manager_id, property_id, payload, error, summary, created_at_ms, \
     updated_at_ms, started_at_ms, completed_at_ms";

const EXCEPTION_COLUMNS: &str = "id, run_id, manager_id, property_id, severity, category, \
     title, details, context, status, requires_by_ms, resolved_by, resolved_at_ms, \
     created_at_ms, updated_at_ms";

const ACTION_COLUMNS: &str = "id, manager_id, property_id, run_id, action_type, status, \
     payload, result, entity_type, entity_id, decision_reason, decided_by, created_at_ms, \
     updated_at_ms, executed_at_ms";

const POLICY_COLUMNS: &str =
    "id, scope_type, scope_key, config, version, is_active, created_by, created_at_ms";

fn run_from_row(row: &PgRow) -> Result<Run, KernelError> {
    Ok(Run {
        id: col(row, "id")?,
        workflow_type: WorkflowType::new(col::<String>(row, "workflow_type")?),
        status: RunStatus::parse(&col::<String>(row, "status")?)?,
        attempts: col::<i32>(row, "attempts")?.max(0) as u32,
        max_attempts: col::<i32>(row, "max_attempts")?.max(1) as u32,
        trigger_type: TriggerType::parse(&col::<String>(row, "trigger_type")?)?,
        trigger_ref: col(row, "trigger_ref")?,
        manager_id: col(row, "manager_id")?,
        property_id: col(row, "property_id")?,
        payload: json_col(row, "payload")?,
        error: col(row, "error")?,
        summary: json_col(row, "summary")?,
        created_at: ms_to_dt(col(row, "created_at_ms")?),
        updated_at: ms_to_dt(col(row, "updated_at_ms")?),
        started_at: opt_ms_col(row, "started_at_ms")?,
        completed_at: opt_ms_col(row, "completed_at_ms")?,
    })
}

fn exception_from_row(row: &PgRow) -> Result<ExceptionRecord, KernelError> {
    Ok(ExceptionRecord {
        id: col(row, "id")?,
        run_id: col(row, "run_id")?,
        manager_id: col(row, "manager_id")?,
        property_id: col(row, "property_id")?,
        severity: Severity::parse(&col::<String>(row, "severity")?)?,
        category: col(row, "category")?,
        title: col(row, "title")?,
        details: col(row, "details")?,
        context: json_col(row, "context")?,
        status: ExceptionStatus::parse(&col::<String>(row, "status")?)?,
        requires_by: ms_to_dt(col(row, "requires_by_ms")?),
        resolved_by: col(row, "resolved_by")?,
        resolved_at: opt_ms_col(row, "resolved_at_ms")?,
        created_at: ms_to_dt(col(row, "created_at_ms")?),
        updated_at: ms_to_dt(col(row, "updated_at_ms")?),
    })
}

fn action_from_row(row: &PgRow) -> Result<ActionRecord, KernelError> {
    Ok(ActionRecord {
        id: col(row, "id")?,
        manager_id: col(row, "manager_id")?,
        property_id: col(row, "property_id")?,
        run_id: col(row, "run_id")?,
        action_type: col(row, "action_type")?,
        status: ActionStatus::parse(&col::<String>(row, "status")?)?,
        payload: json_col(row, "payload")?,
        result: opt_json_col(row, "result")?,
        entity_type: col(row, "entity_type")?,
        entity_id: col(row, "entity_id")?,
        decision_reason: col(row, "decision_reason")?,
        decided_by: col(row, "decided_by")?,
        created_at: ms_to_dt(col(row, "created_at_ms")?),
        updated_at: ms_to_dt(col(row, "updated_at_ms")?),
        executed_at: opt_ms_col(row, "executed_at_ms")?,
    })
}

fn policy_from_row(row: &PgRow) -> Result<PolicyRecord, KernelError> {
    let scope_type = ScopeType::parse(&col::<String>(row, "scope_type")?)?;
    let key: String = col(row, "scope_key")?;
    Ok(PolicyRecord {
        id: col(row, "id")?,
        scope: PolicyScope {
            scope_type,
            scope_id: if key.is_empty() { None } else { Some(key) },
        },
        config: json_col(row, "config")?,
        version: col::<i32>(row, "version")?.max(0) as u32,
        is_active: col(row, "is_active")?,
        created_by: col(row, "created_by")?,
        created_at: ms_to_dt(col(row, "created_at_ms")?),
    })
}

#[derive(Clone)]
pub struct PostgresRepository {
    pool: PgPool,
    schema: String,
    schema_ready: std::sync::Arc<OnceCell<()>>,
}

impl PostgresRepository {
    /// Builds a lazily-connecting pool; nothing touches the network until the
    /// first query.
    pub fn connect_lazy(database_url: &str) -> Result<Self, KernelError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)
            .map_err(|e| map_driver_err("postgres init error", e))?;
        Ok(Self::with_pool(pool))
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self {
            pool,
            schema: "public".to_string(),
            schema_ready: std::sync::Arc::new(OnceCell::new()),
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    fn table(&self, name: &str) -> String {
        format!("\"{}\".{}", self.schema, name)
    }

    async fn ensure_schema(&self) -> Result<(), KernelError> {
        if !is_valid_schema_ident(&self.schema) {
            return Err(map_driver_err("invalid schema", &self.schema));
        }
        self.schema_ready
            .get_or_try_init(|| async {
                let s = &self.schema;
                let statements = [
                    format!("CREATE SCHEMA IF NOT EXISTS \"{s}\""),
                    format!(
                        "CREATE TABLE IF NOT EXISTS \"{s}\".ops_runs (
                            id TEXT PRIMARY KEY,
                            workflow_type TEXT NOT NULL,
                            status TEXT NOT NULL,
                            attempts INTEGER NOT NULL,
                            max_attempts INTEGER NOT NULL,
                            trigger_type TEXT NOT NULL,
                            trigger_ref TEXT NULL UNIQUE,
                            manager_id TEXT NOT NULL,
                            property_id TEXT NULL,
                            payload TEXT NOT NULL,
                            error TEXT NULL,
                            summary TEXT NOT NULL,
                            created_at_ms BIGINT NOT NULL,
                            updated_at_ms BIGINT NOT NULL,
                            started_at_ms BIGINT NULL,
                            completed_at_ms BIGINT NULL
                        )"
                    ),
                    format!(
                        "CREATE INDEX IF NOT EXISTS idx_ops_runs_status_created
                         ON \"{s}\".ops_runs(status, created_at_ms)"
                    ),
                    format!(
                        "CREATE TABLE IF NOT EXISTS \"{s}\".ops_exceptions (
                            id TEXT PRIMARY KEY,
                            run_id TEXT NULL,
                            manager_id TEXT NOT NULL,
                            property_id TEXT NULL,
                            severity TEXT NOT NULL,
                            severity_rank INTEGER NOT NULL,
                            category TEXT NOT NULL,
                            title TEXT NOT NULL,
                            details TEXT NOT NULL,
                            context TEXT NOT NULL,
                            status TEXT NOT NULL,
                            requires_by_ms BIGINT NOT NULL,
                            resolved_by TEXT NULL,
                            resolved_at_ms BIGINT NULL,
                            created_at_ms BIGINT NOT NULL,
                            updated_at_ms BIGINT NOT NULL
                        )"
                    ),
                    format!(
                        "CREATE TABLE IF NOT EXISTS \"{s}\".ops_actions (
                            id TEXT PRIMARY KEY,
                            manager_id TEXT NOT NULL,
                            property_id TEXT NULL,
                            run_id TEXT NULL,
                            action_type TEXT NOT NULL,
                            status TEXT NOT NULL,
                            payload TEXT NOT NULL,
                            result TEXT NULL,
                            entity_type TEXT NULL,
                            entity_id TEXT NULL,
                            decision_reason TEXT NULL,
                            decided_by TEXT NULL,
                            created_at_ms BIGINT NOT NULL,
                            updated_at_ms BIGINT NOT NULL,
                            executed_at_ms BIGINT NULL
                        )"
                    ),
                    format!(
                        "CREATE TABLE IF NOT EXISTS \"{s}\".ops_policies (
                            id TEXT PRIMARY KEY,
                            scope_type TEXT NOT NULL,
                            scope_key TEXT NOT NULL,
                            config TEXT NOT NULL,
                            version INTEGER NOT NULL,
                            is_active BOOLEAN NOT NULL,
                            created_by TEXT NOT NULL,
                            created_at_ms BIGINT NOT NULL
                        )"
                    ),
                    format!(
                        "CREATE UNIQUE INDEX IF NOT EXISTS idx_ops_policies_one_active
                         ON \"{s}\".ops_policies(scope_type, scope_key) WHERE is_active"
                    ),
                    format!(
                        "CREATE TABLE IF NOT EXISTS \"{s}\".ops_governor (
                            id INTEGER PRIMARY KEY,
                            state TEXT NOT NULL,
                            version BIGINT NOT NULL
                        )"
                    ),
                    format!(
                        "CREATE TABLE IF NOT EXISTS \"{s}\".ops_operator_settings (
                            manager_id TEXT PRIMARY KEY,
                            autonomy_enabled BOOLEAN NOT NULL,
                            auto_execute_action_types TEXT NOT NULL,
                            updated_at_ms BIGINT NULL
                        )"
                    ),
                ];
                for sql in &statements {
                    sqlx::query(sql)
                        .execute(&self.pool)
                        .await
                        .map_err(|e| map_driver_err("schema bootstrap", e))?;
                }
                Ok::<(), KernelError>(())
            })
            .await?;
        Ok(())
    }

    async fn exists(&self, table: &str, id: &str) -> Result<bool, KernelError> {
        let sql = format!("SELECT COUNT(*) FROM {} WHERE id = $1", self.table(table));
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_driver_err("existence check", e))?;
        Ok(count > 0)
    }
}

#[async_trait]
impl OpsRepository for PostgresRepository {
    async fn insert_run(&self, run: &Run) -> Result<(), KernelError> {
        self.ensure_schema().await?;
        let sql = format!(
            "INSERT INTO {} ({RUN_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
            self.table("ops_runs")
        );
        match sqlx::query(&sql)
            .bind(&run.id)
            .bind(run.workflow_type.as_str())
            .bind(run.status.as_str())
            .bind(run.attempts as i32)
            .bind(run.max_attempts as i32)
            .bind(run.trigger_type.as_str())
            .bind(&run.trigger_ref)
            .bind(&run.manager_id)
            .bind(&run.property_id)
            .bind(to_json_text(&run.payload))
            .bind(&run.error)
            .bind(to_json_text(&run.summary))
            .bind(dt_to_ms(run.created_at))
            .bind(dt_to_ms(run.updated_at))
            .bind(run.started_at.map(dt_to_ms))
            .bind(run.completed_at.map(dt_to_ms))
            .execute(&self.pool)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(KernelError::Conflict(format!(
                "run '{}' or its trigger_ref already exists",
                run.id
            ))),
            Err(e) => Err(map_driver_err("insert run", e)),
        }
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>, KernelError> {
        self.ensure_schema().await?;
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM {} WHERE id = $1",
            self.table("ops_runs")
        );
        let row = sqlx::query(&sql)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_driver_err("get run", e))?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn find_run_by_trigger_ref(
        &self,
        trigger_ref: &str,
    ) -> Result<Option<Run>, KernelError> {
        self.ensure_schema().await?;
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM {} WHERE trigger_ref = $1",
            self.table("ops_runs")
        );
        let row = sqlx::query(&sql)
            .bind(trigger_ref)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_driver_err("find run by trigger_ref", e))?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn list_runs(&self, query: &RunQuery) -> Result<Vec<Run>, KernelError> {
        self.ensure_schema().await?;
        let direction = match query.order {
            RunOrder::OldestFirst => "ASC",
            RunOrder::NewestFirst => "DESC",
        };
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM {}
             WHERE ($1::text IS NULL OR manager_id = $1)
               AND (cardinality($2::text[]) = 0 OR status = ANY($2))
               AND ($3::bigint IS NULL OR (started_at_ms IS NOT NULL AND started_at_ms < $3))
             ORDER BY created_at_ms {direction}, id {direction}
             LIMIT $4",
            self.table("ops_runs")
        );
        let statuses: Vec<String> = query
            .statuses
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        let rows = sqlx::query(&sql)
            .bind(&query.manager_id)
            .bind(statuses)
            .bind(query.started_before.map(dt_to_ms))
            .bind(limit_param(query.limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_driver_err("list runs", e))?;
        rows.iter().map(run_from_row).collect()
    }

    async fn compare_and_swap_run(
        &self,
        expected_status: RunStatus,
        expected_attempts: u32,
        next: &Run,
    ) -> Result<bool, KernelError> {
        self.ensure_schema().await?;
        let sql = format!(
            "UPDATE {}
             SET status = $2, attempts = $3, max_attempts = $4, error = $5, summary = $6,
                 payload = $7, updated_at_ms = $8, started_at_ms = $9, completed_at_ms = $10
             WHERE id = $1 AND status = $11 AND attempts = $12",
            self.table("ops_runs")
        );
        let updated = sqlx::query(&sql)
            .bind(&next.id)
            .bind(next.status.as_str())
            .bind(next.attempts as i32)
            .bind(next.max_attempts as i32)
            .bind(&next.error)
            .bind(to_json_text(&next.summary))
            .bind(to_json_text(&next.payload))
            .bind(dt_to_ms(next.updated_at))
            .bind(next.started_at.map(dt_to_ms))
            .bind(next.completed_at.map(dt_to_ms))
            .bind(expected_status.as_str())
            .bind(expected_attempts as i32)
            .execute(&self.pool)
            .await
            .map_err(|e| map_driver_err("compare-and-swap run", e))?
            .rows_affected();
        if updated == 1 {
            return Ok(true);
        }
        if !self.exists("ops_runs", &next.id).await? {
            return Err(KernelError::not_found("run", &next.id));
        }
        Ok(false)
    }

    async fn run_stats_since(&self, since: DateTime<Utc>) -> Result<RunStats, KernelError> {
        self.ensure_schema().await?;
        let sql = format!(
            "SELECT COUNT(*) AS total,
                    COUNT(*) FILTER (
                        WHERE status = 'ESCALATED'
                           OR (status = 'FAILED' AND (error IS NULL OR error NOT LIKE $2))
                    ) AS failed
             FROM {} WHERE created_at_ms >= $1",
            self.table("ops_runs")
        );
        let row = sqlx::query(&sql)
            .bind(dt_to_ms(since))
            .bind(format!("{CANCELLED_ERROR}%"))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_driver_err("run stats", e))?;
        Ok(RunStats {
            total: col::<i64>(&row, "total")?.max(0) as u64,
            failed: col::<i64>(&row, "failed")?.max(0) as u64,
        })
    }

    async fn insert_exception(&self, record: &ExceptionRecord) -> Result<(), KernelError> {
        self.ensure_schema().await?;
        let sql = format!(
            "INSERT INTO {} ({EXCEPTION_COLUMNS}, severity_rank)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
            self.table("ops_exceptions")
        );
        match sqlx::query(&sql)
            .bind(&record.id)
            .bind(&record.run_id)
            .bind(&record.manager_id)
            .bind(&record.property_id)
            .bind(record.severity.as_str())
            .bind(&record.category)
            .bind(&record.title)
            .bind(&record.details)
            .bind(to_json_text(&record.context))
            .bind(record.status.as_str())
            .bind(dt_to_ms(record.requires_by))
            .bind(&record.resolved_by)
            .bind(record.resolved_at.map(dt_to_ms))
            .bind(dt_to_ms(record.created_at))
            .bind(dt_to_ms(record.updated_at))
            .bind(severity_rank(record.severity))
            .execute(&self.pool)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(KernelError::Conflict(format!(
                "exception '{}' already exists",
                record.id
            ))),
            Err(e) => Err(map_driver_err("insert exception", e)),
        }
    }

    async fn get_exception(&self, id: &str) -> Result<Option<ExceptionRecord>, KernelError> {
        self.ensure_schema().await?;
        let sql = format!(
            "SELECT {EXCEPTION_COLUMNS} FROM {} WHERE id = $1",
            self.table("ops_exceptions")
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_driver_err("get exception", e))?;
        row.as_ref().map(exception_from_row).transpose()
    }

    async fn compare_and_swap_exception(
        &self,
        expected_status: ExceptionStatus,
        next: &ExceptionRecord,
    ) -> Result<bool, KernelError> {
        self.ensure_schema().await?;
        let sql = format!(
            "UPDATE {}
             SET status = $2, resolved_by = $3, resolved_at_ms = $4, updated_at_ms = $5,
                 context = $6
             WHERE id = $1 AND status = $7",
            self.table("ops_exceptions")
        );
        let updated = sqlx::query(&sql)
            .bind(&next.id)
            .bind(next.status.as_str())
            .bind(&next.resolved_by)
            .bind(next.resolved_at.map(dt_to_ms))
            .bind(dt_to_ms(next.updated_at))
            .bind(to_json_text(&next.context))
            .bind(expected_status.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| map_driver_err("compare-and-swap exception", e))?
            .rows_affected();
        if updated == 1 {
            return Ok(true);
        }
        if !self.exists("ops_exceptions", &next.id).await? {
            return Err(KernelError::not_found("exception", &next.id));
        }
        Ok(false)
    }

    async fn list_exceptions(
        &self,
        query: &ExceptionQuery,
    ) -> Result<Vec<ExceptionRecord>, KernelError> {
        self.ensure_schema().await?;
        let sql = format!(
            "SELECT {EXCEPTION_COLUMNS} FROM {}
             WHERE ($1::text IS NULL OR manager_id = $1)
               AND (cardinality($2::text[]) = 0 OR status = ANY($2))
               AND severity_rank >= $3
             ORDER BY severity_rank DESC, requires_by_ms ASC
             LIMIT $4",
            self.table("ops_exceptions")
        );
        let statuses: Vec<String> = query
            .statuses
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        let rows = sqlx::query(&sql)
            .bind(&query.manager_id)
            .bind(statuses)
            .bind(query.min_severity.map(severity_rank).unwrap_or(0))
            .bind(limit_param(query.limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_driver_err("list exceptions", e))?;
        rows.iter().map(exception_from_row).collect()
    }

    async fn count_open_critical_since(&self, since: DateTime<Utc>) -> Result<u64, KernelError> {
        self.ensure_schema().await?;
        let sql = format!(
            "SELECT COUNT(*) FROM {}
             WHERE status = 'OPEN' AND severity = 'CRITICAL' AND created_at_ms >= $1",
            self.table("ops_exceptions")
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(dt_to_ms(since))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_driver_err("count open critical exceptions", e))?;
        Ok(count.max(0) as u64)
    }

    async fn insert_action(&self, record: &ActionRecord) -> Result<(), KernelError> {
        self.ensure_schema().await?;
        let sql = format!(
            "INSERT INTO {} ({ACTION_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
            self.table("ops_actions")
        );
        match sqlx::query(&sql)
            .bind(&record.id)
            .bind(&record.manager_id)
            .bind(&record.property_id)
            .bind(&record.run_id)
            .bind(&record.action_type)
            .bind(record.status.as_str())
            .bind(to_json_text(&record.payload))
            .bind(record.result.as_ref().map(to_json_text))
            .bind(&record.entity_type)
            .bind(&record.entity_id)
            .bind(&record.decision_reason)
            .bind(&record.decided_by)
            .bind(dt_to_ms(record.created_at))
            .bind(dt_to_ms(record.updated_at))
            .bind(record.executed_at.map(dt_to_ms))
            .execute(&self.pool)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(KernelError::Conflict(format!(
                "action '{}' already exists",
                record.id
            ))),
            Err(e) => Err(map_driver_err("insert action", e)),
        }
    }

    async fn get_action(&self, id: &str) -> Result<Option<ActionRecord>, KernelError> {
        self.ensure_schema().await?;
        let sql = format!(
            "SELECT {ACTION_COLUMNS} FROM {} WHERE id = $1",
            self.table("ops_actions")
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_driver_err("get action", e))?;
        row.as_ref().map(action_from_row).transpose()
    }

    async fn compare_and_swap_action(
        &self,
        expected_status: ActionStatus,
        next: &ActionRecord,
    ) -> Result<bool, KernelError> {
        self.ensure_schema().await?;
        let sql = format!(
            "UPDATE {}
             SET status = $2, result = $3, decision_reason = $4, decided_by = $5,
                 updated_at_ms = $6, executed_at_ms = $7
             WHERE id = $1 AND status = $8",
            self.table("ops_actions")
        );
        let updated = sqlx::query(&sql)
            .bind(&next.id)
            .bind(next.status.as_str())
            .bind(next.result.as_ref().map(to_json_text))
            .bind(&next.decision_reason)
            .bind(&next.decided_by)
            .bind(dt_to_ms(next.updated_at))
            .bind(next.executed_at.map(dt_to_ms))
            .bind(expected_status.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| map_driver_err("compare-and-swap action", e))?
            .rows_affected();
        if updated == 1 {
            return Ok(true);
        }
        if !self.exists("ops_actions", &next.id).await? {
            return Err(KernelError::not_found("action", &next.id));
        }
        Ok(false)
    }

    async fn list_actions(&self, query: &ActionQuery) -> Result<Vec<ActionRecord>, KernelError> {
        self.ensure_schema().await?;
        let sql = format!(
            "SELECT {ACTION_COLUMNS} FROM {}
             WHERE ($1::text IS NULL OR manager_id = $1)
               AND (cardinality($2::text[]) = 0 OR status = ANY($2))
             ORDER BY created_at_ms DESC, id DESC
             LIMIT $3",
            self.table("ops_actions")
        );
        let statuses: Vec<String> = query
            .statuses
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        let rows = sqlx::query(&sql)
            .bind(&query.manager_id)
            .bind(statuses)
            .bind(limit_param(query.limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_driver_err("list actions", e))?;
        rows.iter().map(action_from_row).collect()
    }

    async fn create_policy(
        &self,
        draft: &NewPolicy,
        now: DateTime<Utc>,
    ) -> Result<PolicyRecord, KernelError> {
        draft.scope.validate()?;
        self.ensure_schema().await?;
        let table = self.table("ops_policies");
        let key = scope_key(&draft.scope);
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_driver_err("begin create policy tx", e))?;

        // serializes concurrent creators for the same scope
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!("policy:{}:{}", draft.scope.scope_type.as_str(), key))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_driver_err("lock policy scope", e))?;

        let deactivate_sql = format!(
            "UPDATE {table} SET is_active = FALSE
             WHERE scope_type = $1 AND scope_key = $2 AND is_active"
        );
        sqlx::query(&deactivate_sql)
            .bind(draft.scope.scope_type.as_str())
            .bind(&key)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_driver_err("deactivate policies", e))?;

        let count_sql =
            format!("SELECT COUNT(*) FROM {table} WHERE scope_type = $1 AND scope_key = $2");
        let count: i64 = sqlx::query_scalar(&count_sql)
            .bind(draft.scope.scope_type.as_str())
            .bind(&key)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_driver_err("count policy versions", e))?;

        let record = PolicyRecord {
            id: new_id("pol"),
            scope: draft.scope.clone(),
            config: draft.config.clone(),
            version: count.max(0) as u32 + 1,
            is_active: true,
            created_by: draft.created_by.clone(),
            created_at: now,
        };
        let insert_sql = format!(
            "INSERT INTO {table} ({POLICY_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, TRUE, $6, $7)"
        );
        match sqlx::query(&insert_sql)
            .bind(&record.id)
            .bind(record.scope.scope_type.as_str())
            .bind(&key)
            .bind(to_json_text(&record.config))
            .bind(record.version as i32)
            .bind(&record.created_by)
            .bind(dt_to_ms(record.created_at))
            .execute(&mut *tx)
            .await
        {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(KernelError::Conflict(format!(
                    "concurrent policy creation for scope {}:{}",
                    record.scope.scope_type.as_str(),
                    key
                )));
            }
            Err(e) => return Err(map_driver_err("insert policy", e)),
        }

        tx.commit()
            .await
            .map_err(|e| map_driver_err("commit create policy tx", e))?;
        Ok(record)
    }

    async fn active_policy(
        &self,
        scope: &PolicyScope,
    ) -> Result<Option<PolicyRecord>, KernelError> {
        self.ensure_schema().await?;
        let sql = format!(
            "SELECT {POLICY_COLUMNS} FROM {}
             WHERE scope_type = $1 AND scope_key = $2 AND is_active",
            self.table("ops_policies")
        );
        let row = sqlx::query(&sql)
            .bind(scope.scope_type.as_str())
            .bind(scope_key(scope))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_driver_err("get active policy", e))?;
        row.as_ref().map(policy_from_row).transpose()
    }

    async fn policy_history(&self, scope: &PolicyScope) -> Result<Vec<PolicyRecord>, KernelError> {
        self.ensure_schema().await?;
        let sql = format!(
            "SELECT {POLICY_COLUMNS} FROM {}
             WHERE scope_type = $1 AND scope_key = $2
             ORDER BY version DESC",
            self.table("ops_policies")
        );
        let rows = sqlx::query(&sql)
            .bind(scope.scope_type.as_str())
            .bind(scope_key(scope))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_driver_err("policy history", e))?;
        rows.iter().map(policy_from_row).collect()
    }

    async fn load_governor(&self) -> Result<GovernorState, KernelError> {
        self.ensure_schema().await?;
        let sql = format!(
            "SELECT state, version FROM {} WHERE id = 1",
            self.table("ops_governor")
        );
        let row = sqlx::query(&sql)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_driver_err("load governor", e))?;
        let Some(row) = row else {
            return Ok(GovernorState::default());
        };
        let text: String = col(&row, "state")?;
        let mut state: GovernorState =
            serde_json::from_str(&text).map_err(|e| map_driver_err("decode governor", e))?;
        state.version = col::<i64>(&row, "version")?.max(0) as u64;
        Ok(state)
    }

    async fn compare_and_swap_governor(
        &self,
        expected_version: u64,
        next: &GovernorState,
    ) -> Result<bool, KernelError> {
        self.ensure_schema().await?;
        let table = self.table("ops_governor");
        let state = serde_json::to_string(next)
            .map_err(|e| map_driver_err("encode governor", e))?;
        let updated = if expected_version == 0 {
            let sql = format!(
                "INSERT INTO {table} (id, state, version) VALUES (1, $1, $2)
                 ON CONFLICT (id) DO NOTHING"
            );
            sqlx::query(&sql)
                .bind(&state)
                .bind(next.version as i64)
                .execute(&self.pool)
                .await
                .map_err(|e| map_driver_err("insert governor", e))?
                .rows_affected()
        } else {
            let sql = format!(
                "UPDATE {table} SET state = $1, version = $2 WHERE id = 1 AND version = $3"
            );
            sqlx::query(&sql)
                .bind(&state)
                .bind(next.version as i64)
                .bind(expected_version as i64)
                .execute(&self.pool)
                .await
                .map_err(|e| map_driver_err("compare-and-swap governor", e))?
                .rows_affected()
        };
        Ok(updated == 1)
    }

    async fn operator_settings(&self, manager_id: &str) -> Result<OperatorSettings, KernelError> {
        self.ensure_schema().await?;
        let sql = format!(
            "SELECT manager_id, autonomy_enabled, auto_execute_action_types, updated_at_ms
             FROM {} WHERE manager_id = $1",
            self.table("ops_operator_settings")
        );
        let row = sqlx::query(&sql)
            .bind(manager_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_driver_err("get operator settings", e))?;
        let Some(row) = row else {
            return Ok(OperatorSettings::disabled(manager_id));
        };
        let types_text: String = col(&row, "auto_execute_action_types")?;
        let auto_execute_action_types: Vec<String> = serde_json::from_str(&types_text)
            .map_err(|e| map_driver_err("decode operator settings", e))?;
        Ok(OperatorSettings {
            manager_id: col(&row, "manager_id")?,
            autonomy_enabled: col(&row, "autonomy_enabled")?,
            auto_execute_action_types,
            updated_at: opt_ms_col(&row, "updated_at_ms")?,
        })
    }

    async fn put_operator_settings(&self, settings: &OperatorSettings) -> Result<(), KernelError> {
        self.ensure_schema().await?;
        let sql = format!(
            "INSERT INTO {} (manager_id, autonomy_enabled, auto_execute_action_types, updated_at_ms)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (manager_id) DO UPDATE
             SET autonomy_enabled = EXCLUDED.autonomy_enabled,
                 auto_execute_action_types = EXCLUDED.auto_execute_action_types,
                 updated_at_ms = EXCLUDED.updated_at_ms",
            self.table("ops_operator_settings")
        );
        let types = serde_json::to_string(&settings.auto_execute_action_types)
            .map_err(|e| map_driver_err("encode operator settings", e))?;
        sqlx::query(&sql)
            .bind(&settings.manager_id)
            .bind(settings.autonomy_enabled)
            .bind(types)
            .bind(settings.updated_at.map(dt_to_ms))
            .execute(&self.pool)
            .await
            .map_err(|e| map_driver_err("put operator settings", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use chrono::Duration;
    use serde_json::json;

    use super::*;

    fn test_db_url() -> Option<String> {
        std::env::var("TENANTRY_TEST_POSTGRES_URL").ok()
    }

    fn test_schema(tag: &str) -> String {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        format!("tenantry_repo_test_{}_{}", tag, ts)
    }

    fn repo(tag: &str) -> Option<PostgresRepository> {
        let db_url = test_db_url()?;
        Some(
            PostgresRepository::connect_lazy(&db_url)
                .expect("lazy pool")
                .with_schema(test_schema(tag)),
        )
    }

    #[tokio::test]
    async fn run_cas_and_trigger_ref_uniqueness_when_env_is_set() {
        let Some(repo) = repo("runs") else {
            return;
        };
        let now = Utc::now();
        let run = Run::pending("PM_DUE", "mgr-1", TriggerType::Event, now)
            .with_trigger_ref("PM_DUE:S1:2026-03-01T08");
        repo.insert_run(&run).await.expect("insert run");
        let dup = Run::pending("PM_DUE", "mgr-1", TriggerType::Event, now)
            .with_trigger_ref("PM_DUE:S1:2026-03-01T08");
        assert!(matches!(
            repo.insert_run(&dup).await,
            Err(KernelError::Conflict(_))
        ));

        let mut started = run.clone();
        started.status = RunStatus::Running;
        started.attempts = 1;
        started.started_at = Some(now);
        assert!(repo
            .compare_and_swap_run(RunStatus::Pending, 0, &started)
            .await
            .expect("cas"));
        assert!(!repo
            .compare_and_swap_run(RunStatus::Pending, 0, &started)
            .await
            .expect("stale cas"));

        let stale = repo
            .list_runs(&RunQuery {
                statuses: vec![RunStatus::Running],
                started_before: Some(now + Duration::seconds(1)),
                ..RunQuery::default()
            })
            .await
            .expect("list");
        assert_eq!(stale.len(), 1);
    }

    #[tokio::test]
    async fn policy_versions_and_governor_cas_when_env_is_set() {
        let Some(repo) = repo("policy") else {
            return;
        };
        let draft = NewPolicy {
            scope: PolicyScope::property("p-1"),
            config: json!({"SEND_NOTICE": {"autoExecute": true}}),
            created_by: "admin".into(),
        };
        let v1 = repo.create_policy(&draft, Utc::now()).await.expect("v1");
        let v2 = repo.create_policy(&draft, Utc::now()).await.expect("v2");
        assert_eq!((v1.version, v2.version), (1, 2));
        let active = repo
            .active_policy(&draft.scope)
            .await
            .expect("active")
            .expect("some");
        assert_eq!(active.id, v2.id);

        let mut state = repo.load_governor().await.expect("load");
        state.kill_switch = true;
        state.version = 1;
        assert!(repo.compare_and_swap_governor(0, &state).await.expect("cas"));
        assert!(!repo.compare_and_swap_governor(0, &state).await.expect("stale"));
        assert!(repo.load_governor().await.expect("reload").kill_switch);
    }
}
