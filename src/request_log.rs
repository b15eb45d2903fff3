//! Write-only request log.
//!
//! Each forecast request produces one [`RequestLogEntry`]. The SQLite sink
//! stores entries in a `forecast_requests` table in a WAL-mode database;
//! when no path is configured the no-op sink is used. Logging failures are
//! reported by the caller and never change the response.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::RequestLogConfig;
use crate::models::ToolKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Completed,
    /// Rejected before the pipeline ran.
    Failed,
    /// Answered after the request deadline cut a step short.
    TimedOut,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
            RequestStatus::TimedOut => "timed_out",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestLogEntry {
    pub request_id: Uuid,
    pub company_symbol: Option<String>,
    pub source_url: String,
    pub periods: u32,
    pub request_json: String,
    pub response_json: Option<String>,
    pub status: RequestStatus,
    pub error_message: Option<String>,
    pub duration_ms: u64,
    pub tools_used: Vec<ToolKind>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

#[async_trait]
pub trait RequestLogSink: Send + Sync {
    async fn record(&self, entry: &RequestLogEntry) -> Result<()>;
}

pub struct NoopRequestLog;

#[async_trait]
impl RequestLogSink for NoopRequestLog {
    async fn record(&self, _entry: &RequestLogEntry) -> Result<()> {
        Ok(())
    }
}

pub struct SqliteRequestLog {
    pool: SqlitePool,
}

impl SqliteRequestLog {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = connect(path).await?;
        migrate(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl RequestLogSink for SqliteRequestLog {
    async fn record(&self, entry: &RequestLogEntry) -> Result<()> {
        let tools = serde_json::to_string(&entry.tools_used)?;
        sqlx::query(
            r#"
            INSERT INTO forecast_requests (
                request_id, company_symbol, source_url, periods, request_json,
                response_json, status, error_message, duration_ms, tools_used,
                started_at, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.request_id.to_string())
        .bind(entry.company_symbol.as_deref())
        .bind(entry.source_url.as_str())
        .bind(entry.periods as i64)
        .bind(entry.request_json.as_str())
        .bind(entry.response_json.as_deref())
        .bind(entry.status.as_str())
        .bind(entry.error_message.as_deref())
        .bind(entry.duration_ms as i64)
        .bind(tools)
        .bind(entry.started_at.timestamp())
        .bind(entry.completed_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

pub async fn connect(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Create the request table and its indexes. Safe to run repeatedly.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS forecast_requests (
            request_id TEXT PRIMARY KEY,
            company_symbol TEXT,
            source_url TEXT NOT NULL,
            periods INTEGER NOT NULL,
            request_json TEXT NOT NULL,
            response_json TEXT,
            status TEXT NOT NULL,
            error_message TEXT,
            duration_ms INTEGER NOT NULL,
            tools_used TEXT NOT NULL DEFAULT '[]',
            started_at INTEGER NOT NULL,
            completed_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_forecast_requests_symbol ON forecast_requests(company_symbol)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_forecast_requests_started ON forecast_requests(started_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// The configured sink: SQLite when a path is set, otherwise a no-op.
pub async fn create_request_log(config: &RequestLogConfig) -> Result<Arc<dyn RequestLogSink>> {
    match &config.path {
        Some(path) => Ok(Arc::new(SqliteRequestLog::open(path).await?)),
        None => Ok(Arc::new(NoopRequestLog)),
    }
}
