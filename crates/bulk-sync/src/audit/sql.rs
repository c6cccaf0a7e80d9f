//! Audit tables `[meta].[bulk_sync_load_stats]` and
//! `[meta].[bulk_sync_reconciliation]` on the target.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{AuditLog, CheckRecord, LoadRecord};
use crate::config::{EndpointConfig, LoadType};
use crate::core::quote_ident;
use crate::credentials::{token_for, CredentialProvider};
use crate::error::Result;
use crate::source::MssqlConnection;
use crate::watermark::create_schema_sql;

const LOAD_STATS_TABLE: &str = "bulk_sync_load_stats";
const RECONCILIATION_TABLE: &str = "bulk_sync_reconciliation";

pub struct SqlAuditLog {
    endpoint: EndpointConfig,
    credential: Option<Arc<dyn CredentialProvider>>,
    schema: String,
}

impl std::fmt::Debug for SqlAuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlAuditLog")
            .field("endpoint", &self.endpoint)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

impl SqlAuditLog {
    pub fn new(
        endpoint: EndpointConfig,
        credential: Option<Arc<dyn CredentialProvider>>,
        schema: impl Into<String>,
    ) -> Self {
        Self {
            endpoint,
            credential,
            schema: schema.into(),
        }
    }

    fn qualified(&self, table: &str) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(table))
    }

    async fn connect(&self) -> Result<MssqlConnection> {
        let token = token_for(self.credential.as_ref()).await?;
        MssqlConnection::connect(&self.endpoint, token.as_deref()).await
    }
}

fn create_if_missing(schema: &str, table: &str, columns: &str) -> String {
    format!(
        "IF NOT EXISTS (SELECT * FROM sys.tables WHERE name = '{table}' AND schema_id = SCHEMA_ID('{s}'))
         BEGIN
             CREATE TABLE {q}.[{table}] ({columns})
         END",
        s = schema.replace('\'', "''"),
        q = quote_ident(schema)
    )
}

pub(crate) fn create_load_stats_sql(schema: &str) -> String {
    create_if_missing(
        schema,
        LOAD_STATS_TABLE,
        "run_id NVARCHAR(64) NOT NULL,
         table_name NVARCHAR(256) NOT NULL,
         source_table NVARCHAR(512) NOT NULL,
         target_table NVARCHAR(512) NOT NULL,
         load_type NVARCHAR(20) NOT NULL,
         outcome NVARCHAR(20) NULL,
         delta_column NVARCHAR(256) NULL,
         delta_start BIGINT NULL,
         delta_end BIGINT NULL,
         started_at DATETIME2 NOT NULL,
         ended_at DATETIME2 NOT NULL,
         rows_read BIGINT NOT NULL,
         rows_loaded BIGINT NOT NULL,
         rows_rejected BIGINT NOT NULL,
         chunks BIGINT NOT NULL,
         duration_ms BIGINT NOT NULL,
         success BIT NOT NULL,
         error_message NVARCHAR(4000) NULL",
    )
}

pub(crate) fn create_reconciliation_sql(schema: &str) -> String {
    create_if_missing(
        schema,
        RECONCILIATION_TABLE,
        "run_id NVARCHAR(64) NOT NULL,
         table_name NVARCHAR(256) NOT NULL,
         check_kind NVARCHAR(20) NOT NULL,
         column_name NVARCHAR(256) NULL,
         source_value FLOAT NULL,
         target_value FLOAT NULL,
         diff FLOAT NULL,
         diff_pct FLOAT NULL,
         pass BIT NOT NULL,
         severity NVARCHAR(10) NOT NULL,
         detail NVARCHAR(4000) NULL,
         checked_at DATETIME2 NOT NULL",
    )
}

fn insert_sql(qualified: &str, columns: &[&str]) -> String {
    let params: Vec<String> = (1..=columns.len()).map(|i| format!("@P{}", i)).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        qualified,
        columns.join(", "),
        params.join(", ")
    )
}

const LOAD_STATS_COLUMNS: &[&str] = &[
    "run_id",
    "table_name",
    "source_table",
    "target_table",
    "load_type",
    "outcome",
    "delta_column",
    "delta_start",
    "delta_end",
    "started_at",
    "ended_at",
    "rows_read",
    "rows_loaded",
    "rows_rejected",
    "chunks",
    "duration_ms",
    "success",
    "error_message",
];

const RECONCILIATION_COLUMNS: &[&str] = &[
    "run_id",
    "table_name",
    "check_kind",
    "column_name",
    "source_value",
    "target_value",
    "diff",
    "diff_pct",
    "pass",
    "severity",
    "detail",
    "checked_at",
];

fn as_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

#[async_trait]
impl AuditLog for SqlAuditLog {
    async fn init(&self) -> Result<()> {
        let mut conn = self.connect().await?;
        conn.execute(&create_schema_sql(&self.schema), &[]).await?;
        conn.execute(&create_load_stats_sql(&self.schema), &[]).await?;
        conn.execute(&create_reconciliation_sql(&self.schema), &[])
            .await?;
        debug!("Audit tables ready in schema {}", self.schema);
        Ok(())
    }

    async fn record_load(&self, r: &LoadRecord) -> Result<()> {
        let load_type = match r.load_type {
            LoadType::Full => "full",
            LoadType::Delta => "delta",
        };
        let outcome = r.outcome.map(|o| o.as_str());
        let started_at = r.started_at.naive_utc();
        let ended_at = r.ended_at.naive_utc();
        let (rows_read, rows_loaded, rows_rejected) = (
            as_i64(r.rows_read),
            as_i64(r.rows_loaded),
            as_i64(r.rows_rejected),
        );
        let (chunks, duration_ms) = (as_i64(r.chunks), as_i64(r.duration_ms));

        let mut conn = self.connect().await?;
        conn.execute(
            &insert_sql(&self.qualified(LOAD_STATS_TABLE), LOAD_STATS_COLUMNS),
            &[
                &r.run_id.as_str(),
                &r.table.as_str(),
                &r.source_table.as_str(),
                &r.target_table.as_str(),
                &load_type,
                &outcome,
                &r.delta_column.as_deref(),
                &r.delta_start,
                &r.delta_end,
                &started_at,
                &ended_at,
                &rows_read,
                &rows_loaded,
                &rows_rejected,
                &chunks,
                &duration_ms,
                &r.success,
                &r.error.as_deref(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn record_checks(&self, records: &[CheckRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let sql = insert_sql(&self.qualified(RECONCILIATION_TABLE), RECONCILIATION_COLUMNS);
        let mut conn = self.connect().await?;
        for record in records {
            let r = &record.result;
            let check_kind = r.check_kind.to_string();
            let severity = r.severity.to_string();
            let detail = (!r.detail.is_empty()).then_some(r.detail.as_str());
            let checked_at = record.checked_at.naive_utc();
            conn.execute(
                &sql,
                &[
                    &record.run_id.as_str(),
                    &r.table.as_str(),
                    &check_kind.as_str(),
                    &r.column.as_deref(),
                    &r.source_value,
                    &r.target_value,
                    &r.diff,
                    &r.diff_pct,
                    &r.pass,
                    &severity.as_str(),
                    &detail,
                    &checked_at,
                ],
            )
            .await?;
        }
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "sql"
    }
}
