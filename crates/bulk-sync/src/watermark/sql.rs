//! Watermarks as rows in `[meta].[bulk_sync_watermark]` on the target.
//!
//! Each record is one JSON document replaced by a single `MERGE`, which is
//! atomic on its own; no explicit transaction is opened through tiberius.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{Watermark, WatermarkStore};
use crate::config::EndpointConfig;
use crate::core::quote_ident;
use crate::credentials::{token_for, CredentialProvider};
use crate::error::Result;
use crate::source::MssqlConnection;

const TABLE_NAME: &str = "bulk_sync_watermark";

pub struct SqlWatermarkStore {
    endpoint: EndpointConfig,
    credential: Option<Arc<dyn CredentialProvider>>,
    schema: String,
    key: Vec<u8>,
}

impl std::fmt::Debug for SqlWatermarkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlWatermarkStore")
            .field("endpoint", &self.endpoint)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

impl SqlWatermarkStore {
    pub fn new(
        endpoint: EndpointConfig,
        credential: Option<Arc<dyn CredentialProvider>>,
        schema: impl Into<String>,
        key: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            endpoint,
            credential,
            schema: schema.into(),
            key: key.into(),
        }
    }

    fn qualified(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(TABLE_NAME))
    }

    // One short-lived connection per call; saves happen once per range.
    async fn connect(&self) -> Result<MssqlConnection> {
        let token = token_for(self.credential.as_ref()).await?;
        MssqlConnection::connect(&self.endpoint, token.as_deref()).await
    }
}

pub(crate) fn create_schema_sql(schema: &str) -> String {
    format!(
        "IF NOT EXISTS (SELECT * FROM sys.schemas WHERE name = '{}')
         BEGIN
             EXEC('CREATE SCHEMA {}')
         END",
        schema.replace('\'', "''"),
        quote_ident(schema).replace('\'', "''")
    )
}

pub(crate) fn create_table_sql(schema: &str) -> String {
    format!(
        "IF NOT EXISTS (SELECT * FROM sys.tables WHERE name = '{table}' AND schema_id = SCHEMA_ID('{s}'))
         BEGIN
             CREATE TABLE {q}.[{table}] (
                 table_name NVARCHAR(256) NOT NULL,
                 status NVARCHAR(20) NOT NULL,
                 document NVARCHAR(MAX) NOT NULL,
                 updated_at DATETIME2 NOT NULL
             )
         END",
        table = TABLE_NAME,
        s = schema.replace('\'', "''"),
        q = quote_ident(schema)
    )
}

pub(crate) fn merge_sql(qualified: &str) -> String {
    format!(
        "MERGE {qualified} AS target
         USING (SELECT @P1 AS table_name) AS source
         ON target.table_name = source.table_name
         WHEN MATCHED THEN
             UPDATE SET status = @P2, document = @P3, updated_at = SYSUTCDATETIME()
         WHEN NOT MATCHED THEN
             INSERT (table_name, status, document, updated_at)
             VALUES (@P1, @P2, @P3, SYSUTCDATETIME());"
    )
}

#[async_trait]
impl WatermarkStore for SqlWatermarkStore {
    async fn init(&self) -> Result<()> {
        let mut conn = self.connect().await?;
        conn.execute(&create_schema_sql(&self.schema), &[]).await?;
        conn.execute(&create_table_sql(&self.schema), &[]).await?;
        debug!("Watermark table {} ready", self.qualified());
        Ok(())
    }

    async fn load(&self, table: &str) -> Result<Watermark> {
        let mut conn = self.connect().await?;
        let sql = format!(
            "SELECT document FROM {} WHERE table_name = @P1",
            self.qualified()
        );
        match conn.query_row(&sql, &[&table]).await? {
            Some(row) => {
                let document = row.try_get::<&str, _>(0)?.unwrap_or_default();
                Watermark::from_signed_json(document, &self.key)
            }
            None => Ok(Watermark::new(table)),
        }
    }

    async fn save(&self, watermark: &Watermark) -> Result<()> {
        let document = watermark.to_signed_json(&self.key)?;
        let status = watermark.status.to_string();
        let mut conn = self.connect().await?;
        conn.execute(
            &merge_sql(&self.qualified()),
            &[&watermark.table.as_str(), &status.as_str(), &document.as_str()],
        )
        .await?;
        Ok(())
    }

    async fn clear(&self, table: &str) -> Result<()> {
        let mut conn = self.connect().await?;
        let sql = format!("DELETE FROM {} WHERE table_name = @P1", self.qualified());
        conn.execute(&sql, &[&table]).await?;
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "sql"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_replaces_whole_document() {
        let sql = merge_sql("[meta].[bulk_sync_watermark]");
        assert!(sql.starts_with("MERGE [meta].[bulk_sync_watermark] AS target"));
        assert!(sql.contains("document = @P3"));
        assert!(sql.contains("VALUES (@P1, @P2, @P3"));
    }

    #[test]
    fn test_ddl_is_idempotent() {
        assert!(create_schema_sql("meta").contains("IF NOT EXISTS (SELECT * FROM sys.schemas WHERE name = 'meta')"));
        let ddl = create_table_sql("meta");
        assert!(ddl.contains("SCHEMA_ID('meta')"));
        assert!(ddl.contains("CREATE TABLE [meta].[bulk_sync_watermark]"));
    }
}
