//! Synapse dedicated pool target.
//!
//! Loads go through `COPY INTO` against staged chunks, so the only row data
//! that ever crosses this connection is the statement text.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::core::{
    quote_ident, Column, CopySource, TableProbe, TableRef, TargetWriter,
};
use crate::error::{Result, SyncError};
use crate::export::chunk::FIELD_TERMINATOR;
use crate::source::MssqlConnection;

/// Maximum retries for a statement chosen as a deadlock victim.
const DEADLOCK_MAX_RETRIES: u32 = 5;

/// Base delay between deadlock retries; linear backoff (200ms, 400ms, ...).
const DEADLOCK_RETRY_DELAY_MS: u64 = 200;

/// Target writer over a tiberius connection to a Synapse dedicated pool.
#[derive(Debug)]
pub struct SynapseTarget {
    conn: MssqlConnection,
}

impl SynapseTarget {
    pub fn new(conn: MssqlConnection) -> Self {
        Self { conn }
    }

    /// Execute a statement, retrying deadlock victims and tagging failures with the table.
    async fn execute_for(
        &mut self,
        table: &TableRef,
        sql: &str,
        params: &[&dyn tiberius::ToSql],
    ) -> Result<u64> {
        let mut retries = 0;
        loop {
            match self.conn.execute(sql, params).await {
                Ok(n) => return Ok(n),
                Err(SyncError::Source(e)) if e.is_deadlock() && retries < DEADLOCK_MAX_RETRIES => {
                    retries += 1;
                    warn!(
                        "Deadlock on {}, retry {}/{}",
                        table.full_name(),
                        retries,
                        DEADLOCK_MAX_RETRIES
                    );
                    tokio::time::sleep(Duration::from_millis(
                        DEADLOCK_RETRY_DELAY_MS * retries as u64,
                    ))
                    .await;
                }
                Err(SyncError::Source(e)) => return Err(SyncError::target(table.full_name(), e)),
                Err(e) => return Err(e),
            }
        }
    }
}

/// Column type as written in Synapse DDL.
///
/// Lengths come from `INFORMATION_SCHEMA`, so they are already in characters.
/// Types a dedicated pool cannot store are widened to the nearest supported one.
pub fn format_synapse_type(column: &Column) -> String {
    let data_type = column.data_type.to_lowercase();
    let (max_length, precision, scale) = (column.max_length, column.precision, column.scale);
    match data_type.as_str() {
        "bigint" | "int" | "smallint" | "tinyint" | "bit" | "money" | "smallmoney" | "real"
        | "datetime" | "smalldatetime" | "date" | "uniqueidentifier" => data_type.clone(),

        "float" if precision > 0 && precision != 53 => format!("float({})", precision),
        "float" => data_type.clone(),

        "decimal" | "numeric" if precision > 0 => {
            format!("{}({}, {})", data_type, precision, scale)
        }
        "decimal" | "numeric" => format!("{}(18, 0)", data_type),

        "datetime2" | "time" | "datetimeoffset" if scale > 0 => {
            format!("{}({})", data_type, scale)
        }
        "datetime2" | "time" | "datetimeoffset" => data_type.clone(),

        "char" | "varchar" | "nchar" | "nvarchar" | "binary" | "varbinary" => {
            if max_length == -1 {
                format!("{}(max)", data_type)
            } else if max_length > 0 {
                format!("{}({})", data_type, max_length)
            } else {
                format!("{}(1)", data_type)
            }
        }

        "text" => "varchar(max)".to_string(),
        "ntext" | "xml" => "nvarchar(max)".to_string(),
        "image" => "varbinary(max)".to_string(),
        "timestamp" | "rowversion" => "binary(8)".to_string(),

        _ => "nvarchar(4000)".to_string(),
    }
}

/// `CREATE TABLE` hash-distributed on the key with a clustered columnstore.
///
/// Staged data may contain NULLs the source declares NOT NULL (rejected keys
/// never reach storage), so every column except the key is created nullable.
pub fn create_table_sql(table: &TableRef, columns: &[Column], key_column: &str) -> String {
    let defs = columns
        .iter()
        .map(|c| {
            let null = if c.name.eq_ignore_ascii_case(key_column) {
                "NOT NULL"
            } else {
                "NULL"
            };
            format!("{} {} {}", quote_ident(&c.name), format_synapse_type(c), null)
        })
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "CREATE TABLE {} ({}) WITH (DISTRIBUTION = HASH({}), CLUSTERED COLUMNSTORE INDEX)",
        table.quoted(),
        defs,
        quote_ident(key_column)
    )
}

/// `COPY INTO` over every chunk under the source's wildcard.
pub fn copy_into_sql(table: &TableRef, columns: &[Column], source: &CopySource) -> String {
    let column_list = columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ");

    let credential = match &source.secret {
        Some(secret) => format!(
            ",\n    CREDENTIAL = (IDENTITY = 'Storage Account Key', SECRET = '{}')",
            secret.replace('\'', "''")
        ),
        None => String::new(),
    };

    format!(
        "COPY INTO {} ({})\nFROM '{}'\nWITH (\n    FILE_TYPE = 'CSV',\n    FIELDTERMINATOR = '{}',\n    ROWTERMINATOR = '0x0A',\n    FIELDQUOTE = '\"',\n    ENCODING = 'UTF8',\n    FIRSTROW = 1{}\n)",
        table.quoted(),
        column_list,
        source.url.replace('\'', "''"),
        FIELD_TERMINATOR,
        credential
    )
}

#[async_trait]
impl TableProbe for SynapseTarget {
    async fn row_count(&mut self, table: &TableRef) -> Result<u64> {
        self.conn.row_count(table).await
    }

    async fn duplicate_keys(&mut self, table: &TableRef, key_column: &str) -> Result<u64> {
        self.conn.duplicate_keys(table, key_column).await
    }

    async fn null_count(&mut self, table: &TableRef, column: &str) -> Result<u64> {
        self.conn.null_count(table, column).await
    }

    async fn key_bounds(&mut self, table: &TableRef, column: &str) -> Result<Option<(i64, i64)>> {
        self.conn.key_bounds(table, column).await
    }

    async fn sum_avg(
        &mut self,
        table: &TableRef,
        column: &str,
    ) -> Result<(Option<f64>, Option<f64>)> {
        self.conn.sum_avg(table, column).await
    }
}

#[async_trait]
impl TargetWriter for SynapseTarget {
    async fn ping(&mut self) -> Result<()> {
        self.conn.query_row("SELECT 1", &[]).await?;
        Ok(())
    }

    async fn table_columns(&mut self, table: &TableRef) -> Result<Option<Vec<String>>> {
        let sql = "SELECT COLUMN_NAME FROM INFORMATION_SCHEMA.COLUMNS \
                   WHERE TABLE_SCHEMA = @P1 AND TABLE_NAME = @P2 ORDER BY ORDINAL_POSITION";
        let rows = self
            .conn
            .query_all(sql, &[&table.schema.as_str(), &table.name.as_str()])
            .await?;
        if rows.is_empty() {
            return Ok(None);
        }
        let mut names = Vec::with_capacity(rows.len());
        for row in rows {
            names.push(row.try_get::<&str, _>(0)?.unwrap_or_default().to_string());
        }
        Ok(Some(names))
    }

    async fn create_table(
        &mut self,
        table: &TableRef,
        columns: &[Column],
        key_column: &str,
    ) -> Result<()> {
        let sql = create_table_sql(table, columns, key_column);
        debug!("{}", sql);
        self.execute_for(table, &sql, &[]).await?;
        info!(
            "Created {} distributed on {}",
            table.full_name(),
            key_column
        );
        Ok(())
    }

    async fn delete_range(
        &mut self,
        table: &TableRef,
        column: &str,
        lower: i64,
        upper: i64,
    ) -> Result<u64> {
        let col = quote_ident(column);
        let sql = format!(
            "DELETE FROM {} WHERE {col} >= @P1 AND {col} < @P2",
            table.quoted()
        );
        self.execute_for(table, &sql, &[&lower, &upper]).await
    }

    async fn copy_into(
        &mut self,
        table: &TableRef,
        columns: &[Column],
        source: &CopySource,
    ) -> Result<u64> {
        let sql = copy_into_sql(table, columns, source);
        debug!("COPY INTO {} FROM '{}'", table.full_name(), source.url);
        self.execute_for(table, &sql, &[]).await
    }
}
