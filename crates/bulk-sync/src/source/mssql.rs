//! SQL Server / Synapse connections over tiberius.
//!
//! The same connection type backs the source reader and, wrapped by
//! [`crate::target::SynapseTarget`], the target writer.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use futures::TryStreamExt;
use rust_decimal::Decimal;
use tiberius::{AuthMethod, Client, Config, EncryptionLevel, Row, ToSql};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{AuthConfig, EndpointConfig};
use crate::core::{
    quote_ident, Batch, Column, RangeScan, SourceReader, SqlNullType, SqlValue, TableProbe,
    TableRef,
};
use crate::error::{Result, SyncError};
use crate::planner::KeyDomain;

/// A single tiberius client connection.
pub struct MssqlConnection {
    client: Client<Compat<TcpStream>>,
    endpoint: String,
}

impl std::fmt::Debug for MssqlConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MssqlConnection")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

fn build_config(endpoint: &EndpointConfig, token: Option<&str>) -> Result<Config> {
    let mut config = Config::new();
    config.host(&endpoint.host);
    config.port(endpoint.port);
    config.database(&endpoint.database);

    match (&endpoint.auth, token) {
        (AuthConfig::Sql { user, password }, _) => {
            config.authentication(AuthMethod::sql_server(user, password));
        }
        (_, Some(token)) => {
            config.authentication(AuthMethod::aad_token(token));
        }
        (_, None) => {
            return Err(SyncError::Credential(format!(
                "no access token available for {}",
                endpoint.host
            )));
        }
    }

    if endpoint.encrypt {
        if endpoint.trust_server_cert {
            config.trust_cert();
        }
        config.encryption(EncryptionLevel::Required);
    } else {
        config.encryption(EncryptionLevel::NotSupported);
    }

    Ok(config)
}

async fn open_client(config: Config) -> Result<Client<Compat<TcpStream>>> {
    let addr = config.get_addr();
    let tcp = TcpStream::connect(&addr)
        .await
        .map_err(|e| SyncError::transient(format!("connect {}", addr), e))?;
    tcp.set_nodelay(true).ok();
    Ok(Client::connect(config, tcp.compat_write()).await?)
}

impl MssqlConnection {
    /// Open a connection. `token` is required for the AAD auth methods.
    pub async fn connect(endpoint: &EndpointConfig, token: Option<&str>) -> Result<Self> {
        let config = build_config(endpoint, token)?;
        let client = match open_client(config).await {
            // Azure SQL gateways may redirect to the node actually hosting the database.
            Err(SyncError::Source(tiberius::error::Error::Routing { host, port })) => {
                debug!("Redirected to {}:{}", host, port);
                let mut config = build_config(endpoint, token)?;
                config.host(&host);
                config.port(port);
                open_client(config).await?
            }
            other => other?,
        };

        info!(
            "Connected to {}:{}/{}",
            endpoint.host, endpoint.port, endpoint.database
        );

        Ok(Self {
            client,
            endpoint: format!("{}:{}/{}", endpoint.host, endpoint.port, endpoint.database),
        })
    }

    /// Run a statement, returning the affected-row count.
    pub async fn execute(&mut self, sql: &str, params: &[&dyn ToSql]) -> Result<u64> {
        let result = self.client.execute(sql, params).await?;
        Ok(result.total())
    }

    /// First row of a query, if any.
    pub async fn query_row(&mut self, sql: &str, params: &[&dyn ToSql]) -> Result<Option<Row>> {
        let stream = self.client.query(sql, params).await?;
        Ok(stream.into_row().await?)
    }

    /// All rows of the first result set.
    pub async fn query_all(&mut self, sql: &str, params: &[&dyn ToSql]) -> Result<Vec<Row>> {
        let stream = self.client.query(sql, params).await?;
        Ok(stream.into_first_result().await?)
    }

    async fn scalar_u64(&mut self, sql: &str) -> Result<u64> {
        let row = self.query_row(sql, &[]).await?;
        let value = match row {
            Some(row) => row.try_get::<i64, _>(0)?.unwrap_or(0),
            None => 0,
        };
        Ok(value.max(0) as u64)
    }

    async fn min_max(&mut self, table: &TableRef, column: &str) -> Result<Option<(i64, i64)>> {
        let col = quote_ident(column);
        let sql = format!(
            "SELECT CAST(MIN({col}) AS BIGINT), CAST(MAX({col}) AS BIGINT) FROM {}",
            table.quoted()
        );
        let Some(row) = self.query_row(&sql, &[]).await? else {
            return Ok(None);
        };
        match (row.try_get::<i64, _>(0)?, row.try_get::<i64, _>(1)?) {
            (Some(lo), Some(hi)) => Ok(Some((lo, hi))),
            _ => Ok(None),
        }
    }
}

fn where_range(scan: &RangeScan<'_>) -> String {
    let col = quote_ident(scan.filter_column);
    format!("{col} >= @P1 AND {col} < @P2")
}

#[async_trait]
impl TableProbe for MssqlConnection {
    async fn row_count(&mut self, table: &TableRef) -> Result<u64> {
        self.scalar_u64(&format!("SELECT COUNT_BIG(*) FROM {}", table.quoted()))
            .await
    }

    async fn duplicate_keys(&mut self, table: &TableRef, key_column: &str) -> Result<u64> {
        let key = quote_ident(key_column);
        let sql = format!(
            "SELECT COUNT_BIG(*) FROM (SELECT {key} FROM {} WHERE {key} IS NOT NULL \
             GROUP BY {key} HAVING COUNT_BIG(*) > 1) AS d",
            table.quoted()
        );
        self.scalar_u64(&sql).await
    }

    async fn null_count(&mut self, table: &TableRef, column: &str) -> Result<u64> {
        let sql = format!(
            "SELECT COUNT_BIG(*) FROM {} WHERE {} IS NULL",
            table.quoted(),
            quote_ident(column)
        );
        self.scalar_u64(&sql).await
    }

    async fn key_bounds(&mut self, table: &TableRef, column: &str) -> Result<Option<(i64, i64)>> {
        self.min_max(table, column).await
    }

    async fn sum_avg(
        &mut self,
        table: &TableRef,
        column: &str,
    ) -> Result<(Option<f64>, Option<f64>)> {
        let col = quote_ident(column);
        let sql = format!(
            "SELECT SUM(CAST({col} AS FLOAT)), AVG(CAST({col} AS FLOAT)) FROM {}",
            table.quoted()
        );
        match self.query_row(&sql, &[]).await? {
            Some(row) => Ok((row.try_get::<f64, _>(0)?, row.try_get::<f64, _>(1)?)),
            None => Ok((None, None)),
        }
    }
}

#[async_trait]
impl SourceReader for MssqlConnection {
    async fn ping(&mut self) -> Result<()> {
        self.query_row("SELECT 1", &[]).await?;
        Ok(())
    }

    async fn describe_table(&mut self, table: &TableRef) -> Result<Vec<Column>> {
        let sql = r#"
            SELECT COLUMN_NAME, DATA_TYPE,
                   CAST(ISNULL(CHARACTER_MAXIMUM_LENGTH, 0) AS INT),
                   CAST(ISNULL(NUMERIC_PRECISION, 0) AS INT),
                   CAST(ISNULL(NUMERIC_SCALE, 0) AS INT),
                   CASE WHEN IS_NULLABLE = 'YES' THEN 1 ELSE 0 END
            FROM INFORMATION_SCHEMA.COLUMNS
            WHERE TABLE_SCHEMA = @P1 AND TABLE_NAME = @P2
            ORDER BY ORDINAL_POSITION
        "#;
        let rows = self
            .query_all(sql, &[&table.schema.as_str(), &table.name.as_str()])
            .await?;

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            columns.push(Column {
                name: row.try_get::<&str, _>(0)?.unwrap_or_default().to_string(),
                data_type: row.try_get::<&str, _>(1)?.unwrap_or_default().to_string(),
                max_length: row.try_get::<i32, _>(2)?.unwrap_or(0),
                precision: row.try_get::<i32, _>(3)?.unwrap_or(0),
                scale: row.try_get::<i32, _>(4)?.unwrap_or(0),
                is_nullable: row.try_get::<i32, _>(5)?.unwrap_or(1) == 1,
            });
        }

        if columns.is_empty() {
            return Err(SyncError::Config(format!(
                "table {} not found on {}",
                table.full_name(),
                self.endpoint
            )));
        }
        debug!("{} has {} columns", table.full_name(), columns.len());
        Ok(columns)
    }

    async fn key_domain(&mut self, table: &TableRef, key_column: &str) -> Result<Option<KeyDomain>> {
        let key = quote_ident(key_column);
        let sql = format!(
            "SELECT CAST(MIN({key}) AS BIGINT), CAST(MAX({key}) AS BIGINT), COUNT_BIG(*) FROM {}",
            table.quoted()
        );
        let Some(row) = self.query_row(&sql, &[]).await? else {
            return Ok(None);
        };
        match (row.try_get::<i64, _>(0)?, row.try_get::<i64, _>(1)?) {
            (Some(min_key), Some(max_key)) => Ok(Some(KeyDomain {
                min_key,
                max_key,
                total_rows: row.try_get::<i64, _>(2)?.unwrap_or(0).max(0) as u64,
            })),
            _ => Ok(None),
        }
    }

    async fn max_value(&mut self, table: &TableRef, column: &str) -> Result<Option<i64>> {
        Ok(self.min_max(table, column).await?.map(|(_, hi)| hi))
    }

    async fn count_range(&mut self, scan: &RangeScan<'_>) -> Result<u64> {
        let sql = format!(
            "SELECT COUNT_BIG(*) FROM {} WHERE {}",
            scan.table.quoted(),
            where_range(scan)
        );
        let row = self.query_row(&sql, &[&scan.lower, &scan.upper]).await?;
        let count = match row {
            Some(row) => row.try_get::<i64, _>(0)?.unwrap_or(0),
            None => 0,
        };
        Ok(count.max(0) as u64)
    }

    async fn stream_range(
        &mut self,
        scan: &RangeScan<'_>,
        tx: mpsc::Sender<Result<Batch>>,
    ) -> Result<()> {
        let projection = scan
            .columns
            .iter()
            .map(|c| quote_ident(&c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {} FROM {} WHERE {}",
            projection,
            scan.table.quoted(),
            where_range(scan)
        );

        stream_rows(&mut self.client, &sql, scan, &tx).await
    }
}

async fn stream_rows(
    client: &mut Client<Compat<TcpStream>>,
    sql: &str,
    scan: &RangeScan<'_>,
    tx: &mpsc::Sender<Result<Batch>>,
) -> Result<()> {
    let batch_size = scan.batch_size.max(1);
    let mut rows = client
        .query(sql, &[&scan.lower, &scan.upper])
        .await?
        .into_row_stream();

    let mut buffer = Vec::with_capacity(batch_size);
    while let Some(row) = rows.try_next().await? {
        let mut values = Vec::with_capacity(scan.columns.len());
        for (idx, col) in scan.columns.iter().enumerate() {
            values.push(convert_row_value(&row, idx, &col.data_type)?);
        }
        buffer.push(values);

        if buffer.len() >= batch_size {
            let batch = Batch::new(std::mem::replace(
                &mut buffer,
                Vec::with_capacity(batch_size),
            ));
            if tx.send(Ok(batch)).await.is_err() {
                return Ok(());
            }
        }
    }

    if !buffer.is_empty() {
        let _ = tx.send(Ok(Batch::new(buffer))).await;
    }
    Ok(())
}

/// Convert a row value to SqlValue based on the column type.
fn convert_row_value(row: &Row, idx: usize, data_type: &str) -> Result<SqlValue> {
    let dt = data_type.to_lowercase();

    let value = match dt.as_str() {
        "bit" => row
            .try_get::<bool, _>(idx)?
            .map(SqlValue::Bool)
            .unwrap_or(SqlValue::Null(SqlNullType::Bool)),
        "tinyint" => row
            .try_get::<u8, _>(idx)?
            .map(|v| SqlValue::I16(i16::from(v)))
            .unwrap_or(SqlValue::Null(SqlNullType::I16)),
        "smallint" => row
            .try_get::<i16, _>(idx)?
            .map(SqlValue::I16)
            .unwrap_or(SqlValue::Null(SqlNullType::I16)),
        "int" => row
            .try_get::<i32, _>(idx)?
            .map(SqlValue::I32)
            .unwrap_or(SqlValue::Null(SqlNullType::I32)),
        "bigint" => row
            .try_get::<i64, _>(idx)?
            .map(SqlValue::I64)
            .unwrap_or(SqlValue::Null(SqlNullType::I64)),
        "real" => row
            .try_get::<f32, _>(idx)?
            .map(SqlValue::F32)
            .unwrap_or(SqlValue::Null(SqlNullType::F32)),
        "float" => row
            .try_get::<f64, _>(idx)?
            .map(SqlValue::F64)
            .unwrap_or(SqlValue::Null(SqlNullType::F64)),
        "uniqueidentifier" => row
            .try_get::<Uuid, _>(idx)?
            .map(SqlValue::Uuid)
            .unwrap_or(SqlValue::Null(SqlNullType::Uuid)),
        "datetime" | "datetime2" | "smalldatetime" => row
            .try_get::<NaiveDateTime, _>(idx)?
            .map(SqlValue::DateTime)
            .unwrap_or(SqlValue::Null(SqlNullType::DateTime)),
        "datetimeoffset" => row
            .try_get::<DateTime<FixedOffset>, _>(idx)?
            .map(SqlValue::DateTimeOffset)
            .unwrap_or(SqlValue::Null(SqlNullType::DateTimeOffset)),
        "date" => row
            .try_get::<NaiveDate, _>(idx)?
            .map(SqlValue::Date)
            .unwrap_or(SqlValue::Null(SqlNullType::Date)),
        "time" => row
            .try_get::<NaiveTime, _>(idx)?
            .map(SqlValue::Time)
            .unwrap_or(SqlValue::Null(SqlNullType::Time)),
        "binary" | "varbinary" | "image" | "timestamp" | "rowversion" => row
            .try_get::<&[u8], _>(idx)?
            .map(|v| SqlValue::Bytes(v.to_vec()))
            .unwrap_or(SqlValue::Null(SqlNullType::Bytes)),
        "decimal" | "numeric" | "money" | "smallmoney" => row
            .try_get::<Decimal, _>(idx)?
            .map(SqlValue::Decimal)
            .unwrap_or(SqlValue::Null(SqlNullType::Decimal)),
        // varchar, nvarchar, char, nchar, text, ntext, xml, ...
        _ => row
            .try_get::<&str, _>(idx)?
            .map(|s| SqlValue::Text(s.to_string()))
            .unwrap_or(SqlValue::Null(SqlNullType::String)),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(auth: AuthConfig) -> EndpointConfig {
        EndpointConfig {
            host: "db.example".into(),
            port: 1433,
            database: "dw".into(),
            schema: "dbo".into(),
            auth,
            encrypt: true,
            trust_server_cert: true,
        }
    }

    #[test]
    fn test_build_config_sql_auth() {
        let config = build_config(
            &endpoint(AuthConfig::Sql {
                user: "u".into(),
                password: "p".into(),
            }),
            None,
        )
        .unwrap();
        assert_eq!(config.get_addr(), "db.example:1433");
    }

    #[test]
    fn test_build_config_token_auth_needs_token() {
        let ep = endpoint(AuthConfig::AadToken { token: "t".into() });
        assert!(matches!(
            build_config(&ep, None),
            Err(SyncError::Credential(_))
        ));
        assert!(build_config(&ep, Some("t")).is_ok());
    }

    #[test]
    fn test_where_range_is_half_open() {
        let table = TableRef::new("dbo", "T");
        let scan = RangeScan {
            table: &table,
            columns: &[],
            filter_column: "Id",
            lower: 1,
            upper: 10,
            batch_size: 1,
        };
        assert_eq!(where_range(&scan), "[Id] >= @P1 AND [Id] < @P2");
    }
}
