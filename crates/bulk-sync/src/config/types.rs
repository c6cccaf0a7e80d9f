//! Configuration type definitions with auto-tuning based on system resources.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::info;

use crate::core::TableRef;
use crate::planner::Boundary;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in bytes.
    pub total_memory_bytes: u64,
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_memory();

        let total_memory_bytes = sys.total_memory();
        let total_memory_gb = total_memory_bytes as f64 / (1024.0 * 1024.0 * 1024.0);
        let cpu_cores = sys.cpus().len();

        Self {
            total_memory_bytes,
            total_memory_gb,
            cpu_cores,
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database the rows are read from.
    pub source: EndpointConfig,

    /// Database the rows are loaded into.
    pub target: EndpointConfig,

    /// Chunk staging area.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Where watermarks are persisted.
    #[serde(default)]
    pub watermark: WatermarkConfig,

    #[serde(default)]
    pub notifier: NotifierConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub validation: ValidationConfig,

    #[serde(default)]
    pub reconcile: ReconcileConfig,

    /// Tables to sync, in run order.
    #[serde(default)]
    pub tables: Vec<TableConfig>,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.tables = self
            .tables
            .into_iter()
            .map(|t| t.with_auto_tuning(&resources))
            .collect();
        self
    }
}

/// Connection settings for a SQL Server / Synapse endpoint.
#[derive(Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Server host name.
    pub host: String,

    /// Server port (default: 1433).
    #[serde(default = "default_mssql_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Default schema for tables that don't name one (default: "dbo").
    #[serde(default = "default_dbo_schema")]
    pub schema: String,

    /// How to authenticate.
    pub auth: AuthConfig,

    /// Encrypt the connection (default: true).
    #[serde(default = "default_true")]
    pub encrypt: bool,

    /// Trust server certificate (default: false).
    #[serde(default)]
    pub trust_server_cert: bool,
}

impl fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("schema", &self.schema)
            .field("auth", &self.auth)
            .field("encrypt", &self.encrypt)
            .field("trust_server_cert", &self.trust_server_cert)
            .finish()
    }
}

/// Authentication method for an endpoint.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum AuthConfig {
    /// SQL login.
    Sql { user: String, password: String },

    /// Pre-acquired Azure AD access token.
    AadToken { token: String },

    /// Azure AD service principal (client credentials flow).
    ServicePrincipal {
        tenant_id: String,
        client_id: String,
        client_secret: String,
    },
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthConfig::Sql { user, .. } => f
                .debug_struct("Sql")
                .field("user", user)
                .field("password", &"[REDACTED]")
                .finish(),
            AuthConfig::AadToken { .. } => f
                .debug_struct("AadToken")
                .field("token", &"[REDACTED]")
                .finish(),
            AuthConfig::ServicePrincipal {
                tenant_id,
                client_id,
                ..
            } => f
                .debug_struct("ServicePrincipal")
                .field("tenant_id", tenant_id)
                .field("client_id", client_id)
                .field("client_secret", &"[REDACTED]")
                .finish(),
        }
    }
}

/// Chunk staging backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    /// Azure Blob Storage.
    Azure,
    /// Local filesystem (under `root`).
    #[default]
    Local,
    /// Process memory. Only useful for tests and dry runs.
    Memory,
}

/// Chunk staging configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub kind: StorageKind,

    /// Blob container (azure).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,

    /// Storage account name (azure).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,

    /// Storage account key (azure). Also handed to `COPY INTO` as the credential secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,

    /// Key prefix under which all chunks are written.
    #[serde(default = "default_storage_prefix")]
    pub prefix: String,

    /// Root directory (local).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageKind::default(),
            container: None,
            account: None,
            access_key: None,
            prefix: default_storage_prefix(),
            root: None,
        }
    }
}

impl StorageConfig {
    /// Base URL of the staging area as seen by the target's `COPY INTO`.
    pub fn base_url(&self) -> String {
        match self.kind {
            StorageKind::Azure => format!(
                "https://{}.blob.core.windows.net/{}",
                self.account.as_deref().unwrap_or_default(),
                self.container.as_deref().unwrap_or_default()
            ),
            StorageKind::Local => format!(
                "file://{}",
                self.root
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default()
            ),
            StorageKind::Memory => "memory://".to_string(),
        }
    }
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfig")
            .field("kind", &self.kind)
            .field("container", &self.container)
            .field("account", &self.account)
            .field("access_key", &self.access_key.as_ref().map(|_| "[REDACTED]"))
            .field("prefix", &self.prefix)
            .field("root", &self.root)
            .finish()
    }
}

/// Watermark persistence backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkBackend {
    /// One JSON file per table.
    #[default]
    File,
    /// One row per table on the target database.
    Sql,
    /// Process memory.
    Memory,
}

/// Watermark configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct WatermarkConfig {
    #[serde(default)]
    pub backend: WatermarkBackend,

    /// Directory for file watermarks.
    #[serde(default = "default_watermark_dir")]
    pub dir: PathBuf,

    /// Target schema holding the watermark table (sql backend).
    #[serde(default = "default_meta_schema")]
    pub schema: String,

    /// Key for the watermark integrity signature. Derived from the endpoints when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac_key: Option<String>,
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        Self {
            backend: WatermarkBackend::default(),
            dir: default_watermark_dir(),
            schema: default_meta_schema(),
            hmac_key: None,
        }
    }
}

impl fmt::Debug for WatermarkConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatermarkConfig")
            .field("backend", &self.backend)
            .field("dir", &self.dir)
            .field("schema", &self.schema)
            .field("hmac_key", &self.hmac_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Progress notification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    /// Incoming-webhook URL. Notifications only go to the log when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,

    /// Percentages of planned ranges at which to send a progress message.
    #[serde(default = "default_milestones")]
    pub milestones: Vec<u8>,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            milestones: default_milestones(),
        }
    }
}

/// Per-range retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per range, including the first (default: 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Fixed delay between attempts in seconds (default: 60).
    #[serde(default = "default_retry_delay")]
    pub delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_secs: default_retry_delay(),
        }
    }
}

/// Load-ready validation rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Drop rows whose key column is NULL (default: true).
    #[serde(default = "default_true")]
    pub reject_null_pk: bool,

    /// Drop rows whose date column lies in the future (default: true).
    #[serde(default = "default_true")]
    pub reject_future_dates: bool,

    /// Truncate text longer than `max_string_length` (default: true).
    #[serde(default = "default_true")]
    pub truncate_strings: bool,

    /// Maximum text length in characters (default: 4000).
    #[serde(default = "default_max_string_length")]
    pub max_string_length: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            reject_null_pk: true,
            reject_future_dates: true,
            truncate_strings: true,
            max_string_length: default_max_string_length(),
        }
    }
}

/// Post-load reconciliation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Run reconciliation after `run` (default: true).
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Relative tolerance for SUM/AVG parity, in percent (default: 1.0).
    #[serde(default = "default_aggregate_tolerance")]
    pub aggregate_tolerance_pct: f64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            aggregate_tolerance_pct: default_aggregate_tolerance(),
        }
    }
}

/// How a table's key domain is cut into ranges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RangePolicy {
    /// Constant key span, derived from a row budget unless given explicitly.
    FixedWidth {
        rows_per_range: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        range_width: Option<i64>,
    },

    /// Boundaries from a prior distribution analysis.
    DataDriven { boundaries: Vec<Boundary> },
}

impl Default for RangePolicy {
    fn default() -> Self {
        RangePolicy::FixedWidth {
            rows_per_range: 10_000_000,
            range_width: None,
        }
    }
}

/// Whether a table is copied once or kept current with delta syncs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadType {
    #[default]
    Full,
    Delta,
}

/// One table to sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    /// Logical name; also the watermark and chunk-key identity.
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_schema: Option<String>,

    /// Source table (default: `name`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_table: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_schema: Option<String>,

    /// Target table (default: `name`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_table: Option<String>,

    /// Integer primary key column ranges are cut on.
    pub key_column: String,

    /// Monotonic ordering column for delta sync (default: `key_column`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_column: Option<String>,

    /// Column checked by the future-date rule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_column: Option<String>,

    /// Rows per chunk. Auto-tuned based on RAM if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<usize>,

    /// Batches buffered between the reader task and the exporter. Auto-tuned if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_ahead_batches: Option<usize>,

    /// Safety ceiling on estimated rows per range.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_range_rows: Option<u64>,

    #[serde(default)]
    pub range_policy: RangePolicy,

    #[serde(default)]
    pub load_type: LoadType,

    /// Columns the null check inspects.
    #[serde(default)]
    pub not_null_columns: Vec<String>,

    /// Columns the aggregate check compares.
    #[serde(default)]
    pub numeric_columns: Vec<String>,

    /// Delete staged chunks once a range is loaded (default: false).
    #[serde(default)]
    pub cleanup_chunks: bool,
}

impl TableConfig {
    /// Minimal table entry with defaults for everything else.
    pub fn new(name: impl Into<String>, key_column: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source_schema: None,
            source_table: None,
            target_schema: None,
            target_table: None,
            key_column: key_column.into(),
            cursor_column: None,
            date_column: None,
            chunk_size: None,
            read_ahead_batches: None,
            max_range_rows: None,
            range_policy: RangePolicy::default(),
            load_type: LoadType::default(),
            not_null_columns: Vec::new(),
            numeric_columns: Vec::new(),
            cleanup_chunks: false,
        }
    }

    /// Apply auto-tuned defaults based on system resources.
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        let ram_gb = resources.total_memory_gb;

        // Base: 50K rows, +25K per 8GB of RAM, cap at 200K
        if self.chunk_size.is_none() {
            let chunk = 50_000 + ((ram_gb / 8.0) as usize * 25_000);
            self.chunk_size = Some(chunk.clamp(50_000, 200_000));
        }

        if self.read_ahead_batches.is_none() {
            self.read_ahead_batches = Some(((ram_gb / 8.0) as usize).clamp(2, 8));
        }

        info!(
            "Auto-tuned {}: chunk_size={}, read_ahead_batches={}",
            self.name,
            self.get_chunk_size(),
            self.get_read_ahead_batches()
        );

        self
    }

    pub fn source_ref(&self, default_schema: &str) -> TableRef {
        TableRef::new(
            self.source_schema.as_deref().unwrap_or(default_schema),
            self.source_table.as_deref().unwrap_or(&self.name),
        )
    }

    pub fn target_ref(&self, default_schema: &str) -> TableRef {
        TableRef::new(
            self.target_schema.as_deref().unwrap_or(default_schema),
            self.target_table.as_deref().unwrap_or(&self.name),
        )
    }

    /// Effective delta cursor column.
    pub fn cursor(&self) -> &str {
        self.cursor_column.as_deref().unwrap_or(&self.key_column)
    }

    pub fn get_chunk_size(&self) -> usize {
        self.chunk_size.unwrap_or(50_000)
    }

    pub fn get_read_ahead_batches(&self) -> usize {
        self.read_ahead_batches.unwrap_or(4)
    }

    pub fn get_max_range_rows(&self) -> u64 {
        self.max_range_rows.unwrap_or(50_000_000)
    }
}

// Default value functions for serde
fn default_mssql_port() -> u16 {
    1433
}

fn default_dbo_schema() -> String {
    "dbo".to_string()
}

fn default_meta_schema() -> String {
    "meta".to_string()
}

fn default_storage_prefix() -> String {
    "bulk-sync".to_string()
}

fn default_watermark_dir() -> PathBuf {
    PathBuf::from(".bulk-sync")
}

fn default_milestones() -> Vec<u8> {
    vec![25, 50, 75, 100]
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    60
}

fn default_max_string_length() -> usize {
    4000
}

fn default_aggregate_tolerance() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}
