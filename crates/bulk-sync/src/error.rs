//! Error types for the sync engine.

use thiserror::Error;

/// Main error type for sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Configuration error (invalid YAML, missing fields, bad range plan, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection dropped or timed out; retryable per range.
    #[error("Transient connection error ({context}): {message}")]
    TransientConnection { context: String, message: String },

    /// Source database query error
    #[error("Source database error: {0}")]
    Source(#[from] tiberius::error::Error),

    /// Target statement failed for a specific table
    #[error("Target error for table {table}: {message}")]
    Target { table: String, message: String },

    /// Object store (chunk staging) error
    #[error("Storage error: {0}")]
    Storage(#[from] object_store::Error),

    /// Target table shape disagrees with the source; fatal before any range runs.
    #[error("Schema mismatch for table {table}: {message}")]
    SchemaMismatch { table: String, message: String },

    /// One or more reconciliation checks failed tolerance.
    #[error("Reconciliation failed for {table}: {failed} check(s) out of tolerance")]
    ReconciliationFailure { table: String, failed: usize },

    /// Watermark could not be read, verified or written
    #[error("Watermark error: {0}")]
    Watermark(String),

    /// Range boundaries differ from the ones the watermark was built against
    #[error("Range plan for {table} has changed since the watermark was created. Run `bulk-sync reset --table {table} --yes` to replan.")]
    PlanChanged { table: String },

    /// A range kept failing after all retry attempts
    #[error("Range {range_id} of {table} failed after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        table: String,
        range_id: String,
        attempts: u32,
        last: Box<SyncError>,
    },

    /// Token acquisition failed
    #[error("Credential error: {0}")]
    Credential(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Run was cancelled (SIGINT, etc.)
    #[error("Sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Create a TransientConnection error with context about where it occurred
    pub fn transient(context: impl Into<String>, message: impl std::fmt::Display) -> Self {
        SyncError::TransientConnection {
            context: context.into(),
            message: message.to_string(),
        }
    }

    /// Create a Target error
    pub fn target(table: impl Into<String>, message: impl std::fmt::Display) -> Self {
        SyncError::Target {
            table: table.into(),
            message: message.to_string(),
        }
    }

    /// Create a SchemaMismatch error
    pub fn schema_mismatch(table: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::SchemaMismatch {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Whether the orchestrator may retry the range that produced this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::TransientConnection { .. }
            | SyncError::Storage(_)
            | SyncError::Target { .. }
            | SyncError::Io(_) => true,
            SyncError::Source(e) => matches!(
                e,
                tiberius::error::Error::Io { .. }
                    | tiberius::error::Error::Tls(_)
                    | tiberius::error::Error::Routing { .. }
                    | tiberius::error::Error::Protocol(_)
            ),
            _ => false,
        }
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            SyncError::Config(_) | SyncError::PlanChanged { .. } | SyncError::Yaml(_) => 2,
            SyncError::ReconciliationFailure { .. } => 3,
            SyncError::RetriesExhausted { .. } => 4,
            SyncError::Cancelled => 130,
            _ => 1,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_is_retryable() {
        assert!(SyncError::transient("range 3", "connection reset").is_retryable());
        assert!(SyncError::target("dbo.Sales", "COPY failed").is_retryable());
    }

    #[test]
    fn test_fatal_errors_are_not_retryable() {
        assert!(!SyncError::schema_mismatch("dbo.Sales", "missing column").is_retryable());
        assert!(!SyncError::Config("bad".into()).is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(SyncError::Config("x".into()).exit_code(), 2);
        assert_eq!(
            SyncError::ReconciliationFailure {
                table: "t".into(),
                failed: 1
            }
            .exit_code(),
            3
        );
        assert_eq!(SyncError::Cancelled.exit_code(), 130);
    }

    #[test]
    fn test_retries_exhausted_message_includes_cause() {
        let err = SyncError::RetriesExhausted {
            table: "dbo.FactSales".into(),
            range_id: "00004".into(),
            attempts: 3,
            last: Box::new(SyncError::transient("export", "timeout")),
        };
        let msg = err.to_string();
        assert!(msg.contains("00004"));
        assert!(msg.contains("timeout"));
        assert_eq!(err.exit_code(), 4);
    }
}
