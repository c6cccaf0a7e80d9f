//! # bulk-sync
//!
//! Resumable bulk copy of very large tables from SQL Server into Azure
//! Synapse, staged through object storage.
//!
//! Each table's integer key domain is cut into ranges. Every range is
//! streamed from the source, validated, written as pipe-delimited chunks to
//! object storage and loaded with `COPY INTO` after deleting whatever the
//! target already holds for that range, so a range can be rerun any number
//! of times. A signed per-table watermark records finished ranges so that an
//! interrupted run resumes where it stopped. Afterwards the load is
//! reconciled against the source, and tables configured for it can be kept
//! current with delta syncs.
//!
//! ## Example
//!
//! ```rust,no_run
//! use bulk_sync::{Config, Orchestrator};
//!
//! # async fn example() -> bulk_sync::Result<()> {
//! let config = Config::load("bulk-sync.yaml")?.with_auto_tuning();
//! let orchestrator = Orchestrator::from_config(config)?;
//! let report = orchestrator.run(&[], false).await?;
//! println!("Loaded {} rows", report.rows_loaded());
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod config;
pub mod core;
pub mod credentials;
pub mod delta;
pub mod error;
pub mod export;
pub mod loader;
pub mod notify;
pub mod orchestrator;
pub mod planner;
pub mod reconcile;
pub mod source;
pub mod storage;
pub mod target;
pub mod validate;
pub mod watermark;

// Re-exports for convenient access
pub use config::{Config, LoadType, RangePolicy, TableConfig};
pub use error::{Result, SyncError};
pub use orchestrator::{
    HealthReport, MemoryConnector, MssqlConnector, Orchestrator, RunReport, TableOutcome,
    TablePlan, TableReport,
};
pub use planner::{KeyDomain, Range};
pub use reconcile::{ReconciliationReport, ReconciliationResult};
pub use source::MemorySource;
pub use storage::ChunkStore;
pub use target::MemoryTarget;
pub use watermark::{Watermark, WatermarkStatus, WatermarkStore};
