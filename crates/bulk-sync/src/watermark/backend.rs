//! Storage trait for watermarks.
//!
//! The orchestrator holds an `Arc<dyn WatermarkStore>` and never knows where
//! records live: a JSON file per table, a row on the target, or memory.

use async_trait::async_trait;

use super::Watermark;
use crate::error::Result;

#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// Create whatever the backend needs. Idempotent.
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    /// The last persisted record, or a fresh `not_started` one.
    async fn load(&self, table: &str) -> Result<Watermark>;

    /// Replace the whole record atomically.
    async fn save(&self, watermark: &Watermark) -> Result<()>;

    /// Forget a table's progress. Only reachable through an explicit reset.
    async fn clear(&self, table: &str) -> Result<()>;

    /// Backend name for logging.
    fn backend_type(&self) -> &'static str;
}
