//! Process-local watermark store for tests and dry runs.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{Watermark, WatermarkStore};
use crate::error::Result;

/// Keeps signed JSON per table so records go through the same
/// serialize-verify path as the durable stores.
#[derive(Debug)]
pub struct MemoryWatermarkStore {
    key: Vec<u8>,
    records: Mutex<BTreeMap<String, String>>,
    saves: Mutex<usize>,
}

impl MemoryWatermarkStore {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            records: Mutex::new(BTreeMap::new()),
            saves: Mutex::new(0),
        }
    }

    fn records(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of `save` calls so far.
    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryWatermarkStore {
    fn default() -> Self {
        Self::new(b"memory".to_vec())
    }
}

#[async_trait]
impl WatermarkStore for MemoryWatermarkStore {
    async fn load(&self, table: &str) -> Result<Watermark> {
        match self.records().get(table) {
            Some(json) => Watermark::from_signed_json(json, &self.key),
            None => Ok(Watermark::new(table)),
        }
    }

    async fn save(&self, watermark: &Watermark) -> Result<()> {
        let json = watermark.to_signed_json(&self.key)?;
        self.records().insert(watermark.table.clone(), json);
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        Ok(())
    }

    async fn clear(&self, table: &str) -> Result<()> {
        self.records().remove(table);
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
