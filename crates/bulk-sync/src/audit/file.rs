//! JSON-lines audit files beside the file watermarks.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use super::{AuditLog, CheckRecord, LoadRecord};
use crate::error::Result;

const LOAD_STATS_FILE: &str = "load_stats.jsonl";
const RECONCILIATION_FILE: &str = "reconciliation.jsonl";

#[derive(Debug, Clone)]
pub struct FileAuditLog {
    dir: PathBuf,
}

impl FileAuditLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn load_stats_path(&self) -> PathBuf {
        self.dir.join(LOAD_STATS_FILE)
    }

    pub fn reconciliation_path(&self) -> PathBuf {
        self.dir.join(RECONCILIATION_FILE)
    }

    async fn append<T: Serialize>(&self, path: &Path, records: &[T]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut lines = String::new();
        for record in records {
            lines.push_str(&serde_json::to_string(record)?);
            lines.push('\n');
        }

        tokio::fs::create_dir_all(&self.dir).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(lines.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl AuditLog for FileAuditLog {
    async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    async fn record_load(&self, record: &LoadRecord) -> Result<()> {
        self.append(&self.load_stats_path(), std::slice::from_ref(record))
            .await
    }

    async fn record_checks(&self, records: &[CheckRecord]) -> Result<()> {
        self.append(&self.reconciliation_path(), records).await
    }

    fn backend_type(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::checks;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_checks_are_appended() {
        let dir = TempDir::new().unwrap();
        let log = FileAuditLog::new(dir.path().join("audit"));

        log.record_checks(&CheckRecord::for_run("r1", &[checks::row_count("T", 5, 5)]))
            .await
            .unwrap();
        log.record_checks(&CheckRecord::for_run(
            "r2",
            &[checks::row_count("T", 6, 5), checks::duplicate_keys("T", "Id", 0)],
        ))
        .await
        .unwrap();

        let content = std::fs::read_to_string(log.reconciliation_path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        let first: CheckRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.run_id, "r1");
        assert!(first.result.pass);
        assert!(!log.load_stats_path().exists());
    }
}
