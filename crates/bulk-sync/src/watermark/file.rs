//! One signed JSON file per table.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{Watermark, WatermarkStore};
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct FileWatermarkStore {
    dir: PathBuf,
    key: Vec<u8>,
}

impl FileWatermarkStore {
    pub fn new(dir: impl Into<PathBuf>, key: impl Into<Vec<u8>>) -> Self {
        Self {
            dir: dir.into(),
            key: key.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, table: &str) -> PathBuf {
        let file: String = table
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.watermark.json", file))
    }
}

#[async_trait]
impl WatermarkStore for FileWatermarkStore {
    async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    async fn load(&self, table: &str) -> Result<Watermark> {
        let path = self.path_for(table);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Watermark::from_signed_json(&content, &self.key),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Watermark::new(table)),
            Err(e) => Err(e.into()),
        }
    }

    /// Write to a temp file, fsync, then rename over the record.
    async fn save(&self, watermark: &Watermark) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&watermark.table);
        let temp_path = path.with_extension("tmp");
        let content = watermark.to_signed_json(&self.key)?;

        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(content.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&temp_path, &path).await?;
        debug!("Saved watermark {}", path.display());
        Ok(())
    }

    async fn clear(&self, table: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(table)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn backend_type(&self) -> &'static str {
        "file"
    }
}
