//! Configuration validation.

use std::collections::HashSet;

use super::{Config, EndpointConfig, LoadType, StorageKind};
use crate::error::{Result, SyncError};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    validate_endpoint("source", &config.source)?;
    validate_endpoint("target", &config.target)?;

    if config.retry.max_attempts == 0 {
        return Err(SyncError::Config(
            "retry.max_attempts must be at least 1".into(),
        ));
    }

    if config.storage.kind == StorageKind::Azure
        && (config.storage.account.is_none() || config.storage.container.is_none())
    {
        return Err(SyncError::Config(
            "storage.account and storage.container are required for azure storage".into(),
        ));
    }

    if let Some(m) = config.notifier.milestones.iter().find(|m| **m == 0 || **m > 100) {
        return Err(SyncError::Config(format!(
            "notifier.milestones must be between 1 and 100, got {}",
            m
        )));
    }

    if config.reconcile.aggregate_tolerance_pct < 0.0 {
        return Err(SyncError::Config(
            "reconcile.aggregate_tolerance_pct must not be negative".into(),
        ));
    }

    let mut seen = HashSet::new();
    for table in &config.tables {
        if table.name.is_empty() {
            return Err(SyncError::Config("tables[].name is required".into()));
        }
        if !seen.insert(table.name.as_str()) {
            return Err(SyncError::Config(format!(
                "table '{}' is listed more than once",
                table.name
            )));
        }
        if table.key_column.is_empty() {
            return Err(SyncError::Config(format!(
                "table '{}': key_column is required",
                table.name
            )));
        }
        if let Some(0) = table.chunk_size {
            return Err(SyncError::Config(format!(
                "table '{}': chunk_size must be at least 1",
                table.name
            )));
        }
        if let Some(0) = table.read_ahead_batches {
            return Err(SyncError::Config(format!(
                "table '{}': read_ahead_batches must be at least 1",
                table.name
            )));
        }
        if table.load_type == LoadType::Delta && table.cursor().is_empty() {
            return Err(SyncError::Config(format!(
                "table '{}': delta load needs a cursor_column",
                table.name
            )));
        }
    }

    Ok(())
}

fn validate_endpoint(section: &str, endpoint: &EndpointConfig) -> Result<()> {
    if endpoint.host.is_empty() {
        return Err(SyncError::Config(format!("{}.host is required", section)));
    }
    if endpoint.database.is_empty() {
        return Err(SyncError::Config(format!(
            "{}.database is required",
            section
        )));
    }
    Ok(())
}
