//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::{Result, SyncError};
use sha2::{Digest, Sha256};
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    ///
    /// `${VAR}` references are replaced with the environment variable's value
    /// before parsing; an unset variable is a configuration error.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let expanded = expand_env(yaml, |name| std::env::var(name).ok())?;
        let config: Config = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Compute a SHA256 hash of the configuration.
    pub fn hash(&self) -> String {
        let yaml = serde_yaml::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Key for watermark integrity signatures.
    ///
    /// Uses `watermark.hmac_key` when set, otherwise a digest of the source and
    /// target identities so that tuning knobs can change without invalidating
    /// existing watermarks.
    pub fn watermark_key(&self) -> Vec<u8> {
        if let Some(key) = &self.watermark.hmac_key {
            return key.as_bytes().to_vec();
        }
        let mut hasher = Sha256::new();
        for part in [
            &self.source.host,
            &self.source.database,
            &self.target.host,
            &self.target.database,
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        hasher.finalize().to_vec()
    }

    /// Tables named in `names`, or all tables when `names` is empty.
    pub fn select_tables(&self, names: &[String]) -> Result<Vec<&TableConfig>> {
        if names.is_empty() {
            return Ok(self.tables.iter().collect());
        }
        names
            .iter()
            .map(|name| {
                self.tables
                    .iter()
                    .find(|t| &t.name == name)
                    .ok_or_else(|| SyncError::Config(format!("unknown table '{}'", name)))
            })
            .collect()
    }
}

/// Replace `${NAME}` references using `lookup`.
fn expand_env<F>(input: &str, lookup: F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| SyncError::Config("unterminated ${ in configuration".into()))?;
        let name = &after[..end];
        let value = lookup(name).ok_or_else(|| {
            SyncError::Config(format!("environment variable '{}' is not set", name))
        })?;
        out.push_str(&value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
