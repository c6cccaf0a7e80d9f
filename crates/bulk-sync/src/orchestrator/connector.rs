//! Connection factories handed to the orchestrator.
//!
//! Ranges never share a connection: each attempt asks the connector for a
//! fresh source and target, and drops them when the attempt ends.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{Config, EndpointConfig};
use crate::core::{Connector, SourceReader, TargetWriter};
use crate::credentials::{provider_for, token_for, CredentialProvider};
use crate::error::Result;
use crate::source::{MemorySource, MssqlConnection};
use crate::target::{MemoryTarget, SynapseTarget};

/// Opens tiberius connections to the configured source and Synapse target.
pub struct MssqlConnector {
    source: EndpointConfig,
    target: EndpointConfig,
    source_credential: Option<Arc<dyn CredentialProvider>>,
    target_credential: Option<Arc<dyn CredentialProvider>>,
}

impl MssqlConnector {
    pub fn new(source: EndpointConfig, target: EndpointConfig) -> Self {
        let source_credential = provider_for(&source);
        let target_credential = provider_for(&target);
        Self {
            source,
            target,
            source_credential,
            target_credential,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.source.clone(), config.target.clone())
    }

    /// Credential provider for the target endpoint, shared with the SQL watermark store.
    pub fn target_credential(&self) -> Option<Arc<dyn CredentialProvider>> {
        self.target_credential.clone()
    }
}

impl std::fmt::Debug for MssqlConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MssqlConnector")
            .field("source", &self.source)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Connector for MssqlConnector {
    async fn source(&self) -> Result<Box<dyn SourceReader>> {
        let token = token_for(self.source_credential.as_ref()).await?;
        let conn = MssqlConnection::connect(&self.source, token.as_deref()).await?;
        Ok(Box::new(conn))
    }

    async fn target(&self) -> Result<Box<dyn TargetWriter>> {
        let token = token_for(self.target_credential.as_ref()).await?;
        let conn = MssqlConnection::connect(&self.target, token.as_deref()).await?;
        Ok(Box::new(SynapseTarget::new(conn)))
    }
}

/// In-process source and target for tests and dry runs.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    source: MemorySource,
    target: MemoryTarget,
}

impl MemoryConnector {
    pub fn new(source: MemorySource, target: MemoryTarget) -> Self {
        Self { source, target }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn source(&self) -> Result<Box<dyn SourceReader>> {
        Ok(Box::new(self.source.connect()))
    }

    async fn target(&self) -> Result<Box<dyn TargetWriter>> {
        Ok(Box::new(self.target.connect()))
    }
}
