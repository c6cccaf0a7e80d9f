//! Bearer tokens for Azure AD authenticated endpoints.
//!
//! Tokens are cached per provider and refreshed shortly before expiry, so
//! a multi-hour run never hands an expired token to a fresh connection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::{AuthConfig, EndpointConfig};
use crate::error::{Result, SyncError};

/// Refresh a cached token once it is this close to expiring.
pub const REFRESH_MARGIN_SECS: i64 = 300;

/// OAuth2 scope for Azure SQL / Synapse.
pub const DATABASE_SCOPE: &str = "https://database.windows.net/.default";

const AUTHORITY: &str = "https://login.microsoftonline.com";
const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A token and the instant it stops being valid.
#[derive(Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl AccessToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - now > chrono::Duration::seconds(REFRESH_MARGIN_SECS)
    }
}

/// Yields a currently valid bearer token.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn token(&self) -> Result<String>;
}

/// Acquires a new token from an identity endpoint.
#[async_trait]
pub trait TokenFetcher: Send + Sync {
    async fn fetch(&self) -> Result<AccessToken>;
}

/// A token supplied up front (config or environment). Never refreshed.
pub struct StaticCredential {
    token: String,
}

impl StaticCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredential {
    async fn token(&self) -> Result<String> {
        if self.token.is_empty() {
            return Err(SyncError::Credential("static token is empty".into()));
        }
        Ok(self.token.clone())
    }
}

/// Wraps a fetcher with expiry-aware caching.
pub struct CachedCredential<F> {
    fetcher: F,
    cached: Mutex<Option<AccessToken>>,
}

impl<F: TokenFetcher> CachedCredential<F> {
    pub fn new(fetcher: F) -> Self {
        Self {
            fetcher,
            cached: Mutex::new(None),
        }
    }
}

#[async_trait]
impl<F: TokenFetcher> CredentialProvider for CachedCredential<F> {
    async fn token(&self) -> Result<String> {
        // Held across the fetch so concurrent callers wait for one refresh.
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.is_fresh(Utc::now()) {
                return Ok(token.token.clone());
            }
            debug!("Cached token expires at {}, refreshing", token.expires_at);
        }

        let fresh = self.fetcher.fetch().await?;
        let token = fresh.token.clone();
        *cached = Some(fresh);
        Ok(token)
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

/// OAuth2 client-credentials flow against Azure AD.
pub struct ClientSecretCredential {
    tenant_id: String,
    client_id: String,
    client_secret: String,
    scope: String,
    authority: String,
    http: reqwest::Client,
}

impl ClientSecretCredential {
    pub fn new(
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            scope: DATABASE_SCOPE.to_string(),
            authority: AUTHORITY.to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// Override the identity endpoint (sovereign clouds, tests).
    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = authority.into().trim_end_matches('/').to_string();
        self
    }

    fn token_url(&self) -> String {
        format!("{}/{}/oauth2/v2.0/token", self.authority, self.tenant_id)
    }
}

#[async_trait]
impl TokenFetcher for ClientSecretCredential {
    async fn fetch(&self) -> Result<AccessToken> {
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", self.scope.as_str()),
        ];

        let response = self
            .http
            .post(self.token_url())
            .form(&form)
            .timeout(TOKEN_REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| SyncError::Credential(format!("token request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::Credential(format!(
                "token endpoint returned {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| SyncError::Credential(format!("malformed token response: {}", e)))?;

        let expires_at = Utc::now() + chrono::Duration::seconds(body.expires_in);
        info!(
            "Acquired access token for client {}, expires {}",
            self.client_id, expires_at
        );
        Ok(AccessToken {
            token: body.access_token,
            expires_at,
        })
    }
}

/// Provider for an endpoint's auth method. SQL authentication needs none.
pub fn provider_for(endpoint: &EndpointConfig) -> Option<Arc<dyn CredentialProvider>> {
    match &endpoint.auth {
        AuthConfig::Sql { .. } => None,
        AuthConfig::AadToken { token } => Some(Arc::new(StaticCredential::new(token.clone()))),
        AuthConfig::ServicePrincipal {
            tenant_id,
            client_id,
            client_secret,
        } => Some(Arc::new(CachedCredential::new(ClientSecretCredential::new(
            tenant_id.clone(),
            client_id.clone(),
            client_secret.clone(),
        )))),
    }
}

/// Resolve the token to connect with, if the endpoint needs one.
pub async fn token_for(provider: Option<&Arc<dyn CredentialProvider>>) -> Result<Option<String>> {
    match provider {
        Some(p) => Ok(Some(p.token().await?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFetcher {
        calls: AtomicUsize,
        lifetime: chrono::Duration,
    }

    #[async_trait]
    impl TokenFetcher for CountingFetcher {
        async fn fetch(&self) -> Result<AccessToken> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AccessToken {
                token: format!("token-{}", n),
                expires_at: Utc::now() + self.lifetime,
            })
        }
    }

    #[tokio::test]
    async fn test_cached_token_is_reused_until_near_expiry() {
        let cred = CachedCredential::new(CountingFetcher {
            calls: AtomicUsize::new(0),
            lifetime: chrono::Duration::hours(1),
        });
        assert_eq!(cred.token().await.unwrap(), "token-0");
        assert_eq!(cred.token().await.unwrap(), "token-0");
        assert_eq!(cred.fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_token_inside_refresh_margin_is_refetched() {
        let cred = CachedCredential::new(CountingFetcher {
            calls: AtomicUsize::new(0),
            lifetime: chrono::Duration::minutes(4),
        });
        assert_eq!(cred.token().await.unwrap(), "token-0");
        assert_eq!(cred.token().await.unwrap(), "token-1");
    }

    #[tokio::test]
    async fn test_provider_for_auth_methods() {
        let mut endpoint = EndpointConfig {
            host: "h".into(),
            port: 1433,
            database: "d".into(),
            schema: "dbo".into(),
            auth: AuthConfig::Sql {
                user: "u".into(),
                password: "p".into(),
            },
            encrypt: true,
            trust_server_cert: false,
        };
        assert!(provider_for(&endpoint).is_none());

        endpoint.auth = AuthConfig::AadToken {
            token: "abc".into(),
        };
        let provider = provider_for(&endpoint).unwrap();
        assert_eq!(token_for(Some(&provider)).await.unwrap().as_deref(), Some("abc"));
    }

    #[test]
    fn test_token_url() {
        let cred = ClientSecretCredential::new("tenant", "client", "secret")
            .with_authority("https://login.example/");
        assert_eq!(cred.token_url(), "https://login.example/tenant/oauth2/v2.0/token");
    }
}
