//! Bearer tokens for the Pub/Sub REST API
//!
//! Production uses Application Default Credentials through the same
//! credential chain the GCS store uses; tokens are cached and refreshed
//! before they expire. The emulator needs no token at all.

use async_trait::async_trait;
use object_store::CredentialProvider;
use object_store::gcp::{GcpCredentialProvider, GoogleCloudStorageBuilder};

use super::{MessagingError, Result};

/// Supplies the bearer token for each request
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// `None` sends the request without an `Authorization` header
    async fn token(&self) -> Result<Option<String>>;
}

/// Fixed token, or no token at all (emulator)
#[derive(Debug, Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: Option<String>) -> Self {
        Self(token)
    }

    pub fn none() -> Self {
        Self(None)
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self) -> Result<Option<String>> {
        Ok(self.0.clone())
    }
}

/// Application Default Credentials with cached, refreshing tokens
///
/// Lookup order: `GOOGLE_SERVICE_ACCOUNT` / `GOOGLE_APPLICATION_CREDENTIALS`,
/// the gcloud ADC file, then the metadata server.
#[derive(Debug, Clone)]
pub struct GcpTokenSource {
    provider: GcpCredentialProvider,
}

impl GcpTokenSource {
    pub fn from_env() -> Result<Self> {
        // The bucket name is required by the builder but never contacted
        let store = GoogleCloudStorageBuilder::from_env()
            .with_bucket_name("docrelay-credentials")
            .build()
            .map_err(|e| MessagingError::Auth(e.to_string()))?;

        Ok(Self {
            provider: store.credentials().clone(),
        })
    }
}

#[async_trait]
impl TokenSource for GcpTokenSource {
    async fn token(&self) -> Result<Option<String>> {
        let credential = self
            .provider
            .get_credential()
            .await
            .map_err(|e| MessagingError::Auth(e.to_string()))?;
        Ok(Some(credential.bearer.clone()))
    }
}
