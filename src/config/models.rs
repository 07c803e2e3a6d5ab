use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::messaging::rest::DEFAULT_ENDPOINT;
use crate::messaging::{GcpTokenSource, MessagingError, StaticToken, TokenSource};

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub pubsub: PubSubConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub ingestor: IngestorConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// How requests to the broker are authenticated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PubSubAuth {
    /// Application Default Credentials, refreshed before they expire
    #[default]
    Adc,
    /// No `Authorization` header (emulator)
    None,
}

/// Broker connection settings shared by both processes
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PubSubConfig {
    pub project_id: Option<String>,
    /// Topic the notifier publishes to
    pub topic_id: Option<String>,
    /// Subscription the ingestor pulls from
    pub subscription_id: Option<String>,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub auth: PubSubAuth,
    /// Fixed bearer token for the emulator and tests; never refreshed.
    /// Loaded from environment, not from config file.
    #[serde(skip)]
    pub access_token: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_messages")]
    pub max_messages: u32,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            project_id: None,
            topic_id: None,
            subscription_id: None,
            endpoint: default_endpoint(),
            auth: PubSubAuth::default(),
            access_token: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            max_messages: default_max_messages(),
        }
    }
}

impl PubSubConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// A fixed token wins over `auth`
    pub fn token_source(&self) -> Result<Arc<dyn TokenSource>, MessagingError> {
        if let Some(token) = &self.access_token {
            return Ok(Arc::new(StaticToken::new(Some(token.clone()))));
        }
        match self.auth {
            PubSubAuth::None => Ok(Arc::new(StaticToken::none())),
            PubSubAuth::Adc => Ok(Arc::new(GcpTokenSource::from_env()?)),
        }
    }
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    90
}

fn default_max_messages() -> u32 {
    10
}

/// Notifier HTTP settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotifierConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            max_payload_bytes: default_max_payload_bytes(),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_max_payload_bytes() -> usize {
    1024 * 1024 // 1 MB
}

/// Ingestor worker settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestorConfig {
    #[serde(default = "default_download_root")]
    pub download_root: PathBuf,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Ack deadline requested for deliveries being processed
    #[serde(default = "default_ack_deadline_secs")]
    pub ack_deadline_secs: u64,
    /// Stop extending a delivery's deadline after this long
    #[serde(default = "default_max_lease_secs")]
    pub max_lease_secs: u64,
    /// Delay before pulling again after a retryable stream error
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Delay before pulling again after an empty batch
    #[serde(default = "default_idle_delay_ms")]
    pub idle_delay_ms: u64,
}

impl IngestorConfig {
    pub fn ack_deadline(&self) -> Duration {
        Duration::from_secs(self.ack_deadline_secs)
    }

    pub fn max_lease(&self) -> Duration {
        Duration::from_secs(self.max_lease_secs)
    }
}

impl Default for IngestorConfig {
    fn default() -> Self {
        Self {
            download_root: default_download_root(),
            workers: default_workers(),
            ack_deadline_secs: default_ack_deadline_secs(),
            max_lease_secs: default_max_lease_secs(),
            retry_delay_ms: default_retry_delay_ms(),
            idle_delay_ms: default_idle_delay_ms(),
        }
    }
}

fn default_download_root() -> PathBuf {
    PathBuf::from("data/files")
}

fn default_workers() -> usize {
    4
}

fn default_ack_deadline_secs() -> u64 {
    60
}

fn default_max_lease_secs() -> u64 {
    3600
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_idle_delay_ms() -> u64 {
    250
}

/// Storage provider type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageProvider {
    /// Google Cloud Storage, credentials from the environment
    #[default]
    Gcs,
    /// Buckets are directories under `storage.root`
    Local,
    Memory,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub provider: StorageProvider,
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            provider: StorageProvider::default(),
            root: default_storage_root(),
        }
    }
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("data/buckets")
}
