//! Configuration management for docrelay
//!
//! This module provides a layered configuration system that loads settings from:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. Environment variables (highest priority)
//!
//! # Environment Variables
//!
//! Configuration can be overridden using environment variables with the pattern:
//! `DOCRELAY__<section>__<key>`
//!
//! Examples:
//! - `DOCRELAY__NOTIFIER__BIND_ADDR=0.0.0.0:9000`
//! - `DOCRELAY__INGESTOR__WORKERS=16`
//! - `DOCRELAY__STORAGE__PROVIDER=local`
//!
//! The deployment variables `GCLOUD_PROJECT`, `TOPIC_ID`, `SUBSCRIPTION_ID`,
//! `DOWNLOAD_PATH`, `PUBSUB_ACCESS_TOKEN` and `PUBSUB_EMULATOR_HOST` are
//! honored as well. Broker requests use Application Default Credentials
//! unless `pubsub.auth = "none"` or the emulator is configured.
//!
//! # Configuration File
//!
//! By default, the configuration is loaded from `config/docrelay.toml`.
//! This can be overridden using the `DOCRELAY_CONFIG` environment variable
//! or the `--config` flag.

mod models;
mod sources;
mod validation;

pub use models::{
    Config, IngestorConfig, NotifierConfig, PubSubAuth, PubSubConfig, StorageConfig,
    StorageProvider,
};
pub use sources::apply_deployment_env;
pub use validation::ValidationError;

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),
}

impl Config {
    /// Load configuration from all sources (file + environment).
    ///
    /// No validation happens here: each process checks the settings it
    /// needs with [`Config::validate_notifier`] or [`Config::validate_ingestor`].
    pub fn load(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        Ok(sources::load(path)?)
    }

    /// Load configuration from a specific path, without deployment variables
    ///
    /// Useful for testing with custom configuration files.
    pub fn load_from_path(path: PathBuf) -> Result<Self, ConfigError> {
        Ok(sources::load_from_sources(path)?)
    }

    pub fn validate_notifier(&self) -> Result<(), ConfigError> {
        Ok(validation::validate_notifier(self)?)
    }

    pub fn validate_ingestor(&self) -> Result<(), ConfigError> {
        Ok(validation::validate_ingestor(self)?)
    }
}
