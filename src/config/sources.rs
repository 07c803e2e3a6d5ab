use super::models::{Config, PubSubAuth};
use config::{ConfigError, Environment, File};
use std::env;
use std::path::PathBuf;

const CONFIG_ENV_VAR: &str = "DOCRELAY_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/docrelay.toml";
const ENV_PREFIX: &str = "DOCRELAY";
const ENV_SEPARATOR: &str = "__";

/// Load configuration from multiple sources with priority:
/// 1. Defaults (embedded in structs)
/// 2. TOML file (if exists)
/// 3. Environment variables from .env file (via dotenvy)
/// 4. System environment variables (highest priority)
/// 5. Deployment variables (`GCLOUD_PROJECT`, ...) fill identifiers still unset
pub fn load(config_path: Option<PathBuf>) -> Result<Config, ConfigError> {
    // Load .env file if it exists (ignore errors if file doesn't exist)
    let _ = dotenvy::dotenv();

    let config_path = config_path
        .or_else(|| env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let mut config = load_from_sources(config_path)?;
    apply_deployment_env(&mut config, |key| env::var(key).ok());

    Ok(config)
}

/// Fill broker identifiers and secrets from the variables the deployment
/// sets. Secrets are never stored in TOML files, only in environment.
pub fn apply_deployment_env<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|value| !value.is_empty());
    let pubsub = &mut config.pubsub;

    if pubsub.project_id.is_none() {
        pubsub.project_id = get("GCLOUD_PROJECT");
    }
    if pubsub.topic_id.is_none() {
        pubsub.topic_id = get("TOPIC_ID");
    }
    if pubsub.subscription_id.is_none() {
        pubsub.subscription_id = get("SUBSCRIPTION_ID");
    }
    if let Some(token) = get("PUBSUB_ACCESS_TOKEN") {
        pubsub.access_token = Some(token);
    }
    // Emulator overrides the endpoint and needs no credentials
    if let Some(host) = get("PUBSUB_EMULATOR_HOST") {
        pubsub.endpoint = format!("http://{host}");
        pubsub.auth = PubSubAuth::None;
        pubsub.access_token = None;
    }

    if let Some(path) = get("DOWNLOAD_PATH") {
        config.ingestor.download_root = PathBuf::from(path);
    }
}

/// Load configuration from a specific path and environment
/// Useful for testing with custom config files
pub fn load_from_sources(config_path: PathBuf) -> Result<Config, ConfigError> {
    let mut builder = config::Config::builder();

    if config_path.exists() {
        tracing::info!("Loading configuration from: {}", config_path.display());
        builder = builder.add_source(File::from(config_path).required(false));
    } else {
        tracing::warn!(
            "Configuration file not found at {}, using defaults and environment overrides",
            config_path.display()
        );
    }

    // DOCRELAY__PUBSUB__PROJECT_ID -> pubsub.project_id
    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator(ENV_SEPARATOR)
            .try_parsing(true),
    );

    let config = builder.build()?;
    config.try_deserialize()
}
