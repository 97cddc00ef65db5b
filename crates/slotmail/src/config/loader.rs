use std::path::Path;

use secrecy::SecretString;

use crate::config::schema::{Config, OAuthClientConfig, SecretsConfig};
use crate::error::ConfigError;
use crate::secrets::{has_secret_source, resolve_secret};

/// Serialization format of a config document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
}

impl ConfigFormat {
    /// `.json` is JSON; everything else is read as YAML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => ConfigFormat::Json,
            _ => ConfigFormat::Yaml,
        }
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content, ConfigFormat::from_path(path))
}

pub fn load_config_from_str(content: &str, format: ConfigFormat) -> Result<Config, ConfigError> {
    let config: Config = match format {
        ConfigFormat::Json => serde_json::from_str(content)?,
        ConfigFormat::Yaml if content.trim().is_empty() => Config::default(),
        ConfigFormat::Yaml => serde_yaml::from_str(content)?,
    };

    validate_config(&config)?;

    Ok(config)
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        message: message.into(),
    }
}

pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let s = &config.secrets;
    if !has_secret_source(s.key.as_deref(), s.key_file.as_deref(), s.key_env_var.as_deref()) {
        return Err(invalid("secrets: one of key, keyFile or keyEnvVar is required"));
    }

    for (name, client) in [
        ("gmail", &config.oauth.gmail),
        ("outlook", &config.oauth.outlook),
        ("yahoo", &config.oauth.yahoo),
    ] {
        if let Some(client) = client {
            validate_oauth_client(name, client)?;
        }
    }

    let q = &config.quota;
    if [q.gmail, q.outlook, q.yahoo, q.custom].contains(&0) {
        return Err(invalid("quota: daily limits must be greater than zero"));
    }

    if config.send.max_recipients == 0 {
        return Err(invalid("send.maxRecipients must be greater than zero"));
    }

    if config.transport.timeout_secs == 0 || config.transport.probe_timeout_secs == 0 {
        return Err(invalid("transport timeouts must be greater than zero"));
    }

    let sched = &config.scheduler;
    if sched.poll_interval_secs == 0 {
        return Err(invalid("scheduler.pollIntervalSecs must be greater than zero"));
    }
    if sched.batch_size == 0 || sched.concurrency == 0 {
        return Err(invalid(
            "scheduler.batchSize and scheduler.concurrency must be greater than zero",
        ));
    }
    if sched.max_attempts == 0 {
        return Err(invalid("scheduler.maxAttempts must be at least 1"));
    }
    if sched.backoff_secs.is_empty() {
        return Err(invalid("scheduler.backoffSecs must not be empty"));
    }
    if sched.dispatch_timeout_secs == 0 {
        return Err(invalid("scheduler.dispatchTimeoutSecs must be greater than zero"));
    }

    if let Err(e) = tracing_subscriber::EnvFilter::try_new(&config.logging.level) {
        return Err(invalid(format!(
            "logging.level '{}' is not a valid filter: {}",
            config.logging.level, e
        )));
    }

    Ok(())
}

fn validate_oauth_client(name: &str, client: &OAuthClientConfig) -> Result<(), ConfigError> {
    if client.client_id.trim().is_empty() {
        return Err(invalid(format!("oauth.{}.clientId must not be empty", name)));
    }
    if let Some(url) = &client.token_url {
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(invalid(format!(
                "oauth.{}.tokenUrl must be an http(s) URL",
                name
            )));
        }
    }
    Ok(())
}

/// Resolves the credential encryption key from its configured source.
pub fn resolve_secret_key(secrets: &SecretsConfig) -> Result<SecretString, ConfigError> {
    resolve_secret(
        secrets.key.as_deref(),
        secrets.key_file.as_deref(),
        secrets.key_env_var.as_deref(),
    )
    .map_err(|source| ConfigError::Secret {
        name: "secrets.key",
        source,
    })
}
