pub mod loader;
pub mod schema;

pub use loader::{
    load_config, load_config_from_str, resolve_secret_key, validate_config, ConfigFormat,
};
pub use schema::{
    Config, DatabaseConfig, LoggingConfig, OAuthClientConfig, OAuthConfig, QuotaConfig,
    SchedulerConfig, SecretsConfig, SendConfig, TransportConfig,
};
