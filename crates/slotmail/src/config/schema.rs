use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::secrets::SECRET_KEY_ENV_VAR;
use crate::slots::types::Provider;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub send: SendConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    /// Database file. Defaults to `~/.slotmail/data/slotmail.db`.
    #[serde(default)]
    pub path: Option<String>,
}

impl DatabaseConfig {
    pub fn resolved_path(&self) -> Option<PathBuf> {
        match self.path.as_deref().filter(|p| !p.is_empty()) {
            Some(p) if p == "~" || p.starts_with("~/") => dirs::home_dir()
                .map(|home| home.join(p.trim_start_matches('~').trim_start_matches('/'))),
            Some(p) => Some(PathBuf::from(p)),
            None => crate::db::default_database_path(),
        }
    }
}

/// Where the credential encryption key comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretsConfig {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub key_file: Option<String>,
    #[serde(default = "default_key_env_var")]
    pub key_env_var: Option<String>,
}

fn default_key_env_var() -> Option<String> {
    Some(SECRET_KEY_ENV_VAR.to_string())
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            key: None,
            key_file: None,
            key_env_var: default_key_env_var(),
        }
    }
}

/// OAuth client registration for one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthClientConfig {
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub client_secret_file: Option<String>,
    #[serde(default)]
    pub client_secret_env_var: Option<String>,
    /// Overrides the provider's token endpoint.
    #[serde(default)]
    pub token_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthConfig {
    /// Access tokens expiring within this window are refreshed before use.
    #[serde(default = "default_refresh_margin")]
    pub refresh_margin_secs: u64,
    #[serde(default = "default_token_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub gmail: Option<OAuthClientConfig>,
    #[serde(default)]
    pub outlook: Option<OAuthClientConfig>,
    #[serde(default)]
    pub yahoo: Option<OAuthClientConfig>,
}

fn default_refresh_margin() -> u64 {
    60
}

fn default_token_timeout() -> u64 {
    30
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            refresh_margin_secs: default_refresh_margin(),
            request_timeout_secs: default_token_timeout(),
            gmail: None,
            outlook: None,
            yahoo: None,
        }
    }
}

impl OAuthConfig {
    pub fn client(&self, provider: Provider) -> Option<&OAuthClientConfig> {
        match provider {
            Provider::Gmail => self.gmail.as_ref(),
            Provider::Outlook => self.outlook.as_ref(),
            Provider::Yahoo => self.yahoo.as_ref(),
            Provider::Custom => None,
        }
    }

    pub fn refresh_margin(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.refresh_margin_secs.min(24 * 3600) as i64)
    }
}

/// Default daily limits applied to new slots.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaConfig {
    #[serde(default = "default_gmail_limit")]
    pub gmail: u32,
    #[serde(default = "default_outlook_limit")]
    pub outlook: u32,
    #[serde(default = "default_yahoo_limit")]
    pub yahoo: u32,
    #[serde(default = "default_custom_limit")]
    pub custom: u32,
}

fn default_gmail_limit() -> u32 {
    500
}

fn default_outlook_limit() -> u32 {
    300
}

fn default_yahoo_limit() -> u32 {
    500
}

fn default_custom_limit() -> u32 {
    200
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            gmail: default_gmail_limit(),
            outlook: default_outlook_limit(),
            yahoo: default_yahoo_limit(),
            custom: default_custom_limit(),
        }
    }
}

impl QuotaConfig {
    pub fn daily_limit(&self, provider: Provider) -> u32 {
        match provider {
            Provider::Gmail => self.gmail,
            Provider::Outlook => self.outlook,
            Provider::Yahoo => self.yahoo,
            Provider::Custom => self.custom,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendConfig {
    #[serde(default = "default_max_recipients")]
    pub max_recipients: usize,
    #[serde(default = "default_max_attachments")]
    pub max_attachments: usize,
    /// Total attachment bytes per message.
    #[serde(default = "default_max_attachment_bytes")]
    pub max_attachment_bytes: usize,
}

fn default_max_recipients() -> usize {
    100
}

fn default_max_attachments() -> usize {
    10
}

fn default_max_attachment_bytes() -> usize {
    25 * 1024 * 1024
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            max_recipients: default_max_recipients(),
            max_attachments: default_max_attachments(),
            max_attachment_bytes: default_max_attachment_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConfig {
    /// SMTP command timeout.
    #[serde(default = "default_command_timeout")]
    pub timeout_secs: u64,
    /// Upper bound on a verification probe.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    /// Name sent in EHLO. Defaults to the local hostname.
    #[serde(default)]
    pub helo_name: Option<String>,
}

fn default_command_timeout() -> u64 {
    30
}

fn default_probe_timeout() -> u64 {
    20
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_command_timeout(),
            probe_timeout_secs: default_probe_timeout(),
            helo_name: None,
        }
    }
}

impl TransportConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Maximum due records picked per poll.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before retry N is `backoff_secs[N-1]`; the last entry repeats.
    #[serde(default = "default_backoff")]
    pub backoff_secs: Vec<u64>,
    #[serde(default = "default_dispatch_timeout")]
    pub dispatch_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    30
}

fn default_batch_size() -> u32 {
    50
}

fn default_concurrency() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff() -> Vec<u64> {
    vec![300, 900, 2700]
}

fn default_dispatch_timeout() -> u64 {
    30
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: default_poll_interval(),
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            backoff_secs: default_backoff(),
            dispatch_timeout_secs: default_dispatch_timeout(),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }

    /// Backoff applied after the `attempt`-th failed attempt (1-based).
    pub fn backoff_for(&self, attempt: u32) -> chrono::Duration {
        let idx = (attempt.max(1) - 1) as usize;
        let secs = self
            .backoff_secs
            .get(idx)
            .or(self.backoff_secs.last())
            .copied()
            .unwrap_or(300);
        chrono::Duration::seconds(secs.min(7 * 24 * 3600) as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.quota.daily_limit(Provider::Gmail), 500);
        assert_eq!(config.quota.daily_limit(Provider::Outlook), 300);
        assert_eq!(config.quota.daily_limit(Provider::Custom), 200);
        assert_eq!(config.scheduler.max_attempts, 3);
        assert_eq!(config.scheduler.poll_interval(), Duration::from_secs(30));
        assert_eq!(
            config.secrets.key_env_var.as_deref(),
            Some(SECRET_KEY_ENV_VAR)
        );
    }

    #[test]
    fn test_backoff_schedule() {
        let s = SchedulerConfig::default();
        assert_eq!(s.backoff_for(1), chrono::Duration::minutes(5));
        assert_eq!(s.backoff_for(2), chrono::Duration::minutes(15));
        assert_eq!(s.backoff_for(3), chrono::Duration::minutes(45));
        assert_eq!(s.backoff_for(9), chrono::Duration::minutes(45));
    }

    #[test]
    fn test_database_path_resolution() {
        let explicit = DatabaseConfig {
            path: Some("/var/lib/slotmail/db.sqlite".to_string()),
        };
        assert_eq!(
            explicit.resolved_path().unwrap(),
            PathBuf::from("/var/lib/slotmail/db.sqlite")
        );
        assert!(DatabaseConfig::default()
            .resolved_path()
            .unwrap()
            .ends_with("slotmail.db"));
    }
}
