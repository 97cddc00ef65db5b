//! OAuth2 refresh-token exchange against provider token endpoints.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::config::OAuthConfig;
use crate::error::ConfigError;
use crate::secrets::resolve_secret_optional;
use crate::slots::types::Provider;

/// Maximum length for error bodies echoed into diagnostics.
const MAX_ERROR_BODY_LENGTH: usize = 200;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifetime assumed when the endpoint omits `expires_in`.
pub const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 3600;

/// Token endpoint of a provider.
pub fn token_url(provider: Provider) -> Option<&'static str> {
    match provider {
        Provider::Gmail => Some("https://oauth2.googleapis.com/token"),
        Provider::Outlook => Some("https://login.microsoftonline.com/common/oauth2/v2.0/token"),
        Provider::Yahoo => Some("https://api.login.yahoo.com/oauth2/get_token"),
        Provider::Custom => None,
    }
}

fn sanitize_error_body(body: &str) -> String {
    match body.char_indices().nth(MAX_ERROR_BODY_LENGTH) {
        Some((idx, _)) => format!("{}... (truncated)", &body[..idx]),
        None => body.to_string(),
    }
}

/// Outcome of a successful refresh.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: SecretString,
    /// Present when the provider rotated the refresh token.
    pub refresh_token: Option<SecretString>,
    pub expires_in: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    /// The provider refused the refresh token; the user has to reconnect.
    #[error("Refresh token rejected: {0}")]
    Rejected(String),

    /// The token endpoint could not be reached or failed server-side.
    #[error("Token endpoint unavailable: {0}")]
    Unavailable(String),

    #[error("No OAuth client configured for provider '{0}'")]
    NotConfigured(Provider),
}

/// Exchanges a refresh token for a fresh access token.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(
        &self,
        provider: Provider,
        refresh_token: &SecretString,
    ) -> Result<RefreshedToken, RefreshError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

struct ClientRegistration {
    client_id: String,
    client_secret: Option<SecretString>,
    token_url: String,
}

/// [`TokenRefresher`] over HTTPS using the providers' token endpoints.
pub struct HttpTokenRefresher {
    http: Client,
    registrations: HashMap<Provider, ClientRegistration>,
}

impl HttpTokenRefresher {
    /// Builds the refresher from configuration, resolving client secrets.
    pub fn from_config(config: &OAuthConfig) -> Result<Self, ConfigError> {
        let mut refresher = Self::new(Duration::from_secs(config.request_timeout_secs))?;

        for provider in [Provider::Gmail, Provider::Outlook, Provider::Yahoo] {
            let Some(client) = config.client(provider) else {
                continue;
            };
            let secret = resolve_secret_optional(
                client.client_secret.as_deref(),
                client.client_secret_file.as_deref(),
                client.client_secret_env_var.as_deref(),
            )
            .map_err(|source| ConfigError::Secret {
                name: "oauth.clientSecret",
                source,
            })?;
            let url = client
                .token_url
                .clone()
                .or_else(|| token_url(provider).map(str::to_string))
                .ok_or_else(|| ConfigError::Validation {
                    message: format!("no token endpoint for provider '{}'", provider),
                })?;
            refresher.register(provider, client.client_id.clone(), secret, url);
        }

        Ok(refresher)
    }

    pub fn new(request_timeout: Duration) -> Result<Self, ConfigError> {
        let http = Client::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .timeout(request_timeout)
            .build()
            .map_err(|e| ConfigError::Validation {
                message: format!("Failed to create HTTP client: {}", e),
            })?;
        Ok(Self {
            http,
            registrations: HashMap::new(),
        })
    }

    pub fn register(
        &mut self,
        provider: Provider,
        client_id: String,
        client_secret: Option<SecretString>,
        token_url: String,
    ) {
        self.registrations.insert(
            provider,
            ClientRegistration {
                client_id,
                client_secret,
                token_url,
            },
        );
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(
        &self,
        provider: Provider,
        refresh_token: &SecretString,
    ) -> Result<RefreshedToken, RefreshError> {
        let registration = self
            .registrations
            .get(&provider)
            .ok_or(RefreshError::NotConfigured(provider))?;

        tracing::info!(%provider, "Refreshing access token");

        let mut params = vec![
            ("client_id", registration.client_id.as_str()),
            ("refresh_token", refresh_token.expose_secret()),
            ("grant_type", "refresh_token"),
        ];
        if let Some(secret) = &registration.client_secret {
            params.push(("client_secret", secret.expose_secret()));
        }

        let response = self
            .http
            .post(&registration.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| RefreshError::Unavailable(format!("Token refresh failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_refresh_failure(status, &body));
        }

        let token: TokenResponse = response.json().await.map_err(|e| {
            RefreshError::Unavailable(format!("Failed to parse refresh response: {}", e))
        })?;

        tracing::info!(%provider, "Access token refreshed");
        Ok(RefreshedToken {
            access_token: SecretString::from(token.access_token),
            refresh_token: token.refresh_token.map(SecretString::from),
            expires_in: token.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS),
        })
    }
}

/// Server errors and throttling are retryable; any other refusal means the
/// grant is unusable.
fn classify_refresh_failure(status: StatusCode, body: &str) -> RefreshError {
    let detail = match serde_json::from_str::<TokenErrorResponse>(body) {
        Ok(err) => format!(
            "{} {}",
            err.error,
            err.error_description.unwrap_or_default()
        )
        .trim()
        .to_string(),
        Err(_) => sanitize_error_body(body),
    };
    let message = format!("({}) {}", status, detail);

    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RefreshError::Unavailable(message)
    } else {
        RefreshError::Rejected(message)
    }
}
