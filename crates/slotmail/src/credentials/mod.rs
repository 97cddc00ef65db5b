pub mod oauth;
pub mod vault;

pub use oauth::{
    token_url, HttpTokenRefresher, RefreshError, RefreshedToken, TokenRefresher,
    DEFAULT_TOKEN_LIFETIME_SECS,
};
pub use vault::{CredentialVault, OAuthGrant};
