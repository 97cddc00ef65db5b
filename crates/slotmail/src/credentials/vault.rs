//! Credential storage and on-demand OAuth refresh.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use tracing::Instrument;

use super::oauth::{RefreshError, TokenRefresher};
use crate::db::{slot_repo, Database};
use crate::error::{EngineError, Result};
use crate::secrets::SecretCipher;
use crate::slots::types::{SmtpSlot, StoredCredentials};
use crate::transport::{AuthMechanism, TransportCredential};

/// A completed OAuth authorization handed over by the consent flow.
#[derive(Debug, Clone)]
pub struct OAuthGrant {
    pub access_token: SecretString,
    pub refresh_token: SecretString,
    /// Access token lifetime in seconds.
    pub expires_in: u64,
}

/// Seals secrets at rest and turns stored credentials into usable ones.
pub struct CredentialVault {
    db: Database,
    cipher: SecretCipher,
    refresher: Arc<dyn TokenRefresher>,
    refresh_margin: Duration,
    refresh_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CredentialVault {
    pub fn new(
        db: Database,
        cipher: SecretCipher,
        refresher: Arc<dyn TokenRefresher>,
        refresh_margin: Duration,
    ) -> Self {
        Self {
            db,
            cipher,
            refresher,
            refresh_margin,
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn encrypt(&self, secret: &SecretString) -> Result<String> {
        Ok(self.cipher.encrypt(secret.expose_secret())?)
    }

    pub fn decrypt(&self, sealed: &str) -> Result<SecretString> {
        Ok(self.cipher.decrypt(sealed)?)
    }

    /// Seals an OAuth grant for storage.
    pub fn seal_grant(&self, grant: &OAuthGrant, now: DateTime<Utc>) -> Result<StoredCredentials> {
        if grant.refresh_token.expose_secret().trim().is_empty() {
            return Err(EngineError::Validation(
                "OAuth grant carries no refresh token".to_string(),
            ));
        }
        Ok(StoredCredentials::OAuth {
            access_token: self.encrypt(&grant.access_token)?,
            refresh_token: self.encrypt(&grant.refresh_token)?,
            expires_at: expiry_from(now, grant.expires_in),
        })
    }

    /// Seals custom SMTP settings for storage.
    pub fn seal_password(
        &self,
        host: &str,
        port: u16,
        secure: bool,
        password: &SecretString,
    ) -> Result<StoredCredentials> {
        Ok(StoredCredentials::Password {
            host: host.to_string(),
            port,
            secure,
            password: self.encrypt(password)?,
        })
    }

    /// Produces a credential the transport can authenticate with right now.
    pub async fn transport_credential(&self, slot: &SmtpSlot) -> Result<TransportCredential> {
        match &slot.credentials {
            StoredCredentials::OAuth { .. } => {
                let (host, port, implicit_tls) =
                    slot.provider.oauth_smtp_endpoint().ok_or_else(|| {
                        EngineError::Validation(format!(
                            "provider '{}' has no OAuth SMTP endpoint",
                            slot.provider
                        ))
                    })?;
                Ok(TransportCredential {
                    host: host.to_string(),
                    port,
                    implicit_tls,
                    username: slot.email.clone(),
                    secret: self.usable_access_token(slot).await?,
                    mechanism: AuthMechanism::XOAuth2,
                })
            }
            StoredCredentials::Password {
                host,
                port,
                secure,
                password,
            } => Ok(TransportCredential {
                host: host.clone(),
                port: *port,
                implicit_tls: *secure,
                username: slot.email.clone(),
                secret: self.decrypt(password)?,
                mechanism: AuthMechanism::Password,
            }),
        }
    }

    /// Returns the slot's access token, refreshing it first when it expires
    /// within the safety margin. Concurrent callers for one slot share a
    /// single refresh.
    pub async fn usable_access_token(&self, slot: &SmtpSlot) -> Result<SecretString> {
        if let Some(token) = self.fresh_access_token(slot, Utc::now())? {
            return Ok(token);
        }

        let lock = self.refresh_lock(&slot.id)?;
        let _guard = lock.lock().await;

        // Another caller may have refreshed while we waited.
        let current = slot_repo::find_by_id(&self.db, &slot.id)?.ok_or(EngineError::SlotNotFound)?;
        if let Some(token) = self.fresh_access_token(&current, Utc::now())? {
            tracing::debug!(slot_id = %slot.id, "Using token refreshed by a concurrent caller");
            return Ok(token);
        }

        let span = tracing::info_span!("token_refresh", slot_id = %slot.id, provider = %slot.provider);
        self.refresh(&current).instrument(span).await
    }

    fn fresh_access_token(
        &self,
        slot: &SmtpSlot,
        now: DateTime<Utc>,
    ) -> Result<Option<SecretString>> {
        match &slot.credentials {
            StoredCredentials::OAuth {
                access_token,
                expires_at,
                ..
            } => {
                if *expires_at > now + self.refresh_margin {
                    Ok(Some(self.decrypt(access_token)?))
                } else {
                    Ok(None)
                }
            }
            StoredCredentials::Password { .. } => Err(EngineError::Validation(
                "slot does not use OAuth".to_string(),
            )),
        }
    }

    async fn refresh(&self, slot: &SmtpSlot) -> Result<SecretString> {
        let StoredCredentials::OAuth { refresh_token, .. } = &slot.credentials else {
            return Err(EngineError::Validation(
                "slot does not use OAuth".to_string(),
            ));
        };
        let sealed_refresh = refresh_token.clone();
        let refresh_token = self.decrypt(&sealed_refresh)?;

        let refreshed = match self.refresher.refresh(slot.provider, &refresh_token).await {
            Ok(t) => t,
            Err(RefreshError::Rejected(msg)) => {
                tracing::warn!(reason = %msg, "Refresh token rejected");
                return Err(EngineError::ReauthRequired(msg));
            }
            Err(RefreshError::Unavailable(msg)) => {
                tracing::warn!(reason = %msg, "Token endpoint unavailable");
                return Err(EngineError::TransientTransportError(msg));
            }
            Err(e @ RefreshError::NotConfigured(_)) => {
                return Err(EngineError::AuthFailed(e.to_string()));
            }
        };

        let now = Utc::now();
        let expires_at = expiry_from(now, refreshed.expires_in);
        let access_sealed = self.encrypt(&refreshed.access_token)?;
        let refresh_sealed = match &refreshed.refresh_token {
            Some(rotated) => self.encrypt(rotated)?,
            None => sealed_refresh,
        };
        slot_repo::update_oauth_tokens(
            &self.db,
            &slot.id,
            &access_sealed,
            &refresh_sealed,
            expires_at,
            now,
        )?;

        tracing::info!(%expires_at, "Access token refreshed and stored");
        Ok(refreshed.access_token)
    }

    fn refresh_lock(&self, slot_id: &str) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .refresh_locks
            .lock()
            .map_err(|_| EngineError::Database(crate::db::DatabaseError::LockPoisoned))?;
        Ok(locks
            .entry(slot_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone())
    }

    /// Drops per-slot refresh state after a slot is deleted.
    pub fn forget(&self, slot_id: &str) {
        if let Ok(mut locks) = self.refresh_locks.lock() {
            locks.remove(slot_id);
        }
    }
}

fn expiry_from(now: DateTime<Utc>, expires_in: u64) -> DateTime<Utc> {
    now + Duration::seconds(expires_in.min(365 * 24 * 3600) as i64)
}
