//! The per-account slot registry: attach, verify, toggle and detach identities.

use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use secrecy::SecretString;
use serde::Deserialize;
use uuid::Uuid;

use super::types::{
    ErrorLog, Provider, SlotNumber, SlotPosition, SlotStatus, SlotToggle, SmtpSlot,
    StoredCredentials,
};
use crate::config::QuotaConfig;
use crate::credentials::{CredentialVault, OAuthGrant};
use crate::db::{slot_repo, Database};
use crate::error::{EngineError, Result};
use crate::quota::next_reset_after;
use crate::verify::{ProbeFailure, VerificationService};

static RE_HOSTNAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?)*$")
        .unwrap()
});

/// Settings for a custom SMTP identity.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomSmtpSettings {
    pub email: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub secure: bool,
    pub password: SecretString,
}

fn validate_email(email: &str) -> Result<()> {
    email
        .trim()
        .parse::<lettre::Address>()
        .map(|_| ())
        .map_err(|e| EngineError::Validation(format!("invalid email '{}': {}", email, e)))
}

fn validate_host(host: &str) -> Result<()> {
    if host.len() > 253 || !RE_HOSTNAME.is_match(host) {
        return Err(EngineError::Validation(format!(
            "invalid SMTP host '{}'",
            host
        )));
    }
    Ok(())
}

pub struct SlotManager {
    db: Database,
    vault: Arc<CredentialVault>,
    verifier: Arc<VerificationService>,
    limits: QuotaConfig,
}

impl SlotManager {
    pub fn new(
        db: Database,
        vault: Arc<CredentialVault>,
        verifier: Arc<VerificationService>,
        limits: QuotaConfig,
    ) -> Self {
        Self {
            db,
            vault,
            verifier,
            limits,
        }
    }

    fn require_slot(&self, account_id: &str, slot_number: u8) -> Result<SmtpSlot> {
        let number = SlotNumber::new(slot_number)?;
        slot_repo::find_by_position(&self.db, account_id, number)?.ok_or(EngineError::SlotNotFound)
    }

    fn reload(&self, id: &str) -> Result<SmtpSlot> {
        slot_repo::find_by_id(&self.db, id)?.ok_or(EngineError::SlotNotFound)
    }

    fn new_slot(
        &self,
        account_id: &str,
        number: SlotNumber,
        provider: Provider,
        email: &str,
        credentials: StoredCredentials,
        verified: bool,
        now: DateTime<Utc>,
    ) -> SmtpSlot {
        SmtpSlot {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            slot_number: number,
            provider,
            email: email.trim().to_string(),
            auth_kind: credentials.kind(),
            credentials,
            status: if verified {
                SlotStatus::Active
            } else {
                SlotStatus::Inactive
            },
            is_verified: verified,
            daily_limit: self.limits.daily_limit(provider),
            emails_sent_today: 0,
            quota_reserved: 0,
            quota_reset_at: next_reset_after(now),
            error_log: None,
            signature: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn insert(&self, slot: SmtpSlot) -> Result<SmtpSlot> {
        if !slot_repo::insert_if_vacant(&self.db, &slot)? {
            return Err(EngineError::SlotOccupied {
                slot_number: slot.slot_number.get(),
            });
        }
        tracing::info!(
            account_id = %slot.account_id,
            slot_number = %slot.slot_number,
            provider = %slot.provider,
            "Slot attached"
        );
        Ok(slot)
    }

    /// Attaches an OAuth identity. The completed grant counts as verification.
    pub fn add_oauth_slot(
        &self,
        account_id: &str,
        slot_number: u8,
        provider: Provider,
        email: &str,
        grant: &OAuthGrant,
    ) -> Result<SmtpSlot> {
        let number = SlotNumber::new(slot_number)?;
        if !provider.supports_oauth() {
            return Err(EngineError::Validation(format!(
                "provider '{}' cannot be attached through OAuth",
                provider
            )));
        }
        validate_email(email)?;

        let now = Utc::now();
        let credentials = self.vault.seal_grant(grant, now)?;
        self.insert(self.new_slot(account_id, number, provider, email, credentials, true, now))
    }

    /// Attaches a custom SMTP identity. It starts inactive until verified.
    pub fn add_custom_slot(
        &self,
        account_id: &str,
        slot_number: u8,
        settings: &CustomSmtpSettings,
    ) -> Result<SmtpSlot> {
        let number = SlotNumber::new(slot_number)?;
        validate_email(&settings.email)?;
        validate_host(&settings.host)?;
        if settings.port == 0 {
            return Err(EngineError::Validation("SMTP port must not be 0".to_string()));
        }

        let credentials = self.vault.seal_password(
            &settings.host,
            settings.port,
            settings.secure,
            &settings.password,
        )?;
        let slot = self.new_slot(
            account_id,
            number,
            Provider::Custom,
            &settings.email,
            credentials,
            false,
            Utc::now(),
        );
        self.insert(slot)
    }

    /// Removes the slot and its credentials. Deleting an empty position is a no-op.
    pub fn delete_slot(&self, account_id: &str, slot_number: u8) -> Result<()> {
        let number = SlotNumber::new(slot_number)?;
        let existing = slot_repo::find_by_position(&self.db, account_id, number)?;
        if slot_repo::delete_by_position(&self.db, account_id, number)? {
            if let Some(slot) = existing {
                self.vault.forget(&slot.id);
            }
            tracing::info!(account_id, slot_number, "Slot deleted");
        }
        Ok(())
    }

    /// Probes the slot. Success leaves it active and verified; failure leaves
    /// it unverified with the diagnostic recorded, and returns the failure.
    pub async fn verify_slot(&self, account_id: &str, slot_number: u8) -> Result<SmtpSlot> {
        let slot = self.require_slot(account_id, slot_number)?;
        let verdict = self.verifier.probe(&slot).await?;
        let now = Utc::now();

        match verdict {
            Ok(()) => {
                slot_repo::mark_verified(&self.db, &slot.id, now)?;
                self.reload(&slot.id)
            }
            Err(failure) => {
                let status = match failure {
                    ProbeFailure::ReauthRequired(_) => SlotStatus::NeedsReauth,
                    _ => SlotStatus::Error,
                };
                slot_repo::mark_failed(&self.db, &slot.id, status, &failure.to_string(), now)?;
                Err(failure.into())
            }
        }
    }

    /// Activates or deactivates a slot. Activation requires a verified slot;
    /// the check and the write happen in one statement.
    pub fn set_status(
        &self,
        account_id: &str,
        slot_number: u8,
        toggle: SlotToggle,
    ) -> Result<SmtpSlot> {
        let slot = self.require_slot(account_id, slot_number)?;
        let now = Utc::now();
        if !slot_repo::set_status_checked(&self.db, &slot.id, toggle.into(), now)? {
            // Distinguish a concurrent delete from the verification guard.
            return match slot_repo::find_by_id(&self.db, &slot.id)? {
                Some(_) => Err(EngineError::NotVerified),
                None => Err(EngineError::SlotNotFound),
            };
        }
        self.reload(&slot.id)
    }

    pub fn update_signature(
        &self,
        account_id: &str,
        slot_number: u8,
        signature: &str,
    ) -> Result<SmtpSlot> {
        self.write_signature(account_id, slot_number, Some(signature))
    }

    pub fn delete_signature(&self, account_id: &str, slot_number: u8) -> Result<SmtpSlot> {
        self.write_signature(account_id, slot_number, None)
    }

    fn write_signature(
        &self,
        account_id: &str,
        slot_number: u8,
        signature: Option<&str>,
    ) -> Result<SmtpSlot> {
        let slot = self.require_slot(account_id, slot_number)?;
        if !slot_repo::update_signature(&self.db, &slot.id, signature, Utc::now())? {
            let current = self.reload(&slot.id)?;
            return Err(if !current.is_verified {
                EngineError::NotVerified
            } else {
                EngineError::SlotUnavailable {
                    reason: format!("slot is {}", current.status),
                }
            });
        }
        self.reload(&slot.id)
    }

    pub fn get_slot(&self, account_id: &str, slot_number: u8) -> Result<Option<SmtpSlot>> {
        let number = SlotNumber::new(slot_number)?;
        Ok(slot_repo::find_by_position(&self.db, account_id, number)?)
    }

    /// All five positions, empty ones included.
    pub fn list_slots(&self, account_id: &str) -> Result<Vec<SlotPosition>> {
        let mut occupied = slot_repo::list_by_account(&self.db, account_id)?;
        Ok(SlotNumber::all()
            .map(|n| {
                let idx = occupied.iter().position(|s| s.slot_number == n);
                SlotPosition {
                    slot_number: n,
                    slot: idx.map(|i| occupied.swap_remove(i)),
                }
            })
            .collect())
    }

    /// Replaces the tokens of an OAuth slot after the user re-consented.
    pub fn reconnect_oauth_slot(
        &self,
        account_id: &str,
        slot_number: u8,
        grant: &OAuthGrant,
    ) -> Result<SmtpSlot> {
        let slot = self.require_slot(account_id, slot_number)?;
        if !matches!(slot.credentials, StoredCredentials::OAuth { .. }) {
            return Err(EngineError::Validation(
                "slot does not use OAuth".to_string(),
            ));
        }
        let now = Utc::now();
        let credentials = self.vault.seal_grant(grant, now)?;
        if !slot_repo::replace_credentials(
            &self.db,
            &slot.id,
            &credentials,
            SlotStatus::Active,
            true,
            now,
        )? {
            return Err(EngineError::SlotNotFound);
        }
        tracing::info!(slot_id = %slot.id, "OAuth slot reconnected");
        self.reload(&slot.id)
    }

    /// Replaces a custom slot's password. The slot must be verified again.
    pub fn update_custom_password(
        &self,
        account_id: &str,
        slot_number: u8,
        password: &SecretString,
    ) -> Result<SmtpSlot> {
        let slot = self.require_slot(account_id, slot_number)?;
        let StoredCredentials::Password {
            host, port, secure, ..
        } = &slot.credentials
        else {
            return Err(EngineError::Validation(
                "slot does not use password authentication".to_string(),
            ));
        };
        let credentials = self.vault.seal_password(host, *port, *secure, password)?;
        if !slot_repo::replace_credentials(
            &self.db,
            &slot.id,
            &credentials,
            SlotStatus::Inactive,
            false,
            Utc::now(),
        )? {
            return Err(EngineError::SlotNotFound);
        }
        self.reload(&slot.id)
    }

    /// Working credentials were rejected: unverify and flag for re-authentication.
    pub fn mark_needs_reauth(&self, slot_id: &str, message: &str) -> Result<()> {
        slot_repo::mark_failed(
            &self.db,
            slot_id,
            SlotStatus::NeedsReauth,
            message,
            Utc::now(),
        )?;
        tracing::warn!(slot_id, reason = message, "Slot needs re-authentication");
        Ok(())
    }

    pub fn record_error(&self, slot_id: &str, message: &str) -> Result<()> {
        Ok(slot_repo::record_error(&self.db, slot_id, message, Utc::now())?)
    }

    pub fn clear_error(&self, slot_id: &str) -> Result<()> {
        Ok(slot_repo::clear_error(&self.db, slot_id, Utc::now())?)
    }

    pub fn error_log(&self, account_id: &str, slot_number: u8) -> Result<Option<ErrorLog>> {
        Ok(self.require_slot(account_id, slot_number)?.error_log)
    }
}
