//! Immediate sends: slot selection, quota reservation and per-recipient delivery.

pub mod message;

use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::config::SendConfig;
use crate::credentials::CredentialVault;
use crate::db::{slot_repo, Database};
use crate::error::{EngineError, Result};
use crate::quota::{QuotaReservation, QuotaTracker, QuotaUsage};
use crate::slots::types::SmtpSlot;
use crate::slots::SlotManager;
use crate::transport::{MailTransport, TransportError};

pub use message::{Attachment, OutgoingEmail, PreparedMessage};

/// Which slot a send goes out through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotChoice {
    /// A specific slot by id. It must belong to the sending account.
    Explicit(String),
    /// The first dispatchable slot, by slot number, with enough quota.
    Auto,
}

impl From<Option<String>> for SlotChoice {
    fn from(slot_id: Option<String>) -> Self {
        slot_id.map(SlotChoice::Explicit).unwrap_or(SlotChoice::Auto)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipientFailure {
    pub recipient: String,
    pub reason: String,
    pub permanent: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReport {
    /// `None` when no recipient was valid and no slot was needed.
    pub slot_id: Option<String>,
    pub accepted: Vec<String>,
    pub rejected: Vec<RecipientFailure>,
    /// The slot's credentials were rejected mid-batch; it now needs re-authentication.
    pub reauth_required: bool,
}

impl SendReport {
    /// Every rejection is permanent (or there were none).
    pub fn all_permanent(&self) -> bool {
        self.rejected.iter().all(|r| r.permanent)
    }

    /// One line per rejected recipient.
    pub fn rejection_summary(&self) -> Option<String> {
        if self.rejected.is_empty() {
            return None;
        }
        Some(
            self.rejected
                .iter()
                .map(|r| format!("{}: {}", r.recipient, r.reason))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

/// Recipients delivered so far by a send.
///
/// Shared with the caller, so it stays readable after the send future is
/// dropped by a timeout.
#[derive(Debug, Clone, Default)]
pub struct SendProgress {
    delivered: Arc<Mutex<Vec<String>>>,
}

impl SendProgress {
    pub fn delivered(&self) -> Vec<String> {
        self.delivered
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    /// Entries of `recipients` not delivered yet, in order.
    pub fn undelivered<'a>(&self, recipients: &'a [String]) -> Vec<&'a str> {
        let delivered = self.delivered();
        recipients
            .iter()
            .map(|r| r.trim())
            .filter(|r| !delivered.iter().any(|d| d == r))
            .collect()
    }

    pub(crate) fn record(&self, recipient: &str) {
        if let Ok(mut delivered) = self.delivered.lock() {
            delivered.push(recipient.to_string());
        }
    }
}

pub struct SendEngine {
    db: Database,
    slots: Arc<SlotManager>,
    vault: Arc<CredentialVault>,
    transport: Arc<dyn MailTransport>,
    quota: QuotaTracker,
    limits: SendConfig,
}

impl SendEngine {
    pub fn new(
        db: Database,
        slots: Arc<SlotManager>,
        vault: Arc<CredentialVault>,
        transport: Arc<dyn MailTransport>,
        limits: SendConfig,
    ) -> Self {
        Self {
            quota: QuotaTracker::new(db.clone()),
            db,
            slots,
            vault,
            transport,
            limits,
        }
    }

    pub fn quota_usage(&self, slot_id: &str) -> Result<Option<QuotaUsage>> {
        Ok(self.quota.usage(slot_id)?)
    }

    fn validate(&self, message: &OutgoingEmail) -> Result<()> {
        if message.to.is_empty() {
            return Err(EngineError::Validation("no recipients".to_string()));
        }
        if message.to.len() > self.limits.max_recipients {
            return Err(EngineError::Validation(format!(
                "{} recipients exceed the limit of {}",
                message.to.len(),
                self.limits.max_recipients
            )));
        }
        if message.attachments.len() > self.limits.max_attachments {
            return Err(EngineError::Validation(format!(
                "{} attachments exceed the limit of {}",
                message.attachments.len(),
                self.limits.max_attachments
            )));
        }
        let bytes = message.attachment_bytes();
        if bytes > self.limits.max_attachment_bytes {
            return Err(EngineError::Validation(format!(
                "attachments total {} bytes, limit is {}",
                bytes, self.limits.max_attachment_bytes
            )));
        }
        Ok(())
    }

    fn reserve_explicit(
        &self,
        account_id: &str,
        slot_id: &str,
        count: u32,
    ) -> Result<(SmtpSlot, QuotaReservation)> {
        let slot = slot_repo::find_by_id(&self.db, slot_id)?
            .filter(|s| s.account_id == account_id)
            .ok_or_else(|| EngineError::SlotUnavailable {
                reason: format!("slot '{}' does not belong to this account", slot_id),
            })?;
        if !slot.is_dispatchable() {
            return Err(EngineError::SlotUnavailable {
                reason: format!("slot {} is {}", slot.slot_number, slot.status),
            });
        }
        let reservation = self
            .quota
            .reserve(&slot.id, count)?
            .ok_or(EngineError::QuotaExhausted)?;
        Ok((slot, reservation))
    }

    fn reserve_auto(&self, account_id: &str, count: u32) -> Result<(SmtpSlot, QuotaReservation)> {
        for slot in slot_repo::list_by_account(&self.db, account_id)? {
            if !slot.is_dispatchable() {
                continue;
            }
            if let Some(reservation) = self.quota.reserve(&slot.id, count)? {
                return Ok((slot, reservation));
            }
        }
        Err(EngineError::QuotaExhausted)
    }

    /// Records an undelivered recipient. An auth rejection flags the slot and
    /// fails the rest of the batch with the same reason; returns `true` then.
    fn reject(
        &self,
        slot_id: &str,
        report: &mut SendReport,
        recipient: String,
        rest: &mut impl Iterator<Item = String>,
        e: &TransportError,
    ) -> Result<bool> {
        if !e.is_auth_rejection() {
            tracing::info!(error = %e, permanent = e.is_permanent(), "Recipient not accepted");
            report.rejected.push(recipient_failure(recipient, e));
            return Ok(false);
        }

        let reason = e.to_string();
        self.slots
            .mark_needs_reauth(slot_id, &format!("AuthFailed: {}", reason))?;
        report.reauth_required = true;
        report
            .rejected
            .extend(std::iter::once(recipient).chain(rest).map(|r| RecipientFailure {
                recipient: r,
                reason: reason.clone(),
                permanent: true,
            }));
        Ok(true)
    }

    /// Sends `message` to each recipient individually.
    pub async fn send(
        &self,
        account_id: &str,
        message: &OutgoingEmail,
        choice: SlotChoice,
    ) -> Result<SendReport> {
        self.send_tracked(account_id, message, choice, &SendProgress::default())
            .await
    }

    /// Like [`send`](Self::send), recording each delivery in `progress`.
    ///
    /// Quota is reserved for the syntactically valid recipients up front.
    /// Each accepted recipient is counted the moment the transport accepts
    /// it, so dropping this future mid-batch keeps the delivered ones counted
    /// and returns only the unused part of the reservation.
    #[tracing::instrument(skip_all, fields(account_id = %account_id, recipients = message.to.len()))]
    pub async fn send_tracked(
        &self,
        account_id: &str,
        message: &OutgoingEmail,
        choice: SlotChoice,
        progress: &SendProgress,
    ) -> Result<SendReport> {
        self.validate(message)?;

        let mut report = SendReport::default();
        let mut valid = Vec::with_capacity(message.to.len());
        for recipient in &message.to {
            let trimmed = recipient.trim();
            match trimmed.parse::<lettre::Address>() {
                Ok(_) => valid.push(trimmed.to_string()),
                Err(e) => report.rejected.push(RecipientFailure {
                    recipient: recipient.clone(),
                    reason: format!("invalid address: {}", e),
                    permanent: true,
                }),
            }
        }
        if valid.is_empty() {
            return Ok(report);
        }

        let count = valid.len() as u32;
        let (slot, mut reservation) = match &choice {
            SlotChoice::Explicit(id) => self.reserve_explicit(account_id, id, count)?,
            SlotChoice::Auto => self.reserve_auto(account_id, count)?,
        };
        report.slot_id = Some(slot.id.clone());
        tracing::debug!(slot_id = %slot.id, slot_number = %slot.slot_number, "Slot selected");

        let credential = match self.vault.transport_credential(&slot).await {
            Ok(c) => c,
            Err(EngineError::ReauthRequired(reason)) => {
                self.slots
                    .mark_needs_reauth(&slot.id, &format!("ReauthRequired: {}", reason))?;
                return Err(EngineError::ReauthRequired(reason));
            }
            Err(e) => return Err(e),
        };

        let mut pending = valid.into_iter();
        match self.transport.open(&credential).await {
            Ok(mut session) => {
                while let Some(recipient) = pending.next() {
                    let prepared =
                        message.prepare(&slot.email, &recipient, slot.signature.as_deref());
                    match session.send(&prepared).await {
                        Ok(()) => {
                            progress.record(&recipient);
                            reservation.consume(1)?;
                            report.accepted.push(recipient);
                        }
                        Err(e) => {
                            if self.reject(&slot.id, &mut report, recipient, &mut pending, &e)? {
                                break;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                tracing::info!(error = %e, "Could not open SMTP session");
                while let Some(recipient) = pending.next() {
                    if self.reject(&slot.id, &mut report, recipient, &mut pending, &e)? {
                        break;
                    }
                }
            }
        }

        reservation.release()?;
        let accepted = report.accepted.len();
        if accepted > 0 {
            self.slots.clear_error(&slot.id)?;
        } else if let Some(failure) = report.rejected.iter().find(|r| !r.permanent) {
            self.slots.record_error(
                &slot.id,
                &format!("TransientTransportError: {}", failure.reason),
            )?;
        }

        tracing::info!(
            slot_id = %slot.id,
            accepted,
            rejected = report.rejected.len(),
            "Send finished"
        );
        Ok(report)
    }
}

fn recipient_failure(recipient: String, e: &TransportError) -> RecipientFailure {
    RecipientFailure {
        recipient,
        reason: e.to_string(),
        permanent: e.is_permanent(),
    }
}
