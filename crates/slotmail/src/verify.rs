//! Credential probes: connect, negotiate TLS and authenticate without sending.

use std::sync::Arc;
use std::time::Duration;

use tracing::Instrument;

use crate::credentials::CredentialVault;
use crate::error::{EngineError, Result};
use crate::slots::types::SmtpSlot;
use crate::transport::{MailTransport, TransportError};

/// Why a probe failed. The `Display` form is what lands in the slot's error log.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeFailure {
    #[error("AuthFailed: {0}")]
    AuthFailed(String),

    #[error("NetworkUnreachable: {0}")]
    NetworkUnreachable(String),

    #[error("TimedOut: {0}")]
    TimedOut(String),

    #[error("TLSError: {0}")]
    TlsError(String),

    #[error("ReauthRequired: {0}")]
    ReauthRequired(String),
}

impl From<TransportError> for ProbeFailure {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::AuthFailed(m) => ProbeFailure::AuthFailed(m),
            TransportError::NetworkUnreachable(m) => ProbeFailure::NetworkUnreachable(m),
            TransportError::TimedOut(m) => ProbeFailure::TimedOut(m),
            TransportError::Tls(m) => ProbeFailure::TlsError(m),
            TransportError::Transient { code, message } => {
                ProbeFailure::NetworkUnreachable(format!("{} {}", code, message))
            }
            TransportError::PermanentRecipient { code, message } => {
                ProbeFailure::AuthFailed(format!("{} {}", code, message))
            }
            TransportError::InvalidMessage(m) => ProbeFailure::AuthFailed(m),
        }
    }
}

impl From<ProbeFailure> for EngineError {
    fn from(f: ProbeFailure) -> Self {
        match f {
            ProbeFailure::AuthFailed(m) => EngineError::AuthFailed(m),
            ProbeFailure::NetworkUnreachable(m) => EngineError::NetworkUnreachable(m),
            ProbeFailure::TimedOut(m) => EngineError::TimedOut(m),
            ProbeFailure::TlsError(m) => EngineError::TlsError(m),
            ProbeFailure::ReauthRequired(m) => EngineError::ReauthRequired(m),
        }
    }
}

/// Result of a probe that reached a verdict.
pub type Verification = std::result::Result<(), ProbeFailure>;

pub struct VerificationService {
    vault: Arc<CredentialVault>,
    transport: Arc<dyn MailTransport>,
    probe_timeout: Duration,
}

impl VerificationService {
    pub fn new(
        vault: Arc<CredentialVault>,
        transport: Arc<dyn MailTransport>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            vault,
            transport,
            probe_timeout,
        }
    }

    /// Probes the slot's credentials. The outer error is reserved for
    /// storage failures; credential and network problems are a [`ProbeFailure`].
    pub async fn probe(&self, slot: &SmtpSlot) -> Result<Verification> {
        let span = tracing::info_span!("probe", slot_id = %slot.id, provider = %slot.provider);
        let attempt = async {
            let credential = match self.vault.transport_credential(slot).await {
                Ok(c) => c,
                Err(e) => return credential_failure(e),
            };
            Ok(self
                .transport
                .probe(&credential)
                .await
                .map_err(ProbeFailure::from))
        };

        let verdict = match tokio::time::timeout(self.probe_timeout, attempt)
            .instrument(span.clone())
            .await
        {
            Ok(result) => result?,
            Err(_) => Err(ProbeFailure::TimedOut(format!(
                "no answer within {}s",
                self.probe_timeout.as_secs()
            ))),
        };

        let _enter = span.enter();
        match &verdict {
            Ok(()) => tracing::info!("Probe succeeded"),
            Err(f) => tracing::warn!(failure = %f, "Probe failed"),
        }
        Ok(verdict)
    }
}

/// Sorts vault errors into probe verdicts; storage errors propagate.
fn credential_failure(e: EngineError) -> Result<Verification> {
    let failure = match e {
        EngineError::ReauthRequired(m) => ProbeFailure::ReauthRequired(m),
        EngineError::TransientTransportError(m) | EngineError::NetworkUnreachable(m) => {
            ProbeFailure::NetworkUnreachable(m)
        }
        EngineError::Secret(s) => ProbeFailure::AuthFailed(format!("stored secret unusable: {}", s)),
        EngineError::AuthFailed(m) | EngineError::Validation(m) => ProbeFailure::AuthFailed(m),
        other => return Err(other),
    };
    Ok(Err(failure))
}
