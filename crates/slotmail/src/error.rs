use std::path::PathBuf;
use thiserror::Error;

use crate::slots::types::InvalidSlotNumber;

/// Errors surfaced by slot, send and queue operations.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Slot {slot_number} already holds credentials")]
    SlotOccupied { slot_number: u8 },

    #[error("Invalid slot: {0}")]
    InvalidSlot(#[from] InvalidSlotNumber),

    #[error("Slot is not verified; verify it before activating")]
    NotVerified,

    #[error("Slot is not available for sending: {reason}")]
    SlotUnavailable { reason: String },

    #[error("Daily quota exhausted")]
    QuotaExhausted,

    #[error("Slot needs re-authentication: {0}")]
    ReauthRequired(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("Timed out: {0}")]
    TimedOut(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Recipient rejected permanently: {0}")]
    PermanentRecipientError(String),

    #[error("Transient transport error: {0}")]
    TransientTransportError(String),

    #[error("Slot not found")]
    SlotNotFound,

    #[error("Scheduled email '{0}' not found")]
    ScheduledEmailNotFound(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Secret error: {0}")]
    Secret(#[from] crate::secrets::SecretError),
}

impl EngineError {
    /// Whether the scheduler may retry the operation later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::QuotaExhausted
                | EngineError::NetworkUnreachable(_)
                | EngineError::TimedOut(_)
                | EngineError::TransientTransportError(_)
                | EngineError::Database(_)
        )
    }

    /// Short taxonomy name, used as the prefix of stored diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::SlotOccupied { .. } => "SlotOccupied",
            EngineError::InvalidSlot(_) => "InvalidSlot",
            EngineError::NotVerified => "NotVerified",
            EngineError::SlotUnavailable { .. } => "SlotUnavailable",
            EngineError::QuotaExhausted => "QuotaExhausted",
            EngineError::ReauthRequired(_) => "ReauthRequired",
            EngineError::AuthFailed(_) => "AuthFailed",
            EngineError::NetworkUnreachable(_) => "NetworkUnreachable",
            EngineError::TimedOut(_) => "TimedOut",
            EngineError::TlsError(_) => "TLSError",
            EngineError::PermanentRecipientError(_) => "PermanentRecipientError",
            EngineError::TransientTransportError(_) => "TransientTransportError",
            EngineError::SlotNotFound => "SlotNotFound",
            EngineError::ScheduledEmailNotFound(_) => "ScheduledEmailNotFound",
            EngineError::Validation(_) => "Validation",
            EngineError::Database(_) => "Database",
            EngineError::Secret(_) => "Secret",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Failed to parse config YAML: {0}")]
    ParseYaml(#[from] serde_yaml::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Failed to resolve secret '{name}': {source}")]
    Secret {
        name: &'static str,
        #[source]
        source: crate::secrets::SecretError,
    },
}
