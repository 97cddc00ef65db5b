//! Sender slot domain types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of sender positions every account owns.
pub const MAX_SLOTS: u8 = 5;

/// A slot number outside `1..=MAX_SLOTS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("slot number {0} is outside 1..={max}", max = MAX_SLOTS)]
pub struct InvalidSlotNumber(pub u8);

/// One of the fixed sender positions of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct SlotNumber(u8);

impl SlotNumber {
    pub fn new(value: u8) -> Result<Self, InvalidSlotNumber> {
        if (1..=MAX_SLOTS).contains(&value) {
            Ok(Self(value))
        } else {
            Err(InvalidSlotNumber(value))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// All positions in ascending order.
    pub fn all() -> impl Iterator<Item = SlotNumber> {
        (1..=MAX_SLOTS).map(SlotNumber)
    }
}

impl TryFrom<u8> for SlotNumber {
    type Error = InvalidSlotNumber;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SlotNumber> for u8 {
    fn from(n: SlotNumber) -> Self {
        n.0
    }
}

impl fmt::Display for SlotNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error returned when parsing a stored enum value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Mailbox provider behind a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Gmail,
    Outlook,
    Yahoo,
    Custom,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Gmail => "gmail",
            Provider::Outlook => "outlook",
            Provider::Yahoo => "yahoo",
            Provider::Custom => "custom",
        }
    }

    /// Whether identities from this provider can be attached through OAuth.
    pub fn supports_oauth(&self) -> bool {
        !matches!(self, Provider::Custom)
    }

    /// SMTP submission endpoint `(host, port, implicit_tls)` used with XOAUTH2.
    pub fn oauth_smtp_endpoint(&self) -> Option<(&'static str, u16, bool)> {
        match self {
            Provider::Gmail => Some(("smtp.gmail.com", 587, false)),
            Provider::Outlook => Some(("smtp.office365.com", 587, false)),
            Provider::Yahoo => Some(("smtp.mail.yahoo.com", 465, true)),
            Provider::Custom => None,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gmail" => Ok(Provider::Gmail),
            "outlook" => Ok(Provider::Outlook),
            "yahoo" => Ok(Provider::Yahoo),
            "custom" => Ok(Provider::Custom),
            other => Err(ParseEnumError {
                kind: "provider",
                value: other.to_string(),
            }),
        }
    }
}

/// Health/lifecycle state of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Inactive,
    Active,
    Error,
    NeedsReauth,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStatus::Inactive => "inactive",
            SlotStatus::Active => "active",
            SlotStatus::Error => "error",
            SlotStatus::NeedsReauth => "needs_reauth",
        }
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SlotStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inactive" => Ok(SlotStatus::Inactive),
            "active" => Ok(SlotStatus::Active),
            "error" => Ok(SlotStatus::Error),
            "needs_reauth" => Ok(SlotStatus::NeedsReauth),
            other => Err(ParseEnumError {
                kind: "slot status",
                value: other.to_string(),
            }),
        }
    }
}

/// The two states a caller may toggle a slot into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotToggle {
    Active,
    Inactive,
}

impl From<SlotToggle> for SlotStatus {
    fn from(t: SlotToggle) -> Self {
        match t {
            SlotToggle::Active => SlotStatus::Active,
            SlotToggle::Inactive => SlotStatus::Inactive,
        }
    }
}

/// Which credential family a slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthKind {
    #[serde(rename = "oauth")]
    OAuth,
    Password,
}

impl AuthKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthKind::OAuth => "oauth",
            AuthKind::Password => "password",
        }
    }
}

impl FromStr for AuthKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "oauth" => Ok(AuthKind::OAuth),
            "password" => Ok(AuthKind::Password),
            other => Err(ParseEnumError {
                kind: "auth kind",
                value: other.to_string(),
            }),
        }
    }
}

/// Credentials as persisted. Secret fields hold vault ciphertext, never plaintext.
#[derive(Clone, PartialEq, Eq)]
pub enum StoredCredentials {
    OAuth {
        access_token: String,
        refresh_token: String,
        expires_at: DateTime<Utc>,
    },
    Password {
        host: String,
        port: u16,
        secure: bool,
        password: String,
    },
}

impl StoredCredentials {
    pub fn kind(&self) -> AuthKind {
        match self {
            StoredCredentials::OAuth { .. } => AuthKind::OAuth,
            StoredCredentials::Password { .. } => AuthKind::Password,
        }
    }
}

impl fmt::Debug for StoredCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoredCredentials::OAuth { expires_at, .. } => f
                .debug_struct("OAuth")
                .field("expires_at", expires_at)
                .finish_non_exhaustive(),
            StoredCredentials::Password {
                host, port, secure, ..
            } => f
                .debug_struct("Password")
                .field("host", host)
                .field("port", port)
                .field("secure", secure)
                .finish_non_exhaustive(),
        }
    }
}

/// Last failure recorded on a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorLog {
    pub last_error: String,
    pub at: DateTime<Utc>,
}

/// A sender identity occupying one of the account's positions.
///
/// Serializing a slot never emits its credentials.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SmtpSlot {
    pub id: String,
    pub account_id: String,
    pub slot_number: SlotNumber,
    pub provider: Provider,
    pub email: String,
    pub auth_kind: AuthKind,
    #[serde(skip)]
    pub credentials: StoredCredentials,
    pub status: SlotStatus,
    pub is_verified: bool,
    pub daily_limit: u32,
    pub emails_sent_today: u32,
    #[serde(skip)]
    pub quota_reserved: u32,
    pub quota_reset_at: DateTime<Utc>,
    pub error_log: Option<ErrorLog>,
    pub signature: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SmtpSlot {
    /// Active and verified: the only state in which the engine may send through it.
    pub fn is_dispatchable(&self) -> bool {
        self.status == SlotStatus::Active && self.is_verified
    }
}

/// One position of the registry, occupied or not.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotPosition {
    pub slot_number: SlotNumber,
    pub slot: Option<SmtpSlot>,
}
