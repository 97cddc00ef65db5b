//! Mail transport seam.
//!
//! The engine hands one rendered message and one credential to a
//! [`MailTransport`]; [`SmtpMailer`] is the production implementation.

pub mod error;
pub mod smtp;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::send::message::PreparedMessage;

pub use error::{classify_smtp_reply, TransportError};
pub use smtp::SmtpMailer;

/// SASL mechanism used to authenticate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMechanism {
    /// Bearer access token (OAuth slots).
    XOAuth2,
    /// Username and password (custom SMTP slots).
    Password,
}

/// A ready-to-use credential for one connection.
#[derive(Debug, Clone)]
pub struct TransportCredential {
    pub host: String,
    pub port: u16,
    /// TLS from the first byte (465) instead of STARTTLS.
    pub implicit_tls: bool,
    pub username: String,
    pub secret: SecretString,
    pub mechanism: AuthMechanism,
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Opens an authenticated session for a batch of messages. Implementations
    /// may connect lazily and report connection failures from the first send.
    async fn open<'a>(
        &'a self,
        credential: &'a TransportCredential,
    ) -> Result<Box<dyn MailSession + 'a>, TransportError>;

    /// Connects and authenticates without sending anything.
    async fn probe(&self, credential: &TransportCredential) -> Result<(), TransportError>;
}

/// Delivers messages over one connection.
#[async_trait]
pub trait MailSession: Send {
    async fn send(&mut self, message: &PreparedMessage) -> Result<(), TransportError>;
}
